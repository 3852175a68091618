//! Archive encoder: frames a base tree as a linear byte stream.
//!
//! The encoder is step-driven. Every `step` produces at most one slice of
//! archive bytes — the magic, an entry header, a payload piece, or the end
//! marker — which the caller collects with `take_data`. Identical trees
//! always encode to identical streams: entries are walked in sorted order
//! and headers are fully deterministic.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::mem;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::{SyncError, SyncResult};
use crate::format::{entry_header, ARCHIVE_MAGIC, MAX_PAYLOAD_SLICE, TAG_DIR, TAG_END, TAG_FILE};

/// Outcome of one encoder advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderStep {
    /// The archive stream is complete; no data was produced.
    Finished,
    /// An entry header was produced; a new file or directory begins.
    NextFile,
    /// A non-boundary slice of archive bytes was produced.
    Data,
}

enum PlanEntry {
    Dir {
        path: PathBuf,
        mode: u32,
    },
    File {
        path: PathBuf,
        source: FileSource,
        mode: u32,
        size: u64,
    },
}

enum FileSource {
    /// Opened lazily when the entry is reached.
    Path(PathBuf),
    /// Pre-opened handle, transferred in by the caller.
    Open(File),
}

enum State {
    Magic,
    NextEntry,
    Payload { file: File, remaining: u64 },
    End,
    Finished,
}

/// Step-driven producer of the archive stream.
pub struct Encoder {
    entries: VecDeque<PlanEntry>,
    state: State,
    pending: Vec<u8>,
    current: Option<(PathBuf, u32)>,
}

impl Encoder {
    /// Encode the tree rooted at `root`. The tree is walked up front in
    /// sorted order; only regular files and directories are admitted.
    pub fn from_directory(root: &Path) -> SyncResult<Self> {
        let mut entries = VecDeque::new();
        walk(root, Path::new(""), &mut entries)?;
        Ok(Self {
            entries,
            state: State::Magic,
            pending: Vec::new(),
            current: None,
        })
    }

    /// Encode a single file-like base (regular file or block device) from a
    /// transferred handle. The size is learned by seeking to the end.
    pub fn from_file(mut file: File) -> SyncResult<Self> {
        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        let mode = permissions_mode(&file.metadata()?);

        let mut entries = VecDeque::new();
        entries.push_back(PlanEntry::File {
            path: PathBuf::new(),
            source: FileSource::Open(file),
            mode,
            size,
        });
        Ok(Self {
            entries,
            state: State::Magic,
            pending: Vec::new(),
            current: None,
        })
    }

    /// Advance the stream by one slice.
    pub fn step(&mut self) -> SyncResult<EncoderStep> {
        loop {
            match &mut self.state {
                State::Magic => {
                    self.pending.extend_from_slice(&ARCHIVE_MAGIC);
                    self.state = State::NextEntry;
                    return Ok(EncoderStep::Data);
                }
                State::NextEntry => match self.entries.pop_front() {
                    None => {
                        self.pending.push(TAG_END);
                        self.current = None;
                        self.state = State::End;
                        return Ok(EncoderStep::Data);
                    }
                    Some(PlanEntry::Dir { path, mode }) => {
                        self.pending = entry_header(TAG_DIR, mode, &path, None)?;
                        self.current = Some((path, mode));
                        return Ok(EncoderStep::NextFile);
                    }
                    Some(PlanEntry::File {
                        path,
                        source,
                        mode,
                        size,
                    }) => {
                        let file = match source {
                            FileSource::Path(abs) => File::open(abs)?,
                            FileSource::Open(file) => file,
                        };
                        self.pending = entry_header(TAG_FILE, mode, &path, Some(size))?;
                        self.current = Some((path, mode));
                        self.state = State::Payload {
                            file,
                            remaining: size,
                        };
                        return Ok(EncoderStep::NextFile);
                    }
                },
                State::Payload { file, remaining } => {
                    if *remaining == 0 {
                        self.state = State::NextEntry;
                        continue;
                    }
                    let want = (*remaining).min(MAX_PAYLOAD_SLICE as u64) as usize;
                    let mut buf = vec![0u8; want];
                    let got = file.read(&mut buf)?;
                    if got == 0 {
                        return Err(SyncError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "base file shrank while being encoded",
                        )));
                    }
                    buf.truncate(got);
                    *remaining -= got as u64;
                    self.pending = buf;
                    return Ok(EncoderStep::Data);
                }
                State::End => {
                    self.state = State::Finished;
                    return Ok(EncoderStep::Finished);
                }
                State::Finished => return Ok(EncoderStep::Finished),
            }
        }
    }

    /// Take the bytes produced by the last step.
    pub fn take_data(&mut self) -> Bytes {
        Bytes::from(mem::take(&mut self.pending))
    }

    /// Path of the entry currently being emitted, relative to the base.
    #[must_use]
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|(path, _)| path.as_path())
    }

    /// Permission bits of the entry currently being emitted.
    #[must_use]
    pub fn current_mode(&self) -> Option<u32> {
        self.current.as_ref().map(|(_, mode)| *mode)
    }
}

/// Collect `dir`'s entries in sorted order, parents before children.
fn walk(dir: &Path, rel: &Path, out: &mut VecDeque<PlanEntry>) -> SyncResult<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    children.sort_by_key(std::fs::DirEntry::file_name);

    for child in children {
        let file_type = child.file_type()?;
        let abs = child.path();
        let rel_path = rel.join(child.file_name());

        if file_type.is_dir() {
            let mode = permissions_mode(&child.metadata()?);
            out.push_back(PlanEntry::Dir {
                path: rel_path.clone(),
                mode,
            });
            walk(&abs, &rel_path, out)?;
        } else if file_type.is_file() {
            let metadata = child.metadata()?;
            out.push_back(PlanEntry::File {
                path: rel_path,
                source: FileSource::Path(abs),
                mode: permissions_mode(&metadata),
                size: metadata.len(),
            });
        } else {
            return Err(SyncError::InvalidArgument(
                "only regular files and directories can be archived",
            ));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn permissions_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
