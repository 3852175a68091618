//! Archive decoder: materializes a tree from the linear byte stream.
//!
//! The decoder is push-driven. Input arrives through `put_data` in slices
//! of any size (headers may split across pushes), through `put_data_fd`
//! (the decoder takes the handle and reads it to exhaustion itself), or as
//! an explicit `put_eof`. Every `step` consumes buffered input and reports
//! one event; `Request` means the buffer ran dry and more input is needed.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{SyncError, SyncResult};
use crate::format::{
    ARCHIVE_MAGIC, ENTRY_HEADER_FIXED, TAG_DIR, TAG_END, TAG_FILE,
};

/// Outcome of one decoder advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderStep {
    /// The end marker was consumed and the tree is fully materialized.
    Finished,
    /// An entry header was parsed and its target created.
    NextFile,
    /// Progress was made without payload output.
    Step,
    /// Payload bytes were written to the current file.
    Payload,
    /// The input buffer is exhausted; push more data or an EOF.
    Request,
}

/// Shape of a decode target when it has to be created from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseKind {
    Regular,
    Directory,
    BlockDevice,
}

enum Target {
    /// Single-entry archives written straight into a transferred handle.
    File { file: Option<File>, used: bool },
    /// Tree archives materialized under a root directory.
    Dir { root: PathBuf },
    /// Parse-and-discard sink; only the shape of the target is known.
    Discard,
}

enum ParseState {
    Magic,
    EntryTag,
    Payload { remaining: u64 },
    Finished,
}

/// Contiguous input buffer with a consumed prefix.
#[derive(Default)]
struct InputBuf {
    data: Vec<u8>,
    pos: usize,
}

impl InputBuf {
    fn available(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    fn push(&mut self, bytes: &[u8]) {
        self.compact();
        self.data.extend_from_slice(bytes);
    }

    fn consume(&mut self, n: usize) {
        self.pos += n;
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            self.data.drain(..self.pos);
            self.pos = 0;
        }
    }
}

/// Push-driven consumer of the archive stream.
pub struct Decoder {
    target: Target,
    input: InputBuf,
    source_fd: Option<File>,
    eof_pushed: bool,
    state: ParseState,
    current: Option<(PathBuf, u32)>,
    current_file: Option<File>,
    /// Directory modes deferred to the end so a read-only directory cannot
    /// block creation of its own children.
    dir_modes: Vec<(PathBuf, u32)>,
}

impl Decoder {
    /// Decode into a transferred file-like handle (regular file or block
    /// device). Only single-entry archives are accepted.
    #[must_use]
    pub fn with_base_file(file: File) -> Self {
        Self::new(Target::File {
            file: Some(file),
            used: false,
        })
    }

    /// Decode a tree archive under `root`, which must already exist.
    #[must_use]
    pub fn with_base_dir(root: PathBuf) -> Self {
        Self::new(Target::Dir { root })
    }

    /// Parse and validate the stream without writing anything; used when
    /// only the shape of the target is known.
    #[must_use]
    pub fn with_base_kind(_kind: BaseKind) -> Self {
        Self::new(Target::Discard)
    }

    fn new(target: Target) -> Self {
        Self {
            target,
            input: InputBuf::default(),
            source_fd: None,
            eof_pushed: false,
            state: ParseState::Magic,
            current: None,
            current_file: None,
            dir_modes: Vec::new(),
        }
    }

    /// Push a slice of archive bytes.
    pub fn put_data(&mut self, data: &[u8]) -> SyncResult<()> {
        if self.eof_pushed {
            return Err(SyncError::InvalidArgument("data pushed after eof"));
        }
        self.input.push(data);
        Ok(())
    }

    /// Hand over an archive handle; the decoder reads it to exhaustion by
    /// itself and never returns `Request` again.
    pub fn put_data_fd(&mut self, file: File) -> SyncResult<()> {
        if self.eof_pushed {
            return Err(SyncError::InvalidArgument("data pushed after eof"));
        }
        if self.source_fd.is_some() {
            return Err(SyncError::Busy("decoder input handle"));
        }
        self.source_fd = Some(file);
        Ok(())
    }

    /// Mark the end of input.
    pub fn put_eof(&mut self) -> SyncResult<()> {
        self.eof_pushed = true;
        Ok(())
    }

    /// Advance by one event.
    pub fn step(&mut self) -> SyncResult<DecoderStep> {
        loop {
            match self.state {
                ParseState::Finished => return Ok(DecoderStep::Finished),

                ParseState::Magic => match self.want(ARCHIVE_MAGIC.len())? {
                    Input::Ready => {
                        if self.input.available()[..ARCHIVE_MAGIC.len()] != ARCHIVE_MAGIC {
                            return Err(SyncError::BadMessage("not an archive stream".into()));
                        }
                        self.input.consume(ARCHIVE_MAGIC.len());
                        self.state = ParseState::EntryTag;
                        return Ok(DecoderStep::Step);
                    }
                    Input::Refilled => continue,
                    Input::Starved => return Ok(DecoderStep::Request),
                },

                ParseState::EntryTag => match self.want(1)? {
                    Input::Ready => match self.step_entry()? {
                        EntryParse::Event(event) => return Ok(event),
                        EntryParse::Need(n) => match self.want(n)? {
                            Input::Ready | Input::Refilled => continue,
                            Input::Starved => return Ok(DecoderStep::Request),
                        },
                    },
                    Input::Refilled => continue,
                    Input::Starved => return Ok(DecoderStep::Request),
                },

                ParseState::Payload { remaining } => {
                    if remaining == 0 {
                        self.finish_file_entry()?;
                        self.state = ParseState::EntryTag;
                        continue;
                    }
                    match self.want(1)? {
                        Input::Ready => {
                            let take = remaining.min(self.input.len() as u64) as usize;
                            if let Some(file) = &mut self.current_file {
                                file.write_all(&self.input.available()[..take])?;
                            }
                            self.input.consume(take);
                            self.state = ParseState::Payload {
                                remaining: remaining - take as u64,
                            };
                            return Ok(DecoderStep::Payload);
                        }
                        Input::Refilled => continue,
                        Input::Starved => return Ok(DecoderStep::Request),
                    }
                }
            }
        }
    }

    /// Path of the entry currently being materialized.
    #[must_use]
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|(path, _)| path.as_path())
    }

    /// Permission bits of the entry currently being materialized.
    #[must_use]
    pub fn current_mode(&self) -> Option<u32> {
        self.current.as_ref().map(|(_, mode)| *mode)
    }

    /// Parse one entry header if the buffer holds it completely; otherwise
    /// report how many bytes the header needs so the caller can wait for
    /// them.
    fn step_entry(&mut self) -> SyncResult<EntryParse> {
        let bytes = self.input.available();
        let tag = bytes[0];

        if tag == TAG_END {
            self.input.consume(1);
            self.finish_stream()?;
            return Ok(EntryParse::Event(DecoderStep::Finished));
        }
        if tag != TAG_FILE && tag != TAG_DIR {
            return Err(SyncError::BadMessage("unknown archive entry tag".into()));
        }

        if bytes.len() < ENTRY_HEADER_FIXED {
            return Ok(EntryParse::Need(ENTRY_HEADER_FIXED));
        }
        let mode = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let path_len = u16::from_be_bytes([bytes[5], bytes[6]]) as usize;

        let mut need = ENTRY_HEADER_FIXED + path_len;
        if tag == TAG_FILE {
            need += 8;
        }
        if bytes.len() < need {
            return Ok(EntryParse::Need(need));
        }

        let path_bytes = &bytes[ENTRY_HEADER_FIXED..ENTRY_HEADER_FIXED + path_len];
        let path = parse_wire_path(path_bytes)?;

        if tag == TAG_DIR {
            self.input.consume(need);
            self.begin_dir_entry(&path, mode)?;
            self.current = Some((path, mode));
            return Ok(EntryParse::Event(DecoderStep::NextFile));
        }

        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&bytes[ENTRY_HEADER_FIXED + path_len..need]);
        let size = u64::from_be_bytes(size_bytes);
        self.input.consume(need);
        self.begin_file_entry(&path, mode)?;
        self.current = Some((path, mode));
        self.state = ParseState::Payload { remaining: size };
        Ok(EntryParse::Event(DecoderStep::NextFile))
    }

    fn begin_dir_entry(&mut self, path: &Path, mode: u32) -> SyncResult<()> {
        match &self.target {
            Target::Dir { root } => {
                fs::create_dir_all(root.join(path))?;
                self.dir_modes.push((path.to_path_buf(), mode));
                Ok(())
            }
            Target::File { .. } => Err(SyncError::BadMessage(
                "directory entry in a single-file archive".into(),
            )),
            Target::Discard => Ok(()),
        }
    }

    fn begin_file_entry(&mut self, path: &Path, _mode: u32) -> SyncResult<()> {
        self.current_file = match &mut self.target {
            Target::Dir { root } => {
                let abs = root.join(path);
                if let Some(parent) = abs.parent() {
                    fs::create_dir_all(parent)?;
                }
                Some(File::create(abs)?)
            }
            Target::File { file, used } => {
                if *used {
                    return Err(SyncError::BadMessage(
                        "multiple entries for a single-file target".into(),
                    ));
                }
                *used = true;
                file.take()
            }
            Target::Discard => None,
        };
        Ok(())
    }

    /// Apply the entry's permission bits once its payload is complete.
    fn finish_file_entry(&mut self) -> SyncResult<()> {
        let file = self.current_file.take();
        let Some((path, mode)) = &self.current else {
            return Ok(());
        };
        match (&self.target, file) {
            (Target::Dir { root }, Some(file)) => {
                drop(file);
                set_mode(&root.join(path), *mode)?;
            }
            (Target::File { .. }, Some(file)) => {
                // Restore the archived bits on regular files; a block
                // device keeps whatever it already has.
                if file.metadata()?.is_file() {
                    set_file_mode(&file, *mode)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// End-of-archive bookkeeping: deferred directory modes are applied
    /// deepest-first.
    fn finish_stream(&mut self) -> SyncResult<()> {
        self.finish_file_entry()?;
        if let Target::Dir { root } = &self.target {
            for (path, mode) in self.dir_modes.iter().rev() {
                set_mode(&root.join(path), *mode)?;
            }
        }
        self.current = None;
        self.state = ParseState::Finished;
        Ok(())
    }

    /// Ensure at least `n` buffered bytes, refilling from the source handle
    /// when one was transferred in.
    fn want(&mut self, n: usize) -> SyncResult<Input> {
        if self.input.len() >= n {
            return Ok(Input::Ready);
        }
        if let Some(fd) = &mut self.source_fd {
            let mut buf = [0u8; 64 * 1024];
            let got = fd.read(&mut buf)?;
            if got > 0 {
                self.input.push(&buf[..got]);
                return Ok(Input::Refilled);
            }
            self.source_fd = None;
            self.eof_pushed = true;
        }
        if self.eof_pushed {
            return Err(SyncError::BadMessage("truncated archive stream".into()));
        }
        Ok(Input::Starved)
    }
}

enum Input {
    /// Enough bytes are buffered.
    Ready,
    /// New bytes arrived from the source handle; re-evaluate.
    Refilled,
    /// Nothing buffered and no source to draw from.
    Starved,
}

enum EntryParse {
    /// A full header was consumed and produced this event.
    Event(DecoderStep),
    /// The header spans `n` bytes and is not fully buffered yet.
    Need(usize),
}

fn parse_wire_path(bytes: &[u8]) -> SyncResult<PathBuf> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| SyncError::BadMessage("entry path is not valid UTF-8".into()))?;
    if text.starts_with('/') || text.split('/').any(|part| part == "..") {
        return Err(SyncError::BadMessage("entry path escapes the base".into()));
    }
    Ok(PathBuf::from(text))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> SyncResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> SyncResult<()> {
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(file: &File, mode: u32) -> SyncResult<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_file: &File, _mode: u32) -> SyncResult<()> {
    Ok(())
}
