//! On-disk index framing: the ordered list of chunk ids and sizes.
//!
//! Wire format (all integers are big-endian):
//!
//! ```text
//! +----------------+-----------+-----------+
//! | magic          | record*   | trailer   |
//! | "arcsidx\x01"  |           |           |
//! +----------------+-----------+-----------+
//!
//! record  := 0x01 id[32] size:u64
//! trailer := (0x02 digest[32])? 0x03
//! ```
//!
//! The optional `0x02` record carries the archive-level digest; `0x03`
//! terminates the stream.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{SyncError, SyncResult};
use crate::hash::{ObjectId, OBJECT_ID_LEN};

const INDEX_MAGIC: [u8; 8] = *b"arcsidx\x01";

const TAG_OBJECT: u8 = 0x01;
const TAG_DIGEST: u8 = 0x02;
const TAG_EOF: u8 = 0x03;

/// Append-only writer for the index format.
pub struct IndexWriter {
    out: BufWriter<File>,
    digest: Option<ObjectId>,
}

impl IndexWriter {
    /// Create (or truncate) an index file at `path`.
    pub fn create(path: &Path) -> SyncResult<Self> {
        Self::from_file(File::create(path)?)
    }

    /// Write the index to an already opened file.
    pub fn from_file(file: File) -> SyncResult<Self> {
        let mut out = BufWriter::new(file);
        out.write_all(&INDEX_MAGIC)?;
        Ok(Self { out, digest: None })
    }

    /// Append one (id, size) record.
    pub fn write_object(&mut self, id: &ObjectId, size: u64) -> SyncResult<()> {
        self.out.write_all(&[TAG_OBJECT])?;
        self.out.write_all(id.as_bytes())?;
        self.out.write_all(&size.to_be_bytes())?;
        Ok(())
    }

    /// Stage the archive-level digest; written as part of the trailer.
    pub fn set_digest(&mut self, id: ObjectId) {
        self.digest = Some(id);
    }

    /// Write the trailer and flush everything to disk.
    pub fn write_eof(&mut self) -> SyncResult<()> {
        if let Some(digest) = &self.digest {
            self.out.write_all(&[TAG_DIGEST])?;
            self.out.write_all(digest.as_bytes())?;
        }
        self.out.write_all(&[TAG_EOF])?;
        self.out.flush()?;
        Ok(())
    }
}

/// Record-at-a-time reader for the index format.
pub struct IndexReader {
    input: BufReader<File>,
    digest: Option<ObjectId>,
    done: bool,
}

impl IndexReader {
    /// Open an index file at `path`.
    pub fn open(path: &Path) -> SyncResult<Self> {
        Self::from_file(File::open(path)?)
    }

    /// Read the index from an already opened file.
    pub fn from_file(file: File) -> SyncResult<Self> {
        let mut input = BufReader::new(file);
        let mut magic = [0u8; 8];
        read_exact_or_bad(&mut input, &mut magic)?;
        if magic != INDEX_MAGIC {
            return Err(SyncError::BadMessage("not an index file".into()));
        }
        Ok(Self {
            input,
            digest: None,
            done: false,
        })
    }

    /// Read the next object record, or `None` once the end marker is
    /// reached. The digest record, if present, is captured on the way.
    pub fn read_object(&mut self) -> SyncResult<Option<(ObjectId, u64)>> {
        loop {
            if self.done {
                return Ok(None);
            }

            let mut tag = [0u8; 1];
            read_exact_or_bad(&mut self.input, &mut tag)?;
            match tag[0] {
                TAG_OBJECT => {
                    let mut id = [0u8; OBJECT_ID_LEN];
                    read_exact_or_bad(&mut self.input, &mut id)?;
                    let mut size = [0u8; 8];
                    read_exact_or_bad(&mut self.input, &mut size)?;
                    return Ok(Some((ObjectId::from_raw(id), u64::from_be_bytes(size))));
                }
                TAG_DIGEST => {
                    let mut id = [0u8; OBJECT_ID_LEN];
                    read_exact_or_bad(&mut self.input, &mut id)?;
                    self.digest = Some(ObjectId::from_raw(id));
                }
                TAG_EOF => {
                    self.done = true;
                    return Ok(None);
                }
                _ => return Err(SyncError::BadMessage("unknown index record tag".into())),
            }
        }
    }

    /// The archive-level digest, once its record has been read.
    #[must_use]
    pub fn digest(&self) -> Option<ObjectId> {
        self.digest
    }
}

fn read_exact_or_bad<R: Read>(input: &mut R, buf: &mut [u8]) -> SyncResult<()> {
    input.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SyncError::BadMessage("truncated index".into())
        } else {
            SyncError::Io(e)
        }
    })
}
