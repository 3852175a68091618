//! Archive wire format shared by the encoder and decoder.
//!
//! An archive is a deterministic linear framing of a filesystem tree
//! (all integers are big-endian):
//!
//! ```text
//! archive := magic entry* end
//! magic   := "arcsync\x01"                              (8 bytes)
//! entry   := dir | file
//! dir     := 0x02 mode:u32 path_len:u16 path[path_len]
//! file    := 0x01 mode:u32 path_len:u16 path[path_len] size:u64 payload
//! end     := 0xff
//! ```
//!
//! Paths are relative to the base root, `/`-separated UTF-8, emitted in
//! sorted order with parents before children. `mode` carries the permission
//! bits. A file-like base (regular file or block device) frames as a single
//! `file` entry with an empty path.

use std::path::Path;

use crate::error::{SyncError, SyncResult};

pub(crate) const ARCHIVE_MAGIC: [u8; 8] = *b"arcsync\x01";

pub(crate) const TAG_FILE: u8 = 0x01;
pub(crate) const TAG_DIR: u8 = 0x02;
pub(crate) const TAG_END: u8 = 0xff;

/// Largest payload slice the encoder produces per step.
pub(crate) const MAX_PAYLOAD_SLICE: usize = 64 * 1024;

/// Fixed part of an entry header: tag + mode + path length.
pub(crate) const ENTRY_HEADER_FIXED: usize = 1 + 4 + 2;

/// Serialize a path for the wire: relative, `/`-separated, UTF-8.
pub(crate) fn path_to_wire(path: &Path) -> SyncResult<Vec<u8>> {
    let mut wire = String::new();
    for component in path.components() {
        let part = component
            .as_os_str()
            .to_str()
            .ok_or(SyncError::InvalidArgument("path is not valid UTF-8"))?;
        if !wire.is_empty() {
            wire.push('/');
        }
        wire.push_str(part);
    }
    if wire.len() > u16::MAX as usize {
        return Err(SyncError::InvalidArgument("path is too long to archive"));
    }
    Ok(wire.into_bytes())
}

/// Serialize one entry header.
pub(crate) fn entry_header(
    tag: u8,
    mode: u32,
    path: &Path,
    size: Option<u64>,
) -> SyncResult<Vec<u8>> {
    let wire_path = path_to_wire(path)?;
    let mut header = Vec::with_capacity(ENTRY_HEADER_FIXED + wire_path.len() + 8);
    header.push(tag);
    header.extend_from_slice(&mode.to_be_bytes());
    header.extend_from_slice(&(wire_path.len() as u16).to_be_bytes());
    header.extend_from_slice(&wire_path);
    if let Some(size) = size {
        header.extend_from_slice(&size.to_be_bytes());
    }
    Ok(header)
}
