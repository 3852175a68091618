//! Content-addressed object store on the local filesystem.
//!
//! Objects live at `<root>/<pppp>/<hex>.chunk`, where `pppp` is the first
//! four hex digits of the id and `hex` the full 64. Writes land in a
//! randomized sibling first and are renamed into place, so a chunk file is
//! either absent or complete.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::{SyncError, SyncResult};
use crate::hash::ObjectId;
use crate::util::sibling_temp_path;

/// Extension used for chunk files.
const CHUNK_SUFFIX: &str = ".chunk";

/// A local chunk store keyed by object id.
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open a writable store, creating the root directory if needed.
    pub fn open_local(root: impl Into<PathBuf>) -> SyncResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Open an existing store for read-only seed use.
    pub fn open_seed(root: impl Into<PathBuf>) -> SyncResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(SyncError::InvalidArgument(
                "seed store path is not a directory",
            ));
        }
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..4]).join(format!("{hex}{CHUNK_SUFFIX}"))
    }

    /// Store an object under its id. Idempotent: an id that already exists
    /// names the same bytes, so the write is skipped.
    pub fn put(&self, id: &ObjectId, data: &[u8]) -> SyncResult<()> {
        let path = self.object_path(id);
        if path.exists() {
            return Ok(());
        }

        let hex = id.to_hex();
        let dir = self.root.join(&hex[..4]);
        fs::create_dir_all(&dir)?;

        let temp = sibling_temp_path(&path);
        let result = (|| -> io::Result<()> {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp)?;
            file.write_all(data)?;
            fs::rename(&temp, &path)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result.map_err(SyncError::from)
    }

    /// Fetch an object by id. `Ok(None)` means the id is absent here; any
    /// other failure is returned verbatim so callers can cascade stores.
    pub fn get(&self, id: &ObjectId) -> SyncResult<Option<Bytes>> {
        match fs::read(self.object_path(id)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_local(dir.path()).unwrap();

        let data = b"hello world chunk data";
        let id = ObjectId::from_bytes(data);

        assert!(store.get(&id).unwrap().is_none());

        store.put(&id, data).unwrap();
        let fetched = store.get(&id).unwrap().unwrap();
        assert_eq!(&fetched[..], data);
    }

    #[test]
    fn test_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_local(dir.path()).unwrap();

        let data = b"same chunk";
        let id = ObjectId::from_bytes(data);
        store.put(&id, data).unwrap();
        store.put(&id, data).unwrap();

        assert_eq!(&store.get(&id).unwrap().unwrap()[..], data);
    }

    #[test]
    fn test_chunk_lands_under_hex_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_local(dir.path()).unwrap();

        let data = b"prefixed";
        let id = ObjectId::from_bytes(data);
        store.put(&id, data).unwrap();

        let hex = id.to_hex();
        let expected = dir
            .path()
            .join(&hex[..4])
            .join(format!("{hex}.chunk"));
        assert!(expected.is_file());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_local(dir.path()).unwrap();

        let data = b"clean write";
        let id = ObjectId::from_bytes(data);
        store.put(&id, data).unwrap();

        let hex = id.to_hex();
        let entries: Vec<_> = fs::read_dir(dir.path().join(&hex[..4]))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec![format!("{hex}.chunk")]);
    }

    #[test]
    fn test_seed_store_requires_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            Store::open_seed(&missing),
            Err(SyncError::InvalidArgument(_))
        ));
    }
}
