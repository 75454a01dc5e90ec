//! Blob storage as `<dir>/<name>.blob` files.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use nowchat_core::{BlobStore, StoreError, BLOB_SIZE};

#[derive(Debug, Clone)]
pub struct DirBlobStore {
    dir: PathBuf,
}

impl DirBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
            && !name.contains('\0');
        if !valid {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.blob")))
    }
}

impl BlobStore for DirBlobStore {
    fn load_blob(&self, name: &str) -> Result<[u8; BLOB_SIZE], StoreError> {
        let path = self.path_for(name)?;
        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        <[u8; BLOB_SIZE]>::try_from(data.as_slice())
            .map_err(|_| StoreError::InvalidSize { len: data.len() })
    }

    fn save_blob(&mut self, name: &str, blob: &[u8; BLOB_SIZE]) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        std::fs::create_dir_all(&self.dir)?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::Exists(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(blob)?;
        tracing::debug!(path = %path.display(), "blob saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nowchat-blobs-{}-{tag}", std::process::id()))
    }

    #[test]
    fn save_then_load() {
        let dir = scratch("roundtrip");
        let mut store = DirBlobStore::new(&dir);
        store.save_blob("cat", &[9u8; BLOB_SIZE]).unwrap();
        assert!(dir.join("cat.blob").exists());
        assert_eq!(store.load_blob("cat").unwrap(), [9u8; BLOB_SIZE]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn existing_file_is_not_overwritten() {
        let dir = scratch("exists");
        let mut store = DirBlobStore::new(&dir);
        store.save_blob("cat", &[1u8; BLOB_SIZE]).unwrap();
        assert!(matches!(
            store.save_blob("cat", &[2u8; BLOB_SIZE]),
            Err(StoreError::Exists(_))
        ));
        assert_eq!(store.load_blob("cat").unwrap(), [1u8; BLOB_SIZE]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_and_wrong_size() {
        let dir = scratch("errors");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("short.blob"), [0u8; 10]).unwrap();
        let store = DirBlobStore::new(&dir);
        assert!(matches!(store.load_blob("nope"), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.load_blob("short"),
            Err(StoreError::InvalidSize { len: 10 })
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn path_names_rejected() {
        let store = DirBlobStore::new(scratch("names"));
        for bad in ["", "../x", "a/b", ".hidden"] {
            assert!(matches!(store.load_blob(bad), Err(StoreError::InvalidName(_))));
        }
    }
}
