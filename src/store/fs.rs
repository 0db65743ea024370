//! Default blob store on the local filesystem.
//!
//! One file per key under a base directory. Writes go through a temp file
//! and an atomic rename, so a crash mid-write never leaves a readable
//! half-blob behind.

use std::io::ErrorKind;
use std::path::PathBuf;

use super::{BlobStore, StorageError};

pub struct FsBlobStore {
    base_dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<String, StorageError> {
        let path = self.base_dir.join(format!("{key}.bin"));
        let tmp = self.base_dir.join(format!("{key}.bin.tmp"));

        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path.to_string_lossy().into_owned())
    }

    fn get(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        match std::fs::read(location) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::BlobMissing(location.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, location: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(location) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
