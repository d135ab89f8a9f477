//! On-disk cache for encoded payloads.
//!
//! Encoded rows and firmware images are written once and read back packet by
//! packet during a transfer, so large payloads never sit in memory twice.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use uuid::Uuid;

use crate::error::Error;

/// Cache directory holding encoded payloads, one file per blob.
#[derive(Debug, Clone)]
pub struct PayloadStore {
    dir: PathBuf,
}

impl PayloadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| Error::Storage {
            path: dir.clone(),
            source,
        })?;
        Ok(PayloadStore { dir })
    }

    /// Store under `<temp>/inkline-cache`.
    pub fn in_temp_dir() -> Result<Self, Error> {
        Self::new(std::env::temp_dir().join("inkline-cache"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` to a fresh file named `<prefix>-<uuid>.bin`.
    pub fn save(&self, prefix: &str, bytes: &[u8]) -> Result<PathBuf, Error> {
        let path = self.dir.join(format!("{}-{}.bin", prefix, Uuid::new_v4()));
        fs::write(&path, bytes).map_err(|source| Error::Storage {
            path: path.clone(),
            source,
        })?;
        debug!("stored {} bytes at {:?}", bytes.len(), path);
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Vec<u8>, Error> {
        fs::read(path).map_err(|source| Error::Storage {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn remove(path: &Path) -> Result<(), Error> {
        fs::remove_file(path).map_err(|source| Error::Storage {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Store in a fresh temp directory, deleted with its files on drop.
#[cfg(test)]
pub(crate) struct TestStore(PayloadStore);

#[cfg(test)]
impl std::ops::Deref for TestStore {
    type Target = PayloadStore;

    fn deref(&self) -> &PayloadStore {
        &self.0
    }
}

#[cfg(test)]
impl Drop for TestStore {
    fn drop(&mut self) {
        fs::remove_dir_all(self.0.dir()).ok();
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> TestStore {
    TestStore(
        PayloadStore::new(std::env::temp_dir().join(format!("inkline-test-{}", Uuid::new_v4())))
            .unwrap(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load() {
        let store = test_store();
        let path = store.save("row", &[1, 2, 3]).unwrap();
        assert!(path.starts_with(store.dir()));
        assert_eq!(PayloadStore::load(&path).unwrap(), vec![1, 2, 3]);

        PayloadStore::remove(&path).unwrap();
        assert!(matches!(
            PayloadStore::load(&path),
            Err(Error::Storage { .. })
        ));
    }

    #[test]
    fn file_names_are_unique() {
        let store = test_store();
        let a = store.save("row", &[]).unwrap();
        let b = store.save("row", &[]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_store_cleans_up() {
        let store = test_store();
        let dir = store.dir().to_path_buf();
        store.save("row", &[1]).unwrap();
        drop(store);
        assert!(!dir.exists());
    }
}
