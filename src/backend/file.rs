//! JSON-file storage medium.
//!
//! The whole medium is one JSON object on disk. It is loaded once on open and written
//! back after every mutation with a temp-file + rename swap, so a crash never leaves a
//! half-written file behind.

use super::StorageBackend;
use crate::error::BackendError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// A medium persisted to a single JSON file.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    data: RwLock<BTreeMap<String, String>>,
    capacity: Option<usize>,
}

impl FileBackend {
    /// Opens the medium at `path`, creating an empty one if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Io`] if the file cannot be read and
    /// [`BackendError::Serialization`] if it is not a JSON string map.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), records = data.len(), "File medium opened");

        Ok(Self {
            path,
            data: RwLock::new(data),
            capacity: None,
        })
    }

    /// Bounds the medium to `capacity` bytes of keys and values.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, data: &BTreeMap<String, String>) -> Result<(), BackendError> {
        let json = serde_json::to_string_pretty(data)?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &self.path)?;
        trace!(path = %self.path.display(), "File medium saved");
        Ok(())
    }

    fn used(data: &BTreeMap<String, String>) -> usize {
        data.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut data = self.data.write();

        if let Some(capacity) = self.capacity {
            let released = data.get(key).map(|old| key.len() + old.len()).unwrap_or(0);
            let used_without = Self::used(&data) - released;
            let needed = key.len() + value.len();
            if used_without + needed > capacity {
                return Err(BackendError::QuotaExceeded {
                    needed,
                    available: capacity.saturating_sub(used_without),
                });
            }
        }

        let previous = data.insert(key.to_string(), value.to_string());
        if let Err(e) = self.save(&data) {
            // Keep memory and disk in agreement
            match previous {
                Some(old) => data.insert(key.to_string(), old),
                None => data.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        let mut data = self.data.write();
        if let Some(old) = data.remove(key) {
            if let Err(e) = self.save(&data) {
                data.insert(key.to_string(), old);
                return Err(e);
            }
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.data.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("medium.json");

        {
            let medium = FileBackend::open(&path).unwrap();
            medium.set("app_name", "\"alice\"").unwrap();
            medium.set("app_gone", "1").unwrap();
            medium.remove("app_gone").unwrap();
        }

        let medium = FileBackend::open(&path).unwrap();
        assert_eq!(medium.get("app_name").unwrap(), Some("\"alice\"".to_string()));
        assert_eq!(medium.get("app_gone").unwrap(), None);
        assert_eq!(medium.keys().unwrap(), vec!["app_name".to_string()]);
    }

    #[test]
    fn test_empty_file_is_empty_medium() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let medium = FileBackend::open(file.path()).unwrap();
        assert!(medium.keys().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), "not json").unwrap();
        assert!(matches!(
            FileBackend::open(file.path()),
            Err(BackendError::Serialization(_))
        ));
    }

    #[test]
    fn test_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let medium = FileBackend::open(dir.path().join("m.json"))
            .unwrap()
            .with_capacity(8);
        medium.set("ab", "cd").unwrap();
        let err = medium.set("big", "xxxxxxxx").unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(medium.get("big").unwrap(), None);
    }
}
