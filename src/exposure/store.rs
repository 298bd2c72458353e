//! Persistence of the last successful exposure index.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

/// Default state file name, relative to the working directory.
pub const DEFAULT_STATE_FILE: &str = ".capture_info";

const INDEX_KEY: &str = "capture_idx";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// JSON object file holding `{"capture_idx": N}`.
///
/// Keys other than `capture_idx` already in the file survive a save.
#[derive(Debug, Clone)]
pub struct ExposureStore {
    path: PathBuf,
}

impl ExposureStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored index. Anything unusable reads as no history.
    pub fn load(&self) -> Option<usize> {
        let object = self.read_object()?;
        let index = object.get(INDEX_KEY)?.as_u64()?;
        usize::try_from(index).ok()
    }

    fn read_object(&self) -> Option<Map<String, Value>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("Cannot read {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(Value::Object(object)) => Some(object),
            Ok(_) => {
                log::warn!("{} does not hold a JSON object", self.path.display());
                None
            }
            Err(e) => {
                log::warn!("Cannot parse {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Write `index`, replacing the file atomically.
    pub fn save(&self, index: usize) -> Result<(), StoreError> {
        let mut object = self.read_object().unwrap_or_default();
        object.insert(INDEX_KEY.to_string(), Value::from(index));
        let body = serde_json::to_string_pretty(&Value::Object(object))?;

        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.tmp_path();
        std::fs::write(&tmp, body).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Default for ExposureStore {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let store = ExposureStore::new(dir.path().join(".capture_info"));
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = ExposureStore::new(dir.path().join("state").join(".capture_info"));
        store.save(11).unwrap();
        assert_eq!(store.load(), Some(11));
        store.save(3).unwrap();
        assert_eq!(store.load(), Some(3));
        assert!(!dir.path().join("state").join(".capture_info.tmp").exists());
    }

    #[test]
    fn test_save_preserves_other_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".capture_info");
        std::fs::write(&path, r#"{"capture_idx": 2, "note": "keep me"}"#).unwrap();
        let store = ExposureStore::new(&path);
        store.save(9).unwrap();

        let value: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["capture_idx"], 9);
        assert_eq!(value["note"], "keep me");
    }

    #[test]
    fn test_unusable_contents_are_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".capture_info");
        let store = ExposureStore::new(&path);

        for body in [
            "not json",
            "[1, 2]",
            r#"{"other": 1}"#,
            r#"{"capture_idx": -1}"#,
            r#"{"capture_idx": "4"}"#,
            r#"{"capture_idx": 2.5}"#,
        ] {
            std::fs::write(&path, body).unwrap();
            assert_eq!(store.load(), None, "body {:?}", body);
        }
    }

    #[test]
    fn test_save_over_garbage_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".capture_info");
        std::fs::write(&path, "garbage").unwrap();
        let store = ExposureStore::new(&path);
        store.save(5).unwrap();
        assert_eq!(store.load(), Some(5));
    }
}
