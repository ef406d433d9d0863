//! JSON file key-value store
//!
//! The whole store lives in one JSON document that is rewritten on every put.
//! Writes go to a sibling temporary file first and are renamed into place.

use super::KeyValueStore;
use crate::error::PredictError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    sets: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    blobs: BTreeMap<String, Vec<u8>>,
}

/// Key-value store persisted to a JSON file
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    document: Mutex<Document>,
}

impl FileStore {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PredictError> {
        let path = path.as_ref().to_path_buf();
        let document = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => Document::default(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), keys = document.sets.len() + document.blobs.len(), "opened state file");
        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    fn document(&self) -> MutexGuard<'_, Document> {
        self.document
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keys of every stored entry
    pub fn keys(&self) -> Vec<String> {
        let document = self.document();
        let mut keys: Vec<String> = document
            .sets
            .keys()
            .chain(document.blobs.keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    fn flush(&self, document: &Document) -> Result<(), PredictError> {
        let json = serde_json::to_string_pretty(document)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get_string_set(&self, key: &str) -> Result<Option<BTreeSet<String>>, PredictError> {
        Ok(self.document().sets.get(key).cloned())
    }

    fn put_string_set(&self, key: &str, values: &BTreeSet<String>) -> Result<(), PredictError> {
        let mut document = self.document();
        document.sets.insert(key.to_string(), values.clone());
        self.flush(&document)
    }

    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, PredictError> {
        Ok(self.document().blobs.get(key).cloned())
    }

    fn put_bytes(&self, key: &str, value: &[u8]) -> Result<(), PredictError> {
        let mut document = self.document();
        document.blobs.insert(key.to_string(), value.to_vec());
        self.flush(&document)
    }

    fn remove(&self, key: &str) -> Result<(), PredictError> {
        let mut document = self.document();
        let had_set = document.sets.remove(key).is_some();
        let had_blob = document.blobs.remove(key).is_some();
        if had_set || had_blob {
            self.flush(&document)?;
        }
        Ok(())
    }
}
