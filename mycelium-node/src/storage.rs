//! JSON-file record store: the daemon's durable backend. The whole state is
//! one serde_json document rewritten on every mutation; fine at this scale.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use mycelium_core::{FileMetadata, Fragment, RecordStore, StorageError};

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    values: HashMap<String, String>,
    /// Recency order; the last entry is the latest file.
    files: Vec<FileMetadata>,
    fragments: Vec<Fragment>,
}

pub struct JsonStore {
    path: PathBuf,
    state: State,
}

impl JsonStore {
    pub fn open(path: PathBuf) -> Result<Self, StorageError> {
        let state = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| StorageError::Read(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(e) => return Err(StorageError::Read(format!("{}: {e}", path.display()))),
        };
        Ok(Self { path, state })
    }

    fn persist(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Write(format!("{}: {e}", parent.display())))?;
        }
        let text = serde_json::to_string(&self.state)
            .map_err(|e| StorageError::Write(e.to_string()))?;
        std::fs::write(&self.path, text)
            .map_err(|e| StorageError::Write(format!("{}: {e}", self.path.display())))
    }
}

impl RecordStore for JsonStore {
    fn put_file(&mut self, meta: FileMetadata) -> Result<(), StorageError> {
        self.state.files.retain(|f| f.file_id != meta.file_id);
        self.state.files.push(meta);
        self.persist()
    }

    fn get_file(&self, file_id: &str) -> Result<Option<FileMetadata>, StorageError> {
        Ok(self
            .state
            .files
            .iter()
            .find(|f| f.file_id == file_id)
            .cloned())
    }

    fn latest_file(&self) -> Result<Option<FileMetadata>, StorageError> {
        Ok(self.state.files.last().cloned())
    }

    fn file_count(&self) -> Result<usize, StorageError> {
        Ok(self.state.files.len())
    }

    fn append_fragments(&mut self, fragments: Vec<Fragment>) -> Result<(), StorageError> {
        self.state.fragments.extend(fragments);
        self.persist()
    }

    fn fragments_for(&self, file_id: &str) -> Result<Vec<Fragment>, StorageError> {
        Ok(self
            .state
            .fragments
            .iter()
            .filter(|f| f.file_id == file_id)
            .cloned()
            .collect())
    }

    fn fragment_count(&self) -> Result<usize, StorageError> {
        Ok(self.state.fragments.len())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.state.files.clear();
        self.state.fragments.clear();
        self.persist()
    }

    fn get_value(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.state.values.get(key).cloned())
    }

    fn put_value(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.state
            .values
            .insert(key.to_string(), value.to_string());
        self.persist()
    }

    fn delete_value(&mut self, key: &str) -> Result<(), StorageError> {
        self.state.values.remove(key);
        self.persist()
    }
}
