//! Object store: file metadata (upsert by id) and fragments (append-only),
//! behind a two-table record-store trait so hosts can pick their own backend.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reconstruction metadata for one file. Upserted by `file_id`, never duplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: String,
    /// Opaque transfer information from the coding engine; required to decode.
    pub oti: Vec<u8>,
    pub file_name: String,
    pub file_type: String,
}

/// One erasure-coded fragment. `sequence_info` is the encoder's encoding
/// symbol id; `(file_id, sequence_info)` is the fragment's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub file_id: String,
    pub sequence_info: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage read failed: {0}")]
    Read(String),
    #[error("storage write failed: {0}")]
    Write(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Durable record store: a `files` table keyed by file id, a `fragments`
/// table with auto-assigned keys indexed by file id, and a single-value slot
/// for the persisted identity. Backends must apply writes in call order.
pub trait RecordStore {
    /// Upsert metadata by `file_id`. A re-put refreshes the file's recency.
    fn put_file(&mut self, meta: FileMetadata) -> Result<(), StorageError>;
    fn get_file(&self, file_id: &str) -> Result<Option<FileMetadata>, StorageError>;
    /// Most recently put (or re-put) file metadata.
    fn latest_file(&self) -> Result<Option<FileMetadata>, StorageError>;
    fn file_count(&self) -> Result<usize, StorageError>;

    fn append_fragments(&mut self, fragments: Vec<Fragment>) -> Result<(), StorageError>;
    fn fragments_for(&self, file_id: &str) -> Result<Vec<Fragment>, StorageError>;
    fn fragment_count(&self) -> Result<usize, StorageError>;

    /// Empty both tables in one call; counts observed afterwards are zero.
    fn clear(&mut self) -> Result<(), StorageError>;

    fn get_value(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn put_value(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    fn delete_value(&mut self, key: &str) -> Result<(), StorageError>;
}

/// In-memory backend. Backs tests and any host that does not need durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: HashMap<String, FileMetadata>,
    /// File ids in recency order; last entry is the latest.
    file_order: Vec<String>,
    fragments: Vec<Fragment>,
    values: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn put_file(&mut self, meta: FileMetadata) -> Result<(), StorageError> {
        self.file_order.retain(|id| *id != meta.file_id);
        self.file_order.push(meta.file_id.clone());
        self.files.insert(meta.file_id.clone(), meta);
        Ok(())
    }

    fn get_file(&self, file_id: &str) -> Result<Option<FileMetadata>, StorageError> {
        Ok(self.files.get(file_id).cloned())
    }

    fn latest_file(&self) -> Result<Option<FileMetadata>, StorageError> {
        Ok(self
            .file_order
            .last()
            .and_then(|id| self.files.get(id))
            .cloned())
    }

    fn file_count(&self) -> Result<usize, StorageError> {
        Ok(self.files.len())
    }

    fn append_fragments(&mut self, fragments: Vec<Fragment>) -> Result<(), StorageError> {
        self.fragments.extend(fragments);
        Ok(())
    }

    fn fragments_for(&self, file_id: &str) -> Result<Vec<Fragment>, StorageError> {
        Ok(self
            .fragments
            .iter()
            .filter(|f| f.file_id == file_id)
            .cloned()
            .collect())
    }

    fn fragment_count(&self) -> Result<usize, StorageError> {
        Ok(self.fragments.len())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.files.clear();
        self.file_order.clear();
        self.fragments.clear();
        Ok(())
    }

    fn get_value(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.get(key).cloned())
    }

    fn put_value(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_value(&mut self, key: &str) -> Result<(), StorageError> {
        self.values.remove(key);
        Ok(())
    }
}

/// Object store over a record-store backend. Owns the write policy: metadata
/// is upserted, fragments are appended with redelivered duplicates dropped.
pub struct ObjectStore<S: RecordStore> {
    backend: S,
}

impl<S: RecordStore> ObjectStore<S> {
    pub fn new(backend: S) -> Self {
        Self { backend }
    }

    /// Upsert by `file_id`; calling twice with the same id leaves one record.
    pub fn put_metadata(&mut self, meta: FileMetadata) -> Result<(), StorageError> {
        self.backend.put_file(meta)
    }

    pub fn metadata_for(&self, file_id: &str) -> Result<Option<FileMetadata>, StorageError> {
        self.backend.get_file(file_id)
    }

    /// Append fragments for `file_id`, skipping any whose
    /// `(file_id, sequence_info)` identity is already stored. Returns the
    /// number of fragments newly stored.
    pub fn add_fragments(
        &mut self,
        file_id: &str,
        fragments: Vec<Fragment>,
    ) -> Result<usize, StorageError> {
        let mut seen: std::collections::HashSet<u32> = self
            .backend
            .fragments_for(file_id)?
            .into_iter()
            .map(|f| f.sequence_info)
            .collect();
        let fresh: Vec<Fragment> = fragments
            .into_iter()
            .filter(|f| f.file_id == file_id && seen.insert(f.sequence_info))
            .collect();
        let stored = fresh.len();
        if stored > 0 {
            self.backend.append_fragments(fresh)?;
        }
        Ok(stored)
    }

    /// Snapshot of all fragments currently stored for a file. Re-reads
    /// current state on every call.
    pub fn fragments_for(&self, file_id: &str) -> Result<Vec<Fragment>, StorageError> {
        self.backend.fragments_for(file_id)
    }

    pub fn latest_file(&self) -> Result<Option<FileMetadata>, StorageError> {
        self.backend.latest_file()
    }

    pub fn fragment_count(&self) -> Result<usize, StorageError> {
        self.backend.fragment_count()
    }

    pub fn file_count(&self) -> Result<usize, StorageError> {
        self.backend.file_count()
    }

    pub fn clear(&mut self) -> Result<(), StorageError> {
        self.backend.clear()
    }

    pub fn records(&self) -> &S {
        &self.backend
    }

    pub fn records_mut(&mut self) -> &mut S {
        &mut self.backend
    }
}
