//! Node identity: a durable peer identifier, created once and persisted
//! until explicitly reset.

use serde::{Deserialize, Serialize};

use crate::store::{RecordStore, StorageError};

/// Well-known key of the persisted identity record.
const IDENTITY_KEY: &str = "identity.peer-id";

/// Opaque peer identifier naming this node to the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity persistence failed: {0}")]
    Storage(#[from] StorageError),
}

/// Return the persisted identifier, or mint and persist a fresh one.
/// Idempotent: repeated calls within a process lifetime yield the same id.
pub fn load_or_create<S: RecordStore>(store: &mut S) -> Result<PeerId, IdentityError> {
    if let Some(existing) = store.get_value(IDENTITY_KEY)? {
        return Ok(PeerId(existing));
    }
    let fresh = uuid::Uuid::new_v4().to_string();
    store.put_value(IDENTITY_KEY, &fresh)?;
    Ok(PeerId(fresh))
}

/// Invalidate the persisted identifier. The next `load_or_create` mints a
/// new one; any session tied to the old id must be re-established.
pub fn reset<S: RecordStore>(store: &mut S) -> Result<(), IdentityError> {
    store.delete_value(IDENTITY_KEY)?;
    Ok(())
}
