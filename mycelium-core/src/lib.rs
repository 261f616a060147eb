//! Mycelium core: resilient file fragmentation and encrypted peer chat.
//! Host-driven: no I/O; the host passes transport events and receives
//! effects to perform.

pub mod identity;
pub mod store;
pub mod engine;
pub mod secure;
pub mod session;
pub mod protocol;
pub mod wire;
pub mod router;
pub mod node;

pub use identity::{IdentityError, PeerId};
pub use node::{ChatError, Effect, Event, MyceliumCore, ShareError, TransportFault};
pub use protocol::{Payload, PROTOCOL_VERSION};
pub use session::{HandleId, SessionState};
pub use store::{FileMetadata, Fragment, MemoryStore, ObjectStore, RecordStore, StorageError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
