//! Inter-peer payloads riding on an established session. Encoding is
//! bincode; framing is length-prefix (see wire module).

use serde::{Deserialize, Serialize};

use crate::secure::SealedMessage;
use crate::store::{FileMetadata, Fragment};

/// Current protocol version. Hosts check it during their handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Everything one peer can send another over an active session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// A batch of fragments for one file, with the metadata needed to
    /// reconstruct it. Metadata is repeated per batch; the store upserts.
    FragmentDelivery {
        metadata: FileMetadata,
        fragments: Vec<Fragment>,
    },
    /// An end-to-end encrypted chat line.
    EncryptedChat {
        sender: String,
        sealed: SealedMessage,
    },
}
