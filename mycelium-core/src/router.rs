//! Inbound payload routing: fragments go to the object store, sealed chat
//! goes through the secure channel. One payload in, one outcome out.

use log::{debug, warn};

use crate::secure::{InboundChat, SecureChannel};
use crate::store::{ObjectStore, RecordStore, StorageError};
use crate::wire::{self, FrameDecodeError};
use crate::protocol::Payload;

/// What routing one inbound frame accomplished.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    FragmentsStored {
        file_id: String,
        newly_stored: usize,
        total_for_file: usize,
    },
    Chat {
        sender: String,
        disposition: InboundChat,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// The frame did not decode to any known payload. Non-fatal; the
    /// offending payload is dropped.
    #[error("unrecognized payload: {0}")]
    Unrecognized(#[from] FrameDecodeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Route one inbound frame from the active session.
pub fn route<S: RecordStore>(
    bytes: &[u8],
    store: &mut ObjectStore<S>,
    channel: &mut SecureChannel,
) -> Result<RouteOutcome, RoutingError> {
    let (payload, _) = wire::decode_frame(bytes)?;
    match payload {
        Payload::FragmentDelivery {
            metadata,
            fragments,
        } => {
            let file_id = metadata.file_id.clone();
            store.put_metadata(metadata)?;
            let newly_stored = store.add_fragments(&file_id, fragments)?;
            let total_for_file = store.fragments_for(&file_id)?.len();
            debug!(
                "stored {newly_stored} new fragment(s) for {file_id} ({total_for_file} total)"
            );
            Ok(RouteOutcome::FragmentsStored {
                file_id,
                newly_stored,
                total_for_file,
            })
        }
        Payload::EncryptedChat { sender, sealed } => {
            let disposition = channel.accept_inbound(&sender, sealed);
            if disposition == InboundChat::Rejected {
                warn!("dropped chat payload from {sender}: authentication failed");
            }
            Ok(RouteOutcome::Chat {
                sender,
                disposition,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure::{self, SealedMessage};
    use crate::store::{FileMetadata, Fragment, MemoryStore};
    use crate::wire::encode_frame;

    fn delivery_frame(file_id: &str, seqs: &[u32]) -> Vec<u8> {
        let payload = Payload::FragmentDelivery {
            metadata: FileMetadata {
                file_id: file_id.to_string(),
                oti: vec![0u8; 12],
                file_name: "f.bin".to_string(),
                file_type: "application/octet-stream".to_string(),
            },
            fragments: seqs
                .iter()
                .map(|&s| Fragment {
                    file_id: file_id.to_string(),
                    sequence_info: s,
                    payload: vec![s as u8; 16],
                })
                .collect(),
        };
        encode_frame(&payload).unwrap()
    }

    #[test]
    fn fragment_delivery_lands_in_store() {
        let mut store = ObjectStore::new(MemoryStore::new());
        let mut channel = SecureChannel::new();
        let outcome = route(&delivery_frame("f-1", &[0, 1, 2]), &mut store, &mut channel).unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::FragmentsStored {
                file_id: "f-1".to_string(),
                newly_stored: 3,
                total_for_file: 3,
            }
        );
        assert_eq!(store.file_count().unwrap(), 1);
    }

    #[test]
    fn redelivered_batch_reports_zero_new() {
        let mut store = ObjectStore::new(MemoryStore::new());
        let mut channel = SecureChannel::new();
        let frame = delivery_frame("f-1", &[0, 1]);
        route(&frame, &mut store, &mut channel).unwrap();
        let outcome = route(&frame, &mut store, &mut channel).unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::FragmentsStored {
                file_id: "f-1".to_string(),
                newly_stored: 0,
                total_for_file: 2,
            }
        );
        // Metadata stays single despite the repeated upsert.
        assert_eq!(store.file_count().unwrap(), 1);
    }

    #[test]
    fn chat_with_secret_is_delivered() {
        let mut store = ObjectStore::new(MemoryStore::new());
        let mut channel = SecureChannel::new();
        channel.set_secret("correct-horse");

        let key = secure::derive_key("correct-horse");
        let sealed = secure::encrypt(&key, b"hello").unwrap();
        let frame = encode_frame(&Payload::EncryptedChat {
            sender: "peer-a".to_string(),
            sealed,
        })
        .unwrap();

        match route(&frame, &mut store, &mut channel).unwrap() {
            RouteOutcome::Chat {
                sender,
                disposition: InboundChat::Delivered(text),
            } => {
                assert_eq!(sender, "peer-a");
                assert_eq!(text, "hello");
            }
            other => panic!("expected delivered chat, got {other:?}"),
        }
    }

    #[test]
    fn chat_without_secret_is_buffered() {
        let mut store = ObjectStore::new(MemoryStore::new());
        let mut channel = SecureChannel::new();
        let sealed = SealedMessage {
            nonce: [0u8; 12],
            ciphertext: vec![1, 2, 3],
        };
        let frame = encode_frame(&Payload::EncryptedChat {
            sender: "peer-a".to_string(),
            sealed,
        })
        .unwrap();
        let outcome = route(&frame, &mut store, &mut channel).unwrap();
        assert!(matches!(
            outcome,
            RouteOutcome::Chat {
                disposition: InboundChat::Buffered,
                ..
            }
        ));
        assert!(channel.has_pending());
    }

    #[test]
    fn unrecognized_bytes_are_a_routing_error() {
        let mut store = ObjectStore::new(MemoryStore::new());
        let mut channel = SecureChannel::new();
        let mut junk = vec![12u8, 0, 0, 0];
        junk.extend_from_slice(&[0xEEu8; 12]);
        assert!(matches!(
            route(&junk, &mut store, &mut channel),
            Err(RoutingError::Unrecognized(_))
        ));
        // Nothing was written.
        assert_eq!(store.fragment_count().unwrap(), 0);
    }
}
