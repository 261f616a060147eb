//! Secure chat channel: key derivation from a shared secret, authenticated
//! encryption of chat payloads, and the single-slot pending-message buffer.
//!
//! Both peers derive the same key from the same human-entered secret; the
//! key itself never crosses the wire. KDF and AEAD parameters must match on
//! both sides.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Application-wide KDF salt. Cross-peer constant.
pub const KDF_SALT: &[u8] = b"mycelium-chat-v1";
/// PBKDF2 iteration count. Cross-peer constant.
pub const KDF_ITERATIONS: u32 = 150_000;
/// AEAD nonce length in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// One encrypted chat payload as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// One chat line. History is volatile and append-only in arrival order.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
    pub direction: Direction,
}

/// Authentication failure. Wrong secret, tampering, and corrupted framing
/// are deliberately indistinguishable; decryption fails closed.
#[derive(Debug, thiserror::Error)]
#[error("decryption failed: wrong or missing shared secret")]
pub struct DecryptionError;

#[derive(Debug, thiserror::Error)]
#[error("encryption failed")]
pub struct EncryptError;

/// Derive the 32-byte channel key from a human-entered secret. Deterministic:
/// the same secret always yields the same key on every peer.
pub fn derive_key(secret: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), KDF_SALT, KDF_ITERATIONS, &mut key);
    key
}

/// Encrypt a chat payload with a fresh random 96-bit nonce. A repeated nonce
/// under one key breaks the cipher, so the nonce is drawn from the OS RNG on
/// every call and never reused by construction.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<SealedMessage, EncryptError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| EncryptError)?;
    Ok(SealedMessage { nonce, ciphertext })
}

/// Decrypt and authenticate a sealed payload.
pub fn decrypt(key: &[u8; 32], sealed: &SealedMessage) -> Result<Vec<u8>, DecryptionError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_ref())
        .map_err(|_| DecryptionError)
}

/// What happened to an inbound sealed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundChat {
    /// Decrypted and appended to history.
    Delivered(String),
    /// No secret set yet; buffered (replacing any earlier buffered payload).
    Buffered,
    /// Authentication failed; payload dropped.
    Rejected,
}

/// Stateful secure channel: the derived key (if a secret has been entered),
/// the single-slot pending buffer, and the chat history.
#[derive(Default)]
pub struct SecureChannel {
    key: Option<[u8; 32]>,
    pending: Option<(String, SealedMessage)>,
    history: Vec<ChatMessage>,
}

impl SecureChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_secret(&self) -> bool {
        self.key.is_some()
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Set (or replace) the shared secret. Any buffered payload is drained
    /// through decryption exactly once and discarded whatever the outcome.
    /// Returns the drained message when it authenticated.
    pub fn set_secret(&mut self, secret: &str) -> Option<ChatMessage> {
        let key = derive_key(secret);
        self.key = Some(key);
        let (sender, sealed) = self.pending.take()?;
        match decrypt(&key, &sealed) {
            Ok(plain) => {
                let message = ChatMessage {
                    sender,
                    text: String::from_utf8_lossy(&plain).into_owned(),
                    direction: Direction::Received,
                };
                self.history.push(message.clone());
                Some(message)
            }
            Err(DecryptionError) => None,
        }
    }

    /// Encrypt an outgoing chat line and append it to history as sent.
    pub fn seal_outgoing(
        &mut self,
        local_id: &str,
        text: &str,
    ) -> Result<Option<SealedMessage>, EncryptError> {
        let Some(key) = self.key else {
            return Ok(None);
        };
        let sealed = encrypt(&key, text.as_bytes())?;
        self.history.push(ChatMessage {
            sender: local_id.to_string(),
            text: text.to_string(),
            direction: Direction::Sent,
        });
        Ok(Some(sealed))
    }

    /// Handle an inbound sealed payload: decrypt if a secret is set, buffer
    /// otherwise. The buffer holds at most one payload; the newest wins.
    pub fn accept_inbound(&mut self, sender: &str, sealed: SealedMessage) -> InboundChat {
        let Some(key) = self.key else {
            self.pending = Some((sender.to_string(), sealed));
            return InboundChat::Buffered;
        };
        match decrypt(&key, &sealed) {
            Ok(plain) => {
                let text = String::from_utf8_lossy(&plain).into_owned();
                self.history.push(ChatMessage {
                    sender: sender.to_string(),
                    text: text.clone(),
                    direction: Direction::Received,
                });
                InboundChat::Delivered(text)
            }
            Err(DecryptionError) => InboundChat::Rejected,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn same_secret_derives_interoperable_keys() {
        let a = derive_key("correct-horse");
        let b = derive_key("correct-horse");
        let sealed = encrypt(&a, b"hello").unwrap();
        assert_eq!(decrypt(&b, &sealed).unwrap(), b"hello");
    }

    #[test]
    fn different_secret_never_decrypts() {
        let a = derive_key("correct-horse");
        let b = derive_key("battery-staple");
        let sealed = encrypt(&a, b"hello").unwrap();
        assert!(decrypt(&b, &sealed).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let key = derive_key("s");
        let mut sealed = encrypt(&key, b"payload").unwrap();
        sealed.ciphertext[0] ^= 0xff;
        assert!(decrypt(&key, &sealed).is_err());
    }

    #[test]
    fn nonces_do_not_repeat() {
        let key = derive_key("s");
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let sealed = encrypt(&key, b"x").unwrap();
            assert!(seen.insert(sealed.nonce), "nonce repeated");
        }
    }

    #[test]
    fn inbound_before_secret_is_buffered_then_drained_once() {
        let key = derive_key("correct-horse");
        let sealed = encrypt(&key, b"early bird").unwrap();

        let mut channel = SecureChannel::new();
        assert_eq!(channel.accept_inbound("peer", sealed), InboundChat::Buffered);
        assert!(channel.has_pending());

        let drained = channel.set_secret("correct-horse").unwrap();
        assert_eq!(drained.text, "early bird");
        assert_eq!(drained.sender, "peer");
        assert!(!channel.has_pending());
        assert_eq!(channel.history().len(), 1);

        // Setting the secret again must not replay the buffer.
        assert!(channel.set_secret("correct-horse").is_none());
        assert_eq!(channel.history().len(), 1);
    }

    #[test]
    fn newest_pending_message_replaces_older() {
        let key = derive_key("correct-horse");
        let first = encrypt(&key, b"first").unwrap();
        let second = encrypt(&key, b"second").unwrap();

        let mut channel = SecureChannel::new();
        channel.accept_inbound("peer", first);
        channel.accept_inbound("peer", second);
        assert_eq!(
            channel.set_secret("correct-horse").unwrap().text,
            "second"
        );
        assert_eq!(channel.history().len(), 1);
    }

    #[test]
    fn buffered_message_is_discarded_even_when_wrong_secret() {
        let key = derive_key("correct-horse");
        let sealed = encrypt(&key, b"lost").unwrap();

        let mut channel = SecureChannel::new();
        channel.accept_inbound("peer", sealed);
        assert!(channel.set_secret("wrong").is_none());
        assert!(!channel.has_pending());
        // The buffer was drained exactly once; a correct secret later cannot
        // recover the discarded payload.
        assert!(channel.set_secret("correct-horse").is_none());
        assert!(channel.history().is_empty());
    }

    #[test]
    fn outgoing_requires_a_secret() {
        let mut channel = SecureChannel::new();
        assert!(channel.seal_outgoing("me", "hi").unwrap().is_none());
        channel.set_secret("s");
        let sealed = channel.seal_outgoing("me", "hi").unwrap().unwrap();
        assert_eq!(decrypt(&derive_key("s"), &sealed).unwrap(), b"hi");
        assert_eq!(channel.history().len(), 1);
        assert_eq!(channel.history()[0].direction, Direction::Sent);
    }

    #[test]
    fn two_peers_exchange_hello() {
        let mut alice = SecureChannel::new();
        let mut bob = SecureChannel::new();
        alice.set_secret("correct-horse");
        bob.set_secret("correct-horse");

        let sealed = alice.seal_outgoing("alice", "hello").unwrap().unwrap();
        match bob.accept_inbound("alice", sealed) {
            InboundChat::Delivered(text) => assert_eq!(text, "hello"),
            other => panic!("expected delivery, got {other:?}"),
        }
    }
}
