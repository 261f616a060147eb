//! Host-driven coordinator: the host feeds transport events in, the core
//! returns effects out. All session transitions, routing, and store writes
//! happen here, one event at a time.

use std::collections::VecDeque;

use log::{debug, info, warn};

use crate::engine::{self, EncodingError, ReconstructionError};
use crate::identity::{self, IdentityError, PeerId};
use crate::router::{self, RouteOutcome, RoutingError};
use crate::secure::{EncryptError, InboundChat, SecureChannel};
use crate::session::{Closed, ConnectionError, HandleId, Incoming, SessionManager, SessionState};
use crate::store::{FileMetadata, Fragment, ObjectStore, RecordStore, StorageError};
use crate::wire::{self, FrameEncodeError};
use crate::protocol::Payload;

/// Fragments per delivery frame. Keeps frames well under the wire cap.
const FRAGMENTS_PER_FRAME: usize = 64;

/// Inbound transport event. The host queues these with `enqueue` and calls
/// `drain`; events are processed to completion in arrival order.
#[derive(Debug)]
pub enum Event {
    /// Transport confirmed the local identifier is registered and reachable.
    Registered,
    IncomingRequest { remote_id: String, handle: HandleId },
    Opened { handle: HandleId },
    Closed { handle: HandleId },
    TransportError {
        handle: Option<HandleId>,
        fault: TransportFault,
    },
    Data { handle: HandleId, bytes: Vec<u8> },
}

/// Why the transport reported an error.
#[derive(Debug)]
pub enum TransportFault {
    /// Our identifier is already claimed by another node.
    IdentifierUnavailable,
    ConnectionFailed,
    Other(String),
}

/// Action for the host to perform, or a status change to surface.
#[derive(Debug)]
pub enum Effect {
    /// Announce (or re-announce) the local identifier to the transport.
    Register { peer_id: PeerId },
    /// Open an outbound connection under the given handle.
    Dial { handle: HandleId, remote_id: String },
    Send { handle: HandleId, bytes: Vec<u8> },
    Close { handle: HandleId },
    SessionChanged(SessionState),
    /// An inbound request awaits accept/decline.
    RequestPending { remote_id: String },
    ChatReceived { sender: String, text: String },
    FragmentsStored {
        file_id: String,
        newly_stored: usize,
        total_for_file: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("no shared secret set")]
    NoSecret,
    #[error(transparent)]
    Encrypt(#[from] EncryptError),
    #[error(transparent)]
    Frame(#[from] FrameEncodeError),
}

#[derive(Debug, thiserror::Error)]
pub enum ShareError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Frame(#[from] FrameEncodeError),
}

/// The core: identity, session, store, and secure channel under one owner.
pub struct MyceliumCore<S: RecordStore> {
    peer_id: PeerId,
    session: SessionManager,
    store: ObjectStore<S>,
    channel: SecureChannel,
    queue: VecDeque<Event>,
}

impl<S: RecordStore> MyceliumCore<S> {
    /// Load (or mint) the durable identity and return the core plus the
    /// initial effects: the host must register the identifier and report
    /// back with `Event::Registered` before the session goes online.
    pub fn new(backend: S) -> Result<(Self, Vec<Effect>), IdentityError> {
        let mut store = ObjectStore::new(backend);
        let peer_id = identity::load_or_create(store.records_mut())?;
        info!("local peer id {peer_id}");
        let effects = vec![Effect::Register {
            peer_id: peer_id.clone(),
        }];
        Ok((
            Self {
                peer_id,
                session: SessionManager::new(),
                store,
                channel: SecureChannel::new(),
                queue: VecDeque::new(),
            },
            effects,
        ))
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn remote_peer(&self) -> Option<&str> {
        self.session.remote_peer()
    }

    pub fn active_handle(&self) -> Option<HandleId> {
        self.session.active_handle()
    }

    pub fn chat_history(&self) -> &[crate::secure::ChatMessage] {
        self.channel.history()
    }

    pub fn latest_file(&self) -> Result<Option<FileMetadata>, StorageError> {
        self.store.latest_file()
    }

    pub fn file_metadata(&self, file_id: &str) -> Result<Option<FileMetadata>, StorageError> {
        self.store.metadata_for(file_id)
    }

    pub fn fragment_count(&self) -> Result<usize, StorageError> {
        self.store.fragment_count()
    }

    pub fn file_count(&self) -> Result<usize, StorageError> {
        self.store.file_count()
    }

    /// Queue an inbound transport event for processing.
    pub fn enqueue(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    /// Process queued events one at a time, in arrival order, to completion.
    pub fn drain(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        while let Some(event) = self.queue.pop_front() {
            effects.extend(self.dispatch(event));
        }
        effects
    }

    fn dispatch(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Registered => {
                self.session.on_identity_ready();
                info!("session online as {}", self.peer_id);
                vec![Effect::SessionChanged(self.session.state())]
            }
            Event::IncomingRequest { remote_id, handle } => {
                match self.session.on_incoming(&remote_id, handle) {
                    Incoming::Admitted => {
                        info!("connection request from {remote_id}");
                        vec![
                            Effect::SessionChanged(SessionState::PendingApproval),
                            Effect::RequestPending { remote_id },
                        ]
                    }
                    Incoming::Refused => {
                        warn!(
                            "refused connection request from {remote_id} while {:?}",
                            self.session.state()
                        );
                        vec![Effect::Close { handle }]
                    }
                }
            }
            Event::Opened { handle } => {
                if self.session.on_opened(handle) {
                    info!("connected to {}", self.remote_peer().unwrap_or("peer"));
                    vec![Effect::SessionChanged(SessionState::Connected)]
                } else {
                    debug!("ignored open for stale handle {handle}");
                    vec![]
                }
            }
            Event::Closed { handle } => self.handle_lost(handle, "closed"),
            Event::TransportError { handle, fault } => match fault {
                TransportFault::IdentifierUnavailable => self.recover_identity(),
                fault => {
                    warn!("transport error on {handle:?}: {fault:?}");
                    match handle {
                        Some(h) => self.handle_lost(h, "failed"),
                        None => vec![],
                    }
                }
            },
            Event::Data { handle, bytes } => self.handle_data(handle, &bytes),
        }
    }

    fn handle_lost(&mut self, handle: HandleId, what: &str) -> Vec<Effect> {
        match self.session.on_closed(handle) {
            Closed::ActiveLost => {
                info!("session {what}; back online");
                vec![Effect::SessionChanged(SessionState::Online)]
            }
            Closed::PendingLost => {
                info!("pending request withdrawn");
                vec![Effect::SessionChanged(SessionState::Online)]
            }
            Closed::Stale => vec![],
        }
    }

    fn handle_data(&mut self, handle: HandleId, bytes: &[u8]) -> Vec<Effect> {
        // Data racing a teardown lands on a handle we no longer track.
        if self.session.state() != SessionState::Connected
            || self.session.active_handle() != Some(handle)
        {
            debug!("ignored {} byte(s) on inactive handle {handle}", bytes.len());
            return vec![];
        }
        match router::route(bytes, &mut self.store, &mut self.channel) {
            Ok(RouteOutcome::FragmentsStored {
                file_id,
                newly_stored,
                total_for_file,
            }) => vec![Effect::FragmentsStored {
                file_id,
                newly_stored,
                total_for_file,
            }],
            Ok(RouteOutcome::Chat {
                sender,
                disposition,
            }) => match disposition {
                InboundChat::Delivered(text) => vec![Effect::ChatReceived { sender, text }],
                InboundChat::Buffered => {
                    info!("chat from {sender} buffered until a secret is set");
                    vec![]
                }
                InboundChat::Rejected => vec![],
            },
            Err(RoutingError::Unrecognized(err)) => {
                warn!("dropped unroutable payload: {err}");
                vec![]
            }
            Err(RoutingError::Storage(err)) => {
                warn!("dropped payload, store unavailable: {err}");
                vec![]
            }
        }
    }

    /// The transport rejected our identifier as already claimed: reset the
    /// identity, mint a fresh one, and ask the host to register again.
    fn recover_identity(&mut self) -> Vec<Effect> {
        warn!("identifier {} already claimed; resetting identity", self.peer_id);
        let mut effects = Vec::new();
        if let Some(handle) = self.session.on_identity_reset() {
            effects.push(Effect::Close { handle });
        }
        effects.push(Effect::SessionChanged(SessionState::Offline));
        match identity::reset(self.store.records_mut())
            .and_then(|()| identity::load_or_create(self.store.records_mut()))
        {
            Ok(fresh) => {
                info!("new peer id {fresh}");
                self.peer_id = fresh.clone();
                effects.push(Effect::Register { peer_id: fresh });
            }
            Err(err) => warn!("identity reset failed: {err}"),
        }
        effects
    }

    /// User initiates an outbound connection. `handle` is the host's fresh
    /// handle for the dial it will make when it sees the `Dial` effect.
    pub fn connect(&mut self, remote_id: &str, handle: HandleId) -> Vec<Effect> {
        match self.session.connect(remote_id, handle) {
            Ok(()) => vec![
                Effect::SessionChanged(SessionState::Connecting),
                Effect::Dial {
                    handle,
                    remote_id: remote_id.to_string(),
                },
            ],
            Err(err) => {
                warn!("connect to {remote_id} refused: {err}");
                vec![Effect::Close { handle }]
            }
        }
    }

    /// User accepts the pending inbound request.
    pub fn accept(&mut self) -> Vec<Effect> {
        match self.session.accept() {
            Some(_) => {
                info!("accepted {}", self.remote_peer().unwrap_or("peer"));
                vec![Effect::SessionChanged(SessionState::Connected)]
            }
            None => {
                warn!("nothing to accept");
                vec![]
            }
        }
    }

    /// User declines the pending inbound request.
    pub fn decline(&mut self) -> Vec<Effect> {
        match self.session.decline() {
            Some(handle) => vec![
                Effect::Close { handle },
                Effect::SessionChanged(SessionState::Online),
            ],
            None => vec![],
        }
    }

    /// Enter the shared chat secret. Never persisted; drains any buffered
    /// inbound message exactly once.
    pub fn set_secret(&mut self, secret: &str) -> Vec<Effect> {
        match self.channel.set_secret(secret) {
            Some(message) => vec![Effect::ChatReceived {
                sender: message.sender,
                text: message.text,
            }],
            None => vec![],
        }
    }

    /// Encrypt and send one chat line over the active session.
    pub fn send_chat(&mut self, text: &str) -> Result<Vec<Effect>, ChatError> {
        let handle = match (self.session.state(), self.session.active_handle()) {
            (SessionState::Connected, Some(handle)) => handle,
            _ => return Err(ConnectionError::NotConnected.into()),
        };
        let sealed = self
            .channel
            .seal_outgoing(self.peer_id.as_str(), text)?
            .ok_or(ChatError::NoSecret)?;
        let bytes = wire::encode_frame(&Payload::EncryptedChat {
            sender: self.peer_id.as_str().to_string(),
            sealed,
        })?;
        Ok(vec![Effect::Send { handle, bytes }])
    }

    /// Encode a file, store its metadata and every generated fragment
    /// locally, and deliver the fragments to the connected peer if there is
    /// one. Returns the stored metadata alongside the effects.
    pub fn share_file(
        &mut self,
        file_name: &str,
        file_type: &str,
        data: &[u8],
    ) -> Result<(FileMetadata, Vec<Effect>), ShareError> {
        let encoded = engine::encode(data)?;
        let metadata = FileMetadata {
            file_id: uuid::Uuid::new_v4().to_string(),
            oti: encoded.oti,
            file_name: file_name.to_string(),
            file_type: file_type.to_string(),
        };
        let fragments: Vec<Fragment> = encoded
            .fragments
            .into_iter()
            .map(|(esi, payload)| Fragment {
                file_id: metadata.file_id.clone(),
                sequence_info: esi,
                payload,
            })
            .collect();
        self.store.put_metadata(metadata.clone())?;
        let stored = self
            .store
            .add_fragments(&metadata.file_id, fragments.clone())?;
        info!(
            "encoded {} into {stored} fragment(s) as {}",
            metadata.file_name, metadata.file_id
        );

        let mut effects = Vec::new();
        if let (SessionState::Connected, Some(handle)) =
            (self.session.state(), self.session.active_handle())
        {
            for batch in fragments.chunks(FRAGMENTS_PER_FRAME) {
                let bytes = wire::encode_frame(&Payload::FragmentDelivery {
                    metadata: metadata.clone(),
                    fragments: batch.to_vec(),
                })?;
                effects.push(Effect::Send { handle, bytes });
            }
        }
        Ok((metadata, effects))
    }

    /// Gather everything stored for `file_id` and ask the engine to rebuild
    /// the original bytes. No automatic retry on insufficiency; acquire more
    /// fragments and call again.
    pub fn reconstruct(&self, file_id: &str) -> Result<Vec<u8>, ReconstructionError> {
        let metadata = self
            .store
            .metadata_for(file_id)?
            .ok_or_else(|| ReconstructionError::UnknownFile(file_id.to_string()))?;
        let fragments = self.store.fragments_for(file_id)?;
        info!(
            "reconstructing {} from {} fragment(s)",
            metadata.file_name,
            fragments.len()
        );
        let bytes = engine::decode(&metadata.oti, &fragments)?;
        info!("reconstructed {} ({} bytes)", metadata.file_name, bytes.len());
        Ok(bytes)
    }

    /// Drop every stored file and fragment.
    pub fn clear_store(&mut self) -> Result<(), StorageError> {
        self.store.clear()
    }

    /// Explicit identity reset: mint a fresh identifier and go offline until
    /// the host re-registers it.
    pub fn reset_identity(&mut self) -> Result<Vec<Effect>, IdentityError> {
        let mut effects = Vec::new();
        if let Some(handle) = self.session.on_identity_reset() {
            effects.push(Effect::Close { handle });
        }
        effects.push(Effect::SessionChanged(SessionState::Offline));
        identity::reset(self.store.records_mut())?;
        let fresh = identity::load_or_create(self.store.records_mut())?;
        self.peer_id = fresh.clone();
        effects.push(Effect::Register { peer_id: fresh });
        Ok(effects)
    }
}
