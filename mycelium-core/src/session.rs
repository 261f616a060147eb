//! Session lifecycle: a state machine over the single peer connection.
//! At most one connection handle is tracked at any time; everything else is
//! refused at the transport boundary.

/// Opaque connection handle issued by the transport host.
pub type HandleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Offline,
    Online,
    Connecting,
    PendingApproval,
    Connected,
}

/// An inbound request awaiting the user's decision. Held only while
/// `PendingApproval`; at most one at a time.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub remote_peer_id: String,
    pub handle: HandleId,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("cannot connect while {0:?}")]
    Busy(SessionState),
    #[error("no connected peer")]
    NotConnected,
}

/// What an inbound connection request turned into.
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
    /// Admitted; session is now `PendingApproval`.
    Admitted,
    /// Refused at the boundary; caller closes the handle, state unchanged.
    Refused,
}

/// Effect of a transport close/error on the session.
#[derive(Debug, PartialEq, Eq)]
pub enum Closed {
    /// The active handle went away; session reverted to `Online`.
    ActiveLost,
    /// The pending request's handle went away before a decision.
    PendingLost,
    /// Unknown or already-discarded handle; ignored.
    Stale,
}

/// The single session. `handle` is set iff state is `Connecting` or
/// `Connected`; `pending` is set iff state is `PendingApproval`.
pub struct SessionManager {
    state: SessionState,
    remote_peer_id: Option<String>,
    handle: Option<HandleId>,
    pending: Option<PendingRequest>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            state: SessionState::Offline,
            remote_peer_id: None,
            handle: None,
            pending: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_peer(&self) -> Option<&str> {
        self.remote_peer_id.as_deref()
    }

    /// The handle of the connection being opened or in use, if any.
    pub fn active_handle(&self) -> Option<HandleId> {
        self.handle
    }

    pub fn pending_request(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    /// Local identifier became usable: the session can take connections.
    pub fn on_identity_ready(&mut self) {
        if self.state == SessionState::Offline {
            self.state = SessionState::Online;
        }
    }

    /// Identity was invalidated; drop everything and go dark. Returns any
    /// handle the host must close.
    pub fn on_identity_reset(&mut self) -> Option<HandleId> {
        let doomed = self.handle.take().or(self.pending.take().map(|p| p.handle));
        self.state = SessionState::Offline;
        self.remote_peer_id = None;
        doomed
    }

    /// User initiates an outbound connection. The host has already allocated
    /// `handle` for the dial it is about to make.
    pub fn connect(&mut self, remote_id: &str, handle: HandleId) -> Result<(), ConnectionError> {
        if self.state != SessionState::Online {
            return Err(ConnectionError::Busy(self.state));
        }
        self.state = SessionState::Connecting;
        self.remote_peer_id = Some(remote_id.to_string());
        self.handle = Some(handle);
        Ok(())
    }

    /// Transport reports the outbound handle opened. Stale handles are
    /// ignored (the dial may have been abandoned by a close in between).
    pub fn on_opened(&mut self, handle: HandleId) -> bool {
        if self.state == SessionState::Connecting && self.handle == Some(handle) {
            self.state = SessionState::Connected;
            return true;
        }
        false
    }

    /// Transport reports an inbound connection request. Exactly one is
    /// admitted, and only while `Online`.
    pub fn on_incoming(&mut self, remote_id: &str, handle: HandleId) -> Incoming {
        if self.state != SessionState::Online {
            return Incoming::Refused;
        }
        self.pending = Some(PendingRequest {
            remote_peer_id: remote_id.to_string(),
            handle,
        });
        self.state = SessionState::PendingApproval;
        Incoming::Admitted
    }

    /// User accepts the pending request; its handle becomes the active one.
    pub fn accept(&mut self) -> Option<HandleId> {
        let pending = self.pending.take()?;
        self.state = SessionState::Connected;
        self.remote_peer_id = Some(pending.remote_peer_id);
        self.handle = Some(pending.handle);
        Some(pending.handle)
    }

    /// User declines the pending request. Returns the handle to close.
    pub fn decline(&mut self) -> Option<HandleId> {
        let pending = self.pending.take()?;
        self.state = SessionState::Online;
        Some(pending.handle)
    }

    /// Transport reports a handle closed or failed.
    pub fn on_closed(&mut self, handle: HandleId) -> Closed {
        if self.handle == Some(handle) {
            self.handle = None;
            self.remote_peer_id = None;
            self.state = SessionState::Online;
            return Closed::ActiveLost;
        }
        if self.pending.as_ref().map(|p| p.handle) == Some(handle) {
            self.pending = None;
            self.state = SessionState::Online;
            return Closed::PendingLost;
        }
        Closed::Stale
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online() -> SessionManager {
        let mut s = SessionManager::new();
        s.on_identity_ready();
        s
    }

    fn assert_invariant(s: &SessionManager) {
        let expects_handle = matches!(
            s.state(),
            SessionState::Connecting | SessionState::Connected
        );
        assert_eq!(s.active_handle().is_some(), expects_handle);
        assert_eq!(
            s.pending_request().is_some(),
            s.state() == SessionState::PendingApproval
        );
    }

    #[test]
    fn starts_offline_then_online_on_identity() {
        let mut s = SessionManager::new();
        assert_eq!(s.state(), SessionState::Offline);
        s.on_identity_ready();
        assert_eq!(s.state(), SessionState::Online);
        assert_invariant(&s);
    }

    #[test]
    fn outbound_connect_lifecycle() {
        let mut s = online();
        s.connect("peer-b", 1).unwrap();
        assert_eq!(s.state(), SessionState::Connecting);
        assert_invariant(&s);
        assert!(s.on_opened(1));
        assert_eq!(s.state(), SessionState::Connected);
        assert_eq!(s.remote_peer(), Some("peer-b"));
        assert_invariant(&s);
        assert_eq!(s.on_closed(1), Closed::ActiveLost);
        assert_eq!(s.state(), SessionState::Online);
        assert_invariant(&s);
    }

    #[test]
    fn dial_failure_reverts_to_online() {
        let mut s = online();
        s.connect("peer-b", 7).unwrap();
        assert_eq!(s.on_closed(7), Closed::ActiveLost);
        assert_eq!(s.state(), SessionState::Online);
        assert_invariant(&s);
    }

    #[test]
    fn connect_refused_unless_online() {
        let mut s = SessionManager::new();
        assert!(matches!(
            s.connect("peer-b", 1),
            Err(ConnectionError::Busy(SessionState::Offline))
        ));
        let mut s = online();
        s.connect("peer-b", 1).unwrap();
        assert!(s.connect("peer-c", 2).is_err());
        assert_eq!(s.active_handle(), Some(1));
    }

    #[test]
    fn inbound_accept_lifecycle() {
        let mut s = online();
        assert_eq!(s.on_incoming("peer-a", 3), Incoming::Admitted);
        assert_eq!(s.state(), SessionState::PendingApproval);
        assert_invariant(&s);
        assert_eq!(s.accept(), Some(3));
        assert_eq!(s.state(), SessionState::Connected);
        assert_eq!(s.remote_peer(), Some("peer-a"));
        assert_invariant(&s);
    }

    #[test]
    fn inbound_decline_returns_handle_and_reverts() {
        let mut s = online();
        s.on_incoming("peer-a", 3);
        assert_eq!(s.decline(), Some(3));
        assert_eq!(s.state(), SessionState::Online);
        assert_invariant(&s);
    }

    #[test]
    fn second_inbound_request_is_refused_in_every_busy_state() {
        // While connected.
        let mut s = online();
        s.on_incoming("peer-a", 1);
        s.accept();
        assert_eq!(s.on_incoming("peer-b", 2), Incoming::Refused);
        assert_eq!(s.state(), SessionState::Connected);
        assert_eq!(s.active_handle(), Some(1));

        // While a request is already pending.
        let mut s = online();
        s.on_incoming("peer-a", 1);
        assert_eq!(s.on_incoming("peer-b", 2), Incoming::Refused);
        assert_eq!(s.pending_request().unwrap().handle, 1);

        // While dialing out.
        let mut s = online();
        s.connect("peer-c", 1).unwrap();
        assert_eq!(s.on_incoming("peer-b", 2), Incoming::Refused);
        assert_eq!(s.state(), SessionState::Connecting);
    }

    #[test]
    fn pending_handle_closing_early_reverts_to_online() {
        let mut s = online();
        s.on_incoming("peer-a", 3);
        assert_eq!(s.on_closed(3), Closed::PendingLost);
        assert_eq!(s.state(), SessionState::Online);
        assert_invariant(&s);
        assert_eq!(s.accept(), None);
    }

    #[test]
    fn stale_closes_are_ignored() {
        let mut s = online();
        s.connect("peer-b", 1).unwrap();
        s.on_opened(1);
        assert_eq!(s.on_closed(99), Closed::Stale);
        assert_eq!(s.state(), SessionState::Connected);
        assert_invariant(&s);
    }

    #[test]
    fn opened_for_stale_handle_is_ignored() {
        let mut s = online();
        assert!(!s.on_opened(5));
        s.connect("peer-b", 1).unwrap();
        assert!(!s.on_opened(2));
        assert_eq!(s.state(), SessionState::Connecting);
    }

    #[test]
    fn identity_reset_goes_offline_and_yields_handle() {
        let mut s = online();
        s.connect("peer-b", 4).unwrap();
        s.on_opened(4);
        assert_eq!(s.on_identity_reset(), Some(4));
        assert_eq!(s.state(), SessionState::Offline);
        assert_invariant(&s);

        let mut s = online();
        s.on_incoming("peer-a", 9);
        assert_eq!(s.on_identity_reset(), Some(9));
        assert_eq!(s.state(), SessionState::Offline);
        assert_invariant(&s);
    }

    #[test]
    fn invariant_holds_across_random_event_soup() {
        // A fixed soup of events in every state; the machine must never track
        // two handles and must keep handle presence tied to state.
        let mut s = SessionManager::new();
        let events: &[fn(&mut SessionManager)] = &[
            |s| s.on_identity_ready(),
            |s| {
                let _ = s.connect("p", 1);
            },
            |s| {
                let _ = s.on_incoming("q", 2);
            },
            |s| {
                let _ = s.on_opened(1);
            },
            |s| {
                let _ = s.accept();
            },
            |s| {
                let _ = s.on_closed(1);
            },
            |s| {
                let _ = s.decline();
            },
            |s| {
                let _ = s.on_closed(2);
            },
        ];
        for i in 0..events.len() {
            for j in 0..events.len() {
                for k in 0..events.len() {
                    events[i](&mut s);
                    assert_invariant(&s);
                    events[j](&mut s);
                    assert_invariant(&s);
                    events[k](&mut s);
                    assert_invariant(&s);
                }
            }
        }
    }
}
