//! Per-peer negotiation state machine.
//!
//! The [`Negotiator`] is owned by the signaling loop and every operation runs
//! to completion before the next inbound frame, transport event or local
//! command is looked at. Session records live in a [`SessionRegistry`]; the
//! negotiator itself tracks the client-level phase (connect, assignment,
//! closed) and which remote is currently active.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::channel::SignalSender;
use crate::observer::CallObserver;
use crate::protocol::SignalingMessage;
use crate::session::{FailureCause, NegotiationState, Session, SessionRegistry};
use crate::transport::{
    ConnectionState, MediaTrack, MediaTransport, MediaTransportFactory, PeerEvent, PeerEvents,
    RemoteStream, TransportError,
};

mod error;

pub use error::NegotiationError;

/// A negotiation step that moved its session into a terminal state.
struct Failure {
    cause: FailureCause,
    error: NegotiationError,
}

impl Failure {
    fn rejected(remote: &str, source: TransportError) -> Self {
        Self {
            cause: FailureCause::Rejected,
            error: NegotiationError::NegotiationRejected {
                remote: remote.to_string(),
                source,
            },
        }
    }

    fn channel_lost() -> Self {
        Self {
            cause: FailureCause::ChannelLost,
            error: NegotiationError::ChannelClosed,
        }
    }
}

pub struct Negotiator {
    local_id: String,
    phase: NegotiationState,
    active: Option<String>,
    registry: SessionRegistry,
    outbound: SignalSender,
    factory: Arc<dyn MediaTransportFactory>,
    observer: Arc<dyn CallObserver>,
    events: mpsc::UnboundedSender<PeerEvent>,
    local_tracks: Vec<MediaTrack>,
    negotiation_timeout: Option<Duration>,
    /// Remotes whose session was torn down; their late candidates are dropped.
    retired: HashSet<String>,
}

impl Negotiator {
    pub fn new(
        local_id: impl Into<String>,
        outbound: SignalSender,
        factory: Arc<dyn MediaTransportFactory>,
        observer: Arc<dyn CallObserver>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            phase: NegotiationState::Idle,
            active: None,
            registry: SessionRegistry::new(),
            outbound,
            factory,
            observer,
            events,
            local_tracks: Vec::new(),
            negotiation_timeout: None,
            retired: HashSet::new(),
        }
    }

    pub fn with_negotiation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_local_tracks(mut self, tracks: Vec<MediaTrack>) -> Self {
        self.local_tracks = tracks;
        self
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout
    }

    pub fn active_remote(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn local_tracks(&self) -> &[MediaTrack] {
        &self.local_tracks
    }

    pub fn take_local_tracks(&mut self) -> Vec<MediaTrack> {
        std::mem::take(&mut self.local_tracks)
    }

    /// Client-level phase.
    pub fn phase(&self) -> NegotiationState {
        self.phase
    }

    /// The active session's state when there is one, else the client phase.
    pub async fn state(&self) -> NegotiationState {
        if let Some(remote) = self.active.as_deref() {
            if let Some(state) = self.session_state(remote).await {
                return state;
            }
        }
        self.phase
    }

    pub async fn session_state(&self, remote: &str) -> Option<NegotiationState> {
        let handle = self.registry.lookup(remote)?;
        let state = handle.lock().await.state();
        Some(state)
    }

    /// Announces the local identity. Valid once, from `Idle`.
    pub fn request_connect(&mut self) -> Result<(), NegotiationError> {
        if self.phase != NegotiationState::Idle {
            return Err(NegotiationError::InvalidState {
                operation: "request_connect",
                state: self.phase,
            });
        }
        let message = SignalingMessage::ClientConnect {
            client_id: self.local_id.clone(),
        };
        if let Err(err) = self.send(message) {
            self.phase = NegotiationState::Failed(FailureCause::ChannelLost);
            return Err(err);
        }
        tracing::info!(
            target = "negotiation",
            client_id = %self.local_id,
            "announced local identity"
        );
        self.phase = NegotiationState::AwaitingAssignment;
        Ok(())
    }

    pub async fn on_assigned(&mut self, remote: &str) -> Result<(), NegotiationError> {
        match self.phase {
            NegotiationState::AwaitingAssignment
            | NegotiationState::Assigned
            | NegotiationState::Failed(_) => {}
            state => {
                return Err(NegotiationError::InvalidState {
                    operation: "on_assigned",
                    state,
                });
            }
        }

        if let Some(previous) = self.active.take() {
            if previous != remote {
                tracing::info!(
                    target = "negotiation",
                    previous = %previous,
                    remote,
                    "reassigned; releasing previous session"
                );
                self.close_session(&previous).await;
            }
        }
        self.active = Some(remote.to_string());
        self.retired.remove(remote);

        let handle = self.registry.assign(remote);
        let mut session = handle.lock().await;
        let newly_assigned = session.state() == NegotiationState::Idle;
        let outcome = self.bind_assigned(&mut session).await;
        drop(session);

        if let Err(failure) = outcome {
            return Err(self.fail(remote, failure).await);
        }

        self.phase = NegotiationState::Assigned;
        if newly_assigned {
            tracing::info!(target = "negotiation", remote, "remote peer assigned");
            self.observer.on_assignment_ready(remote);
        } else {
            tracing::debug!(target = "negotiation", remote, "duplicate assignment ignored");
        }
        Ok(())
    }

    async fn bind_assigned(&self, session: &mut Session) -> Result<(), Failure> {
        let transport = self.ensure_bound(session).await?;
        if session.state() == NegotiationState::Idle {
            session.set_state(NegotiationState::Assigned);
            self.bind_tracks(session, &transport).await?;
        }
        Ok(())
    }

    /// Sends an offer to the active remote.
    pub async fn start_call(&mut self) -> Result<(), NegotiationError> {
        let Some(remote) = self.active.clone() else {
            return Err(match self.phase {
                state if state.is_terminal() => NegotiationError::InvalidState {
                    operation: "start_call",
                    state,
                },
                _ => NegotiationError::NoRemoteAssigned,
            });
        };
        let handle = self
            .registry
            .lookup(&remote)
            .ok_or_else(|| NegotiationError::UnknownPeer(remote.clone()))?;
        let mut session = handle.lock().await;
        match session.state() {
            NegotiationState::Assigned => {}
            state if state.is_negotiating() => {
                return Err(NegotiationError::AlreadyNegotiating { remote, state });
            }
            state => {
                return Err(NegotiationError::InvalidState {
                    operation: "start_call",
                    state,
                });
            }
        }
        let outcome = self.send_offer(&mut session).await;
        drop(session);

        match outcome {
            Ok(()) => Ok(()),
            Err(failure) => Err(self.fail(&remote, failure).await),
        }
    }

    async fn send_offer(&self, session: &mut Session) -> Result<(), Failure> {
        let remote = session.remote().to_string();
        let transport = self.ensure_bound(session).await?;
        self.bind_tracks(session, &transport).await?;

        let sdp = transport
            .create_offer()
            .await
            .map_err(|err| Failure::rejected(&remote, err))?;
        transport
            .set_local_description(&sdp)
            .await
            .map_err(|err| Failure::rejected(&remote, err))?;
        session.mark_local_description();

        self.send(SignalingMessage::Offer {
            from: self.local_id.clone(),
            to: remote.clone(),
            sdp,
        })
        .map_err(|_| Failure::channel_lost())?;

        session.set_state(NegotiationState::Offering);
        session.start_negotiation(Instant::now());
        tracing::info!(target = "negotiation", remote = %remote, "offer sent");
        Ok(())
    }

    /// Applies the answer to our offer. `from` defaults to the active remote.
    pub async fn on_answer(&mut self, from: Option<&str>, sdp: &str) -> Result<(), NegotiationError> {
        let remote = match from {
            Some(from) => from.to_string(),
            None => self
                .active
                .clone()
                .ok_or(NegotiationError::NoRemoteAssigned)?,
        };
        let handle = self
            .registry
            .lookup(&remote)
            .ok_or_else(|| NegotiationError::UnknownPeer(remote.clone()))?;
        let mut session = handle.lock().await;
        if session.state() != NegotiationState::Offering {
            return Err(NegotiationError::InvalidState {
                operation: "on_answer",
                state: session.state(),
            });
        }
        let outcome = self.accept_answer(&mut session, sdp).await;
        drop(session);

        match outcome {
            Ok(()) => Ok(()),
            Err(failure) => Err(self.fail(&remote, failure).await),
        }
    }

    async fn accept_answer(&self, session: &mut Session, sdp: &str) -> Result<(), Failure> {
        let remote = session.remote().to_string();
        let transport = session
            .transport()
            .ok_or_else(|| Failure::rejected(&remote, TransportError::Closed))?;
        transport
            .set_remote_description(sdp)
            .await
            .map_err(|err| Failure::rejected(&remote, err))?;
        session.mark_remote_description();
        self.enter_connected(session, transport.as_ref()).await;
        Ok(())
    }

    /// Answerer role: a remote peer offered to us.
    pub async fn on_offer(&mut self, from: &str, to: &str, sdp: &str) -> Result<(), NegotiationError> {
        if to != self.local_id {
            return Err(NegotiationError::Misaddressed {
                to: to.to_string(),
                local: self.local_id.clone(),
            });
        }
        if self.phase == NegotiationState::Closed {
            return Err(NegotiationError::InvalidState {
                operation: "on_offer",
                state: self.phase,
            });
        }

        self.retired.remove(from);
        let handle = self.registry.assign(from);
        let mut session = handle.lock().await;
        match session.state() {
            NegotiationState::Idle | NegotiationState::Assigned => {}
            state if state.is_negotiating() => {
                return Err(NegotiationError::AlreadyNegotiating {
                    remote: from.to_string(),
                    state,
                });
            }
            state => {
                return Err(NegotiationError::InvalidState {
                    operation: "on_offer",
                    state,
                });
            }
        }
        let outcome = self.answer_offer(&mut session, sdp).await;
        drop(session);

        if let Err(failure) = outcome {
            return Err(self.fail(from, failure).await);
        }
        if self.active.is_none() {
            self.active = Some(from.to_string());
            if !self.phase.is_terminal() {
                self.phase = NegotiationState::Assigned;
            }
        }
        Ok(())
    }

    async fn answer_offer(&self, session: &mut Session, sdp: &str) -> Result<(), Failure> {
        let remote = session.remote().to_string();
        let transport = self.ensure_bound(session).await?;
        session.set_state(NegotiationState::Answering);
        session.start_negotiation(Instant::now());

        transport
            .set_remote_description(sdp)
            .await
            .map_err(|err| Failure::rejected(&remote, err))?;
        session.mark_remote_description();
        self.bind_tracks(session, &transport).await?;

        let answer = transport
            .create_answer()
            .await
            .map_err(|err| Failure::rejected(&remote, err))?;
        transport
            .set_local_description(&answer)
            .await
            .map_err(|err| Failure::rejected(&remote, err))?;
        session.mark_local_description();

        self.send(SignalingMessage::Answer {
            from: Some(self.local_id.clone()),
            to: Some(remote.clone()),
            sdp: answer,
        })
        .map_err(|_| Failure::channel_lost())?;
        tracing::info!(target = "negotiation", remote = %remote, "answer sent");

        self.enter_connected(session, transport.as_ref()).await;
        Ok(())
    }

    /// Inbound ICE candidate. Buffered until a remote description is applied.
    pub async fn on_candidate(&mut self, from: &str, candidate: String) -> Result<(), NegotiationError> {
        if self.phase == NegotiationState::Closed {
            return Err(NegotiationError::InvalidState {
                operation: "on_candidate",
                state: self.phase,
            });
        }
        let handle = match self.registry.lookup(from) {
            Some(handle) => handle,
            None if self.retired.contains(from) => {
                tracing::debug!(
                    target = "negotiation",
                    remote = from,
                    "dropping late ice candidate for released session"
                );
                return Ok(());
            }
            None => self.registry.assign(from),
        };
        let mut session = handle.lock().await;
        match session.state() {
            state if state.buffers_candidates() => {
                session.buffer_candidate(candidate);
                tracing::debug!(
                    target = "negotiation",
                    remote = from,
                    state = %state,
                    pending = session.pending_candidates(),
                    "buffered early ice candidate"
                );
            }
            NegotiationState::Connected => {
                if let Some(transport) = session.transport() {
                    if let Err(err) = transport.add_ice_candidate(&candidate).await {
                        tracing::warn!(
                            target = "negotiation",
                            remote = from,
                            error = %err,
                            "failed to apply ice candidate; skipping"
                        );
                    }
                }
            }
            state => {
                return Err(NegotiationError::InvalidState {
                    operation: "on_candidate",
                    state,
                });
            }
        }
        Ok(())
    }

    /// The remote peer left. Its session is closed without notifying anyone.
    pub async fn on_remote_disconnect(&mut self, remote: &str) -> Result<(), NegotiationError> {
        if remote == self.local_id {
            tracing::debug!(target = "negotiation", "ignoring own disconnect notice");
            return Ok(());
        }
        if self.registry.lookup(remote).is_none() {
            return Err(NegotiationError::UnknownPeer(remote.to_string()));
        }
        self.close_session(remote).await;
        if self.active.as_deref() == Some(remote) {
            self.active = None;
            if !self.phase.is_terminal() {
                self.phase = NegotiationState::AwaitingAssignment;
            }
        }
        tracing::info!(target = "negotiation", remote, "remote peer disconnected");
        Ok(())
    }

    /// Local hang-up. Idempotent once closed.
    pub async fn disconnect(&mut self) {
        if self.phase == NegotiationState::Closed {
            return;
        }
        let notice = SignalingMessage::ClientDisconnect {
            client_id: self.local_id.clone(),
        };
        if let Err(err) = self.send(notice) {
            tracing::debug!(
                target = "negotiation",
                error = %err,
                "disconnect notice not delivered"
            );
        }
        let released = self.release_all().await;
        self.active = None;
        self.phase = NegotiationState::Closed;
        tracing::info!(target = "negotiation", released, "disconnected");
    }

    /// The signaling channel went away underneath us.
    pub async fn on_channel_closed(&mut self, reason: Option<&str>) {
        if self.phase == NegotiationState::Closed {
            return;
        }
        let released = self.release_all().await;
        self.active = None;
        self.phase = NegotiationState::Closed;
        let reason = match reason {
            Some(reason) => format!("signaling channel closed: {reason}"),
            None => "signaling channel closed".to_string(),
        };
        tracing::warn!(target = "negotiation", released, "{reason}");
        self.observer.on_fatal_error(&reason);
    }

    /// Records the local tracks and binds them into an assigned session right away.
    pub async fn on_media_ready(&mut self, tracks: Vec<MediaTrack>) -> Result<(), NegotiationError> {
        tracing::debug!(target = "negotiation", tracks = tracks.len(), "local media ready");
        self.local_tracks = tracks;
        let Some(remote) = self.active.clone() else {
            return Ok(());
        };
        let Some(handle) = self.registry.lookup(&remote) else {
            return Ok(());
        };
        let mut session = handle.lock().await;
        if session.state() != NegotiationState::Assigned {
            return Ok(());
        }
        let outcome = match session.transport() {
            Some(transport) => self.bind_tracks(&mut session, &transport).await,
            None => Ok(()),
        };
        drop(session);

        match outcome {
            Ok(()) => Ok(()),
            Err(failure) => Err(self.fail(&remote, failure).await),
        }
    }

    /// Relays a locally discovered candidate to `remote`.
    pub async fn on_local_candidate(&mut self, remote: &str, candidate: String) -> Result<(), NegotiationError> {
        if self.phase == NegotiationState::Closed || self.registry.lookup(remote).is_none() {
            tracing::debug!(
                target = "negotiation",
                remote,
                "dropping local candidate for released session"
            );
            return Ok(());
        }
        let message = SignalingMessage::IceCandidate {
            from: self.local_id.clone(),
            to: remote.to_string(),
            candidate,
        };
        if self.send(message).is_err() {
            return Err(self.fail(remote, Failure::channel_lost()).await);
        }
        Ok(())
    }

    pub fn on_remote_stream(&self, remote: &str, stream: RemoteStream) {
        tracing::info!(
            target = "negotiation",
            remote,
            track = %stream.track_id,
            kind = ?stream.kind,
            "remote track received"
        );
        self.observer.on_remote_stream(stream, remote);
    }

    pub fn on_connection_state(&self, remote: &str, state: ConnectionState) {
        match state {
            ConnectionState::Failed | ConnectionState::Disconnected => tracing::warn!(
                target = "negotiation",
                remote,
                state = ?state,
                "transport connection state changed"
            ),
            _ => tracing::debug!(
                target = "negotiation",
                remote,
                state = ?state,
                "transport connection state changed"
            ),
        }
    }

    pub fn on_server_error(&self, code: i64, message: &str) {
        tracing::warn!(target = "negotiation", code, reason = message, "signaling server error");
        self.observer
            .on_fatal_error(&format!("signaling server error {code}: {message}"));
    }

    /// Fails every session stuck in `Offering`/`Answering` past the timeout.
    pub async fn expire_stalled(&mut self, now: Instant) -> usize {
        let Some(timeout) = self.negotiation_timeout else {
            return 0;
        };
        let mut stalled = Vec::new();
        for remote in self.registry.remotes() {
            let Some(handle) = self.registry.lookup(&remote) else {
                continue;
            };
            let session = handle.lock().await;
            if !matches!(
                session.state(),
                NegotiationState::Offering | NegotiationState::Answering
            ) {
                continue;
            }
            if let Some(started) = session.negotiation_started() {
                let elapsed = now.saturating_duration_since(started);
                if elapsed >= timeout {
                    stalled.push((remote, elapsed));
                }
            }
        }

        let expired = stalled.len();
        for (remote, elapsed) in stalled {
            let failure = Failure {
                cause: FailureCause::Timeout,
                error: NegotiationError::NegotiationTimeout {
                    remote: remote.clone(),
                    elapsed,
                },
            };
            self.fail(&remote, failure).await;
        }
        expired
    }

    fn send(&self, message: SignalingMessage) -> Result<(), NegotiationError> {
        self.outbound
            .send(message)
            .map_err(|_| NegotiationError::ChannelClosed)
    }

    async fn ensure_bound(&self, session: &mut Session) -> Result<Arc<dyn MediaTransport>, Failure> {
        if let Some(transport) = session.transport() {
            return Ok(transport);
        }
        let remote = session.remote().to_string();
        let events = PeerEvents::new(remote.as_str(), self.events.clone());
        let transport = self
            .factory
            .create(events)
            .await
            .map_err(|err| Failure::rejected(&remote, err))?;
        session.bind(Arc::clone(&transport));
        Ok(transport)
    }

    async fn bind_tracks(
        &self,
        session: &mut Session,
        transport: &Arc<dyn MediaTransport>,
    ) -> Result<(), Failure> {
        if session.tracks_bound() || self.local_tracks.is_empty() {
            return Ok(());
        }
        transport
            .add_local_tracks(&self.local_tracks)
            .await
            .map_err(|err| Failure::rejected(session.remote(), err))?;
        session.mark_tracks_bound();
        Ok(())
    }

    async fn enter_connected(&self, session: &mut Session, transport: &dyn MediaTransport) {
        let pending = session.take_pending();
        let buffered = pending.len();
        for candidate in pending {
            if let Err(err) = transport.add_ice_candidate(&candidate).await {
                tracing::warn!(
                    target = "negotiation",
                    remote = %session.remote(),
                    error = %err,
                    "failed to apply buffered ice candidate; skipping"
                );
            }
        }
        session.set_state(NegotiationState::Connected);
        tracing::info!(
            target = "negotiation",
            remote = %session.remote(),
            buffered,
            "negotiation complete"
        );
    }

    async fn close_session(&mut self, remote: &str) {
        self.retired.insert(remote.to_string());
        if let Some(handle) = self.registry.remove(remote) {
            handle.lock().await.release(NegotiationState::Closed).await;
        }
    }

    async fn release_all(&self) -> usize {
        let handles = self.registry.drain();
        let released = handles.len();
        for handle in handles {
            handle.lock().await.release(NegotiationState::Closed).await;
        }
        released
    }

    async fn fail(&mut self, remote: &str, failure: Failure) -> NegotiationError {
        let Failure { cause, error } = failure;
        self.retired.insert(remote.to_string());
        if let Some(handle) = self.registry.remove(remote) {
            handle
                .lock()
                .await
                .release(NegotiationState::Failed(cause))
                .await;
        }
        if self.active.as_deref() == Some(remote) {
            self.active = None;
            if self.phase != NegotiationState::Closed {
                self.phase = NegotiationState::Failed(cause);
            }
        }
        tracing::warn!(
            target = "negotiation",
            remote,
            cause = ?cause,
            error = %error,
            "session failed"
        );
        self.observer.on_fatal_error(&error.to_string());
        error
    }
}
