use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use crate::transport::MediaTransport;

pub mod registry;

pub use registry::{SessionHandle, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// The transport capability refused an offer, answer or description.
    Rejected,
    Timeout,
    /// An outbound signaling send could not be queued.
    ChannelLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingAssignment,
    Assigned,
    Offering,
    Answering,
    Connected,
    Closed,
    Failed(FailureCause),
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed(_))
    }

    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            NegotiationState::Offering | NegotiationState::Answering | NegotiationState::Connected
        )
    }

    /// States in which a remote description has not been applied yet.
    pub fn buffers_candidates(self) -> bool {
        matches!(
            self,
            NegotiationState::Idle
                | NegotiationState::AwaitingAssignment
                | NegotiationState::Assigned
                | NegotiationState::Offering
                | NegotiationState::Answering
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::AwaitingAssignment => "awaiting_assignment",
            NegotiationState::Assigned => "assigned",
            NegotiationState::Offering => "offering",
            NegotiationState::Answering => "answering",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
            NegotiationState::Failed(FailureCause::Rejected) => "failed(rejected)",
            NegotiationState::Failed(FailureCause::Timeout) => "failed(timeout)",
            NegotiationState::Failed(FailureCause::ChannelLost) => "failed(channel_lost)",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiation record for one remote identity.
pub struct Session {
    remote: String,
    state: NegotiationState,
    transport: Option<Arc<dyn MediaTransport>>,
    pending_candidates: VecDeque<String>,
    has_local_description: bool,
    has_remote_description: bool,
    tracks_bound: bool,
    negotiation_started: Option<Instant>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("bound", &self.transport.is_some())
            .field("pending_candidates", &self.pending_candidates.len())
            .field("has_local_description", &self.has_local_description)
            .field("has_remote_description", &self.has_remote_description)
            .finish()
    }
}

impl Session {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            state: NegotiationState::Idle,
            transport: None,
            pending_candidates: VecDeque::new(),
            has_local_description: false,
            has_remote_description: false,
            tracks_bound: false,
            negotiation_started: None,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn transport(&self) -> Option<Arc<dyn MediaTransport>> {
        self.transport.clone()
    }

    pub fn is_bound(&self) -> bool {
        self.transport.is_some()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn has_local_description(&self) -> bool {
        self.has_local_description
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    pub fn tracks_bound(&self) -> bool {
        self.tracks_bound
    }

    pub fn negotiation_started(&self) -> Option<Instant> {
        self.negotiation_started
    }

    pub(crate) fn bind(&mut self, transport: Arc<dyn MediaTransport>) {
        self.transport = Some(transport);
    }

    pub(crate) fn set_state(&mut self, state: NegotiationState) {
        if self.state != state {
            tracing::debug!(
                target = "negotiation",
                remote = %self.remote,
                from = %self.state,
                to = %state,
                "session state change"
            );
        }
        self.state = state;
    }

    pub(crate) fn buffer_candidate(&mut self, candidate: String) {
        self.pending_candidates.push_back(candidate);
    }

    pub(crate) fn take_pending(&mut self) -> VecDeque<String> {
        std::mem::take(&mut self.pending_candidates)
    }

    pub(crate) fn mark_tracks_bound(&mut self) {
        self.tracks_bound = true;
    }

    pub(crate) fn mark_local_description(&mut self) {
        self.has_local_description = true;
    }

    pub(crate) fn mark_remote_description(&mut self) {
        self.has_remote_description = true;
    }

    pub(crate) fn start_negotiation(&mut self, at: Instant) {
        self.negotiation_started = Some(at);
    }

    /// Closes the bound transport at most once and settles into `final_state`.
    ///
    /// A session that is already terminal keeps its first terminal state.
    pub(crate) async fn release(&mut self, final_state: NegotiationState) {
        if let Some(transport) = self.transport.take() {
            if let Err(err) = transport.close().await {
                tracing::warn!(
                    target = "negotiation",
                    remote = %self.remote,
                    error = %err,
                    "failed to close transport"
                );
            }
        }
        self.pending_candidates.clear();
        self.negotiation_started = None;
        if !self.state.is_terminal() {
            self.set_state(final_state);
        }
    }
}
