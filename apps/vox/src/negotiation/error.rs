use std::time::Duration;
use thiserror::Error;

use crate::session::NegotiationState;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("no remote peer has been assigned yet")]
    NoRemoteAssigned,
    #[error("negotiation with {remote} already in progress ({state})")]
    AlreadyNegotiating {
        remote: String,
        state: NegotiationState,
    },
    #[error("{operation} is not valid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: NegotiationState,
    },
    #[error("no session for peer {0}")]
    UnknownPeer(String),
    #[error("message addressed to {to}, local identity is {local}")]
    Misaddressed { to: String, local: String },
    #[error("negotiation with {remote} rejected by transport")]
    NegotiationRejected {
        remote: String,
        #[source]
        source: TransportError,
    },
    #[error("negotiation with {remote} timed out after {elapsed:?}")]
    NegotiationTimeout { remote: String, elapsed: Duration },
    #[error("signaling channel closed")]
    ChannelClosed,
}

impl NegotiationError {
    /// Protocol errors leave session state untouched and only concern the caller.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            NegotiationError::NoRemoteAssigned
                | NegotiationError::AlreadyNegotiating { .. }
                | NegotiationError::InvalidState { .. }
                | NegotiationError::UnknownPeer(_)
                | NegotiationError::Misaddressed { .. }
        )
    }
}
