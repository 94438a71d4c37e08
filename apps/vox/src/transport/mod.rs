use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod binding;
pub mod mock;
pub mod webrtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// A locally captured track handed over by the media layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

impl MediaTrack {
    pub fn audio(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind: MediaKind::Audio,
        }
    }

    pub fn video(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind: MediaKind::Video,
        }
    }
}

/// Inbound media announced by the transport capability.
#[derive(Clone)]
pub struct RemoteStream {
    pub track_id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// Live track handle when the stream comes from the WebRTC stack.
    pub track: Option<Arc<::webrtc::track::track_remote::TrackRemote>>,
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("live", &self.track.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    CandidateDiscovered(String),
    TrackReceived(RemoteStream),
    ConnectionStateChanged(ConnectionState),
}

/// A transport event tagged with the remote identity of the session that owns it.
#[derive(Debug)]
pub struct PeerEvent {
    pub remote: String,
    pub event: TransportEvent,
}

/// Sender handed to a transport so its callbacks end up in the signaling loop.
#[derive(Clone)]
pub struct PeerEvents {
    remote: String,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEvents {
    pub fn new(remote: impl Into<String>, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            remote: remote.into(),
            tx,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Returns false once the signaling loop is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(PeerEvent {
                remote: self.remote.clone(),
                event,
            })
            .is_ok()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport rejected request: {0}")]
    Rejected(String),
    #[error("transport closed")]
    Closed,
}

/// The external media-transport capability bound to one session.
///
/// Descriptions and candidates cross this boundary as the serialized strings
/// carried on the wire.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn add_local_tracks(&self, tracks: &[MediaTrack]) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<String, TransportError>;

    async fn create_answer(&self) -> Result<String, TransportError>;

    async fn set_local_description(&self, description: &str) -> Result<(), TransportError>;

    async fn set_remote_description(&self, description: &str) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), TransportError>;

    /// Must tolerate repeated calls.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait MediaTransportFactory: Send + Sync {
    async fn create(&self, events: PeerEvents) -> Result<Arc<dyn MediaTransport>, TransportError>;
}
