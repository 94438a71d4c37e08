//! Scripted transport capability used by tests and dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::{
    MediaTrack, MediaTransport, MediaTransportFactory, PeerEvents, TransportError, TransportEvent,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    AddTracks(Vec<String>),
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(String),
    SetRemoteDescription(String),
    AddIceCandidate(String),
    Close,
}

/// Failures the mock should inject.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub reject_create: bool,
    pub reject_offer: bool,
    pub reject_answer: bool,
    pub reject_remote_description: bool,
    pub reject_tracks: bool,
    pub reject_candidates: Vec<String>,
}

pub struct MockTransport {
    events: PeerEvents,
    behavior: MockBehavior,
    calls: Mutex<Vec<MockCall>>,
    descriptions: AtomicU32,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new(events: PeerEvents, behavior: MockBehavior) -> Self {
        Self {
            events,
            behavior,
            calls: Mutex::new(Vec::new()),
            descriptions: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> &str {
        self.events.remote()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::AddIceCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn remote_descriptions(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::SetRemoteDescription(description) => Some(description.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, MockCall::Close))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Raises an event as if the underlying stack had produced it.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.emit(event)
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn description(&self, kind: &str) -> String {
        let version = self.descriptions.fetch_add(1, Ordering::SeqCst) + 1;
        let sdp = format!(
            "v=0\r\no=- {version} {version} IN IP4 127.0.0.1\r\ns=mock-{}\r\nt=0 0\r\n",
            self.remote()
        );
        json!({ "type": kind, "sdp": sdp }).to_string()
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn add_local_tracks(&self, tracks: &[MediaTrack]) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.record(MockCall::AddTracks(
            tracks.iter().map(|track| track.id.clone()).collect(),
        ));
        if self.behavior.reject_tracks {
            return Err(TransportError::Rejected("tracks refused".into()));
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        self.ensure_open()?;
        self.record(MockCall::CreateOffer);
        if self.behavior.reject_offer {
            return Err(TransportError::Rejected("offer refused".into()));
        }
        Ok(self.description("offer"))
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        self.ensure_open()?;
        self.record(MockCall::CreateAnswer);
        if self.behavior.reject_answer {
            return Err(TransportError::Rejected("answer refused".into()));
        }
        Ok(self.description("answer"))
    }

    async fn set_local_description(&self, description: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.record(MockCall::SetLocalDescription(description.to_string()));
        Ok(())
    }

    async fn set_remote_description(&self, description: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.record(MockCall::SetRemoteDescription(description.to_string()));
        if self.behavior.reject_remote_description {
            return Err(TransportError::Rejected("remote description refused".into()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.record(MockCall::AddIceCandidate(candidate.to_string()));
        if self
            .behavior
            .reject_candidates
            .iter()
            .any(|rejected| rejected == candidate)
        {
            return Err(TransportError::Rejected(format!(
                "candidate {candidate} refused"
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(MockCall::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockTransportFactory {
    behavior: Mutex<MockBehavior>,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Applies to transports created from now on.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Most recently created transport for `remote`.
    pub fn transport_for(&self, remote: &str) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|transport| transport.remote() == remote)
            .cloned()
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl MediaTransportFactory for MockTransportFactory {
    async fn create(&self, events: PeerEvents) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let behavior = self.behavior.lock().clone();
        if behavior.reject_create {
            return Err(TransportError::Setup("mock factory refused".into()));
        }
        let transport = Arc::new(MockTransport::new(events, behavior));
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}
