use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectionState, MediaKind, MediaTrack, MediaTransport, MediaTransportFactory, PeerEvents,
    RemoteStream, TransportError, TransportEvent,
};

pub mod config;

pub use config::{WebRtcConfig, WebRtcConfigBuilder};

const RTCP_BUFFER_LEN: usize = 1500;

fn setup_error(err: webrtc::Error) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn rejected(err: webrtc::Error) -> TransportError {
    TransportError::Rejected(err.to_string())
}

fn parse<T: serde::de::DeserializeOwned>(text: &str, what: &str) -> Result<T, TransportError> {
    serde_json::from_str(text)
        .map_err(|err| TransportError::Rejected(format!("invalid {what}: {err}")))
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

/// Builds one peer connection per session from a shared WebRTC API instance.
pub struct WebRtcTransportFactory {
    api: API,
    config: WebRtcConfig,
}

impl WebRtcTransportFactory {
    pub fn new(config: WebRtcConfig) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(setup_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, config })
    }
}

#[async_trait]
impl MediaTransportFactory for WebRtcTransportFactory {
    async fn create(&self, events: PeerEvents) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(setup_error)?,
        );
        tracing::debug!(
            target = "webrtc",
            remote = %events.remote(),
            ice_servers = self.config.ice_servers.len(),
            "peer connection created"
        );
        Ok(Arc::new(WebRtcTransport::attach(peer_connection, events)))
    }
}

/// A `MediaTransport` backed by a webrtc-rs peer connection.
pub struct WebRtcTransport {
    remote: String,
    peer_connection: Arc<RTCPeerConnection>,
    local_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    fn attach(peer_connection: Arc<RTCPeerConnection>, events: PeerEvents) -> Self {
        let remote = events.remote().to_string();

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                // None marks the end of gathering.
                let Some(candidate) = candidate else {
                    return;
                };
                let encoded = candidate
                    .to_json()
                    .map_err(|err| err.to_string())
                    .and_then(|init| serde_json::to_string(&init).map_err(|err| err.to_string()));
                match encoded {
                    Ok(text) => {
                        events.emit(TransportEvent::CandidateDiscovered(text));
                    }
                    Err(err) => tracing::warn!(
                        target = "webrtc",
                        remote = %events.remote(),
                        error = %err,
                        "failed to serialize local ice candidate"
                    ),
                }
            })
        }));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => MediaKind::Video,
                        _ => MediaKind::Audio,
                    };
                    let stream = RemoteStream {
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                        track: Some(track),
                    };
                    events.emit(TransportEvent::TrackReceived(stream));
                })
            },
        ));

        let state_events = events;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                state_events.emit(TransportEvent::ConnectionStateChanged(connection_state(
                    state,
                )));
                Box::pin(async {})
            },
        ));

        Self {
            remote,
            peer_connection,
            local_tracks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Sample sink for a bound local track; the capture layer writes media into it.
    pub fn local_track(&self, id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().get(id).cloned()
    }

    fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
        match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn add_local_tracks(&self, tracks: &[MediaTrack]) -> Result<(), TransportError> {
        for track in tracks {
            let local = Arc::new(TrackLocalStaticSample::new(
                Self::codec_for(track.kind),
                track.id.clone(),
                track.stream_id.clone(),
            ));
            let sender = self
                .peer_connection
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(rejected)?;
            // RTCP has to be read for interceptors (NACK, reports) to make progress.
            tokio::spawn(async move {
                let mut buf = vec![0u8; RTCP_BUFFER_LEN];
                while sender.read(&mut buf).await.is_ok() {}
            });
            self.local_tracks.lock().insert(track.id.clone(), local);
            tracing::debug!(
                target = "webrtc",
                remote = %self.remote,
                track = %track.id,
                kind = ?track.kind,
                "local track bound"
            );
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(rejected)?;
        serde_json::to_string(&offer).map_err(|err| TransportError::Rejected(err.to_string()))
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(rejected)?;
        serde_json::to_string(&answer).map_err(|err| TransportError::Rejected(err.to_string()))
    }

    async fn set_local_description(&self, description: &str) -> Result<(), TransportError> {
        let description: RTCSessionDescription = parse(description, "local description")?;
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(rejected)
    }

    async fn set_remote_description(&self, description: &str) -> Result<(), TransportError> {
        let description: RTCSessionDescription = parse(description, "remote description")?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(rejected)
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), TransportError> {
        let candidate: RTCIceCandidateInit = parse(candidate, "ice candidate")?;
        self.peer_connection
            .add_ice_candidate(candidate)
            .await
            .map_err(rejected)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.local_tracks.lock().clear();
        self.peer_connection.close().await.map_err(rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_connection_states_map_onto_transport_states() {
        assert_eq!(
            connection_state(RTCPeerConnectionState::Connected),
            ConnectionState::Connected
        );
        assert_eq!(
            connection_state(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert_eq!(
            connection_state(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
    }

    #[test]
    fn session_descriptions_keep_the_browser_envelope() {
        let description: RTCSessionDescription =
            parse(r#"{"type":"answer","sdp":"v=0\r\n"}"#, "remote description").unwrap();
        assert_eq!(description.sdp, "v=0\r\n");

        let err = parse::<RTCSessionDescription>("v=0", "remote description").unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
    }

    #[test]
    fn candidates_decode_from_camel_case_json() {
        let candidate: RTCIceCandidateInit = parse(
            r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
            "ice candidate",
        )
        .unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert!(candidate.candidate.ends_with("typ host"));
    }

    #[tokio::test]
    async fn factory_builds_closable_peer_connections() {
        let factory = WebRtcTransportFactory::new(WebRtcConfig::localhost()).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = factory.create(PeerEvents::new("s1", tx)).await.unwrap();

        transport
            .add_local_tracks(&[MediaTrack::audio("mic", "local")])
            .await
            .unwrap();
        let offer = transport.create_offer().await.unwrap();
        assert!(offer.contains("\"type\":\"offer\""));
        assert!(offer.contains("m=audio"));

        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }
}
