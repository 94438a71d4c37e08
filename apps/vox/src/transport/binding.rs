//! Turns transport callbacks into negotiator calls inside the signaling loop.

use super::{PeerEvent, TransportEvent};
use crate::negotiation::{NegotiationError, Negotiator};

pub async fn apply(negotiator: &mut Negotiator, event: PeerEvent) -> Result<(), NegotiationError> {
    let PeerEvent { remote, event } = event;
    match event {
        TransportEvent::CandidateDiscovered(candidate) => {
            negotiator.on_local_candidate(&remote, candidate).await
        }
        TransportEvent::TrackReceived(stream) => {
            negotiator.on_remote_stream(&remote, stream);
            Ok(())
        }
        TransportEvent::ConnectionStateChanged(state) => {
            negotiator.on_connection_state(&remote, state);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SignalSender;
    use crate::observer::CallObserver;
    use crate::protocol::SignalingMessage;
    use crate::transport::mock::MockTransportFactory;
    use crate::transport::{ConnectionState, MediaKind, RemoteStream};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Streams(Mutex<Vec<(String, String)>>);

    impl CallObserver for Streams {
        fn on_remote_stream(&self, stream: RemoteStream, remote: &str) {
            self.0.lock().push((remote.to_string(), stream.track_id));
        }
    }

    #[tokio::test]
    async fn events_reach_the_negotiator() {
        let factory = Arc::new(MockTransportFactory::new());
        let observer = Arc::new(Streams::default());
        let (sender, mut outbound) = SignalSender::channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut negotiator = Negotiator::new("c1", sender, factory.clone(), observer.clone(), events_tx);
        negotiator.request_connect().unwrap();
        negotiator.on_assigned("s1").await.unwrap();
        outbound.try_recv().unwrap();

        let transport = factory.transport_for("s1").unwrap();
        transport.emit(TransportEvent::CandidateDiscovered("cand-1".into()));
        transport.emit(TransportEvent::TrackReceived(RemoteStream {
            track_id: "t1".into(),
            stream_id: "remote".into(),
            kind: MediaKind::Audio,
            track: None,
        }));
        transport.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connected));

        while let Ok(event) = events_rx.try_recv() {
            apply(&mut negotiator, event).await.unwrap();
        }

        assert_eq!(
            outbound.try_recv().unwrap(),
            SignalingMessage::IceCandidate {
                from: "c1".into(),
                to: "s1".into(),
                candidate: "cand-1".into(),
            }
        );
        assert_eq!(
            observer.0.lock().clone(),
            vec![("s1".to_string(), "t1".to_string())]
        );
    }
}
