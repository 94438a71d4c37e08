//! Signaling channel adapter and the event loop that serializes all work.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::Config;
use crate::negotiation::{NegotiationError, Negotiator};
use crate::observer::CallObserver;
use crate::protocol::{self, SignalingMessage};
use crate::transport::{MediaTrack, MediaTransportFactory, PeerEvent, binding};

pub mod websocket;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("signaling channel closed")]
    Closed,
}

/// Handle on the writer queue. The writer task is the only thing that
/// touches the socket.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

impl SignalSender {
    pub fn new(tx: mpsc::UnboundedSender<SignalingMessage>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&self, message: SignalingMessage) -> Result<(), ChannelError> {
        tracing::trace!(target = "signaling", tag = message.tag(), "queue outbound");
        self.tx.send(message).map_err(|_| ChannelError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub enum ChannelEvent {
    Opened,
    Frame(Vec<u8>),
    Closed(Option<String>),
}

#[derive(Debug)]
pub enum CallCommand {
    MediaReady(Vec<MediaTrack>),
    StartCall(oneshot::Sender<Result<(), NegotiationError>>),
    Disconnect,
}

/// Local entry point for UI actions; every call is queued into the event loop.
#[derive(Debug, Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<CallCommand>,
}

impl CallHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CallCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn media_ready(&self, tracks: Vec<MediaTrack>) -> bool {
        self.tx.send(CallCommand::MediaReady(tracks)).is_ok()
    }

    pub async fn start_call(&self) -> Result<(), NegotiationError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CallCommand::StartCall(reply_tx))
            .map_err(|_| NegotiationError::ChannelClosed)?;
        reply_rx.await.map_err(|_| NegotiationError::ChannelClosed)?
    }

    pub fn disconnect(&self) -> bool {
        self.tx.send(CallCommand::Disconnect).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    LocalDisconnect,
    ChannelClosed,
}

/// Decodes one inbound frame and hands it to the negotiator.
///
/// Nothing here is fatal to the loop: undecodable frames and protocol errors
/// are logged and dropped.
pub async fn dispatch_frame(negotiator: &mut Negotiator, frame: &[u8]) {
    let message = match protocol::decode(frame) {
        Ok(Some(message)) => message,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(target = "signaling", error = %err, "dropping undecodable frame");
            return;
        }
    };
    let tag = message.tag();
    tracing::debug!(target = "signaling", tag, "inbound message");
    if let Err(err) = route(negotiator, message).await {
        if err.is_protocol_error() {
            tracing::warn!(target = "signaling", tag, error = %err, "dropping message");
        } else {
            tracing::debug!(target = "signaling", tag, error = %err, "message failed its session");
        }
    }
}

pub async fn route(negotiator: &mut Negotiator, message: SignalingMessage) -> Result<(), NegotiationError> {
    match message {
        SignalingMessage::ClientConnected { server_id, .. } => negotiator.on_assigned(&server_id).await,
        SignalingMessage::Offer { from, to, sdp } => negotiator.on_offer(&from, &to, &sdp).await,
        SignalingMessage::Answer { from, to, sdp } => {
            if let Some(to) = to {
                ensure_addressed(negotiator, to)?;
            }
            negotiator.on_answer(from.as_deref(), &sdp).await
        }
        SignalingMessage::IceCandidate {
            from,
            to,
            candidate,
        } => {
            ensure_addressed(negotiator, to)?;
            negotiator.on_candidate(&from, candidate).await
        }
        SignalingMessage::ClientDisconnect { client_id } => {
            negotiator.on_remote_disconnect(&client_id).await
        }
        SignalingMessage::ServerDisconnect { server_id } => {
            negotiator.on_remote_disconnect(&server_id).await
        }
        SignalingMessage::Error { code, message } => {
            negotiator.on_server_error(code, &message);
            Ok(())
        }
        SignalingMessage::ClientConnect { client_id } => {
            tracing::debug!(target = "signaling", client_id = %client_id, "ignoring client_connect echo");
            Ok(())
        }
    }
}

fn ensure_addressed(negotiator: &Negotiator, to: String) -> Result<(), NegotiationError> {
    if to == negotiator.local_id() {
        Ok(())
    } else {
        Err(NegotiationError::Misaddressed {
            to,
            local: negotiator.local_id().to_string(),
        })
    }
}

fn expiry_ticker(timeout: Option<Duration>) -> Option<Interval> {
    timeout.map(|timeout| {
        let period = (timeout / 4).max(Duration::from_millis(100));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    })
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Runs one connection's worth of signaling.
///
/// Frames, transport events, local commands and the expiry ticker are taken
/// one at a time and each is applied to completion before the next. Local
/// commands take priority over channel frames, then transport events.
pub async fn run_session(
    negotiator: &mut Negotiator,
    channel: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    events: &mut mpsc::UnboundedReceiver<PeerEvent>,
    commands: &mut mpsc::UnboundedReceiver<CallCommand>,
) -> LoopExit {
    let mut expiry = expiry_ticker(negotiator.negotiation_timeout());
    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(CallCommand::MediaReady(tracks)) => {
                    if let Err(err) = negotiator.on_media_ready(tracks).await {
                        tracing::warn!(target = "signaling", error = %err, "binding local media failed");
                    }
                }
                Some(CallCommand::StartCall(reply)) => {
                    let result = negotiator.start_call().await;
                    if let Err(err) = &result {
                        tracing::warn!(target = "signaling", error = %err, "start call failed");
                    }
                    let _ = reply.send(result);
                }
                Some(CallCommand::Disconnect) | None => {
                    negotiator.disconnect().await;
                    return LoopExit::LocalDisconnect;
                }
            },
            event = channel.recv() => match event {
                Some(ChannelEvent::Opened) => {
                    if let Err(err) = negotiator.request_connect() {
                        tracing::warn!(target = "signaling", error = %err, "connect request failed");
                    }
                }
                Some(ChannelEvent::Frame(frame)) => dispatch_frame(negotiator, &frame).await,
                Some(ChannelEvent::Closed(reason)) => {
                    negotiator.on_channel_closed(reason.as_deref()).await;
                    return LoopExit::ChannelClosed;
                }
                None => {
                    negotiator.on_channel_closed(None).await;
                    return LoopExit::ChannelClosed;
                }
            },
            Some(event) = events.recv() => {
                if let Err(err) = binding::apply(negotiator, event).await {
                    tracing::debug!(target = "signaling", error = %err, "transport event failed");
                }
            }
            _ = tick(&mut expiry) => {
                let expired = negotiator.expire_stalled(Instant::now()).await;
                if expired > 0 {
                    tracing::warn!(target = "signaling", expired, "negotiation timed out");
                }
            }
        }
    }
}

/// Long-running client: connects, runs the event loop, reconnects after the
/// configured delay until a local disconnect.
pub struct SignalingClient {
    config: Config,
    factory: Arc<dyn MediaTransportFactory>,
    observer: Arc<dyn CallObserver>,
}

impl SignalingClient {
    pub fn new(
        config: Config,
        factory: Arc<dyn MediaTransportFactory>,
        observer: Arc<dyn CallObserver>,
    ) -> Self {
        Self {
            config,
            factory,
            observer,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn run(&self, mut commands: mpsc::UnboundedReceiver<CallCommand>) -> Result<(), ChannelError> {
        let url = self.config.signaling_url()?;
        let mut tracks = Vec::new();
        loop {
            match websocket::connect(&url).await {
                Ok((outbound, mut inbound, connection)) => {
                    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
                    let mut negotiator = Negotiator::new(
                        self.config.client_id.clone(),
                        outbound,
                        Arc::clone(&self.factory),
                        Arc::clone(&self.observer),
                        events_tx,
                    )
                    .with_negotiation_timeout(self.config.negotiation_timeout)
                    .with_local_tracks(std::mem::take(&mut tracks));

                    let exit =
                        run_session(&mut negotiator, &mut inbound, &mut events_rx, &mut commands)
                            .await;
                    tracks = negotiator.take_local_tracks();
                    drop(negotiator);
                    connection.shutdown().await;

                    if exit == LoopExit::LocalDisconnect {
                        return Ok(());
                    }
                }
                Err(err) => {
                    tracing::warn!(target = "signaling", url = %url, error = %err, "signaling connect failed");
                }
            }

            tracing::info!(
                target = "signaling",
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "reconnecting"
            );
            if !wait_for_reconnect(&mut commands, &mut tracks, self.config.reconnect_delay).await {
                return Ok(());
            }
        }
    }
}

/// Returns false when a local disconnect arrives before the delay elapses.
async fn wait_for_reconnect(
    commands: &mut mpsc::UnboundedReceiver<CallCommand>,
    tracks: &mut Vec<MediaTrack>,
    delay: Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(CallCommand::MediaReady(ready)) => *tracks = ready,
                Some(CallCommand::StartCall(reply)) => {
                    let _ = reply.send(Err(NegotiationError::ChannelClosed));
                }
                Some(CallCommand::Disconnect) | None => return false,
            },
        }
    }
}
