use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::{ChannelError, ChannelEvent, SignalSender};
use crate::protocol::SignalingMessage;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Reader and writer tasks of one WebSocket connection.
pub struct Connection {
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    /// Lets the writer flush queued messages (the disconnect notice in
    /// particular) once every `SignalSender` is gone, then stops the reader.
    /// A writer still held open after the drain timeout is aborted.
    pub async fn shutdown(mut self) {
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
                tracing::debug!(target = "signaling", "writer did not drain in time");
                writer.abort();
                let _ = writer.await;
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for handle in [self.writer.take(), self.reader.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

/// Opens the signaling WebSocket.
///
/// The returned receiver yields `Opened` first, then inbound frames, and ends
/// with exactly one `Closed`.
pub async fn connect(
    url: &Url,
) -> Result<(SignalSender, mpsc::UnboundedReceiver<ChannelEvent>, Connection), ChannelError> {
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|err| ChannelError::Connect(err.to_string()))?;
    tracing::info!(target = "signaling", url = %url, "signaling websocket connected");
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<SignalingMessage>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<ChannelEvent>();
    let _ = event_tx.send(ChannelEvent::Opened);

    let writer = tokio::spawn(async move {
        while let Some(message) = send_rx.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(
                        target = "signaling",
                        tag = message.tag(),
                        error = %err,
                        "failed to encode signaling message"
                    );
                    continue;
                }
            };
            tracing::trace!(
                target = "signaling",
                event = "ws_out",
                tag = message.tag(),
                len = text.len()
            );
            if ws_write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    let reader = tokio::spawn(async move {
        let mut reason = None;
        while let Some(msg) = ws_read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    tracing::trace!(
                        target = "signaling",
                        event = "ws_in",
                        kind = "text",
                        len = text.len()
                    );
                    if event_tx.send(ChannelEvent::Frame(text.into_bytes())).is_err() {
                        return;
                    }
                }
                Ok(Message::Binary(data)) => {
                    tracing::trace!(
                        target = "signaling",
                        event = "ws_in",
                        kind = "binary",
                        len = data.len()
                    );
                    if event_tx.send(ChannelEvent::Frame(data)).is_err() {
                        return;
                    }
                }
                Ok(Message::Close(frame)) => {
                    reason = frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty());
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            tracing::debug!(target = "signaling", "signaling websocket closed: {err}");
                        }
                        _ => {
                            tracing::warn!(target = "signaling", "signaling websocket error: {err}");
                            reason = Some(err.to_string());
                        }
                    }
                    break;
                }
            }
        }
        let _ = event_tx.send(ChannelEvent::Closed(reason));
    });

    Ok((
        SignalSender::new(send_tx),
        event_rx,
        Connection {
            writer: Some(writer),
            reader: Some(reader),
        },
    ))
}
