//! Bidirectional text-frame channel to the relay.
//!
//! A [`Connector`] spawns one channel per transport attempt and reports
//! everything that happens on it as [`TransportEvent`]s tagged with the
//! attempt's [`Tag`]. Exactly one `Closed` event is emitted per channel,
//! whether it failed to connect, dropped, or was closed locally.

use futures::{SinkExt, StreamExt};
use scratchpad_core::{ScratchpadError, ScratchpadResult};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::Tag;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened { tag: Tag },
    Frame { tag: Tag, text: String },
    Closed { tag: Tag, reason: String },
}

/// Owner side of a spawned channel. Dropping it does not close the channel;
/// call [`TransportHandle::close`].
#[derive(Debug)]
pub struct TransportHandle {
    outgoing: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl TransportHandle {
    pub fn new(outgoing: mpsc::UnboundedSender<String>, cancel: CancellationToken) -> Self {
        TransportHandle { outgoing, cancel }
    }

    /// Queue one frame for the channel's writer.
    pub fn send(&self, frame: String) -> ScratchpadResult<()> {
        self.outgoing
            .send(frame)
            .map_err(|_| ScratchpadError::Transport("channel writer has stopped".into()))
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Opens channels to the relay.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        url: &str,
        tag: Tag,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> TransportHandle;
}

// ── WebSocket ─────────────────────────────────────────────────────────────────

/// Connector over `tokio-tungstenite`.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(
        &self,
        url: &str,
        tag: Tag,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> TransportHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_socket(url.to_string(), tag, events, rx, cancel.clone()));
        TransportHandle::new(tx, cancel)
    }
}

async fn run_socket(
    url: String,
    tag: Tag,
    events: mpsc::UnboundedSender<TransportEvent>,
    outgoing: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let reason = match drive_socket(&url, tag, &events, outgoing, &cancel).await {
        Ok(reason) => reason,
        Err(e) => e.to_string(),
    };
    debug!(%url, ?tag, %reason, "websocket finished");
    let _ = events.send(TransportEvent::Closed { tag, reason });
}

async fn drive_socket(
    url: &str,
    tag: Tag,
    events: &mpsc::UnboundedSender<TransportEvent>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> ScratchpadResult<String> {
    let stream = tokio::select! {
        _ = cancel.cancelled() => return Ok("closed before connecting".into()),
        result = connect_async(url) => {
            let (stream, _response) = result
                .map_err(|e| ScratchpadError::Transport(format!("connecting to {url}: {e}")))?;
            stream
        }
    };
    let _ = events.send(TransportEvent::Opened { tag });

    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok("closed locally".into());
            }
            Some(frame) = outgoing.recv() => {
                write
                    .send(Message::Text(frame))
                    .await
                    .map_err(|e| ScratchpadError::Transport(format!("send failed: {e}")))?;
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Frame { tag, text: text.to_string() });
                }
                Some(Ok(Message::Close(frame))) => {
                    return Ok(frame
                        .map(|f| format!("closed by relay: {} {}", f.code, f.reason))
                        .unwrap_or_else(|| "closed by relay".into()));
                }
                Some(Ok(Message::Binary(data))) => {
                    warn!(bytes = data.len(), "ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ScratchpadError::Transport(format!("receive failed: {e}"))),
                None => return Ok("stream ended".into()),
            },
        }
    }
}
