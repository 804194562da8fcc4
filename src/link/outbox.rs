use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{Envelope, MessageType, StreamEvent, StreamEventPayload};

pub(crate) type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

enum Writer {
    Socket(WsSink),
    Capture(mpsc::UnboundedSender<Envelope>),
}

/// The write half of the control link.
///
/// Cloned freely into task workers. Every frame goes out under one mutex so
/// concurrent senders never interleave. While the link is down sends fail
/// and the caller decides whether that matters.
#[derive(Clone)]
pub struct Outbox {
    writer: Arc<Mutex<Option<Writer>>>,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Outbox {
    /// A detached outbox; sends fail until a socket is attached.
    pub fn new() -> Self {
        Self {
            writer: Arc::new(Mutex::new(None)),
        }
    }

    /// An outbox that hands every envelope to a channel instead of a socket.
    pub fn capture() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                writer: Arc::new(Mutex::new(Some(Writer::Capture(tx)))),
            },
            rx,
        )
    }

    pub(crate) async fn attach(&self, sink: WsSink) {
        *self.writer.lock().await = Some(Writer::Socket(sink));
    }

    /// Drop the socket writer, sending a close frame first.
    pub(crate) async fn detach(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(Writer::Socket(mut sink)) = writer {
            let _ = sink.close().await;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    pub async fn send<T: Serialize>(&self, kind: MessageType, payload: &T) -> Result<()> {
        let envelope = Envelope::new(kind, payload).with_context(|| format!("encode {}", kind))?;
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            None => bail!("control link not connected"),
            Some(Writer::Socket(sink)) => {
                let text = envelope.to_text().context("encode envelope")?;
                sink.send(Message::Text(text))
                    .await
                    .with_context(|| format!("write {}", kind))
            }
            Some(Writer::Capture(tx)) => tx
                .send(envelope)
                .map_err(|_| anyhow!("capture receiver dropped")),
        }
    }

    /// Forward one stream event for a session. Failures are logged and
    /// dropped; a task keeps running while the link is down.
    pub async fn emit(&self, session_id: &str, event: StreamEvent) {
        let kind = event.kind();
        let payload = StreamEventPayload {
            session_id: session_id.to_string(),
            event,
        };
        if let Err(e) = self.send(MessageType::StreamEvent, &payload).await {
            tracing::debug!(%session_id, kind, "stream event dropped: {:#}", e);
        }
    }
}
