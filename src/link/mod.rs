//! Durable WebSocket session to the orchestration server.
//!
//! [`Link::run`] dials, registers, pumps inbound frames to a [`Dispatch`]
//! implementation and reconnects on the backoff ladder until stopped.

mod backoff;
mod heartbeat;
mod outbox;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use backoff::{Backoff, LADDER};
pub use heartbeat::PERIOD as HEARTBEAT_PERIOD;
pub use outbox::Outbox;

use crate::protocol::{Envelope, Heartbeat, Inbound, MessageType, ProtocolError, Register};

/// Agent side of the protocol. The link owns the socket; implementors own
/// everything the messages mean.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Body of the `register` frame sent right after every handshake.
    async fn registration(&self) -> Register;

    /// Body of the periodic `heartbeat` frame.
    async fn heartbeat(&self) -> Heartbeat;

    /// Handle one server message. Must not block for long: the read loop
    /// waits on it, so real work belongs on a spawned task.
    async fn dispatch(&self, outbox: &Outbox, message: Inbound);
}

/// Fresh identity for one agent process, e.g. `agent_1a2b3c4d`.
pub fn new_agent_id(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &id[..8])
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub server_url: String,
    pub auth_token: String,
    pub heartbeat_period: Duration,
}

impl LinkConfig {
    pub fn new(server_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            auth_token: auth_token.into(),
            heartbeat_period: HEARTBEAT_PERIOD,
        }
    }

    /// URL actually dialled: the token rides along as a query parameter.
    pub fn dial_url(&self) -> String {
        if self.auth_token.is_empty() {
            return self.server_url.clone();
        }
        let sep = if self.server_url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.server_url, sep, self.auth_token)
    }
}

enum Flow {
    Continue,
    Reconnect(String),
}

pub struct Link {
    config: LinkConfig,
    outbox: Outbox,
    stop: CancellationToken,
    backoff: std::sync::Mutex<Backoff>,
}

impl Link {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            outbox: Outbox::new(),
            stop: CancellationToken::new(),
            backoff: std::sync::Mutex::new(Backoff::new()),
        }
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Ask `run` to return. Safe to call any number of times.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Supervision loop. Returns only after [`Link::stop`].
    pub async fn run(&self, dispatcher: Arc<dyn Dispatch>) -> Result<()> {
        while !self.stop.is_cancelled() {
            match self.session(&dispatcher).await {
                Ok(()) => info!("control link closed"),
                Err(e) => warn!("control link: {:#}", e),
            }
            if self.stop.is_cancelled() {
                break;
            }

            let delay = self.next_delay();
            info!(delay_secs = delay.as_secs(), "reconnecting");
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.outbox.detach().await;
        Ok(())
    }

    fn next_delay(&self) -> Duration {
        match self.backoff.lock() {
            Ok(mut backoff) => backoff.next_delay(),
            Err(poisoned) => poisoned.into_inner().next_delay(),
        }
    }

    fn reset_backoff(&self) {
        match self.backoff.lock() {
            Ok(mut backoff) => backoff.reset(),
            Err(poisoned) => poisoned.into_inner().reset(),
        }
    }

    /// One connected lifetime: dial, register, read until the socket dies.
    async fn session(&self, dispatcher: &Arc<dyn Dispatch>) -> Result<()> {
        let url = self.config.dial_url();
        let (socket, _) = tokio::select! {
            _ = self.stop.cancelled() => return Ok(()),
            dialled = tokio_tungstenite::connect_async(url.as_str()) => {
                dialled.with_context(|| format!("dial {}", self.config.server_url))?
            }
        };
        self.reset_backoff();
        info!(url = %self.config.server_url, "control link connected");

        let (sink, mut stream) = socket.split();
        self.outbox.attach(sink).await;

        let session = self.stop.child_token();
        let result = async {
            let register = dispatcher.registration().await;
            self.outbox
                .send(MessageType::Register, &register)
                .await
                .context("send register")?;

            let beats = heartbeat::spawn(
                self.outbox.clone(),
                dispatcher.clone(),
                self.config.heartbeat_period,
                session.clone(),
            );

            let outcome = loop {
                let frame = tokio::select! {
                    _ = session.cancelled() => break Ok(()),
                    frame = stream.next() => frame,
                };
                match frame {
                    None => break Err(anyhow!("connection closed by server")),
                    Some(Err(e)) => break Err(anyhow!(e).context("read frame")),
                    Some(Ok(Message::Text(text))) => {
                        if let Flow::Reconnect(reason) = self.route(&text, dispatcher).await {
                            break Err(anyhow!("registration rejected: {}", reason));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break Err(anyhow!("server closed connection: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                }
            };

            session.cancel();
            let _ = beats.await;
            outcome
        }
        .await;

        session.cancel();
        self.outbox.detach().await;
        result
    }

    async fn route(&self, text: &str, dispatcher: &Arc<dyn Dispatch>) -> Flow {
        let envelope = match Envelope::from_text(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("{}", e);
                return Flow::Continue;
            }
        };

        let message = match Inbound::decode(&envelope) {
            Ok(message) => message,
            Err(e @ ProtocolError::UnknownType(_)) => {
                warn!("ignoring frame: {}", e);
                return Flow::Continue;
            }
            Err(e) => {
                warn!("dropping frame: {}", e);
                return Flow::Continue;
            }
        };

        match message {
            Inbound::RegisterAck(ack) if ack.success => {
                info!("registered with server");
                Flow::Continue
            }
            Inbound::RegisterAck(ack) => {
                warn!(error = %ack.error, "registration rejected");
                Flow::Reconnect(ack.error)
            }
            Inbound::HeartbeatAck => {
                debug!("heartbeat acknowledged");
                Flow::Continue
            }
            message => {
                debug!(kind = message.kind().as_str(), "dispatching");
                dispatcher.dispatch(&self.outbox, message).await;
                Flow::Continue
            }
        }
    }
}
