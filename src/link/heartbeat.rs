use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Dispatch, Outbox};
use crate::protocol::MessageType;

/// Heartbeat period while connected.
pub const PERIOD: Duration = Duration::from_secs(15);

/// Spawn the heartbeat timer for one connected session. It ends when the
/// token is cancelled or a send fails.
pub(crate) fn spawn(
    outbox: Outbox,
    dispatcher: Arc<dyn Dispatch>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // First tick fires immediately; registration covers it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let beat = dispatcher.heartbeat().await;
                    if let Err(e) = outbox.send(MessageType::Heartbeat, &beat).await {
                        tracing::warn!("heartbeat failed: {:#}", e);
                        break;
                    }
                }
            }
        }
    })
}
