// SPDX-License-Identifier: Apache-2.0

//! Visibility heartbeat for in-flight messages.
//!
//! When enabled, every processor spawns a heartbeat that periodically
//! re-hides its message so a slow listener does not race the queue's
//! redelivery clock. The heartbeat stops when the message reaches a terminal
//! state (the guard drops) or on the first extension failure, after which the
//! queue's own redelivery takes over.

use crate::client::{QueueClient, RawMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) struct VisibilityExtender {
    client: Arc<dyn QueueClient>,
    interval: Duration,
    extension: Duration,
}

impl VisibilityExtender {
    pub(crate) fn new(client: Arc<dyn QueueClient>, interval: Duration, extension: Duration) -> Self {
        Self {
            client,
            interval,
            extension,
        }
    }

    /// Starts a heartbeat for one message. Dropping the returned guard stops
    /// it.
    pub(crate) fn spawn_heartbeat(self: &Arc<Self>, message: Arc<RawMessage>) -> HeartbeatGuard {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let extender = Arc::clone(self);
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = sleep(extender.interval) => {}
                }
                let extended = extender
                    .client
                    .change_visibility(
                        &message.queue_url,
                        &message.receipt_handle,
                        extender.extension,
                    )
                    .await;
                match extended {
                    Ok(()) => {
                        debug!(message.id = %message.id, "extended message visibility");
                    }
                    Err(err) => {
                        warn!(
                            message.id = %message.id,
                            error = %err,
                            "visibility extension failed, stopping heartbeat"
                        );
                        break;
                    }
                }
            }
        }));
        HeartbeatGuard { cancel }
    }
}

/// Stops the heartbeat of one message when dropped.
pub(crate) struct HeartbeatGuard {
    cancel: CancellationToken,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedQueueClient, raw_message};

    fn extender(client: &Arc<ScriptedQueueClient>) -> Arc<VisibilityExtender> {
        Arc::new(VisibilityExtender::new(
            Arc::clone(client) as Arc<dyn QueueClient>,
            Duration::from_secs(15),
            Duration::from_secs(30),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn extends_until_the_guard_drops() {
        let client = Arc::new(ScriptedQueueClient::new());
        let guard = extender(&client).spawn_heartbeat(Arc::new(raw_message("m1", "r1", "{}")));

        client.wait_for_visibility_calls(2).await;
        drop(guard);
        tokio::task::yield_now().await;

        let calls = client.visibility_calls();
        assert!(calls.len() >= 2);
        assert_eq!(calls[0].1, "r1");
        assert_eq!(calls[0].2, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_an_extension_failure() {
        let client = Arc::new(ScriptedQueueClient::new());
        client.script_visibility_failures(1);
        let _guard = extender(&client).spawn_heartbeat(Arc::new(raw_message("m1", "r1", "{}")));

        client.wait_for_visibility_calls(1).await;
        // Give the heartbeat room to (incorrectly) fire again.
        sleep(Duration::from_secs(60)).await;
        assert_eq!(client.visibility_calls().len(), 1);
    }
}
