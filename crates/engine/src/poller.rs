// SPDX-License-Identifier: Apache-2.0

//! The long-polling loop.
//!
//! One poller task runs per container. Each iteration admits a window of
//! processing slots first, then polls for at most that many messages, so
//! back-pressure is applied before the receive call and a poll can never
//! deliver work the container has no capacity for. Receive failures back the
//! loop off with jitter; they never terminate it. Only container stop does.

use crate::admit::{Admitter, Window};
use crate::client::{QueueClient, RawMessage, ReceiveRequest};
use crate::error::format_error_sources;
use crate::processor::Pipeline;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, warn};

pub(crate) struct Poller<T, C, R> {
    pub(crate) container_id: String,
    pub(crate) client: Arc<dyn QueueClient>,
    pub(crate) pipeline: Arc<Pipeline<T, C, R>>,
    pub(crate) admitter: Admitter,
    pub(crate) queue_url: String,
    pub(crate) max_messages_per_poll: usize,
    pub(crate) poll_timeout: Duration,
    pub(crate) visibility_timeout: Option<Duration>,
    pub(crate) polling_error_backoff: Duration,
    pub(crate) cancel: CancellationToken,
}

impl<T, C, R> Poller<T, C, R>
where
    T: Send + 'static,
    C: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    /// Runs until the container's stop token fires. An in-flight receive is
    /// cancelled by the stop signal; its messages, if any, are never
    /// observed and redeliver after their visibility timeout.
    pub(crate) async fn run(self) {
        let span = info_span!(
            "poller",
            container.id = %self.container_id,
            queue.url = %self.queue_url,
        );
        async move {
            loop {
                if self.cancel.is_cancelled() {
                    break;
                }
                let mut window = tokio::select! {
                    () = self.cancel.cancelled() => break,
                    window = self.admitter.admit_window(self.max_messages_per_poll) => window,
                };
                if window.is_empty() {
                    break;
                }

                let request = ReceiveRequest {
                    queue_url: self.queue_url.clone(),
                    max_messages: window.len(),
                    poll_timeout: self.poll_timeout,
                    visibility_timeout: self.visibility_timeout,
                };
                let received = tokio::select! {
                    () = self.cancel.cancelled() => break,
                    received = self.client.receive_messages(request) => received,
                };

                match received {
                    Ok(messages) if messages.is_empty() => {
                        // The long poll already absorbed the wait.
                        continue;
                    }
                    Ok(messages) => self.dispatch(messages, &mut window),
                    Err(err) => {
                        error!(error = %format_error_sources(&err), "receive failed, backing off");
                        let backoff = jittered(self.polling_error_backoff);
                        tokio::select! {
                            () = self.cancel.cancelled() => break,
                            () = sleep(backoff) => {}
                        }
                    }
                }
            }
            debug!("polling loop exited");
        }
        .instrument(span)
        .await;
    }

    /// Spawns one processor per received message, transferring one admission
    /// slot each. Surplus slots release when the window drops at the end of
    /// the iteration.
    fn dispatch(&self, messages: Vec<RawMessage>, window: &mut Window) {
        for message in messages {
            let Some(slot) = window.take_slot() else {
                // The client returned more than the requested maximum; the
                // surplus is not admitted and will redeliver.
                warn!(
                    message.id = %message.id,
                    "receive returned more messages than requested, skipping surplus"
                );
                break;
            };
            let pipeline = Arc::clone(&self.pipeline);
            let cancel = self.cancel.child_token();
            drop(tokio::spawn(pipeline.process(message, slot, cancel)));
        }
    }
}

/// Applies ±20% jitter so a fleet of containers does not hammer a recovering
/// queue service in lockstep.
fn jittered(backoff: Duration) -> Duration {
    let factor = rand::rng().random_range(0.8..=1.2);
    backoff.mul_f64(factor)
}
