// SPDX-License-Identifier: Apache-2.0

//! Acknowledgement: deleting processed messages, optionally in batches.
//!
//! The [`AckSink`] is the single entry point processors use. In direct mode
//! every acknowledgement is one `delete_message` call. In batched mode the
//! [`AckBatcher`] coalesces deletions per queue and flushes when the batch is
//! full, when the flush timer fires, or when the container stops.
//!
//! At-least-once discipline: an enqueued receipt handle is never dropped
//! before at least one delete attempt. Whole-batch transport failures and
//! per-entry service failures that are not the sender's fault are re-enqueued
//! exactly once; entries the service flags as `sender_fault` are permanent
//! client-side errors and are dropped immediately. Batching collapses
//! duplicate receipt handles and may reorder deletes relative to processing
//! completion.

use crate::client::{DeleteEntry, QueueClient, QueueClientError};
use crate::error::format_error_sources;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// A failed message deletion.
#[derive(thiserror::Error, Debug)]
#[error("delete failed: {source}")]
pub struct AckError {
    #[from]
    source: QueueClientError,
}

/// One pending deletion inside the batcher.
///
/// `entry_id` is the id sent in the batch-delete call. It is generated per
/// enqueue rather than taken from the service message id: the service keeps
/// one message id across redeliveries of a logical message while issuing a
/// fresh receipt handle per delivery, so two concurrently in-flight
/// deliveries acked into the same batch would otherwise collide on a
/// duplicate entry id and fail the whole call.
#[derive(Debug, Clone)]
struct AckRequest {
    message_id: String,
    entry_id: String,
    receipt_handle: String,
    enqueued_at: Instant,
    attempts: u8,
}

/// Where processors send acknowledgements.
#[derive(Clone)]
pub enum AckSink {
    /// One `delete_message` call per acknowledgement.
    Direct(DirectAck),
    /// Deletions coalesced by the batcher.
    Batched(Arc<AckBatcher>),
}

impl AckSink {
    /// Creates a direct (unbatched) sink.
    pub fn direct(client: Arc<dyn QueueClient>) -> Self {
        Self::Direct(DirectAck { client })
    }

    /// Creates a batched sink.
    pub fn batched(batcher: Arc<AckBatcher>) -> Self {
        Self::Batched(batcher)
    }

    /// Acknowledges one delivery.
    ///
    /// In batched mode this only enqueues and returns immediately; delete
    /// failures are handled inside the batcher. In direct mode the delete
    /// runs inline and its failure is returned.
    pub async fn acknowledge(
        &self,
        queue_url: &str,
        message_id: &str,
        receipt_handle: &str,
    ) -> Result<(), AckError> {
        match self {
            AckSink::Direct(direct) => {
                direct
                    .client
                    .delete_message(queue_url, receipt_handle)
                    .await?;
                debug!(message.id = message_id, "message deleted");
                Ok(())
            }
            AckSink::Batched(batcher) => {
                batcher.enqueue(queue_url, message_id, receipt_handle);
                Ok(())
            }
        }
    }

    /// Final flush at container stop. A no-op in direct mode.
    pub async fn flush_all(&self) {
        if let AckSink::Batched(batcher) = self {
            batcher.flush_all().await;
        }
    }
}

/// Unbatched acknowledgement path.
#[derive(Clone)]
pub struct DirectAck {
    client: Arc<dyn QueueClient>,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<AckRequest>,
    /// Bumped whenever `pending` is taken for a flush; lets an armed timer
    /// detect that its batch was already flushed.
    epoch: u64,
}

impl QueueState {
    fn take_pending(&mut self) -> Vec<AckRequest> {
        self.epoch += 1;
        std::mem::take(&mut self.pending)
    }
}

/// Coalesces message deletions into batch calls, one pending batch per queue.
pub struct AckBatcher {
    client: Arc<dyn QueueClient>,
    max_size: usize,
    flush_interval: Duration,
    queues: parking_lot::Mutex<HashMap<String, QueueState>>,
    /// Source of batch entry ids; see [`AckRequest`].
    entry_seq: AtomicU64,
}

impl AckBatcher {
    /// Creates a batcher flushing at `max_size` entries or after
    /// `flush_interval`, whichever comes first.
    pub fn new(client: Arc<dyn QueueClient>, max_size: usize, flush_interval: Duration) -> Self {
        Self {
            client,
            max_size,
            flush_interval,
            queues: parking_lot::Mutex::new(HashMap::new()),
            entry_seq: AtomicU64::new(0),
        }
    }

    /// Adds one deletion to the queue's pending batch. Returns immediately;
    /// the flush happens on a spawned task.
    ///
    /// Duplicate receipt handles already pending for the queue are collapsed.
    pub fn enqueue(self: &Arc<Self>, queue_url: &str, message_id: &str, receipt_handle: &str) {
        let entry_id = format!("ack-{}", self.entry_seq.fetch_add(1, Ordering::Relaxed));
        self.enqueue_request(
            queue_url,
            AckRequest {
                message_id: message_id.to_owned(),
                entry_id,
                receipt_handle: receipt_handle.to_owned(),
                enqueued_at: Instant::now(),
                attempts: 0,
            },
        );
    }

    fn enqueue_request(self: &Arc<Self>, queue_url: &str, request: AckRequest) {
        let full_batch = {
            let mut queues = self.queues.lock();
            let state = queues.entry(queue_url.to_owned()).or_default();
            if state
                .pending
                .iter()
                .any(|pending| pending.receipt_handle == request.receipt_handle)
            {
                debug!(
                    message.id = %request.message_id,
                    "receipt handle already pending, collapsing duplicate ack"
                );
                return;
            }
            state.pending.push(request);
            if state.pending.len() >= self.max_size {
                Some(state.take_pending())
            } else {
                if state.pending.len() == 1 {
                    self.arm_flush_timer(queue_url, state.epoch);
                }
                None
            }
        };
        if let Some(batch) = full_batch {
            let batcher = Arc::clone(self);
            let queue_url = queue_url.to_owned();
            drop(tokio::spawn(async move {
                batcher.flush_batch(&queue_url, batch, true).await;
            }));
        }
    }

    /// Arms the per-queue flush timer when the first entry lands in an empty
    /// batch. The epoch guard makes a stale timer (whose batch was already
    /// flushed by size) a no-op.
    fn arm_flush_timer(self: &Arc<Self>, queue_url: &str, epoch: u64) {
        let batcher = Arc::clone(self);
        let queue_url = queue_url.to_owned();
        drop(tokio::spawn(async move {
            tokio::time::sleep(batcher.flush_interval).await;
            let due = {
                let mut queues = batcher.queues.lock();
                match queues.get_mut(&queue_url) {
                    Some(state) if state.epoch == epoch && !state.pending.is_empty() => {
                        Some(state.take_pending())
                    }
                    _ => None,
                }
            };
            if let Some(batch) = due {
                batcher.flush_batch(&queue_url, batch, true).await;
            }
        }));
    }

    /// Flushes every queue's pending batch once, synchronously.
    ///
    /// Called at container stop. Entries that fail this final attempt are
    /// not re-enqueued; they are logged as leaked and left to redeliver
    /// after their visibility timeout expires.
    pub async fn flush_all(self: &Arc<Self>) {
        let drained: Vec<(String, Vec<AckRequest>)> = {
            let mut queues = self.queues.lock();
            queues
                .iter_mut()
                .filter(|(_, state)| !state.pending.is_empty())
                .map(|(queue_url, state)| (queue_url.clone(), state.take_pending()))
                .collect()
        };
        join_all(drained.into_iter().map(|(queue_url, batch)| {
            let batcher = Arc::clone(self);
            async move { batcher.flush_batch(&queue_url, batch, false).await }
        }))
        .await;
    }

    async fn flush_batch(self: &Arc<Self>, queue_url: &str, batch: Vec<AckRequest>, requeue: bool) {
        let entries: Vec<DeleteEntry> = batch
            .iter()
            .map(|request| DeleteEntry {
                id: request.entry_id.clone(),
                receipt_handle: request.receipt_handle.clone(),
            })
            .collect();
        match self.client.delete_message_batch(queue_url, entries).await {
            Ok(outcome) => {
                let oldest = batch
                    .iter()
                    .map(|request| request.enqueued_at.elapsed())
                    .max()
                    .unwrap_or_default();
                debug!(
                    queue.url = queue_url,
                    deleted = outcome.succeeded.len(),
                    failed = outcome.failed.len(),
                    oldest_pending_ms = oldest.as_millis() as u64,
                    "flushed ack batch"
                );
                for failure in outcome.failed {
                    let Some(request) = batch.iter().find(|request| request.entry_id == failure.id)
                    else {
                        warn!(entry.id = %failure.id, "batch failure for an unknown entry id");
                        continue;
                    };
                    if failure.sender_fault {
                        warn!(
                            message.id = %request.message_id,
                            code = %failure.code,
                            "dropping malformed receipt handle reported as sender fault"
                        );
                    } else if requeue && request.attempts == 0 {
                        debug!(
                            message.id = %request.message_id,
                            code = %failure.code,
                            "re-enqueueing failed delete"
                        );
                        let mut retry = request.clone();
                        retry.attempts = 1;
                        self.enqueue_request(queue_url, retry);
                    } else {
                        error!(
                            message.id = %request.message_id,
                            code = %failure.code,
                            "delete failed twice, leaking receipt handle to visibility-based redelivery"
                        );
                    }
                }
            }
            Err(err) => {
                if requeue {
                    let (retriable, exhausted): (Vec<_>, Vec<_>) =
                        batch.into_iter().partition(|request| request.attempts == 0);
                    error!(
                        queue.url = queue_url,
                        error = %format_error_sources(&err),
                        retried = retriable.len(),
                        dropped = exhausted.len(),
                        "batch delete failed"
                    );
                    for mut request in retriable {
                        request.attempts = 1;
                        self.enqueue_request(queue_url, request);
                    }
                } else {
                    error!(
                        queue.url = queue_url,
                        error = %format_error_sources(&err),
                        leaked = batch.len(),
                        "final batch delete failed, leaking pending acks"
                    );
                }
            }
        }
    }

    /// Number of pending deletions across all queues.
    pub fn pending_len(&self) -> usize {
        self.queues
            .lock()
            .values()
            .map(|state| state.pending.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedEntryFailure, ScriptedQueueClient};

    const QUEUE: &str = "https://queue.example/orders";

    fn batcher(client: &Arc<ScriptedQueueClient>, max_size: usize) -> Arc<AckBatcher> {
        Arc::new(AckBatcher::new(
            Arc::clone(client) as Arc<dyn QueueClient>,
            max_size,
            Duration::from_millis(100),
        ))
    }

    #[tokio::test]
    async fn direct_sink_deletes_inline() {
        let client = Arc::new(ScriptedQueueClient::new());
        let sink = AckSink::direct(Arc::clone(&client) as Arc<dyn QueueClient>);
        sink.acknowledge(QUEUE, "m1", "r1")
            .await
            .expect("delete succeeds");
        assert_eq!(client.deleted_receipts(), ["r1"]);
    }

    #[tokio::test]
    async fn direct_sink_surfaces_delete_failures() {
        let client = Arc::new(ScriptedQueueClient::new());
        client.script_delete_failures(1);
        let sink = AckSink::direct(Arc::clone(&client) as Arc<dyn QueueClient>);
        let err = sink
            .acknowledge(QUEUE, "m1", "r1")
            .await
            .expect_err("delete fails");
        assert!(err.to_string().contains("delete failed"));
    }

    #[tokio::test]
    async fn flushes_when_the_batch_is_full() {
        let client = Arc::new(ScriptedQueueClient::new());
        let batcher = batcher(&client, 3);
        for (id, receipt) in [("m1", "r1"), ("m2", "r2"), ("m3", "r3")] {
            batcher.enqueue(QUEUE, id, receipt);
        }
        client.wait_for_deleted(3).await;
        let batches = client.batch_calls();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 3);
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_the_timer_for_partial_batches() {
        let client = Arc::new(ScriptedQueueClient::new());
        let batcher = batcher(&client, 10);
        batcher.enqueue(QUEUE, "m1", "r1");
        batcher.enqueue(QUEUE, "m2", "r2");
        assert_eq!(batcher.pending_len(), 2);
        client.wait_for_deleted(2).await;
        assert_eq!(client.batch_calls().len(), 1);
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn redelivered_message_gets_a_distinct_batch_entry_id() {
        // One logical message delivered twice: same message id, fresh
        // receipt handle per delivery. Both acks must coexist in one batch
        // without colliding on the entry id.
        let client = Arc::new(ScriptedQueueClient::new());
        let batcher = batcher(&client, 2);
        batcher.enqueue(QUEUE, "m1", "r1");
        batcher.enqueue(QUEUE, "m1", "r2");

        client.wait_for_deleted(2).await;
        let batches = client.batch_calls();
        assert_eq!(batches.len(), 1);
        let entries = &batches[0].1;
        assert_eq!(entries.len(), 2);
        assert_ne!(entries[0].id, entries[1].id);
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn duplicate_receipts_are_collapsed() {
        let client = Arc::new(ScriptedQueueClient::new());
        let batcher = batcher(&client, 10);
        batcher.enqueue(QUEUE, "m1", "r1");
        batcher.enqueue(QUEUE, "m1", "r1");
        assert_eq!(batcher.pending_len(), 1);
        batcher.flush_all().await;
        assert_eq!(client.deleted_receipts(), ["r1"]);
    }

    #[tokio::test]
    async fn sender_faults_are_dropped_without_retry() {
        let client = Arc::new(ScriptedQueueClient::new());
        client.script_batch_failures(vec![ScriptedEntryFailure {
            receipt_handle: "r1".to_owned(),
            code: "ReceiptHandleIsInvalid".to_owned(),
            sender_fault: true,
        }]);
        let batcher = batcher(&client, 10);
        batcher.enqueue(QUEUE, "m1", "r1");
        batcher.flush_all().await;
        assert_eq!(batcher.pending_len(), 0);
        assert_eq!(client.batch_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn service_faults_are_retried_exactly_once() {
        let client = Arc::new(ScriptedQueueClient::new());
        let failure = ScriptedEntryFailure {
            receipt_handle: "r1".to_owned(),
            code: "InternalError".to_owned(),
            sender_fault: false,
        };
        client.script_batch_failures(vec![failure.clone()]);
        client.script_batch_failures(vec![failure]);

        let batcher = batcher(&client, 1);
        batcher.enqueue(QUEUE, "m1", "r1");

        // First flush fails and re-enqueues; the retry flushes (max_size=1)
        // and fails again, which exhausts the single retry.
        client.wait_for_batch_calls(2).await;
        tokio::task::yield_now().await;
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_leave_entries_for_one_retry() {
        let client = Arc::new(ScriptedQueueClient::new());
        client.script_batch_transport_failures(1);
        let batcher = batcher(&client, 2);
        batcher.enqueue(QUEUE, "m1", "r1");
        batcher.enqueue(QUEUE, "m2", "r2");

        // First call fails in transit, both entries re-enqueue and the
        // refilled batch flushes again by size.
        client.wait_for_batch_calls(2).await;
        client.wait_for_deleted(2).await;
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn stop_flush_drains_every_queue() {
        let client = Arc::new(ScriptedQueueClient::new());
        let batcher = batcher(&client, 10);
        batcher.enqueue(QUEUE, "m1", "r1");
        batcher.enqueue("https://queue.example/audit", "m2", "r2");
        batcher.flush_all().await;
        assert_eq!(batcher.pending_len(), 0);
        let mut receipts = client.deleted_receipts();
        receipts.sort();
        assert_eq!(receipts, ["r1", "r2"]);
    }

    #[tokio::test]
    async fn final_flush_failure_leaks_instead_of_requeueing() {
        let client = Arc::new(ScriptedQueueClient::new());
        client.script_batch_transport_failures(1);
        let batcher = batcher(&client, 10);
        batcher.enqueue(QUEUE, "m1", "r1");
        batcher.flush_all().await;
        // The entry is gone: leaked to visibility-based redelivery, not
        // silently retained.
        assert_eq!(batcher.pending_len(), 0);
        assert_eq!(client.batch_calls().len(), 1);
    }
}
