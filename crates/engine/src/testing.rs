// SPDX-License-Identifier: Apache-2.0

//! Test utilities: a scripted in-memory queue client and listener/handler
//! probes.
//!
//! Available to downstream crates behind the `test-utils` feature. The
//! scripted client emulates the queue service closely enough for lifecycle
//! tests: long polling against an in-memory queue, receipt-handle based
//! deletion, per-call failure scripting, and explicit redelivery of unacked
//! messages (the test decides when a visibility timeout "expires").

use crate::client::{
    APPROX_RECEIVE_COUNT_ATTRIBUTE, DeleteBatchOutcome, DeleteEntry, DeleteFailure, QueueClient,
    QueueClientError, RawMessage, ReceiveRequest,
};
use crate::error::{BoxError, Error, ErrorKind};
use crate::handler::ErrorHandler;
use crate::listener::{MessageContext, QueueListener};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Builds a raw message with the given identity and body; everything else is
/// empty.
pub fn raw_message(id: &str, receipt_handle: &str, body: &str) -> RawMessage {
    RawMessage {
        id: id.to_owned(),
        receipt_handle: receipt_handle.to_owned(),
        body: body.to_owned(),
        ..RawMessage::default()
    }
}

/// A scripted per-entry batch-delete failure, matched by receipt handle (the
/// batcher generates its own batch entry ids, so scripts cannot name them).
#[derive(Debug, Clone)]
pub struct ScriptedEntryFailure {
    /// Receipt handle of the entry that must fail.
    pub receipt_handle: String,
    /// Service error code echoed in the outcome.
    pub code: String,
    /// Whether the failure is reported as a permanent client-side error.
    pub sender_fault: bool,
}

enum BatchScript {
    EntryFailures(Vec<ScriptedEntryFailure>),
    Transport,
}

#[derive(Default)]
struct State {
    queue: VecDeque<RawMessage>,
    in_flight: HashMap<String, RawMessage>,
    queue_urls: HashMap<String, String>,
    receive_failures: usize,
    delete_failures: usize,
    visibility_failures: usize,
    batch_scripts: VecDeque<BatchScript>,
    deleted: Vec<String>,
    deletes: Vec<(String, String)>,
    batch_calls: Vec<(String, Vec<DeleteEntry>)>,
    visibility_calls: Vec<(String, String, Duration)>,
    receive_calls: usize,
    receive_batches: Vec<usize>,
    resolve_calls: usize,
}

/// In-memory [`QueueClient`] with scripted failures and full call recording.
#[derive(Default)]
pub struct ScriptedQueueClient {
    state: parking_lot::Mutex<State>,
    changed: Notify,
}

impl ScriptedQueueClient {
    /// Creates an empty client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a message for delivery.
    pub fn push(&self, message: RawMessage) {
        self.state.lock().queue.push_back(message);
        self.changed.notify_waiters();
    }

    /// Registers a queue name for URL resolution.
    pub fn register_queue(&self, name: &str, url: &str) {
        self.state
            .lock()
            .queue_urls
            .insert(name.to_owned(), url.to_owned());
    }

    /// Makes the next `count` receive calls fail with a transport error.
    pub fn script_receive_failures(&self, count: usize) {
        self.state.lock().receive_failures += count;
    }

    /// Makes the next `count` single-delete calls fail with a transport
    /// error.
    pub fn script_delete_failures(&self, count: usize) {
        self.state.lock().delete_failures += count;
    }

    /// Makes the next `count` visibility changes fail with a transport
    /// error.
    pub fn script_visibility_failures(&self, count: usize) {
        self.state.lock().visibility_failures += count;
    }

    /// Scripts per-entry failures for the next batch-delete call. Entries
    /// whose receipt handle is not named in `failures` succeed.
    pub fn script_batch_failures(&self, failures: Vec<ScriptedEntryFailure>) {
        self.state
            .lock()
            .batch_scripts
            .push_back(BatchScript::EntryFailures(failures));
    }

    /// Makes the next `count` batch-delete calls fail in transit.
    pub fn script_batch_transport_failures(&self, count: usize) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.batch_scripts.push_back(BatchScript::Transport);
        }
    }

    /// Moves every received-but-not-deleted message back into the queue, as
    /// if its visibility timeout expired.
    pub fn redeliver_unacked(&self) {
        let mut state = self.state.lock();
        let redelivered: Vec<RawMessage> = state.in_flight.drain().map(|(_, m)| m).collect();
        state.queue.extend(redelivered);
        drop(state);
        self.changed.notify_waiters();
    }

    /// Receipt handles that were actually deleted (single or batch).
    pub fn deleted_receipts(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    /// Every single-delete call as `(queue_url, receipt_handle)`.
    pub fn deletes(&self) -> Vec<(String, String)> {
        self.state.lock().deletes.clone()
    }

    /// Every batch-delete call with its entries.
    pub fn batch_calls(&self) -> Vec<(String, Vec<DeleteEntry>)> {
        self.state.lock().batch_calls.clone()
    }

    /// Every visibility change as `(queue_url, receipt_handle, timeout)`.
    pub fn visibility_calls(&self) -> Vec<(String, String, Duration)> {
        self.state.lock().visibility_calls.clone()
    }

    /// Number of completed receive calls, failures included.
    pub fn receive_calls(&self) -> usize {
        self.state.lock().receive_calls
    }

    /// Size of every non-empty receive response, in call order.
    pub fn receive_batches(&self) -> Vec<usize> {
        self.state.lock().receive_batches.clone()
    }

    /// Number of queue-URL resolutions.
    pub fn resolve_calls(&self) -> usize {
        self.state.lock().resolve_calls
    }

    /// Messages received but neither deleted nor redelivered.
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    async fn wait_until(&self, predicate: impl Fn(&State) -> bool) {
        loop {
            let notified = self.changed.notified();
            if predicate(&self.state.lock()) {
                return;
            }
            notified.await;
        }
    }

    /// Waits until at least `count` receipts were deleted.
    pub async fn wait_for_deleted(&self, count: usize) {
        self.wait_until(|state| state.deleted.len() >= count).await;
    }

    /// Waits until at least `count` batch-delete calls were made.
    pub async fn wait_for_batch_calls(&self, count: usize) {
        self.wait_until(|state| state.batch_calls.len() >= count)
            .await;
    }

    /// Waits until at least `count` visibility changes were made.
    pub async fn wait_for_visibility_calls(&self, count: usize) {
        self.wait_until(|state| state.visibility_calls.len() >= count)
            .await;
    }

    /// Waits until at least `count` receive calls completed.
    pub async fn wait_for_receive_calls(&self, count: usize) {
        self.wait_until(|state| state.receive_calls >= count).await;
    }
}

#[async_trait]
impl QueueClient for ScriptedQueueClient {
    async fn receive_messages(
        &self,
        request: ReceiveRequest,
    ) -> Result<Vec<RawMessage>, QueueClientError> {
        let deadline = tokio::time::Instant::now() + request.poll_timeout;
        loop {
            let notified = self.changed.notified();
            {
                let mut state = self.state.lock();
                if state.receive_failures > 0 {
                    state.receive_failures -= 1;
                    state.receive_calls += 1;
                    drop(state);
                    self.changed.notify_waiters();
                    return Err(QueueClientError::transport(std::io::Error::other(
                        "scripted receive failure",
                    )));
                }
                if !state.queue.is_empty() {
                    let mut batch = Vec::new();
                    while batch.len() < request.max_messages {
                        let Some(mut message) = state.queue.pop_front() else {
                            break;
                        };
                        message.approx_receive_count += 1;
                        message.system_attributes.insert(
                            APPROX_RECEIVE_COUNT_ATTRIBUTE.to_owned(),
                            message.approx_receive_count.to_string(),
                        );
                        if message.queue_url.is_empty() {
                            message.queue_url = request.queue_url.clone();
                        }
                        state
                            .in_flight
                            .insert(message.receipt_handle.clone(), message.clone());
                        batch.push(message);
                    }
                    state.receive_calls += 1;
                    state.receive_batches.push(batch.len());
                    drop(state);
                    self.changed.notify_waiters();
                    return Ok(batch);
                }
            }
            if request.poll_timeout.is_zero() {
                self.state.lock().receive_calls += 1;
                self.changed.notify_waiters();
                // Short polling returns immediately; yield so a tight
                // empty-poll loop cannot starve the test runtime.
                tokio::task::yield_now().await;
                return Ok(Vec::new());
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    self.state.lock().receive_calls += 1;
                    self.changed.notify_waiters();
                    return Ok(Vec::new());
                }
            }
        }
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), QueueClientError> {
        let mut state = self.state.lock();
        state
            .deletes
            .push((queue_url.to_owned(), receipt_handle.to_owned()));
        let result = if state.delete_failures > 0 {
            state.delete_failures -= 1;
            Err(QueueClientError::transport(std::io::Error::other(
                "scripted delete failure",
            )))
        } else {
            state.in_flight.remove(receipt_handle);
            state.deleted.push(receipt_handle.to_owned());
            Ok(())
        };
        drop(state);
        self.changed.notify_waiters();
        result
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<DeleteBatchOutcome, QueueClientError> {
        let mut state = self.state.lock();
        state
            .batch_calls
            .push((queue_url.to_owned(), entries.clone()));
        let script = state.batch_scripts.pop_front();
        let result = match script {
            Some(BatchScript::Transport) => Err(QueueClientError::transport(
                std::io::Error::other("scripted batch failure"),
            )),
            Some(BatchScript::EntryFailures(failures)) => {
                let mut outcome = DeleteBatchOutcome::default();
                for entry in entries {
                    if let Some(failure) = failures
                        .iter()
                        .find(|failure| failure.receipt_handle == entry.receipt_handle)
                    {
                        outcome.failed.push(DeleteFailure {
                            id: entry.id,
                            code: failure.code.clone(),
                            message: None,
                            sender_fault: failure.sender_fault,
                        });
                    } else {
                        state.in_flight.remove(&entry.receipt_handle);
                        state.deleted.push(entry.receipt_handle);
                        outcome.succeeded.push(entry.id);
                    }
                }
                Ok(outcome)
            }
            None => {
                let mut outcome = DeleteBatchOutcome::default();
                for entry in entries {
                    state.in_flight.remove(&entry.receipt_handle);
                    state.deleted.push(entry.receipt_handle);
                    outcome.succeeded.push(entry.id);
                }
                Ok(outcome)
            }
        };
        drop(state);
        self.changed.notify_waiters();
        result
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueClientError> {
        let mut state = self.state.lock();
        state.visibility_calls.push((
            queue_url.to_owned(),
            receipt_handle.to_owned(),
            timeout,
        ));
        let result = if state.visibility_failures > 0 {
            state.visibility_failures -= 1;
            Err(QueueClientError::transport(std::io::Error::other(
                "scripted visibility failure",
            )))
        } else {
            Ok(())
        };
        drop(state);
        self.changed.notify_waiters();
        result
    }

    async fn resolve_queue_url(&self, queue_name: &str) -> Result<String, QueueClientError> {
        let mut state = self.state.lock();
        state.resolve_calls += 1;
        state
            .queue_urls
            .get(queue_name)
            .cloned()
            .ok_or_else(|| QueueClientError::NotFound(queue_name.to_owned()))
    }
}

/// Listener probe recording payloads, receive counts, and concurrency, with
/// scriptable behaviour (failure, delay, manual ack, waiting for
/// cancellation).
pub struct ProbeListener<T> {
    received: parking_lot::Mutex<Vec<T>>,
    receive_counts: parking_lot::Mutex<Vec<u32>>,
    invocations: AtomicUsize,
    completed: AtomicUsize,
    current_inflight: AtomicUsize,
    max_inflight: AtomicUsize,
    cancellations_seen: AtomicUsize,
    fail_message: parking_lot::Mutex<Option<String>>,
    delay: parking_lot::Mutex<Option<Duration>>,
    manual_ack: AtomicBool,
    wait_for_cancellation: AtomicBool,
    changed: Notify,
}

impl<T> Default for ProbeListener<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ProbeListener<T> {
    /// Creates a well-behaved probe: records and returns `Ok`.
    pub fn new() -> Self {
        Self {
            received: parking_lot::Mutex::new(Vec::new()),
            receive_counts: parking_lot::Mutex::new(Vec::new()),
            invocations: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            current_inflight: AtomicUsize::new(0),
            max_inflight: AtomicUsize::new(0),
            cancellations_seen: AtomicUsize::new(0),
            fail_message: parking_lot::Mutex::new(None),
            delay: parking_lot::Mutex::new(None),
            manual_ack: AtomicBool::new(false),
            wait_for_cancellation: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    /// Makes every invocation return an error with the given message.
    pub fn fail_with(&self, message: &str) {
        *self.fail_message.lock() = Some(message.to_owned());
    }

    /// Makes every invocation sleep before completing.
    pub fn delay_for(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Makes every invocation call `ctx.acknowledge()`.
    pub fn acknowledge_manually(&self) {
        self.manual_ack.store(true, Ordering::SeqCst);
    }

    /// Makes every invocation block until its cancellation token fires.
    pub fn await_cancellation(&self) {
        self.wait_for_cancellation.store(true, Ordering::SeqCst);
    }

    /// Number of invocations started.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Number of invocations that ran to completion.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent invocations observed.
    pub fn max_inflight(&self) -> usize {
        self.max_inflight.load(Ordering::SeqCst)
    }

    /// Number of invocations that observed cancellation.
    pub fn cancellations_seen(&self) -> usize {
        self.cancellations_seen.load(Ordering::SeqCst)
    }

    /// The `approx_receive_count` of every delivery, in arrival order.
    pub fn receive_counts(&self) -> Vec<u32> {
        self.receive_counts.lock().clone()
    }

    async fn wait_until(&self, predicate: impl Fn(&Self) -> bool) {
        loop {
            let notified = self.changed.notified();
            if predicate(self) {
                return;
            }
            notified.await;
        }
    }

    /// Waits until at least `count` invocations started.
    pub async fn wait_for_invocations(&self, count: usize) {
        self.wait_until(|probe| probe.invocations() >= count).await;
    }

    /// Waits until at least `count` invocations completed.
    pub async fn wait_for_completed(&self, count: usize) {
        self.wait_until(|probe| probe.completed() >= count).await;
    }

    /// Waits until at least `count` invocations observed cancellation.
    pub async fn wait_for_cancellations(&self, count: usize) {
        self.wait_until(|probe| probe.cancellations_seen() >= count)
            .await;
    }
}

impl<T: Clone> ProbeListener<T> {
    /// Every payload received, in arrival order.
    pub fn received(&self) -> Vec<T> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl<T, C, R> QueueListener<T, C, R> for ProbeListener<T>
where
    T: Send + Sync + 'static,
    C: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    async fn on_message(&self, payload: T, ctx: &MessageContext<C, R>) -> Result<(), BoxError> {
        let inflight = self.current_inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight.fetch_max(inflight, Ordering::SeqCst);
        self.received.lock().push(payload);
        self.receive_counts.lock().push(ctx.approx_receive_count());
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.wait_for_cancellation.load(Ordering::SeqCst) {
            ctx.cancellation().cancelled().await;
            self.cancellations_seen.fetch_add(1, Ordering::SeqCst);
        }
        let ack_result = if self.manual_ack.load(Ordering::SeqCst) {
            ctx.acknowledge()
                .await
                .map_err(|err| Box::new(err) as BoxError)
        } else {
            Ok(())
        };

        let fail = self.fail_message.lock().clone();
        self.current_inflight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
        if let Some(message) = fail {
            return Err(message.into());
        }
        ack_result
    }
}

/// Error handler recording the taxonomy kind of every routed failure.
#[derive(Default)]
pub struct RecordingErrorHandler {
    kinds: parking_lot::Mutex<Vec<ErrorKind>>,
    changed: Notify,
}

impl RecordingErrorHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// The kind of every handled failure, in arrival order.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        self.kinds.lock().clone()
    }

    /// Waits until at least `count` failures were handled.
    pub async fn wait_for_kinds(&self, count: usize) {
        loop {
            let notified = self.changed.notified();
            if self.kinds.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ErrorHandler for RecordingErrorHandler {
    async fn handle(&self, error: &Error, _message: &RawMessage) {
        self.kinds.lock().push(error.kind());
        self.changed.notify_waiters();
    }
}
