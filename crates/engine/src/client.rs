// SPDX-License-Identifier: Apache-2.0

//! Thin typed contract over the queue service.
//!
//! The runtime depends on a narrow operations surface: receive, delete,
//! batch-delete, visibility change, and name-to-URL resolution. Concrete
//! clients (the AWS SQS implementation lives in `siphon-sqs`, the scripted
//! in-memory client in [`crate::testing`]) translate these calls onto their
//! SDK and report failures verbatim. Clients never retry internally; retry
//! and backoff belong to the polling loop and the ack batcher.

use crate::error::BoxError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// System attribute carrying the queue service's delivery counter.
pub const APPROX_RECEIVE_COUNT_ATTRIBUTE: &str = "ApproximateReceiveCount";

/// A message as returned by a receive call, before any decoding.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    /// Service-assigned message id.
    pub id: String,
    /// Opaque token required to delete or re-hide this delivery.
    pub receipt_handle: String,
    /// Raw body text.
    pub body: String,
    /// User-supplied message attributes.
    pub attributes: HashMap<String, String>,
    /// Service-supplied system attributes.
    pub system_attributes: HashMap<String, String>,
    /// How many times this message has been delivered, per the
    /// `ApproximateReceiveCount` system attribute. Zero when the service did
    /// not report a count.
    pub approx_receive_count: u32,
    /// URL of the queue this message was received from.
    pub queue_url: String,
}

impl RawMessage {
    /// Reads the delivery counter out of a system-attribute map.
    ///
    /// The counter is advisory (it is only logged), so an absent or
    /// unparsable attribute degrades to zero instead of failing the message.
    pub fn receive_count_from(system_attributes: &HashMap<String, String>) -> u32 {
        system_attributes
            .get(APPROX_RECEIVE_COUNT_ATTRIBUTE)
            .and_then(|count| count.parse().ok())
            .unwrap_or(0)
    }
}

/// Parameters of one receive call.
#[derive(Debug, Clone)]
pub struct ReceiveRequest {
    /// URL of the queue to poll.
    pub queue_url: String,
    /// Maximum number of messages to return, `1..=10`.
    pub max_messages: usize,
    /// How long the call may wait for at least one message. Zero selects
    /// short polling.
    pub poll_timeout: Duration,
    /// Visibility timeout to apply to returned messages. `None` inherits the
    /// queue's default.
    pub visibility_timeout: Option<Duration>,
}

/// One entry of a batch delete call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEntry {
    /// Caller-chosen id, unique within the batch, echoed back in the outcome.
    pub id: String,
    /// Receipt handle of the delivery to delete.
    pub receipt_handle: String,
}

/// Per-entry failure reported by a batch delete call.
#[derive(Debug, Clone)]
pub struct DeleteFailure {
    /// Id of the failed entry, as passed in the request.
    pub id: String,
    /// Service error code.
    pub code: String,
    /// Optional human-readable detail.
    pub message: Option<String>,
    /// `true` when the failure is a permanent client-side error (for example
    /// a malformed receipt handle) that must not be retried.
    pub sender_fault: bool,
}

/// Result of a batch delete call.
#[derive(Debug, Clone, Default)]
pub struct DeleteBatchOutcome {
    /// Ids of the entries that were deleted.
    pub succeeded: Vec<String>,
    /// Entries that were not deleted, with the reason.
    pub failed: Vec<DeleteFailure>,
}

/// Errors reported by queue clients.
#[derive(thiserror::Error, Debug)]
pub enum QueueClientError {
    /// The queue service was unreachable or answered with a server fault.
    #[error("transport failure")]
    Transport(#[source] BoxError),

    /// The named queue does not exist.
    #[error("queue `{0}` does not exist")]
    NotFound(String),

    /// The service answered with a response the client could not interpret.
    #[error("malformed response from the queue service: {0}")]
    Malformed(String),
}

impl QueueClientError {
    /// Wraps an SDK or I/O error as a transport failure.
    pub fn transport(source: impl Into<BoxError>) -> Self {
        Self::Transport(source.into())
    }
}

/// Typed operations surface of the queue service.
///
/// Implementations must be safe to share across the polling loop, the ack
/// batcher, and every in-flight processor.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receives up to `request.max_messages` messages, long-polling for up to
    /// `request.poll_timeout`.
    async fn receive_messages(
        &self,
        request: ReceiveRequest,
    ) -> Result<Vec<RawMessage>, QueueClientError>;

    /// Deletes a single delivery.
    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), QueueClientError>;

    /// Deletes up to ten deliveries in one call.
    ///
    /// Per-entry failures are reported in the outcome, not as an `Err`; the
    /// call itself only fails on transport problems.
    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<DeleteBatchOutcome, QueueClientError>;

    /// Re-hides a delivery for `timeout` from now.
    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueClientError>;

    /// Resolves a queue name to its URL.
    ///
    /// Containers memoise the result; clients may assume at most one call per
    /// container start.
    async fn resolve_queue_url(&self, queue_name: &str) -> Result<String, QueueClientError>;
}

#[async_trait]
impl<Q> QueueClient for Arc<Q>
where
    Q: QueueClient + ?Sized,
{
    async fn receive_messages(
        &self,
        request: ReceiveRequest,
    ) -> Result<Vec<RawMessage>, QueueClientError> {
        (**self).receive_messages(request).await
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), QueueClientError> {
        (**self).delete_message(queue_url, receipt_handle).await
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> Result<DeleteBatchOutcome, QueueClientError> {
        (**self).delete_message_batch(queue_url, entries).await
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueClientError> {
        (**self)
            .change_visibility(queue_url, receipt_handle, timeout)
            .await
    }

    async fn resolve_queue_url(&self, queue_name: &str) -> Result<String, QueueClientError> {
        (**self).resolve_queue_url(queue_name).await
    }
}
