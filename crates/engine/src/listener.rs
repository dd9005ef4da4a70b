// SPDX-License-Identifier: Apache-2.0

//! The listener contract and the per-message context handed to it.
//!
//! A listener is a single async operation over a typed payload. Decorators
//! (tracing, metrics, retries) are plain wrappers: a type holding another
//! listener and implementing the trait itself; no framework machinery is
//! involved.

use crate::ack::{AckError, AckSink};
use crate::client::RawMessage;
use crate::error::BoxError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// User callback invoked once per received message.
#[async_trait]
pub trait QueueListener<T, C = (), R = ()>: Send + Sync {
    /// Handles one decoded payload.
    ///
    /// Returning an error routes the failure to the container's error
    /// handler; whether the message is still deleted is decided by the
    /// container's acknowledgement mode, never by the listener's error
    /// value.
    async fn on_message(&self, payload: T, ctx: &MessageContext<C, R>) -> Result<(), BoxError>;
}

#[async_trait]
impl<T, C, R, L> QueueListener<T, C, R> for Arc<L>
where
    L: QueueListener<T, C, R> + ?Sized,
    T: Send + 'static,
    C: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    async fn on_message(&self, payload: T, ctx: &MessageContext<C, R>) -> Result<(), BoxError> {
        (**self).on_message(payload, ctx).await
    }
}

/// Immutable per-message handle passed to the listener.
///
/// The context borrows the container's view of the message: identity,
/// attributes, the resolved routing context and provisioned resources (when
/// configured), a cancellation token observing container shutdown, and the
/// explicit acknowledgement hook used in manual mode.
pub struct MessageContext<C = (), R = ()> {
    message: Arc<RawMessage>,
    context: Option<Arc<C>>,
    resources: Option<Arc<R>>,
    cancellation: CancellationToken,
    ack: AckSink,
    acked: Arc<AtomicBool>,
}

impl<C, R> MessageContext<C, R> {
    pub(crate) fn new(
        message: Arc<RawMessage>,
        context: Option<Arc<C>>,
        resources: Option<Arc<R>>,
        cancellation: CancellationToken,
        ack: AckSink,
        acked: Arc<AtomicBool>,
    ) -> Self {
        Self {
            message,
            context,
            resources,
            cancellation,
            ack,
            acked,
        }
    }

    /// Service-assigned message id.
    pub fn message_id(&self) -> &str {
        &self.message.id
    }

    /// Receipt handle of this delivery.
    pub fn receipt_handle(&self) -> &str {
        &self.message.receipt_handle
    }

    /// URL of the queue the message was received from.
    pub fn queue_url(&self) -> &str {
        &self.message.queue_url
    }

    /// User-supplied message attributes.
    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.message.attributes
    }

    /// Service-supplied system attributes.
    pub fn system_attributes(&self) -> &HashMap<String, String> {
        &self.message.system_attributes
    }

    /// How many times this message has been delivered.
    pub fn approx_receive_count(&self) -> u32 {
        self.message.approx_receive_count
    }

    /// The whole raw message.
    pub fn raw(&self) -> &RawMessage {
        &self.message
    }

    /// The resolved routing context, when a resolver is configured.
    pub fn context(&self) -> Option<&C> {
        self.context.as_deref()
    }

    /// The provisioned resources, when a provider is configured.
    pub fn resources(&self) -> Option<&R> {
        self.resources.as_deref()
    }

    /// Token cancelled when the container stops. Long-running listeners
    /// should observe it; the container does not enforce per-message
    /// timeouts.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Explicitly acknowledges (deletes) the message.
    ///
    /// The call is idempotent per message: the first call issues the delete,
    /// later calls are no-ops. In manual acknowledgement mode this is the
    /// only way a message gets deleted.
    pub async fn acknowledge(&self) -> Result<(), AckError> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .ack
            .acknowledge(
                &self.message.queue_url,
                &self.message.id,
                &self.message.receipt_handle,
            )
            .await;
        if result.is_err() {
            // The delete never happened; let a later attempt retry it.
            self.acked.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Whether this message has been acknowledged through this context.
    pub fn is_acknowledged(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }
}
