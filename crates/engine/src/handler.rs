// SPDX-License-Identifier: Apache-2.0

//! Recovery surface for per-message failures.

use crate::client::RawMessage;
use crate::error::Error;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

/// User-supplied recovery logic for per-message failures.
///
/// The handler observes the failure; it does not decide acknowledgement.
/// Whether the failed message is deleted is fixed by the container's
/// acknowledgement mode.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Handles one failure. `message` is the raw delivery the failure
    /// belongs to.
    async fn handle(&self, error: &Error, message: &RawMessage);
}

#[async_trait]
impl<H> ErrorHandler for Arc<H>
where
    H: ErrorHandler + ?Sized,
{
    async fn handle(&self, error: &Error, message: &RawMessage) {
        (**self).handle(error, message).await;
    }
}

/// The default handler: one error-level log line per failure, tagged with
/// the error's taxonomy kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

#[async_trait]
impl ErrorHandler for LoggingErrorHandler {
    async fn handle(&self, error: &Error, message: &RawMessage) {
        error!(
            message.id = %message.id,
            message.receive_count = message.approx_receive_count,
            error.kind = %error.kind(),
            "message processing failed: {error}"
        );
    }
}
