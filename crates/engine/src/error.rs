// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the container runtime.
//!
//! Per-message failures are data, not control flow: every step of the
//! processing pipeline reports its failure as an [`Error`] value which is
//! routed to the configured error handler and then dropped. Nothing a message
//! does can unwind past its processor task or stop the polling loop. The only
//! errors that propagate to the caller are configuration and lifecycle errors
//! returned synchronously from `start()`.

use crate::ack::AckError;
use crate::client::QueueClientError;
use crate::convert::ConvertError;
use crate::resource::{ContextError, ProvisionError};
use crate::validate::ConstraintViolation;
use std::fmt;

/// Boxed error type accepted from user listeners and providers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stable classification tag attached to every error, used by the default
/// error handler for taxonomy logging.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    /// The queue service was unreachable or answered with a server fault.
    Transport,
    /// The message body could not be parsed into the target payload.
    Decode,
    /// The decoded payload violated one or more schema constraints.
    Validation,
    /// Required routing attributes were absent or invalid.
    Context,
    /// The resource provider failed.
    Provision,
    /// The user listener returned an error.
    Listener,
    /// A message deletion failed.
    Ack,
    /// The container configuration was rejected at start.
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Decode => "decode",
            ErrorKind::Validation => "validation",
            ErrorKind::Context => "context",
            ErrorKind::Provision => "provision",
            ErrorKind::Listener => "listener",
            ErrorKind::Ack => "ack",
            ErrorKind::Configuration => "configuration",
        };
        write!(f, "{label}")
    }
}

/// Umbrella error for everything the container can report.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The queue service was unreachable or answered with a server fault.
    #[error("queue transport failure: {0}")]
    Transport(#[from] QueueClientError),

    /// The message body could not be parsed into the target payload.
    #[error("payload decode failed: {0}")]
    Decode(#[from] ConvertError),

    /// The decoded payload violated one or more schema constraints.
    #[error("payload failed validation with {} violation(s)", violations.len())]
    Validation {
        /// The violations reported by the validator, in traversal order.
        violations: Vec<ConstraintViolation>,
    },

    /// Required routing attributes were absent or invalid.
    #[error("context resolution failed: {0}")]
    Context(#[from] ContextError),

    /// The resource provider failed.
    #[error("resource provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    /// The user listener returned an error.
    #[error("listener failed: {0}")]
    Listener(#[source] BoxError),

    /// A message deletion failed.
    #[error("acknowledgement failed: {0}")]
    Ack(#[from] AckError),

    /// The container configuration was rejected.
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl Error {
    /// The taxonomy tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Context(_) => ErrorKind::Context,
            Error::Provision(_) => ErrorKind::Provision,
            Error::Listener(_) => ErrorKind::Listener,
            Error::Ack(_) => ErrorKind::Ack,
            Error::Configuration(_) => ErrorKind::Configuration,
        }
    }
}

/// Errors detected while assembling or starting a container.
///
/// These reject `start()` synchronously and never reach the error handler.
#[derive(thiserror::Error, Debug)]
pub enum ConfigurationError {
    /// An option failed the config crate's range checks.
    #[error(transparent)]
    Config(#[from] siphon_config::ConfigError),

    /// No queue client was registered.
    #[error("no queue client was registered")]
    MissingClient,

    /// No listener was registered.
    #[error("no listener was registered")]
    MissingListener,

    /// A resource provider was registered without a context resolver to
    /// produce the context it is keyed on.
    #[error("a resource provider requires a context resolver")]
    ProviderWithoutResolver,

    /// A resource cleanup hook was registered without a resource provider.
    #[error("a resource cleanup hook requires a resource provider")]
    CleanupWithoutProvider,
}

/// Formats the source chain of an error into a single display string.
#[must_use]
pub fn format_error_sources(error: &(dyn std::error::Error + 'static)) -> String {
    let mut segments = vec![error.to_string()];
    let mut current = error.source();
    while let Some(source) = current {
        segments.push(source.to_string());
        current = source.source();
    }
    segments.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(ErrorKind::Transport.to_string(), "transport");
        assert_eq!(ErrorKind::Decode.to_string(), "decode");
        assert_eq!(ErrorKind::Validation.to_string(), "validation");
        assert_eq!(ErrorKind::Context.to_string(), "context");
        assert_eq!(ErrorKind::Provision.to_string(), "provision");
        assert_eq!(ErrorKind::Listener.to_string(), "listener");
        assert_eq!(ErrorKind::Ack.to_string(), "ack");
        assert_eq!(ErrorKind::Configuration.to_string(), "configuration");
    }

    #[test]
    fn source_chain_is_flattened() {
        let io = std::io::Error::other("connection reset");
        let err = QueueClientError::transport(io);
        let rendered = format_error_sources(&err);
        assert!(rendered.contains("connection reset"));
    }
}
