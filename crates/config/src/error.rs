// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

/// Errors produced while validating a container configuration.
///
/// These are fatal for `start()`: a container refuses to run with an invalid
/// configuration instead of clamping values into range.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// Neither `queue_name` nor `queue_url` was set.
    #[error("either `queue_name` or `queue_url` must be set")]
    QueueMissing,

    /// A numeric or duration option fell outside its allowed range.
    #[error("`{field}` is out of range: got {actual}, allowed {allowed}")]
    OutOfRange {
        /// Name of the offending option.
        field: &'static str,
        /// Human-readable description of the allowed range.
        allowed: &'static str,
        /// The rejected value, rendered for the message.
        actual: String,
    },

    /// The visibility heartbeat was enabled without a visibility timeout or
    /// an explicit interval to derive the cadence from.
    #[error("`visibility_extension` requires `visibility_timeout` or an explicit interval")]
    ExtensionWithoutVisibility,
}

impl ConfigError {
    /// Shorthand for an [`ConfigError::OutOfRange`] value.
    pub fn out_of_range(field: &'static str, allowed: &'static str, actual: String) -> Self {
        Self::OutOfRange {
            field,
            allowed,
            actual,
        }
    }
}
