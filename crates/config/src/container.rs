// SPDX-License-Identifier: Apache-2.0

//! Option surface of a listener container.
//!
//! Every recognised option is represented here with its default. The queue
//! service caps a single receive call at 10 messages and a long poll at 20
//! seconds; those caps are enforced by [`ContainerConfig::validate`] rather
//! than silently clamped, so a misconfigured container fails loudly at
//! start-up instead of behaving almost-but-not-quite as configured.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on `max_messages_per_poll` and on a delete batch, imposed by
/// the queue service.
pub const MAX_RECEIVE_BATCH: usize = 10;

/// Upper bound on the long-poll wait, imposed by the queue service.
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// When a message is considered successfully processed and removed from the
/// queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgementMode {
    /// Delete the message after the listener returns without error.
    #[default]
    OnSuccess,
    /// Delete the message only when the listener explicitly acknowledges it
    /// through the message context.
    Manual,
    /// Delete the message regardless of the listener outcome.
    Always,
}

/// What to do with a message whose payload fails schema validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFailureMode {
    /// Treat the violations as a processing error: the error handler runs and
    /// the acknowledgement mode decides the message's fate.
    #[default]
    Throw,
    /// Log the violations, delete the message, skip the listener.
    Ack,
    /// Log the violations and skip the listener, but leave the message in the
    /// queue so it redelivers after its visibility timeout.
    Reject,
}

/// Switches controlling how the structural validator traverses a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidatorOptions {
    /// Remove members not described by the schema before the payload is
    /// materialised.
    pub strip_unknown: bool,
    /// Report members not described by the schema as violations.
    pub reject_unknown: bool,
    /// Do not report missing required fields.
    pub skip_missing: bool,
    /// Stop traversal after the first violation.
    pub stop_at_first: bool,
    /// Include the validated root value in violation logs.
    pub include_target: bool,
    /// Attach the offending value to each violation.
    pub include_value: bool,
    /// Restrict validation to fields tagged with one of these groups. Fields
    /// without group tags are always validated.
    pub groups: Vec<String>,
}

/// Settings for coalescing message deletions into batch calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchAckConfig {
    /// Batch deletions instead of deleting one message per call.
    pub enabled: bool,
    /// Flush a queue's pending deletions once this many have accumulated.
    pub max_size: usize,
    /// Flush a queue's pending deletions this long after the first one
    /// arrived, even if the batch is not full.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for BatchAckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: MAX_RECEIVE_BATCH,
            flush_interval: default_flush_interval(),
        }
    }
}

/// Settings for the per-message visibility heartbeat.
///
/// When enabled, the container periodically extends the visibility timeout of
/// every in-flight message so that slow listeners do not race the queue's
/// redelivery clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VisibilityExtensionConfig {
    /// Extend the visibility timeout of in-flight messages.
    pub enabled: bool,
    /// Interval between extensions. Defaults to half the configured
    /// visibility timeout.
    #[serde(with = "humantime_serde")]
    pub interval: Option<Duration>,
}

/// Complete option surface of one listener container.
///
/// A container targets exactly one queue, identified either by name (resolved
/// once at start) or directly by URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// Container identifier used in logs.
    pub id: String,
    /// Name of the target queue, resolved to a URL at start.
    pub queue_name: Option<String>,
    /// URL of the target queue. Takes precedence over `queue_name`.
    pub queue_url: Option<String>,
    /// How long a receive call waits for at least one message. Zero selects
    /// short polling.
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
    /// Visibility timeout requested on each receive. `None` inherits the
    /// queue's own default.
    #[serde(with = "humantime_serde")]
    pub visibility_timeout: Option<Duration>,
    /// Maximum number of messages fetched by one receive call.
    pub max_messages_per_poll: usize,
    /// Maximum number of messages processed concurrently.
    pub max_concurrent_messages: usize,
    /// Whether host adapters should start this container on their own
    /// lifecycle hook. Advisory: the container itself never reads it.
    pub auto_startup: bool,
    /// When messages are deleted from the queue.
    pub acknowledgement_mode: AcknowledgementMode,
    /// Pause after a failed receive call before polling again.
    #[serde(with = "humantime_serde")]
    pub polling_error_backoff: Duration,
    /// Run schema validation on decoded payloads.
    pub enable_validation: bool,
    /// What to do with payloads that fail validation.
    pub validation_failure_mode: ValidationFailureMode,
    /// Traversal switches for the validator.
    pub validator_options: ValidatorOptions,
    /// Deletion batching.
    pub batch_ack: BatchAckConfig,
    /// Visibility heartbeat for in-flight messages.
    pub visibility_extension: VisibilityExtensionConfig,
    /// How long `stop()` waits for in-flight messages before abandoning them.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            id: default_container_id(),
            queue_name: None,
            queue_url: None,
            poll_timeout: MAX_POLL_TIMEOUT,
            visibility_timeout: None,
            max_messages_per_poll: MAX_RECEIVE_BATCH,
            max_concurrent_messages: 1,
            auto_startup: true,
            acknowledgement_mode: AcknowledgementMode::default(),
            polling_error_backoff: default_polling_error_backoff(),
            enable_validation: false,
            validation_failure_mode: ValidationFailureMode::default(),
            validator_options: ValidatorOptions::default(),
            batch_ack: BatchAckConfig::default(),
            visibility_extension: VisibilityExtensionConfig::default(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

fn default_container_id() -> String {
    let uuid = Uuid::new_v4();
    let mut short = uuid.simple().to_string();
    short.truncate(8);
    format!("container-{short}")
}

fn default_polling_error_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

impl ContainerConfig {
    /// Creates a config targeting the given queue name, everything else at
    /// defaults.
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: Some(queue_name.into()),
            ..Self::default()
        }
    }

    /// Creates a config targeting the given queue URL, everything else at
    /// defaults.
    pub fn for_queue_url(queue_url: impl Into<String>) -> Self {
        Self {
            queue_url: Some(queue_url.into()),
            ..Self::default()
        }
    }

    /// The visibility-extension interval in effect, if the heartbeat is
    /// enabled: the configured interval, or half the visibility timeout.
    pub fn effective_extension_interval(&self) -> Option<Duration> {
        if !self.visibility_extension.enabled {
            return None;
        }
        self.visibility_extension
            .interval
            .or_else(|| self.visibility_timeout.map(|v| v / 2))
    }

    /// Checks every option against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns the first offending option found. Containers call this before
    /// starting; a failed check is fatal for `start()`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.is_none() && self.queue_url.is_none() {
            return Err(ConfigError::QueueMissing);
        }
        if self.poll_timeout > MAX_POLL_TIMEOUT {
            return Err(ConfigError::out_of_range(
                "poll_timeout",
                "0s..=20s",
                format!("{:?}", self.poll_timeout),
            ));
        }
        if self.max_messages_per_poll == 0 || self.max_messages_per_poll > MAX_RECEIVE_BATCH {
            return Err(ConfigError::out_of_range(
                "max_messages_per_poll",
                "1..=10",
                self.max_messages_per_poll.to_string(),
            ));
        }
        if self.max_concurrent_messages == 0 {
            return Err(ConfigError::out_of_range(
                "max_concurrent_messages",
                ">=1",
                self.max_concurrent_messages.to_string(),
            ));
        }
        if self.batch_ack.max_size == 0 || self.batch_ack.max_size > MAX_RECEIVE_BATCH {
            return Err(ConfigError::out_of_range(
                "batch_ack.max_size",
                "1..=10",
                self.batch_ack.max_size.to_string(),
            ));
        }
        if self.visibility_extension.enabled && self.effective_extension_interval().is_none() {
            return Err(ConfigError::ExtensionWithoutVisibility);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_values() {
        let config = ContainerConfig::default();
        assert_eq!(config.poll_timeout, Duration::from_secs(20));
        assert_eq!(config.max_messages_per_poll, 10);
        assert_eq!(config.max_concurrent_messages, 1);
        assert_eq!(config.acknowledgement_mode, AcknowledgementMode::OnSuccess);
        assert_eq!(config.polling_error_backoff, Duration::from_secs(5));
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
        assert!(!config.enable_validation);
        assert!(!config.batch_ack.enabled);
        assert_eq!(config.batch_ack.max_size, 10);
        assert_eq!(config.batch_ack.flush_interval, Duration::from_millis(100));
        assert!(config.auto_startup);
        assert!(config.id.starts_with("container-"));
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = ContainerConfig::default();
        let b = ContainerConfig::default();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn deserializes_with_defaults_and_human_durations() {
        let config: ContainerConfig = serde_json::from_str(
            r#"{
                "id": "orders-consumer",
                "queue_name": "orders",
                "poll_timeout": "5s",
                "batch_ack": { "enabled": true, "flush_interval": "250ms" }
            }"#,
        )
        .expect("valid config document");
        assert_eq!(config.id, "orders-consumer");
        assert_eq!(config.queue_name.as_deref(), Some("orders"));
        assert_eq!(config.poll_timeout, Duration::from_secs(5));
        assert!(config.batch_ack.enabled);
        assert_eq!(config.batch_ack.flush_interval, Duration::from_millis(250));
        // Untouched options keep their defaults.
        assert_eq!(config.max_messages_per_poll, 10);
        config.validate().expect("config validates");
    }

    #[test]
    fn rejects_unknown_fields() {
        let result = serde_json::from_str::<ContainerConfig>(r#"{ "queue": "orders" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn validate_requires_a_queue() {
        let config = ContainerConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::QueueMissing)));
    }

    #[test]
    fn validate_rejects_out_of_range_options() {
        let mut config = ContainerConfig::for_queue("orders");
        config.poll_timeout = Duration::from_secs(21);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "poll_timeout", .. })
        ));

        let mut config = ContainerConfig::for_queue("orders");
        config.max_messages_per_poll = 11;
        assert!(config.validate().is_err());

        let mut config = ContainerConfig::for_queue("orders");
        config.max_concurrent_messages = 0;
        assert!(config.validate().is_err());

        let mut config = ContainerConfig::for_queue("orders");
        config.batch_ack.max_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn extension_interval_defaults_to_half_visibility() {
        let mut config = ContainerConfig::for_queue("orders");
        config.visibility_extension.enabled = true;
        config.visibility_timeout = Some(Duration::from_secs(30));
        assert_eq!(
            config.effective_extension_interval(),
            Some(Duration::from_secs(15))
        );
        config.validate().expect("config validates");
    }

    #[test]
    fn extension_without_visibility_is_rejected() {
        let mut config = ContainerConfig::for_queue("orders");
        config.visibility_extension.enabled = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ExtensionWithoutVisibility)
        ));
    }
}
