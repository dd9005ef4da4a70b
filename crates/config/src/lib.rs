// SPDX-License-Identifier: Apache-2.0

//! Configuration model for siphon listener containers.
//!
//! This crate only holds data: the option surface of a listener container,
//! its serde representation (so containers can be described in JSON or YAML
//! files), the default for every option, and the range checks applied before
//! a container is allowed to start. The runtime that consumes these values
//! lives in `siphon-engine`.

pub mod container;
pub mod error;

pub use container::{
    AcknowledgementMode, BatchAckConfig, ContainerConfig, ValidationFailureMode, ValidatorOptions,
    VisibilityExtensionConfig,
};
pub use error::ConfigError;
