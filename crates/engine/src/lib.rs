// SPDX-License-Identifier: Apache-2.0

//! Message-listener container runtime for pull-based queues.
//!
//! A [`ListenerContainer`] turns a raw polling endpoint into a typed,
//! concurrent, back-pressured consumer: it owns the long-polling loop, the
//! admission governor capping in-flight messages, the per-message pipeline
//! (decode, validate, resolve context, provision resources, dispatch,
//! acknowledge), deletion batching, and the start/stop state machine. A host
//! declares one container per queue, supplies a [`QueueListener`], and the
//! container owns everything else.
//!
//! ```no_run
//! use siphon_config::ContainerConfig;
//! use siphon_engine::{ListenerContainer, MessageContext, QueueListener};
//!
//! #[derive(serde::Deserialize)]
//! struct Order {
//!     order_id: String,
//! }
//!
//! struct OrderListener;
//!
//! #[async_trait::async_trait]
//! impl QueueListener<Order> for OrderListener {
//!     async fn on_message(
//!         &self,
//!         order: Order,
//!         _ctx: &MessageContext,
//!     ) -> Result<(), siphon_engine::BoxError> {
//!         tracing::info!(order.id = %order.order_id, "order received");
//!         Ok(())
//!     }
//! }
//!
//! # async fn run(client: impl siphon_engine::QueueClient + 'static) {
//! let container = ListenerContainer::builder(ContainerConfig::for_queue("orders"))
//!     .client(client)
//!     .listener(OrderListener)
//!     .build()
//!     .expect("valid configuration");
//! container.start().await.expect("container starts");
//! # }
//! ```

pub mod ack;
pub mod admit;
pub mod client;
pub mod container;
pub mod convert;
pub mod error;
pub mod handler;
pub mod listener;
pub mod resource;
pub mod schema;
pub mod validate;

mod poller;
mod processor;
mod visibility;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use ack::{AckBatcher, AckError, AckSink};
pub use admit::Admitter;
pub use client::{
    DeleteBatchOutcome, DeleteEntry, DeleteFailure, QueueClient, QueueClientError, RawMessage,
    ReceiveRequest,
};
pub use container::{ContainerError, ContainerState, ListenerContainer, ListenerContainerBuilder};
pub use convert::{ConvertError, JsonPayloadConverter, PayloadConverter};
pub use error::{BoxError, ConfigurationError, Error, ErrorKind};
pub use handler::{ErrorHandler, LoggingErrorHandler};
pub use listener::{MessageContext, QueueListener};
pub use resource::{
    ContextError, ContextResolver, ProvisionError, ResourceCache, ResourceProvider, canonical_key,
};
pub use schema::{Constraint, CustomConstraint, FieldKind, FieldSpec, Schema, SchemaBuilder};
pub use validate::{ConstraintViolation, Validator};
