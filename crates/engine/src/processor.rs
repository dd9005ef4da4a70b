// SPDX-License-Identifier: Apache-2.0

//! The per-message processing pipeline.
//!
//! One processor task runs per admitted message: decode, validate, resolve
//! context, provision resources, dispatch to the listener, acknowledge. Each
//! step short-circuits on failure; the failure is wrapped in the taxonomy
//! [`Error`], routed to the error handler, and the acknowledgement mode
//! decides whether the message is still deleted:
//!
//! | step failure              | `OnSuccess` | `Always` | `Manual` |
//! |---------------------------|-------------|----------|----------|
//! | decode/context/provision  | no ack      | ack      | no ack   |
//! | validation (`Throw`)      | no ack      | ack      | no ack   |
//! | validation (`Ack`)        | ack, listener skipped in every mode  |
//! | validation (`Reject`)     | no ack, listener skipped in every mode |
//! | listener error            | no ack      | ack      | no ack   |
//! | listener success          | ack         | ack      | only via `ctx.acknowledge()` |
//!
//! The admission slot is owned by the task and released on drop, so exactly
//! one permit returns per message regardless of how the task exits.

use crate::ack::AckSink;
use crate::admit::Slot;
use crate::client::RawMessage;
use crate::convert::PayloadConverter;
use crate::error::Error;
use crate::handler::ErrorHandler;
use crate::listener::{MessageContext, QueueListener};
use crate::resource::{ContextResolver, KeyFn, ResourceCache, ResourceProvider};
use crate::validate::{ConstraintViolation, Validator};
use crate::visibility::VisibilityExtender;
use siphon_config::{AcknowledgementMode, ValidationFailureMode, ValidatorOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

/// Everything a processor task needs, shared across all messages of one
/// container run.
pub(crate) struct Pipeline<T, C, R> {
    pub(crate) container_id: String,
    pub(crate) listener: Arc<dyn QueueListener<T, C, R>>,
    pub(crate) converter: Arc<dyn PayloadConverter<T>>,
    pub(crate) validator: Option<Arc<Validator>>,
    pub(crate) validation_failure_mode: ValidationFailureMode,
    pub(crate) validator_options: ValidatorOptions,
    pub(crate) acknowledgement_mode: AcknowledgementMode,
    pub(crate) resolver: Option<Arc<dyn ContextResolver<C>>>,
    pub(crate) provider: Option<Arc<dyn ResourceProvider<C, R>>>,
    pub(crate) key_fn: Option<Arc<KeyFn<C>>>,
    pub(crate) cache: Arc<ResourceCache<R>>,
    pub(crate) ack: AckSink,
    pub(crate) error_handler: Arc<dyn ErrorHandler>,
    pub(crate) extender: Option<Arc<VisibilityExtender>>,
}

impl<T, C, R> Pipeline<T, C, R>
where
    T: Send + 'static,
    C: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    /// Runs the whole pipeline for one message. The slot is held until this
    /// future completes or is dropped.
    pub(crate) async fn process(
        self: Arc<Self>,
        message: RawMessage,
        slot: Slot,
        cancel: CancellationToken,
    ) {
        let span = info_span!(
            "message",
            container.id = %self.container_id,
            message.id = %message.id,
        );
        async move {
            let _slot = slot;
            let message = Arc::new(message);
            let acked = Arc::new(AtomicBool::new(false));
            let _heartbeat = self
                .extender
                .as_ref()
                .map(|extender| extender.spawn_heartbeat(Arc::clone(&message)));
            self.run(&message, &acked, &cancel).await;
        }
        .instrument(span)
        .await;
    }

    async fn run(
        &self,
        message: &Arc<RawMessage>,
        acked: &Arc<AtomicBool>,
        cancel: &CancellationToken,
    ) {
        let payload = match self.decode(message, acked).await {
            Ok(Some(payload)) => payload,
            // Validation already settled the message (ack or reject).
            Ok(None) => return,
            Err(error) => {
                self.fail(error, message, acked).await;
                return;
            }
        };

        let context = match &self.resolver {
            Some(resolver) => match resolver.resolve(message) {
                Ok(context) => Some(Arc::new(context)),
                Err(error) => {
                    self.fail(Error::Context(error), message, acked).await;
                    return;
                }
            },
            None => None,
        };

        let resources = match (&self.provider, &context, &self.key_fn) {
            (Some(provider), Some(context), Some(key_fn)) => {
                let key = key_fn(context);
                let provided = self
                    .cache
                    .get_or_provide(&key, || provider.provide(context))
                    .await;
                match provided {
                    Ok(resources) => Some(resources),
                    Err(error) => {
                        self.fail(Error::Provision(error), message, acked).await;
                        return;
                    }
                }
            }
            _ => None,
        };

        let ctx = MessageContext::new(
            Arc::clone(message),
            context,
            resources,
            cancel.clone(),
            self.ack.clone(),
            Arc::clone(acked),
        );
        match self.listener.on_message(payload, &ctx).await {
            Ok(()) => match self.acknowledgement_mode {
                AcknowledgementMode::OnSuccess | AcknowledgementMode::Always => {
                    self.acknowledge(message, acked).await;
                }
                AcknowledgementMode::Manual => {
                    if !ctx.is_acknowledged() {
                        debug!("listener returned without acknowledging, leaving message in queue");
                    }
                }
            },
            Err(error) => self.fail(Error::Listener(error), message, acked).await,
        }
    }

    /// Decodes the body, running validation between the structural parse and
    /// the materialisation when a validator is configured.
    ///
    /// `Ok(None)` means validation settled the message and the listener must
    /// be skipped.
    async fn decode(
        &self,
        message: &Arc<RawMessage>,
        acked: &Arc<AtomicBool>,
    ) -> Result<Option<T>, Error> {
        let Some(validator) = &self.validator else {
            return Ok(Some(self.converter.convert(message)?));
        };

        let mut value = self.converter.parse(message)?;
        let violations = validator.validate(&mut value, &self.validator_options);
        if !violations.is_empty() {
            return match self.validation_failure_mode {
                ValidationFailureMode::Throw => Err(Error::Validation { violations }),
                ValidationFailureMode::Ack => {
                    self.log_violations(message, &violations, &value);
                    self.acknowledge(message, acked).await;
                    Ok(None)
                }
                ValidationFailureMode::Reject => {
                    self.log_violations(message, &violations, &value);
                    Ok(None)
                }
            };
        }
        Ok(Some(self.converter.materialize(value)?))
    }

    fn log_violations(
        &self,
        message: &RawMessage,
        violations: &[ConstraintViolation],
        target: &serde_json::Value,
    ) {
        for violation in violations {
            if self.validator_options.include_target {
                warn!(
                    message.id = %message.id,
                    payload = %target,
                    "payload validation: {violation}"
                );
            } else {
                warn!(message.id = %message.id, "payload validation: {violation}");
            }
        }
    }

    /// Routes a step failure to the error handler and applies the
    /// acknowledgement mode's failure policy.
    async fn fail(&self, error: Error, message: &Arc<RawMessage>, acked: &Arc<AtomicBool>) {
        self.error_handler.handle(&error, message).await;
        if self.acknowledgement_mode == AcknowledgementMode::Always {
            self.acknowledge(message, acked).await;
        }
    }

    /// Acknowledges the message unless the listener already did. An ack
    /// failure is itself routed to the error handler; it is not retried here
    /// because the message redelivers after its visibility timeout anyway.
    async fn acknowledge(&self, message: &Arc<RawMessage>, acked: &Arc<AtomicBool>) {
        if acked.swap(true, Ordering::SeqCst) {
            return;
        }
        let result = self
            .ack
            .acknowledge(&message.queue_url, &message.id, &message.receipt_handle)
            .await;
        if let Err(error) = result {
            self.error_handler.handle(&Error::Ack(error), message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admit::Admitter;
    use crate::client::QueueClient;
    use crate::convert::JsonPayloadConverter;
    use crate::error::ErrorKind;
    use crate::schema::{Constraint, FieldKind, FieldSpec, Schema};
    use crate::testing::{ProbeListener, RecordingErrorHandler, ScriptedQueueClient, raw_message};
    use serde::Deserialize;

    #[derive(Debug, Clone, Deserialize, PartialEq)]
    struct Order {
        order_id: String,
        amount: f64,
    }

    struct Fixture {
        client: Arc<ScriptedQueueClient>,
        listener: Arc<ProbeListener<Order>>,
        handler: Arc<RecordingErrorHandler>,
        admitter: Admitter,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                client: Arc::new(ScriptedQueueClient::new()),
                listener: Arc::new(ProbeListener::new()),
                handler: Arc::new(RecordingErrorHandler::new()),
                admitter: Admitter::new(1),
            }
        }

        fn pipeline(
            &self,
            mode: AcknowledgementMode,
            schema: Option<Schema>,
            failure_mode: ValidationFailureMode,
        ) -> Arc<Pipeline<Order, (), ()>> {
            Arc::new(Pipeline {
                container_id: "container-test".to_owned(),
                listener: Arc::new(Arc::clone(&self.listener)),
                converter: Arc::new(JsonPayloadConverter::new()),
                validator: schema.map(|schema| Arc::new(Validator::new(schema))),
                validation_failure_mode: failure_mode,
                validator_options: ValidatorOptions::default(),
                acknowledgement_mode: mode,
                resolver: None,
                provider: None,
                key_fn: None,
                cache: Arc::new(ResourceCache::new()),
                ack: AckSink::direct(Arc::clone(&self.client) as Arc<dyn QueueClient>),
                error_handler: Arc::new(Arc::clone(&self.handler)),
                extender: None,
            })
        }

        async fn run(&self, pipeline: Arc<Pipeline<Order, (), ()>>, message: RawMessage) {
            let mut window = self.admitter.admit_window(1).await;
            let slot = window.take_slot().expect("admitter has a permit");
            pipeline
                .process(message, slot, CancellationToken::new())
                .await;
        }
    }

    fn order_schema() -> Schema {
        Schema::builder()
            .field(FieldSpec::new("order_id", FieldKind::String).required())
            .field(
                FieldSpec::new("amount", FieldKind::Number)
                    .required()
                    .constraint(Constraint::Positive),
            )
            .build()
    }

    const GOOD: &str = r#"{"order_id":"o-1","amount":10.0}"#;
    const NEGATIVE: &str = r#"{"order_id":"o-1","amount":-5}"#;

    #[tokio::test]
    async fn success_acks_in_on_success_mode() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(
            AcknowledgementMode::OnSuccess,
            None,
            ValidationFailureMode::Throw,
        );
        fixture.run(pipeline, raw_message("m1", "r1", GOOD)).await;
        assert_eq!(fixture.listener.invocations(), 1);
        assert_eq!(fixture.client.deleted_receipts(), ["r1"]);
        assert_eq!(fixture.admitter.available(), 1);
    }

    #[tokio::test]
    async fn decode_failure_is_routed_and_not_acked_in_on_success_mode() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(
            AcknowledgementMode::OnSuccess,
            None,
            ValidationFailureMode::Throw,
        );
        fixture
            .run(pipeline, raw_message("m1", "r1", "not json"))
            .await;
        assert_eq!(fixture.listener.invocations(), 0);
        assert!(fixture.client.deleted_receipts().is_empty());
        assert_eq!(fixture.handler.kinds(), [ErrorKind::Decode]);
    }

    #[tokio::test]
    async fn decode_failure_still_acks_in_always_mode() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(
            AcknowledgementMode::Always,
            None,
            ValidationFailureMode::Throw,
        );
        fixture
            .run(pipeline, raw_message("m1", "r1", "not json"))
            .await;
        assert_eq!(fixture.client.deleted_receipts(), ["r1"]);
        assert_eq!(fixture.handler.kinds(), [ErrorKind::Decode]);
    }

    #[tokio::test]
    async fn validation_throw_routes_violations_without_ack() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(
            AcknowledgementMode::OnSuccess,
            Some(order_schema()),
            ValidationFailureMode::Throw,
        );
        fixture
            .run(pipeline, raw_message("m1", "r1", NEGATIVE))
            .await;
        assert_eq!(fixture.listener.invocations(), 0);
        assert!(fixture.client.deleted_receipts().is_empty());
        assert_eq!(fixture.handler.kinds(), [ErrorKind::Validation]);
    }

    #[tokio::test]
    async fn validation_ack_deletes_and_skips_the_listener() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(
            AcknowledgementMode::OnSuccess,
            Some(order_schema()),
            ValidationFailureMode::Ack,
        );
        fixture
            .run(pipeline, raw_message("m2", "r2", NEGATIVE))
            .await;
        assert_eq!(fixture.listener.invocations(), 0);
        assert_eq!(fixture.client.deleted_receipts(), ["r2"]);
        // Not an error: the violations are logged, not routed.
        assert!(fixture.handler.kinds().is_empty());
    }

    #[tokio::test]
    async fn validation_reject_leaves_the_message_in_the_queue() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(
            AcknowledgementMode::OnSuccess,
            Some(order_schema()),
            ValidationFailureMode::Reject,
        );
        fixture
            .run(pipeline, raw_message("m1", "r1", NEGATIVE))
            .await;
        assert_eq!(fixture.listener.invocations(), 0);
        assert!(fixture.client.deleted_receipts().is_empty());
        assert!(fixture.handler.kinds().is_empty());
    }

    #[tokio::test]
    async fn valid_payload_passes_validation_and_reaches_the_listener() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(
            AcknowledgementMode::OnSuccess,
            Some(order_schema()),
            ValidationFailureMode::Throw,
        );
        fixture.run(pipeline, raw_message("m1", "r1", GOOD)).await;
        assert_eq!(fixture.listener.invocations(), 1);
        assert_eq!(
            fixture.listener.received(),
            [Order {
                order_id: "o-1".to_owned(),
                amount: 10.0
            }]
        );
        assert_eq!(fixture.client.deleted_receipts(), ["r1"]);
    }

    #[tokio::test]
    async fn listener_failure_keeps_the_message_in_on_success_mode() {
        let fixture = Fixture::new();
        fixture.listener.fail_with("downstream unavailable");
        let pipeline = fixture.pipeline(
            AcknowledgementMode::OnSuccess,
            None,
            ValidationFailureMode::Throw,
        );
        fixture.run(pipeline, raw_message("m1", "r1", GOOD)).await;
        assert!(fixture.client.deleted_receipts().is_empty());
        assert_eq!(fixture.handler.kinds(), [ErrorKind::Listener]);
    }

    #[tokio::test]
    async fn listener_failure_still_acks_in_always_mode() {
        let fixture = Fixture::new();
        fixture.listener.fail_with("downstream unavailable");
        let pipeline = fixture.pipeline(
            AcknowledgementMode::Always,
            None,
            ValidationFailureMode::Throw,
        );
        fixture.run(pipeline, raw_message("m1", "r1", GOOD)).await;
        assert_eq!(fixture.client.deleted_receipts(), ["r1"]);
        assert_eq!(fixture.handler.kinds(), [ErrorKind::Listener]);
    }

    #[tokio::test]
    async fn manual_mode_only_acks_through_the_context() {
        let fixture = Fixture::new();
        let pipeline = fixture.pipeline(
            AcknowledgementMode::Manual,
            None,
            ValidationFailureMode::Throw,
        );
        fixture
            .run(Arc::clone(&pipeline), raw_message("m1", "r1", GOOD))
            .await;
        assert!(fixture.client.deleted_receipts().is_empty());

        fixture.listener.acknowledge_manually();
        fixture.run(pipeline, raw_message("m2", "r2", GOOD)).await;
        assert_eq!(fixture.client.deleted_receipts(), ["r2"]);
    }

    #[tokio::test]
    async fn manual_ack_is_not_repeated_by_the_processor() {
        let fixture = Fixture::new();
        fixture.listener.acknowledge_manually();
        // OnSuccess + an explicit ack from the listener: one delete total.
        let pipeline = fixture.pipeline(
            AcknowledgementMode::OnSuccess,
            None,
            ValidationFailureMode::Throw,
        );
        fixture.run(pipeline, raw_message("m1", "r1", GOOD)).await;
        assert_eq!(fixture.client.deleted_receipts(), ["r1"]);
        assert_eq!(fixture.client.deletes().len(), 1);
    }

    #[tokio::test]
    async fn ack_failure_is_routed_to_the_error_handler() {
        let fixture = Fixture::new();
        fixture.client.script_delete_failures(1);
        let pipeline = fixture.pipeline(
            AcknowledgementMode::OnSuccess,
            None,
            ValidationFailureMode::Throw,
        );
        fixture.run(pipeline, raw_message("m1", "r1", GOOD)).await;
        assert_eq!(fixture.handler.kinds(), [ErrorKind::Ack]);
    }

    #[tokio::test]
    async fn context_and_resources_flow_into_the_listener() {
        use crate::resource::{ContextError, ProvisionError, ResourceProvider, canonical_key};
        use std::sync::atomic::AtomicUsize;

        struct TenantPool;
        #[async_trait::async_trait]
        impl ResourceProvider<String, String> for TenantPool {
            async fn provide(&self, context: &String) -> Result<String, ProvisionError> {
                PROVISIONS.fetch_add(1, Ordering::SeqCst);
                Ok(format!("pool-{context}"))
            }
        }
        static PROVISIONS: AtomicUsize = AtomicUsize::new(0);

        struct SeeingListener;
        #[async_trait::async_trait]
        impl QueueListener<Order, String, String> for SeeingListener {
            async fn on_message(
                &self,
                _payload: Order,
                ctx: &MessageContext<String, String>,
            ) -> Result<(), crate::error::BoxError> {
                assert_eq!(ctx.context().map(String::as_str), Some("t1"));
                assert_eq!(ctx.resources().map(String::as_str), Some("pool-t1"));
                Ok(())
            }
        }

        let client = Arc::new(ScriptedQueueClient::new());
        let admitter = Admitter::new(1);
        let pipeline: Arc<Pipeline<Order, String, String>> = Arc::new(Pipeline {
            container_id: "container-test".to_owned(),
            listener: Arc::new(SeeingListener),
            converter: Arc::new(JsonPayloadConverter::new()),
            validator: None,
            validation_failure_mode: ValidationFailureMode::Throw,
            validator_options: ValidatorOptions::default(),
            acknowledgement_mode: AcknowledgementMode::OnSuccess,
            resolver: Some(Arc::new(|message: &RawMessage| {
                message
                    .attributes
                    .get("tenant")
                    .cloned()
                    .ok_or_else(|| ContextError::MissingAttribute("tenant".to_owned()))
            })),
            provider: Some(Arc::new(TenantPool)),
            key_fn: Some(Arc::new(|context: &String| canonical_key(context))),
            cache: Arc::new(ResourceCache::new()),
            ack: AckSink::direct(Arc::clone(&client) as Arc<dyn QueueClient>),
            error_handler: Arc::new(crate::handler::LoggingErrorHandler),
            extender: None,
        });

        for (id, receipt) in [("m1", "r1"), ("m2", "r2")] {
            let mut message = raw_message(id, receipt, GOOD);
            message
                .attributes
                .insert("tenant".to_owned(), "t1".to_owned());
            let mut window = admitter.admit_window(1).await;
            let slot = window.take_slot().expect("admitter has a permit");
            Arc::clone(&pipeline)
                .process(message, slot, CancellationToken::new())
                .await;
        }
        // Same tenant key: provisioned once, both messages acked.
        assert_eq!(PROVISIONS.load(Ordering::SeqCst), 1);
        assert_eq!(client.deleted_receipts(), ["r1", "r2"]);
    }

    #[tokio::test]
    async fn missing_context_attribute_is_a_context_error() {
        let fixture = Fixture::new();
        let handler = Arc::clone(&fixture.handler);
        let client = Arc::clone(&fixture.client);
        let pipeline: Arc<Pipeline<Order, String, ()>> = Arc::new(Pipeline {
            container_id: "container-test".to_owned(),
            listener: Arc::new(ProbeListener::<Order>::new()),
            converter: Arc::new(JsonPayloadConverter::new()),
            validator: None,
            validation_failure_mode: ValidationFailureMode::Throw,
            validator_options: ValidatorOptions::default(),
            acknowledgement_mode: AcknowledgementMode::OnSuccess,
            resolver: Some(Arc::new(|message: &RawMessage| {
                message
                    .attributes
                    .get("tenant")
                    .cloned()
                    .ok_or_else(|| crate::resource::ContextError::MissingAttribute(
                        "tenant".to_owned(),
                    ))
            })),
            provider: None,
            key_fn: None,
            cache: Arc::new(ResourceCache::new()),
            ack: AckSink::direct(client as Arc<dyn QueueClient>),
            error_handler: Arc::new(handler),
            extender: None,
        });
        let mut window = fixture.admitter.admit_window(1).await;
        let slot = window.take_slot().expect("admitter has a permit");
        pipeline
            .process(raw_message("m1", "r1", GOOD), slot, CancellationToken::new())
            .await;
        assert_eq!(fixture.handler.kinds(), [ErrorKind::Context]);
        assert!(fixture.client.deleted_receipts().is_empty());
    }
}
