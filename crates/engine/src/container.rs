// SPDX-License-Identifier: Apache-2.0

//! Container lifecycle and assembly.
//!
//! A [`ListenerContainer`] owns one queue's consumption end to end: the
//! polling loop, the admission governor, the per-message processors, the ack
//! sink, and the resource cache. The builder wires the user-supplied pieces
//! (listener, queue client, optional converter/schema/resolver/provider)
//! into an immutable container; `start()` and `stop()` drive the state
//! machine
//!
//! ```text
//! Created -> Configured -> Starting -> Running -> Stopping -> Stopped
//! ```
//!
//! where `Created` is the builder itself and `Stopped` may start again.

use crate::ack::{AckBatcher, AckSink};
use crate::admit::Admitter;
use crate::client::{QueueClient, QueueClientError};
use crate::convert::{JsonPayloadConverter, PayloadConverter};
use crate::error::ConfigurationError;
use crate::handler::{ErrorHandler, LoggingErrorHandler};
use crate::listener::QueueListener;
use crate::poller::Poller;
use crate::processor::Pipeline;
use crate::resource::{CleanupFn, ContextResolver, KeyFn, ResourceCache, ResourceProvider, canonical_key};
use crate::schema::Schema;
use crate::validate::Validator;
use crate::visibility::VisibilityExtender;
use serde::Serialize;
use serde::de::DeserializeOwned;
use siphon_config::ContainerConfig;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// The builder phase; never observed on a built container.
    Created,
    /// Built and startable.
    Configured,
    /// `start()` is wiring the runtime.
    Starting,
    /// The polling loop is live.
    Running,
    /// `stop()` is draining in-flight work.
    Stopping,
    /// Fully drained; may be started again.
    Stopped,
}

impl ContainerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ContainerState::Created,
            1 => ContainerState::Configured,
            2 => ContainerState::Starting,
            3 => ContainerState::Running,
            4 => ContainerState::Stopping,
            _ => ContainerState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ContainerState::Created => 0,
            ContainerState::Configured => 1,
            ContainerState::Starting => 2,
            ContainerState::Running => 3,
            ContainerState::Stopping => 4,
            ContainerState::Stopped => 5,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ContainerState::Created => "created",
            ContainerState::Configured => "configured",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
        };
        write!(f, "{label}")
    }
}

/// Errors returned by [`ListenerContainer::start`].
#[derive(thiserror::Error, Debug)]
pub enum ContainerError {
    /// The configuration was rejected.
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    /// `start()` was called in a state that cannot start.
    #[error("container cannot start from state `{state}`")]
    NotStartable {
        /// The state the container was in.
        state: ContainerState,
    },

    /// The queue name could not be resolved to a URL.
    #[error("failed to resolve queue `{name}`: {source}")]
    QueueResolution {
        /// The queue name passed to the resolver.
        name: String,
        /// The client failure.
        #[source]
        source: QueueClientError,
    },
}

/// Everything that only exists while the container runs.
struct Runtime<R> {
    queue_url: String,
    cancel: CancellationToken,
    poller: JoinHandle<()>,
    admitter: Admitter,
    ack: AckSink,
    cache: Arc<ResourceCache<R>>,
}

/// A message-listener container for one queue.
///
/// Containers are cheap to share behind an `Arc`; `start()` and `stop()`
/// take `&self` and serialise internally.
pub struct ListenerContainer<T, C = (), R = ()> {
    config: ContainerConfig,
    client: Arc<dyn QueueClient>,
    listener: Arc<dyn QueueListener<T, C, R>>,
    converter: Arc<dyn PayloadConverter<T>>,
    validator: Option<Arc<Validator>>,
    resolver: Option<Arc<dyn ContextResolver<C>>>,
    provider: Option<Arc<dyn ResourceProvider<C, R>>>,
    key_fn: Option<Arc<KeyFn<C>>>,
    cleanup: Option<Arc<CleanupFn<R>>>,
    error_handler: Arc<dyn ErrorHandler>,
    state: AtomicU8,
    lifecycle: tokio::sync::Mutex<Option<Runtime<R>>>,
    resolved_url: tokio::sync::OnceCell<String>,
}

impl<T, C, R> ListenerContainer<T, C, R>
where
    T: Send + 'static,
    C: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    /// Starts building a container for the given configuration.
    pub fn builder(config: ContainerConfig) -> ListenerContainerBuilder<T, C, R> {
        ListenerContainerBuilder {
            config,
            client: None,
            listener: None,
            converter: None,
            schema: None,
            resolver: None,
            provider: None,
            key_fn: None,
            cleanup: None,
            error_handler: None,
        }
    }

    /// The container identifier used in logs.
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// The configuration this container was built with.
    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContainerState {
        ContainerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ContainerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Starts the container: resolves the queue URL, wires the runtime, and
    /// spawns the polling loop.
    ///
    /// # Errors
    ///
    /// Rejects synchronously when the configuration is invalid, the queue
    /// name cannot be resolved, or the container is already running.
    /// A stopped container may be started again.
    pub async fn start(&self) -> Result<(), ContainerError> {
        let mut runtime_guard = self.lifecycle.lock().await;
        let before = self.state();
        match before {
            ContainerState::Configured | ContainerState::Stopped => {}
            state => return Err(ContainerError::NotStartable { state }),
        }
        self.set_state(ContainerState::Starting);

        let started = self.start_runtime().await;
        match started {
            Ok(runtime) => {
                info!(
                    container.id = %self.config.id,
                    queue.url = %runtime.queue_url,
                    "container started"
                );
                *runtime_guard = Some(runtime);
                self.set_state(ContainerState::Running);
                Ok(())
            }
            Err(err) => {
                self.set_state(before);
                Err(err)
            }
        }
    }

    async fn start_runtime(&self) -> Result<Runtime<R>, ContainerError> {
        self.config
            .validate()
            .map_err(|err| ContainerError::Configuration(err.into()))?;
        let queue_url = self.resolve_url().await?;

        let admitter = Admitter::new(self.config.max_concurrent_messages);
        let ack = if self.config.batch_ack.enabled {
            AckSink::batched(Arc::new(AckBatcher::new(
                Arc::clone(&self.client),
                self.config.batch_ack.max_size,
                self.config.batch_ack.flush_interval,
            )))
        } else {
            AckSink::direct(Arc::clone(&self.client))
        };
        let cache = Arc::new(ResourceCache::new());
        let extender = self.config.effective_extension_interval().map(|interval| {
            let extension = self.config.visibility_timeout.unwrap_or(interval * 2);
            Arc::new(VisibilityExtender::new(
                Arc::clone(&self.client),
                interval,
                extension,
            ))
        });

        let pipeline = Arc::new(Pipeline {
            container_id: self.config.id.clone(),
            listener: Arc::clone(&self.listener),
            converter: Arc::clone(&self.converter),
            validator: self.validator.clone(),
            validation_failure_mode: self.config.validation_failure_mode,
            validator_options: self.config.validator_options.clone(),
            acknowledgement_mode: self.config.acknowledgement_mode,
            resolver: self.resolver.clone(),
            provider: self.provider.clone(),
            key_fn: self.key_fn.clone(),
            cache: Arc::clone(&cache),
            ack: ack.clone(),
            error_handler: Arc::clone(&self.error_handler),
            extender,
        });

        let cancel = CancellationToken::new();
        let poller = Poller {
            container_id: self.config.id.clone(),
            client: Arc::clone(&self.client),
            pipeline,
            admitter: admitter.clone(),
            queue_url: queue_url.clone(),
            max_messages_per_poll: self.config.max_messages_per_poll,
            poll_timeout: self.config.poll_timeout,
            visibility_timeout: self.config.visibility_timeout,
            polling_error_backoff: self.config.polling_error_backoff,
            cancel: cancel.clone(),
        };
        let poller = tokio::spawn(poller.run());

        Ok(Runtime {
            queue_url,
            cancel,
            poller,
            admitter,
            ack,
            cache,
        })
    }

    async fn resolve_url(&self) -> Result<String, ContainerError> {
        if let Some(url) = &self.config.queue_url {
            return Ok(url.clone());
        }
        let Some(name) = &self.config.queue_name else {
            return Err(ContainerError::Configuration(
                siphon_config::ConfigError::QueueMissing.into(),
            ));
        };
        let url = self
            .resolved_url
            .get_or_try_init(|| self.client.resolve_queue_url(name))
            .await
            .map_err(|source| ContainerError::QueueResolution {
                name: name.clone(),
                source,
            })?;
        Ok(url.clone())
    }

    /// Stops the container: cancels polling, drains in-flight processors
    /// within the shutdown grace period, flushes pending acks, and releases
    /// cached resources.
    ///
    /// Idempotent; concurrent calls serialise on one shutdown and later
    /// calls return once it finished.
    pub async fn stop(&self) {
        let mut runtime_guard = self.lifecycle.lock().await;
        let Some(runtime) = runtime_guard.take() else {
            return;
        };
        self.set_state(ContainerState::Stopping);
        info!(container.id = %self.config.id, "stopping container");

        runtime.cancel.cancel();
        if let Err(err) = runtime.poller.await {
            warn!(container.id = %self.config.id, error = %err, "polling task panicked");
        }

        if !runtime.admitter.drain(self.config.shutdown_grace).await {
            warn!(
                container.id = %self.config.id,
                grace = ?self.config.shutdown_grace,
                "shutdown grace elapsed, abandoning in-flight processors"
            );
        }

        runtime.ack.flush_all().await;
        runtime.cache.shutdown(self.cleanup.as_deref());

        self.set_state(ContainerState::Stopped);
        info!(container.id = %self.config.id, "container stopped");
    }
}

/// Builder for [`ListenerContainer`].
pub struct ListenerContainerBuilder<T, C = (), R = ()> {
    config: ContainerConfig,
    client: Option<Arc<dyn QueueClient>>,
    listener: Option<Arc<dyn QueueListener<T, C, R>>>,
    converter: Option<Arc<dyn PayloadConverter<T>>>,
    schema: Option<Schema>,
    resolver: Option<Arc<dyn ContextResolver<C>>>,
    provider: Option<Arc<dyn ResourceProvider<C, R>>>,
    key_fn: Option<Arc<KeyFn<C>>>,
    cleanup: Option<Arc<CleanupFn<R>>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl<T, C, R> ListenerContainerBuilder<T, C, R>
where
    T: Send + 'static,
    C: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    /// Sets the queue client.
    #[must_use]
    pub fn client(mut self, client: impl QueueClient + 'static) -> Self {
        self.client = Some(Arc::new(client));
        self
    }

    /// Sets the listener invoked for every message.
    #[must_use]
    pub fn listener(mut self, listener: impl QueueListener<T, C, R> + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Overrides the payload converter. Defaults to the JSON converter.
    #[must_use]
    pub fn converter(mut self, converter: impl PayloadConverter<T> + 'static) -> Self {
        self.converter = Some(Arc::new(converter));
        self
    }

    /// Sets the schema validated against decoded payloads. Only consulted
    /// when `enable_validation` is set in the configuration.
    #[must_use]
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Sets the per-message context resolver.
    #[must_use]
    pub fn context_resolver(mut self, resolver: impl ContextResolver<C> + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Sets the resource provider. Installs the canonical-JSON key function
    /// unless one was (or is later) set explicitly.
    #[must_use]
    pub fn resource_provider(mut self, provider: impl ResourceProvider<C, R> + 'static) -> Self
    where
        C: Serialize,
    {
        self.provider = Some(Arc::new(provider));
        if self.key_fn.is_none() {
            self.key_fn = Some(Arc::new(|context: &C| canonical_key(context)));
        }
        self
    }

    /// Overrides the cache key function.
    #[must_use]
    pub fn resource_key_fn(mut self, key_fn: impl Fn(&C) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Sets the cleanup hook run once per cached resource at stop.
    #[must_use]
    pub fn resource_cleanup(mut self, cleanup: impl Fn(&R) + Send + Sync + 'static) -> Self {
        self.cleanup = Some(Arc::new(cleanup));
        self
    }

    /// Overrides the error handler. Defaults to the logging handler.
    #[must_use]
    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }
}

impl<T, C, R> ListenerContainerBuilder<T, C, R>
where
    T: DeserializeOwned + Send + 'static,
    C: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    /// Builds the container, checking the configuration and the wiring.
    ///
    /// # Errors
    ///
    /// Rejects a configuration that fails its range checks, a missing
    /// listener or client, a resource provider without a context resolver,
    /// or a cleanup hook without a provider.
    pub fn build(self) -> Result<ListenerContainer<T, C, R>, ConfigurationError> {
        self.config.validate()?;
        let Some(client) = self.client else {
            return Err(ConfigurationError::MissingClient);
        };
        let Some(listener) = self.listener else {
            return Err(ConfigurationError::MissingListener);
        };
        if self.provider.is_some() && self.resolver.is_none() {
            return Err(ConfigurationError::ProviderWithoutResolver);
        }
        if self.cleanup.is_some() && self.provider.is_none() {
            return Err(ConfigurationError::CleanupWithoutProvider);
        }

        let validator = if self.config.enable_validation {
            // No schema registered: validation degrades to a silent pass.
            self.schema.map(|schema| Arc::new(Validator::new(schema)))
        } else {
            None
        };

        Ok(ListenerContainer {
            config: self.config,
            client,
            listener,
            converter: self
                .converter
                .unwrap_or_else(|| Arc::new(JsonPayloadConverter::new())),
            validator,
            resolver: self.resolver,
            provider: self.provider,
            key_fn: self.key_fn,
            cleanup: self.cleanup,
            error_handler: self
                .error_handler
                .unwrap_or_else(|| Arc::new(LoggingErrorHandler)),
            state: AtomicU8::new(ContainerState::Configured.as_u8()),
            lifecycle: tokio::sync::Mutex::new(None),
            resolved_url: tokio::sync::OnceCell::new(),
        })
    }
}
