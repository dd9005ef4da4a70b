// SPDX-License-Identifier: Apache-2.0

//! Per-message routing context and lazily provisioned resources.
//!
//! A [`ContextResolver`] extracts a caller-defined routing value from message
//! attributes; it must be pure and cheap. A [`ResourceProvider`] turns that
//! context into a resource (it may perform I/O, for example opening a
//! per-tenant datasource) and the [`ResourceCache`] guarantees it runs at
//! most once per distinct cache key: concurrent first-touches of a key share
//! one provisioning, later lookups hit the populated entry without touching
//! the provisioning guard.
//!
//! The cache has no TTL and no eviction; entries live until the container
//! stops, at which point the cleanup hook runs exactly once per entry.
//! Bounding cache growth is the caller's responsibility through the key
//! function.

use crate::client::RawMessage;
use crate::error::BoxError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

/// Errors produced while resolving a message's routing context.
#[derive(thiserror::Error, Debug)]
pub enum ContextError {
    /// A required attribute was not present on the message.
    #[error("required attribute `{0}` is missing")]
    MissingAttribute(String),

    /// An attribute was present but could not be interpreted.
    #[error("attribute `{name}` is invalid: {reason}")]
    InvalidAttribute {
        /// Name of the offending attribute.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Any other resolution failure.
    #[error("{0}")]
    Other(String),
}

/// Errors produced by resource providers.
#[derive(thiserror::Error, Debug)]
#[error("{source}")]
pub struct ProvisionError {
    #[source]
    source: BoxError,
}

impl ProvisionError {
    /// Wraps a provider failure.
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Creates a provision error from a plain message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            source: message.into().into(),
        }
    }
}

/// Extracts a routing context from a received message.
///
/// Resolution runs on every message before the listener; implementations
/// must be pure and cheap, typically a couple of attribute lookups.
pub trait ContextResolver<C>: Send + Sync {
    /// Resolves the context for one message.
    fn resolve(&self, message: &RawMessage) -> Result<C, ContextError>;
}

impl<C, F> ContextResolver<C> for F
where
    F: Fn(&RawMessage) -> Result<C, ContextError> + Send + Sync,
{
    fn resolve(&self, message: &RawMessage) -> Result<C, ContextError> {
        self(message)
    }
}

/// Provisions a resource for a routing context.
///
/// Providers may perform I/O. The cache guarantees at most one invocation
/// per distinct cache key over the life of a container; a failed invocation
/// leaves no cache entry, so the next message with the same key retries.
#[async_trait]
pub trait ResourceProvider<C, R>: Send + Sync {
    /// Provisions the resource for one context.
    async fn provide(&self, context: &C) -> Result<R, ProvisionError>;
}

#[async_trait]
impl<C, R, P> ResourceProvider<C, R> for Arc<P>
where
    P: ResourceProvider<C, R> + ?Sized,
    C: Sync,
    R: Send + 'static,
{
    async fn provide(&self, context: &C) -> Result<R, ProvisionError> {
        (**self).provide(context).await
    }
}

/// Function mapping a context to its cache key.
pub type KeyFn<C> = dyn Fn(&C) -> String + Send + Sync;

/// Cleanup hook invoked for every live resource at container stop.
pub type CleanupFn<R> = dyn Fn(&R) + Send + Sync;

/// The default cache key: canonical JSON of the context.
///
/// Object keys serialize in sorted order, so two structurally equal contexts
/// always map to the same key. Contexts that fail to serialize all share one
/// sentinel key; such contexts should install an explicit key function
/// instead.
pub fn canonical_key<C: Serialize>(context: &C) -> String {
    match serde_json::to_value(context).and_then(|value| serde_json::to_string(&value)) {
        Ok(key) => key,
        Err(err) => {
            warn!(error = %err, "context is not serializable, falling back to the shared key");
            "<unserializable>".to_owned()
        }
    }
}

struct CacheSlot<R> {
    cell: OnceCell<Arc<R>>,
    created_at: Instant,
}

/// Keyed store of provisioned resources with per-key single-flight creation.
pub struct ResourceCache<R> {
    entries: parking_lot::Mutex<HashMap<String, Arc<CacheSlot<R>>>>,
}

impl<R> Default for ResourceCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> ResourceCache<R> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            entries: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Number of populated or in-flight entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns the cached resource for `key`, provisioning it on first touch.
    ///
    /// Concurrent callers for the same key share one `provide` invocation.
    /// When provisioning fails, the error is returned to the caller whose
    /// attempt ran, the slot stays empty, and subsequent callers retry.
    pub async fn get_or_provide<F, Fut>(&self, key: &str, provide: F) -> Result<Arc<R>, ProvisionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, ProvisionError>>,
    {
        let slot = {
            let mut entries = self.entries.lock();
            Arc::clone(entries.entry(key.to_owned()).or_insert_with(|| {
                Arc::new(CacheSlot {
                    cell: OnceCell::new(),
                    created_at: Instant::now(),
                })
            }))
        };
        let resource = slot
            .cell
            .get_or_try_init(|| async {
                debug!(cache.key = key, "provisioning resource");
                provide().await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(resource))
    }

    /// Drains the cache, running `cleanup` exactly once per populated entry.
    ///
    /// A panicking cleanup hook is caught and logged so that the remaining
    /// entries are still cleaned up. Entries whose provisioning never
    /// completed have no resource and are skipped.
    pub fn shutdown(&self, cleanup: Option<&CleanupFn<R>>) {
        let drained: Vec<(String, Arc<CacheSlot<R>>)> = self.entries.lock().drain().collect();
        for (key, slot) in drained {
            let Some(resource) = slot.cell.get() else {
                continue;
            };
            debug!(
                cache.key = %key,
                cache.age_secs = slot.created_at.elapsed().as_secs(),
                "releasing cached resource"
            );
            if let Some(cleanup) = cleanup {
                let outcome =
                    std::panic::catch_unwind(AssertUnwindSafe(|| cleanup(resource.as_ref())));
                if outcome.is_err() {
                    error!(cache.key = %key, "resource cleanup panicked");
                }
            }
        }
    }
}
