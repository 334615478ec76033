//! The store handle: lock-free reads and the validated, persisted write path.

use crate::core::cache::ReadCache;
use crate::core::key;
use crate::core::snapshot::{Snapshot, ValueStore};
use crate::core::validation::{ValidationEngine, Validator};
use crate::core::HotswapStoreBuilder;
use crate::error::{ConfigError, Result};
use crate::notify::{SubscriberRegistry, SubscriptionHandle};
use crate::persist::PersistenceStatus;
use crate::persist::scheduler::{CryptoSlot, PersistenceScheduler};
use crate::value::Value;
use std::sync::Arc;

#[cfg(feature = "file-watch")]
use crate::notify::FileWatcher;
#[cfg(feature = "file-watch")]
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::metrics::StoreMetrics;

#[cfg(feature = "file-watch")]
struct WatchTask {
    _watcher: FileWatcher,
    task: tokio::task::JoinHandle<()>,
}

pub(crate) struct StoreInner {
    pub(crate) values: Arc<ValueStore>,
    pub(crate) cache: Arc<ReadCache>,
    pub(crate) validation: ValidationEngine,
    pub(crate) persistence: Option<Arc<PersistenceScheduler>>,
    pub(crate) crypto: CryptoSlot,
    /// Merged under durable state on every reload.
    pub(crate) defaults: Snapshot,
    /// Serializes set/remove/reload and their notifications. The cache's
    /// rebuild-handle lock and the scheduler's locks may be taken while held.
    pub(crate) write_lock: tokio::sync::Mutex<()>,
    pub(crate) subscribers: SubscriberRegistry,
    #[cfg(feature = "file-watch")]
    watch: parking_lot::Mutex<Option<WatchTask>>,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Option<StoreMetrics>,
}

impl StoreInner {
    pub(crate) fn new(
        values: Arc<ValueStore>,
        cache: Arc<ReadCache>,
        validation: ValidationEngine,
        persistence: Option<Arc<PersistenceScheduler>>,
        crypto: CryptoSlot,
        defaults: Snapshot,
        #[cfg(feature = "metrics")] metrics: Option<StoreMetrics>,
    ) -> Self {
        Self {
            values,
            cache,
            validation,
            persistence,
            crypto,
            defaults,
            write_lock: tokio::sync::Mutex::new(()),
            subscribers: SubscriberRegistry::new(),
            #[cfg(feature = "file-watch")]
            watch: parking_lot::Mutex::new(None),
            #[cfg(feature = "metrics")]
            metrics,
        }
    }
}

/// Hierarchical configuration store with lock-free reads and validated writes.
///
/// Cloning is cheap; clones share the same store.
///
/// # Examples
///
/// ```rust,no_run
/// use hotswap_store::prelude::*;
///
/// # async fn example() -> Result<()> {
/// let store = HotswapStore::builder()
///     .with_defaults(Value::from_iter([("server", Value::from_iter([("port", 8080)]))]))
///     .with_validator(RuleSet::new("server").rule(Rule::range("server.port", 1, 65535)))
///     .build()
///     .await?;
///
/// assert!(store.set("server.port", 70000).await.is_err());
/// assert_eq!(store.get("server.port"), Some(Value::Integer(8080)));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HotswapStore {
    inner: Arc<StoreInner>,
}

impl HotswapStore {
    /// Start building a store.
    pub fn builder() -> HotswapStoreBuilder {
        HotswapStoreBuilder::new()
    }

    pub(crate) fn from_inner(inner: StoreInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Point read of a dot-path key.
    ///
    /// Served from the read cache when it is built, otherwise from the current
    /// snapshot. Never blocks.
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.inner.cache.get(key) {
            return Some(value);
        }
        self.inner.values.load().get(key).cloned()
    }

    /// The current snapshot. Stays valid after later mutations.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.values.load()
    }

    /// Set `key` to `value`, replacing anything stored under that path.
    ///
    /// Only validators covering the key's field group run. With a zero flush
    /// delay the new state is written before this returns, and a write failure
    /// restores the previous state.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidKey`] for a malformed key
    /// - [`ConfigError::Validation`] if a validator rejects the change
    /// - [`ConfigError::Persistence`] if a synchronous flush fails
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        key::segments(key)?;

        let guard = self.inner.write_lock.lock().await;
        let previous = self.inner.values.load();
        let candidate = previous.with_value(key, value.clone())?;
        let committed = self.commit("set", key, &value, previous, candidate).await?;
        self.notify(&committed);
        drop(guard);
        Ok(())
    }

    /// Remove `key` and everything under it.
    ///
    /// Runs the same protocol as [`set`](Self::set), with the removed key as the
    /// touched field, so a `required` rule on it rejects the removal.
    ///
    /// # Errors
    ///
    /// Same as [`set`](Self::set).
    pub async fn remove(&self, key: &str) -> Result<()> {
        key::segments(key)?;

        let guard = self.inner.write_lock.lock().await;
        let previous = self.inner.values.load();
        let candidate = previous.without(key)?;
        let committed = self
            .commit("remove", key, &Value::Null, previous, candidate)
            .await?;
        self.notify(&committed);
        drop(guard);
        Ok(())
    }

    /// Validate, publish and persist `candidate`. Caller holds the write lock.
    async fn commit(
        &self,
        operation: &'static str,
        key: &str,
        value: &Value,
        previous: Arc<Snapshot>,
        candidate: Snapshot,
    ) -> Result<Arc<Snapshot>> {
        if let Err(e) = self.inner.validation.validate_field(key, value, &candidate) {
            tracing::debug!(key, error = %e, "mutation rejected");
            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.inner.metrics {
                metrics.record_validation_failure();
            }
            return Err(e);
        }
        if let Some(persistence) = &self.inner.persistence {
            // Catch values the format cannot encode before they reach memory.
            persistence.check_encodable(&candidate)?;
        }

        let committed = Arc::new(candidate);
        self.inner.values.replace(Arc::clone(&committed));
        self.inner.cache.invalidate();

        if let Some(persistence) = &self.inner.persistence {
            if let Err(e) = persistence.request_flush().await {
                self.inner.values.replace(previous);
                self.inner.cache.invalidate();
                tracing::warn!(key, error = %e, "mutation rolled back after persistence failure");
                return Err(e);
            }
        }

        tracing::debug!(operation, key, "configuration committed");
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_mutation(operation);
        }
        Ok(committed)
    }

    /// Deliver `snapshot` to subscribers. Caller holds the write lock, so
    /// notifications arrive in commit order.
    fn notify(&self, snapshot: &Snapshot) {
        self.inner.subscribers.notify_all(snapshot);
    }

    /// Run every validator's full check against the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns the first failure as [`ConfigError::Validation`].
    pub fn validate_all(&self) -> Result<()> {
        self.inner.validation.validate_all(&self.inner.values.load())
    }

    /// Register a validator. Takes effect for the next mutation.
    pub fn add_validator(&self, validator: impl Validator + 'static) {
        self.inner.validation.add(Arc::new(validator));
    }

    /// Remove every validator with this name. Returns `true` if any was removed.
    pub fn remove_validator(&self, name: &str) -> bool {
        self.inner.validation.remove(name)
    }

    /// Remove all validators; the built-in plausibility checks apply again.
    pub fn clear_validators(&self) {
        self.inner.validation.clear();
    }

    /// Names of the registered validators.
    pub fn validator_names(&self) -> Vec<String> {
        self.inner.validation.names()
    }

    /// Write the current snapshot now, bypassing the debounce.
    ///
    /// A memory-only store has nothing to flush and returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Persistence`] if the write fails.
    pub async fn flush(&self) -> Result<()> {
        match &self.inner.persistence {
            Some(persistence) => persistence.flush_now().await,
            None => Ok(()),
        }
    }

    /// Re-read durable state and publish it if it validates.
    ///
    /// Durable state is merged over the builder defaults, checked with every
    /// validator and swapped in as a whole. Skipped while local changes are
    /// still waiting to be flushed, since memory is ahead of the file then.
    /// On any failure the current snapshot is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the store has no durable location, or if reading,
    /// decrypting, decoding or validating the durable state fails.
    pub async fn reload(&self) -> Result<()> {
        let persistence = self.inner.persistence.as_ref().ok_or_else(|| {
            ConfigError::Other("No durable location configured for reload".to_string())
        })?;

        #[cfg(feature = "metrics")]
        let timer = self.inner.metrics.as_ref().map(StoreMetrics::start_reload);

        let result = self.reload_from(persistence).await;

        #[cfg(feature = "metrics")]
        if let (Some(metrics), Some(timer)) = (&self.inner.metrics, timer) {
            match &result {
                Ok(_) => metrics.record_reload_success(timer),
                Err(_) => metrics.record_reload_failure(timer),
            }
        }

        match result {
            Ok(true) => {
                tracing::info!(
                    location = %persistence.backend().location(),
                    "configuration reloaded"
                );
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                tracing::warn!(
                    location = %persistence.backend().location(),
                    error = %e,
                    "reload failed; keeping current configuration"
                );
                Err(e)
            }
        }
    }

    /// Returns `true` if a new snapshot was published.
    async fn reload_from(&self, persistence: &PersistenceScheduler) -> Result<bool> {
        let _guard = self.inner.write_lock.lock().await;

        if persistence.status().dirty {
            tracing::debug!("unflushed changes pending; reload skipped");
            return Ok(false);
        }
        let Some(loaded) = persistence.load().await? else {
            tracing::debug!("nothing persisted yet; reload skipped");
            return Ok(false);
        };

        let candidate = merge_over(&self.inner.defaults, loaded)?;
        if *self.inner.values.load() == candidate {
            return Ok(false);
        }
        if let Err(e) = self.inner.validation.validate_all(&candidate) {
            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.inner.metrics {
                metrics.record_validation_failure();
            }
            return Err(e);
        }

        let published = Arc::new(candidate);
        self.inner.values.replace(Arc::clone(&published));
        self.inner.cache.invalidate();
        self.notify(&published);
        Ok(true)
    }

    /// Call `callback` with the new snapshot after every successful change.
    ///
    /// Dropping the returned handle unsubscribes.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let handle = self.inner.subscribers.subscribe(callback);
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.inner.metrics {
            metrics.update_subscriber_count(self.inner.subscribers.subscriber_count() as i64);
        }
        handle
    }

    /// Reload automatically whenever the durable file changes.
    ///
    /// Changes are debounced by `debounce`. Reload failures are logged and the
    /// current snapshot is kept. Calling this again replaces the previous watch.
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::WatchError`] if the store has no watchable
    /// location or the watcher cannot be started.
    #[cfg(feature = "file-watch")]
    pub fn watch(&self, debounce: Duration) -> Result<()> {
        let path = self
            .inner
            .persistence
            .as_ref()
            .and_then(|p| p.backend().watch_path())
            .ok_or_else(|| ConfigError::WatchError("Store has no watchable location".to_string()))?;

        let (watcher, mut rx) = FileWatcher::new(debounce)?;
        watcher.watch(&path)?;

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                // Failures are logged by reload.
                let _ = HotswapStore { inner }.reload().await;
            }
        });

        tracing::info!(path = %path.display(), "watching configuration file");
        let previous = self.inner.watch.lock().replace(WatchTask {
            _watcher: watcher,
            task,
        });
        if let Some(previous) = previous {
            previous.task.abort();
        }
        Ok(())
    }

    /// Returns `true` if a file watch is active.
    #[cfg(feature = "file-watch")]
    pub fn is_watching(&self) -> bool {
        self.inner.watch.lock().is_some()
    }

    /// Export the encryption key (base64), if encryption is on and the provider allows it.
    pub fn export_key(&self) -> Option<String> {
        self.inner
            .crypto
            .read()
            .as_ref()
            .and_then(|provider| provider.export_key())
    }

    /// Persistence health, or `None` for a memory-only store.
    pub fn persistence_status(&self) -> Option<PersistenceStatus> {
        self.inner.persistence.as_ref().map(|p| p.status())
    }

    /// Returns `true` if the store is bound to durable storage.
    pub fn is_persistent(&self) -> bool {
        self.inner.persistence.is_some()
    }

    /// Stop background work without side effects.
    ///
    /// Cancels the pending flush, any pending or in-flight cache rebuild and
    /// the file watch. Reads keep working and are served from the snapshot.
    /// Call [`flush`](Self::flush) first to keep unflushed changes.
    ///
    /// A memory-only or synchronous store still accepts writes afterwards. A
    /// debounced persistent store rejects them with
    /// [`ErrorKind::PersistenceFailure`](crate::error::ErrorKind::PersistenceFailure)
    /// and keeps the previous state.
    pub fn shutdown(&self) {
        self.inner.cache.shutdown();
        if let Some(persistence) = &self.inner.persistence {
            persistence.shutdown();
        }
        #[cfg(feature = "file-watch")]
        if let Some(watch) = self.inner.watch.lock().take() {
            watch.task.abort();
        }
        tracing::debug!("configuration store shut down");
    }
}

impl std::fmt::Debug for HotswapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotswapStore")
            .field("keys", &self.inner.values.load().len())
            .field("validators", &self.inner.validation.len())
            .field("cache_version", &self.inner.cache.version())
            .field("persistent", &self.is_persistent())
            .finish_non_exhaustive()
    }
}

/// Deep-merge decoded durable state over `defaults`.
pub(crate) fn merge_over(defaults: &Snapshot, loaded: Value) -> Result<Snapshot> {
    let loaded = Snapshot::from_value(loaded)?;
    let mut merged = defaults.to_value();
    merged.merge(loaded.to_value());
    Snapshot::from_value(merged)
}
