//! Builder for constructing HotswapStore instances.

use crate::core::cache::ReadCache;
use crate::core::config_handle::{StoreInner, merge_over};
use crate::core::snapshot::{Snapshot, ValueStore};
use crate::core::validation::{ValidationEngine, Validator};
use crate::core::HotswapStore;
use crate::crypto::CryptoProvider;
use crate::error::{ConfigError, ErrorKind, Result};
use crate::persist::scheduler::{CryptoSlot, PersistenceScheduler};
use crate::persist::{FileBackend, StorageBackend, StorageFormat};
use crate::value::Value;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::metrics::StoreMetrics;

/// Flush delay used unless [`with_flush_delay`](HotswapStoreBuilder::with_flush_delay) is called.
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(500);

/// Cache rebuild delay used unless overridden.
pub const DEFAULT_CACHE_REBUILD_DELAY: Duration = Duration::from_millis(50);

enum Location {
    File(PathBuf),
    Backend(Arc<dyn StorageBackend>, StorageFormat),
}

/// Builder for constructing a [`HotswapStore`].
///
/// Without a location the store lives purely in memory.
///
/// # Examples
///
/// ```rust,no_run
/// use hotswap_store::prelude::*;
/// use std::time::Duration;
///
/// # async fn example() -> Result<()> {
/// let store = HotswapStore::builder()
///     .with_defaults(Value::from_iter([("server", Value::from_iter([("port", 8080)]))]))
///     .with_location("/etc/myapp", "config", StorageFormat::Yaml)
///     .with_flush_delay(Duration::from_millis(200))
///     .with_validator(RuleSet::new("server").rule(Rule::range("server.port", 1, 65535)))
///     .fallback_to_defaults(true)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct HotswapStoreBuilder {
    defaults: Value,
    location: Option<Location>,
    flush_delay: Duration,
    max_flush_retries: u32,
    cache_enabled: bool,
    cache_rebuild_delay: Duration,
    validators: Vec<Arc<dyn Validator>>,
    crypto: Option<Arc<dyn CryptoProvider>>,
    require_encryption: bool,
    fallback_to_defaults: bool,
    #[cfg(feature = "metrics")]
    metrics: Option<StoreMetrics>,
}

impl HotswapStoreBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            defaults: Value::map(),
            location: None,
            flush_delay: DEFAULT_FLUSH_DELAY,
            max_flush_retries: 3,
            cache_enabled: true,
            cache_rebuild_delay: DEFAULT_CACHE_REBUILD_DELAY,
            validators: Vec::new(),
            crypto: None,
            require_encryption: false,
            fallback_to_defaults: false,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Initial tree, overlaid by any durable state found at build time.
    pub fn with_defaults(mut self, defaults: impl Into<Value>) -> Self {
        self.defaults = defaults.into();
        self
    }

    /// Persist to `{dir}/{name}.{ext}`, with the extension taken from `format`.
    pub fn with_location(
        mut self,
        dir: impl AsRef<Path>,
        name: &str,
        format: StorageFormat,
    ) -> Self {
        let backend = FileBackend::in_dir(dir, name, format.extension());
        self.location = Some(Location::Backend(Arc::new(backend), format));
        self
    }

    /// Persist to an explicit file; the format is inferred from its extension.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.location = Some(Location::File(path.into()));
        self
    }

    /// Persist through a custom backend.
    pub fn with_backend(
        mut self,
        backend: impl StorageBackend + 'static,
        format: StorageFormat,
    ) -> Self {
        self.location = Some(Location::Backend(Arc::new(backend), format));
        self
    }

    /// Quiet period before changes are flushed. Zero flushes inside every mutation.
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    /// Consecutive background flush failures retried before giving up until the next change.
    pub fn with_max_flush_retries(mut self, retries: u32) -> Self {
        self.max_flush_retries = retries;
        self
    }

    /// Enable or disable the flattened read cache (enabled by default).
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Delay between an invalidation and the cache rebuild. Zero rebuilds immediately.
    pub fn with_cache_rebuild_delay(mut self, delay: Duration) -> Self {
        self.cache_rebuild_delay = delay;
        self
    }

    /// Register a validator.
    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Encrypt persisted state with `provider`.
    pub fn with_encryption(mut self, provider: impl CryptoProvider + 'static) -> Self {
        self.crypto = Some(Arc::new(provider));
        self
    }

    /// Encrypt with ChaCha20-Poly1305, deriving the key from `material`.
    #[cfg(feature = "encryption")]
    pub fn with_encryption_key(self, material: &[u8]) -> Self {
        self.with_encryption(crate::crypto::ChaChaProvider::from_passphrase(material))
    }

    /// Refuse to load durable state that is not encrypted.
    pub fn require_encryption(mut self, required: bool) -> Self {
        self.require_encryption = required;
        self
    }

    /// Start from the defaults if durable state cannot be decrypted or decoded.
    pub fn fallback_to_defaults(mut self, fallback: bool) -> Self {
        self.fallback_to_defaults = fallback;
        self
    }

    /// Record OpenTelemetry metrics on `meter`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, meter: opentelemetry::metrics::Meter) -> Self {
        self.metrics = Some(StoreMetrics::new(meter));
        self
    }

    /// Load durable state, validate it and build the store.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The defaults are not a mapping
    /// - The file extension has no known format
    /// - Durable state cannot be read, decrypted or decoded (unless falling back to defaults)
    /// - A validator rejects the initial state
    pub async fn build(self) -> Result<HotswapStore> {
        let defaults = Snapshot::from_value(self.defaults)?;
        let values = Arc::new(ValueStore::new(defaults.clone()));
        let crypto: CryptoSlot = Arc::new(RwLock::new(self.crypto));

        if self.require_encryption && crypto.read().is_none() {
            return Err(ConfigError::Other(
                "Encryption is required but no provider is configured".to_string(),
            ));
        }

        let persistence = match self.location {
            None => None,
            Some(location) => {
                let (backend, format) = resolve_location(location)?;
                let scheduler = PersistenceScheduler::new(
                    backend,
                    format,
                    Arc::clone(&values),
                    Arc::clone(&crypto),
                )
                .with_delay(self.flush_delay)
                .with_max_retries(self.max_flush_retries)
                .with_required_encryption(self.require_encryption);
                #[cfg(feature = "metrics")]
                let scheduler = scheduler.with_metrics(self.metrics.clone());
                Some(Arc::new(scheduler))
            }
        };

        let initial = match &persistence {
            None => defaults.clone(),
            Some(persistence) => match load_initial(persistence, &defaults).await {
                Ok(snapshot) => snapshot,
                Err(e)
                    if self.fallback_to_defaults
                        && matches!(
                            e.kind(),
                            ErrorKind::DecryptionFailure | ErrorKind::FormatFailure
                        ) =>
                {
                    tracing::warn!(
                        location = %persistence.backend().location(),
                        error = %e,
                        "durable configuration unreadable; starting from defaults"
                    );
                    defaults.clone()
                }
                Err(e) => return Err(e),
            },
        };

        let validation = ValidationEngine::new();
        for validator in self.validators {
            validation.add(validator);
        }
        validation.validate_all(&initial)?;
        values.replace(Arc::new(initial));

        let cache = ReadCache::new(
            Arc::clone(&values),
            self.cache_enabled,
            self.cache_rebuild_delay,
        );
        #[cfg(feature = "metrics")]
        let cache = cache.with_metrics(self.metrics.clone());
        let cache = Arc::new(cache);
        cache.rebuild();

        tracing::debug!(
            keys = values.load().len(),
            persistent = persistence.is_some(),
            "configuration store built"
        );

        Ok(HotswapStore::from_inner(StoreInner::new(
            values,
            cache,
            validation,
            persistence,
            crypto,
            defaults,
            #[cfg(feature = "metrics")]
            self.metrics,
        )))
    }
}

impl Default for HotswapStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_location(location: Location) -> Result<(Arc<dyn StorageBackend>, StorageFormat)> {
    match location {
        Location::Backend(backend, format) => Ok((backend, format)),
        Location::File(path) => {
            let format = StorageFormat::from_path(&path).ok_or_else(|| {
                ConfigError::LoadError(format!(
                    "Unsupported file format: {} (expected .yaml, .yml, .json, .toml, .ini or .env)",
                    path.display()
                ))
            })?;
            Ok((Arc::new(FileBackend::new(path)), format))
        }
    }
}

async fn load_initial(persistence: &PersistenceScheduler, defaults: &Snapshot) -> Result<Snapshot> {
    match persistence.load().await? {
        Some(loaded) => {
            tracing::info!(
                location = %persistence.backend().location(),
                "loaded durable configuration"
            );
            merge_over(defaults, loaded)
        }
        None => Ok(defaults.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Rule, RuleSet};
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_builder_defaults() {
        let store = HotswapStoreBuilder::new().build().await.unwrap();
        assert!(store.snapshot().is_empty());
        assert!(!store.is_persistent());
    }

    #[tokio::test]
    async fn test_non_map_defaults_rejected() {
        let result = HotswapStore::builder().with_defaults(5).build().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_durable_state_overlays_defaults() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("app.ini"), "[server]\nport = 9000\n").unwrap();

        let store = HotswapStore::builder()
            .with_defaults(Value::from_iter([(
                "server",
                Value::from_iter([("port", Value::from(8080)), ("host", Value::from("localhost"))]),
            )]))
            .with_location(temp_dir.path(), "app", StorageFormat::Ini)
            .build()
            .await
            .unwrap();

        assert_eq!(store.get("server.port"), Some(Value::Integer(9000)));
        assert_eq!(store.get("server.host"), Some(Value::from("localhost")));
    }

    #[tokio::test]
    async fn test_initial_state_is_validated() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("app.ini"), "[server]\nport = 99999\n").unwrap();

        let result = HotswapStore::builder()
            .with_location(temp_dir.path(), "app", StorageFormat::Ini)
            .with_validator(RuleSet::new("ports").rule(Rule::range("server.port", 1, 65535)))
            .build()
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ValidationFailure);
    }

    #[tokio::test]
    async fn test_unknown_extension() {
        let result = HotswapStore::builder().with_file("/tmp/config.xml").build().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_require_encryption_needs_provider() {
        let result = HotswapStore::builder().require_encryption(true).build().await;
        assert!(result.is_err());
    }

    #[cfg(feature = "json")]
    #[tokio::test]
    async fn test_fallback_to_defaults_on_bad_format() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.json");
        fs::write(&path, "{ not json").unwrap();

        let err = HotswapStore::builder()
            .with_file(&path)
            .build()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FormatFailure);

        let store = HotswapStore::builder()
            .with_defaults(Value::from_iter([("mode", "safe")]))
            .with_file(&path)
            .fallback_to_defaults(true)
            .build()
            .await
            .unwrap();
        assert_eq!(store.get("mode"), Some(Value::from("safe")));
    }

    #[cfg(feature = "encryption")]
    #[tokio::test]
    async fn test_require_encryption_rejects_plaintext() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("app.ini"), "a = 1\n").unwrap();

        let err = HotswapStore::builder()
            .with_location(temp_dir.path(), "app", StorageFormat::Ini)
            .with_encryption_key(b"key")
            .require_encryption(true)
            .build()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecryptionFailure);
    }
}
