//! Debounced flush pipeline: snapshot → serialize → (encrypt) → backend.

use crate::core::snapshot::{Snapshot, ValueStore};
use crate::crypto::CryptoProvider;
use crate::error::{ConfigError, Result};
use crate::persist::backend::StorageBackend;
use crate::persist::format::StorageFormat;
use crate::value::Value;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[cfg(feature = "metrics")]
use crate::metrics::StoreMetrics;

/// Shared, swappable crypto provider. Guarded independently of the data locks.
pub(crate) type CryptoSlot = Arc<RwLock<Option<Arc<dyn CryptoProvider>>>>;

/// Snapshot of the scheduler's bookkeeping, for health checks.
#[derive(Debug, Clone, Default)]
pub struct PersistenceStatus {
    /// Changes are waiting to be flushed
    pub dirty: bool,
    /// A debounce timer is armed
    pub scheduled: bool,
    /// When the armed timer fires
    pub deadline: Option<Instant>,
    /// Failed flushes since the last success
    pub consecutive_failures: u32,
    /// Message of the most recent failure
    pub last_error: Option<String>,
    /// Time of the most recent successful flush
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct PendingWrite {
    dirty: bool,
    timer: Option<(u64, JoinHandle<()>)>,
    generation: u64,
    deadline: Option<Instant>,
    consecutive_failures: u32,
    last_error: Option<String>,
    last_success: Option<DateTime<Utc>>,
}

pub(crate) struct PersistenceScheduler {
    backend: Arc<dyn StorageBackend>,
    format: StorageFormat,
    store: Arc<ValueStore>,
    crypto: CryptoSlot,
    require_encryption: bool,
    delay: Duration,
    max_retries: u32,
    pending: Mutex<PendingWrite>,
    /// Serializes flushes; at most one write is in flight.
    flush_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    #[cfg(feature = "metrics")]
    metrics: Option<StoreMetrics>,
}

impl PersistenceScheduler {
    pub(crate) fn new(
        backend: Arc<dyn StorageBackend>,
        format: StorageFormat,
        store: Arc<ValueStore>,
        crypto: CryptoSlot,
    ) -> Self {
        Self {
            backend,
            format,
            store,
            crypto,
            require_encryption: false,
            delay: Duration::ZERO,
            max_retries: 3,
            pending: Mutex::new(PendingWrite::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub(crate) fn with_required_encryption(mut self, required: bool) -> Self {
        self.require_encryption = required;
        self
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn with_metrics(mut self, metrics: Option<StoreMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Zero delay: every request flushes before returning.
    pub(crate) fn is_synchronous(&self) -> bool {
        self.delay.is_zero()
    }

    pub(crate) fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Mark dirty and flush now (synchronous mode) or after quiescence.
    ///
    /// In debounced mode this only fails, with [`ConfigError::Persistence`], if
    /// the scheduler has been shut down.
    pub(crate) async fn request_flush(self: &Arc<Self>) -> Result<()> {
        if self.is_synchronous() {
            self.pending.lock().dirty = true;
            return self.flush_now().await;
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(ConfigError::Persistence {
                location: self.backend.location(),
                source: io::Error::other("persistence scheduler has been shut down"),
            });
        }
        self.pending.lock().dirty = true;
        self.arm();
        Ok(())
    }

    /// Fail fast if `candidate` cannot be written in this format.
    ///
    /// Synchronous mode serializes inside the flush anyway, so only debounced
    /// mode pays for the extra encode.
    pub(crate) fn check_encodable(&self, candidate: &Snapshot) -> Result<()> {
        if self.is_synchronous() {
            return Ok(());
        }
        self.format.serialize(candidate).map(|_| ())
    }

    /// (Re)arm the debounce timer, pushing the deadline out by the full delay.
    fn arm(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(
                "no tokio runtime; pending configuration changes wait for an explicit flush"
            );
            return;
        };

        let mut pending = self.pending.lock();
        if let Some((_, timer)) = pending.timer.take() {
            timer.abort();
        }
        pending.generation += 1;
        let generation = pending.generation;
        let delay = self.delay;
        let this = Arc::clone(self);
        pending.deadline = Some(Instant::now() + delay);
        pending.timer = Some((
            generation,
            runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                this.on_timer(generation).await;
            }),
        ));
    }

    async fn on_timer(self: Arc<Self>, generation: u64) {
        {
            let mut pending = self.pending.lock();
            match &pending.timer {
                // Detach so a request arriving mid-flush re-arms instead of aborting us.
                Some((current, _)) if *current == generation => {
                    pending.timer = None;
                    pending.deadline = None;
                }
                _ => return,
            }
            if !pending.dirty {
                return;
            }
        }

        if let Err(e) = self.flush_now().await {
            let failures = self.pending.lock().consecutive_failures;
            if failures <= self.max_retries {
                tracing::warn!(
                    location = %self.backend.location(),
                    error = %e,
                    attempt = failures,
                    "configuration flush failed; retrying after debounce delay"
                );
                self.arm();
            } else {
                tracing::error!(
                    location = %self.backend.location(),
                    error = %e,
                    failures,
                    "configuration flush keeps failing; waiting for the next change"
                );
            }
        }
    }

    /// Write whatever snapshot is current right now.
    pub(crate) async fn flush_now(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        // Requests arriving while we write set this again and land in the next cycle.
        self.pending.lock().dirty = false;

        let started = Instant::now();
        let snapshot = self.store.load();
        let result = match self.format.serialize(&snapshot) {
            Ok(bytes) => self.write_bytes(bytes).await,
            Err(e) => Err(e),
        };

        {
            let mut pending = self.pending.lock();
            match &result {
                Ok(()) => {
                    pending.consecutive_failures = 0;
                    pending.last_error = None;
                    pending.last_success = Some(Utc::now());
                }
                Err(e) => {
                    // Synchronous callers roll memory back, so nothing is left to write.
                    pending.dirty = !self.is_synchronous();
                    pending.consecutive_failures += 1;
                    pending.last_error = Some(e.to_string());
                }
            }
        }

        match &result {
            Ok(()) => tracing::debug!(
                location = %self.backend.location(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "configuration flushed"
            ),
            Err(e) => tracing::warn!(
                location = %self.backend.location(),
                error = %e,
                "configuration flush failed"
            ),
        }

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_flush(result.is_ok(), started);
        }

        result
    }

    async fn write_bytes(&self, plaintext: Vec<u8>) -> Result<()> {
        let crypto = self.crypto.read().clone();
        let bytes = match crypto {
            Some(provider) => provider.encrypt(&plaintext)?,
            None => plaintext,
        };

        let backend = Arc::clone(&self.backend);
        let location = backend.location();
        match tokio::task::spawn_blocking(move || backend.write(&bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(ConfigError::Persistence { location, source }),
            Err(join) => Err(ConfigError::Persistence {
                location,
                source: io::Error::other(join),
            }),
        }
    }

    /// Read and decode the durable state, decrypting when it carries the marker.
    ///
    /// Returns `Ok(None)` if nothing has been persisted yet.
    pub(crate) async fn load(&self) -> Result<Option<Value>> {
        let backend = Arc::clone(&self.backend);
        let bytes = tokio::task::spawn_blocking(move || backend.read())
            .await
            .map_err(|e| ConfigError::LoadError(format!("Read task failed: {e}")))?
            .map_err(|e| {
                ConfigError::LoadError(format!(
                    "Failed to read {}: {e}",
                    self.backend.location()
                ))
            })?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let crypto = self.crypto.read().clone();
        let plaintext = match crypto {
            Some(provider) if provider.is_encrypted(&bytes) => provider.decrypt(&bytes)?,
            Some(_) if self.require_encryption => {
                return Err(ConfigError::Decryption(format!(
                    "{} is not encrypted but encryption is required",
                    self.backend.location()
                )));
            }
            None if looks_encrypted(&bytes) => {
                return Err(ConfigError::Decryption(format!(
                    "{} is encrypted but no key is configured",
                    self.backend.location()
                )));
            }
            _ => bytes,
        };

        self.format.deserialize(&plaintext).map(Some)
    }

    pub(crate) fn status(&self) -> PersistenceStatus {
        let pending = self.pending.lock();
        PersistenceStatus {
            dirty: pending.dirty,
            scheduled: pending.timer.is_some(),
            deadline: pending.deadline,
            consecutive_failures: pending.consecutive_failures,
            last_error: pending.last_error.clone(),
            last_success: pending.last_success,
        }
    }

    /// Cancel the debounce timer without flushing.
    pub(crate) fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut pending = self.pending.lock();
        if let Some((_, timer)) = pending.timer.take() {
            timer.abort();
        }
        pending.deadline = None;
        if pending.dirty {
            tracing::warn!(
                location = %self.backend.location(),
                "shutting down with unflushed configuration changes"
            );
        }
    }
}

/// Provider-independent sniff for the default envelope, used when no key is set.
fn looks_encrypted(bytes: &[u8]) -> bool {
    #[cfg(feature = "encryption")]
    {
        crate::crypto::ChaChaProvider::has_marker(bytes)
    }
    #[cfg(not(feature = "encryption"))]
    {
        let _ = bytes;
        false
    }
}
