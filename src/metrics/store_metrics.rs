//! Store metrics tracking using OpenTelemetry.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector for store operations.
///
/// Tracks mutations, flushes, reloads, cache rebuilds and subscriber counts
/// using OpenTelemetry metrics.
///
/// # Examples
///
/// ```rust,no_run
/// use hotswap_store::metrics::StoreMetrics;
/// use opentelemetry::global;
///
/// let metrics = StoreMetrics::new(global::meter("hotswap-store"));
///
/// let timer = metrics.start_reload();
/// // ... perform reload ...
/// metrics.record_reload_success(timer);
/// ```
#[derive(Clone)]
pub struct StoreMetrics {
    mutations: Counter<u64>,
    validation_failures: Counter<u64>,
    flushes: Counter<u64>,
    flush_duration: Histogram<f64>,
    reload_attempts: Counter<u64>,
    reload_failures: Counter<u64>,
    reload_duration: Histogram<f64>,
    cache_rebuilds: Counter<u64>,
    store_age_seconds: Gauge<i64>,
    active_subscribers: Gauge<i64>,
    last_update: Arc<parking_lot::Mutex<Instant>>,
}

impl StoreMetrics {
    /// Create a new metrics collector with the provided meter.
    pub fn new(meter: Meter) -> Self {
        Self {
            mutations: meter
                .u64_counter("hotswap_store.mutations")
                .with_description("Applied set/remove operations")
                .build(),
            validation_failures: meter
                .u64_counter("hotswap_store.validation.failures")
                .with_description("Mutations or reloads rejected by validation")
                .build(),
            flushes: meter
                .u64_counter("hotswap_store.flush")
                .with_description("Flush attempts by outcome")
                .build(),
            flush_duration: meter
                .f64_histogram("hotswap_store.flush.duration")
                .with_description("Duration of flushes in seconds")
                .with_unit("s")
                .build(),
            reload_attempts: meter
                .u64_counter("hotswap_store.reload.attempts")
                .with_description("Total number of reload attempts")
                .build(),
            reload_failures: meter
                .u64_counter("hotswap_store.reload.failures")
                .with_description("Number of failed reloads")
                .build(),
            reload_duration: meter
                .f64_histogram("hotswap_store.reload.duration")
                .with_description("Duration of reload operations in seconds")
                .with_unit("s")
                .build(),
            cache_rebuilds: meter
                .u64_counter("hotswap_store.cache.rebuilds")
                .with_description("Read cache rebuilds by outcome")
                .build(),
            store_age_seconds: meter
                .i64_gauge("hotswap_store.age")
                .with_description("Time since the last published snapshot in seconds")
                .with_unit("s")
                .build(),
            active_subscribers: meter
                .i64_gauge("hotswap_store.subscribers.active")
                .with_description("Number of active subscribers")
                .build(),
            last_update: Arc::new(parking_lot::Mutex::new(Instant::now())),
        }
    }

    /// Record a published mutation.
    pub fn record_mutation(&self, operation: &'static str) {
        self.mutations.add(1, &[KeyValue::new("operation", operation)]);
        *self.last_update.lock() = Instant::now();
    }

    /// Record a validation failure.
    pub fn record_validation_failure(&self) {
        self.validation_failures.add(1, &[]);
    }

    /// Record the outcome of a flush started at `start`.
    pub fn record_flush(&self, success: bool, start: Instant) {
        let outcome = KeyValue::new("outcome", if success { "success" } else { "failure" });
        self.flushes.add(1, std::slice::from_ref(&outcome));
        self.flush_duration
            .record(start.elapsed().as_secs_f64(), &[outcome]);
    }

    /// Start a reload operation timer.
    ///
    /// Pass the returned `Instant` to `record_reload_success` or
    /// `record_reload_failure` when the operation completes.
    pub fn start_reload(&self) -> Instant {
        self.reload_attempts.add(1, &[]);
        Instant::now()
    }

    /// Record a successful reload operation.
    pub fn record_reload_success(&self, start: Instant) {
        self.reload_duration.record(start.elapsed().as_secs_f64(), &[]);
        *self.last_update.lock() = Instant::now();
    }

    /// Record a failed reload operation.
    pub fn record_reload_failure(&self, start: Instant) {
        self.reload_failures.add(1, &[]);
        self.reload_duration.record(start.elapsed().as_secs_f64(), &[]);
    }

    /// Record a cache rebuild; `installed` is false when a newer invalidation won.
    pub fn record_cache_rebuild(&self, installed: bool) {
        let outcome = if installed { "installed" } else { "superseded" };
        self.cache_rebuilds
            .add(1, &[KeyValue::new("outcome", outcome)]);
    }

    /// Update the number of active subscribers.
    pub fn update_subscriber_count(&self, count: i64) {
        self.active_subscribers.record(count, &[]);
    }

    /// Update the store age metric.
    ///
    /// Call periodically to track how stale the configuration is.
    pub fn update_store_age(&self) {
        let age_secs = self.last_update.lock().elapsed().as_secs() as i64;
        self.store_age_seconds.record(age_secs, &[]);
    }
}
