//! Derived flattened read cache with debounced rebuilds.
//!
//! The cache never holds data that the authoritative snapshot does not: every
//! invalidation installs an explicit empty entry first, and a rebuild only
//! installs its result if nothing replaced the entry it started from.

use crate::core::snapshot::ValueStore;
use crate::value::Value;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[cfg(feature = "metrics")]
use crate::metrics::StoreMetrics;

/// State of a published cache entry.
#[derive(Debug)]
pub(crate) enum CacheState {
    /// Caching is turned off; every lookup misses.
    Disabled,
    /// Invalidated or not yet built; every lookup misses.
    Empty,
    /// Flattened view of one snapshot.
    Built(HashMap<String, Value>),
}

/// One published cache generation. Immutable once installed.
#[derive(Debug)]
pub(crate) struct CacheEntry {
    pub(crate) version: u64,
    pub(crate) state: CacheState,
}

impl CacheEntry {
    fn new(version: u64, state: CacheState) -> Arc<Self> {
        Arc::new(Self { version, state })
    }
}

pub(crate) struct ReadCache {
    entry: ArcSwap<CacheEntry>,
    version: AtomicU64,
    store: Arc<ValueStore>,
    rebuild_delay: Duration,
    /// Pending or running rebuild task. Leaf lock: nothing else is acquired while held.
    pending: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    #[cfg(feature = "metrics")]
    metrics: Option<StoreMetrics>,
}

impl ReadCache {
    pub(crate) fn new(store: Arc<ValueStore>, enabled: bool, rebuild_delay: Duration) -> Self {
        let state = if enabled {
            CacheState::Empty
        } else {
            CacheState::Disabled
        };
        Self {
            entry: ArcSwap::new(CacheEntry::new(0, state)),
            version: AtomicU64::new(0),
            store,
            rebuild_delay,
            pending: Mutex::new(None),
            closed: AtomicBool::new(false),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn with_metrics(mut self, metrics: Option<StoreMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub(crate) fn is_enabled(&self) -> bool {
        !matches!(self.entry.load().state, CacheState::Disabled)
    }

    /// Lock-free point read. `None` means "ask the snapshot", never "absent".
    pub(crate) fn get(&self, key: &str) -> Option<Value> {
        match &self.entry.load().state {
            CacheState::Built(values) => values.get(key).cloned(),
            CacheState::Disabled | CacheState::Empty => None,
        }
    }

    /// The currently published entry.
    #[cfg(test)]
    pub(crate) fn current(&self) -> Arc<CacheEntry> {
        self.entry.load_full()
    }

    /// Drop the current view and schedule a rebuild of whatever is current later.
    ///
    /// After [`shutdown`](Self::shutdown) the cache stays disabled and every
    /// lookup falls through to the snapshot.
    pub(crate) fn invalidate(self: &Arc<Self>) {
        if !self.is_enabled() {
            return;
        }
        let version = self.next_version();
        self.entry.store(CacheEntry::new(version, CacheState::Empty));
        self.schedule_rebuild(self.rebuild_delay);
    }

    /// (Re)arm the rebuild task.
    ///
    /// A zero delay spawns an immediate background rebuild; a positive delay
    /// replaces any armed task with a fresh delayed one. Without a tokio runtime
    /// the rebuild runs inline.
    pub(crate) fn schedule_rebuild(self: &Arc<Self>, delay: Duration) {
        if !self.is_enabled() || self.closed.load(Ordering::Acquire) {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            self.rebuild();
            return;
        };

        let cache = Arc::clone(self);
        let mut pending = self.pending.lock();
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        *pending = Some(runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            cache.rebuild();
        }));
    }

    /// Flatten the snapshot that is current right now and try to publish it.
    ///
    /// Returns `true` if the result was installed.
    pub(crate) fn rebuild(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let observed = self.entry.load_full();
        if matches!(observed.state, CacheState::Disabled) {
            return false;
        }

        let snapshot = self.store.load();
        let values = snapshot.flatten();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let version = self.next_version();
        let entry_count = values.len();
        let previous = self
            .entry
            .compare_and_swap(&observed, CacheEntry::new(version, CacheState::Built(values)));
        let installed = Arc::ptr_eq(&*previous, &observed);

        if installed {
            tracing::debug!(version, entries = entry_count, "read cache rebuilt");
        } else {
            tracing::debug!(
                version,
                observed = observed.version,
                current = previous.version,
                "read cache rebuild superseded"
            );
        }

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_rebuild(installed);
        }

        installed
    }

    /// Abort pending and in-flight rebuilds and stop serving cached reads.
    ///
    /// Installs a disabled entry, so an in-flight rebuild loses its
    /// compare-and-swap and nothing is installed afterwards.
    pub(crate) fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let version = self.next_version();
        self.entry.store(CacheEntry::new(version, CacheState::Disabled));
        if let Some(handle) = self.pending.lock().take() {
            handle.abort();
        }
    }

    /// Version of the published entry.
    pub(crate) fn version(&self) -> u64 {
        self.entry.load().version
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }
}
