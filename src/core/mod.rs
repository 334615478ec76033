//! Core store types: snapshots, the read cache, validation and the store handle.

mod builder;
pub(crate) mod cache;
mod config_handle;
pub(crate) mod key;
mod rules;
pub(crate) mod snapshot;
mod validation;

pub use builder::{DEFAULT_CACHE_REBUILD_DELAY, DEFAULT_FLUSH_DELAY, HotswapStoreBuilder};
pub use config_handle::HotswapStore;
pub use rules::{Check, FieldFormat, Rule, RuleSet};
pub use snapshot::Snapshot;
pub use validation::{BASELINE_VALIDATOR, Coverage, FnValidator, ValidationEngine, Validator};
