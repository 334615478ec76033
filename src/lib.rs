//! # hotswap-store
//!
//! Hierarchical key/value configuration store with lock-free reads, validated
//! atomic writes and debounced, optionally encrypted persistence.
//!
//! ## Overview
//!
//! - Lock-free reads of immutable snapshots using `arc-swap`
//! - Dot-path addressing (`server.port`) over a nested value tree
//! - Field-scoped validation before every write, with atomic rejection
//! - A flattened read cache rebuilt in the background after each write
//! - Debounced persistence to YAML, JSON, TOML, INI or dotenv files, with
//!   timestamped backups and rollback when a synchronous write fails
//! - ChaCha20-Poly1305 encryption at rest
//! - Live reload when the file changes on disk
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hotswap_store::prelude::*;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<()> {
//! let store = HotswapStore::builder()
//!     .with_defaults(Value::from_iter([(
//!         "server",
//!         Value::from_iter([("port", 8080)]),
//!     )]))
//!     .with_location("config", "app", StorageFormat::Yaml)
//!     .with_validator(RuleSet::new("server").rule(Rule::range("server.port", 1, 65535)))
//!     .build()
//!     .await?;
//!
//! // Lock-free read
//! assert_eq!(store.get("server.port"), Some(Value::Integer(8080)));
//!
//! // Validated write, flushed after 500ms of quiet
//! store.set("server.port", 9090).await?;
//!
//! // Reload whenever the file changes
//! store.watch(Duration::from_millis(250))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `yaml`, `json`, `toml` (all on by default via `all-formats`): storage formats.
//!   INI and dotenv are always available.
//! - `encryption` (default): ChaCha20-Poly1305 provider.
//! - `file-watch` (default): reload on file changes.
//! - `metrics`: OpenTelemetry metrics.

#![warn(missing_docs, rust_2024_compatibility)]
#![deny(unsafe_code)]

pub mod core;
pub mod crypto;
pub mod error;
pub mod notify;
pub mod persist;
pub mod value;

#[cfg(feature = "metrics")]
pub mod metrics;

/// Convenient re-exports for common usage patterns.
pub mod prelude {
    pub use crate::core::{
        FnValidator, HotswapStore, HotswapStoreBuilder, Rule, RuleSet, Snapshot, Validator,
    };
    pub use crate::crypto::CryptoProvider;
    pub use crate::error::{ConfigError, ErrorKind, Result, ValidationError};
    pub use crate::persist::{FileBackend, StorageBackend, StorageFormat};
    pub use crate::value::Value;

    #[cfg(feature = "encryption")]
    pub use crate::crypto::ChaChaProvider;
}
