//! Built-in metrics for store operations.
//!
//! Provides OpenTelemetry metrics tracking:
//! - Mutations and validation failures
//! - Flush outcomes and duration
//! - Reload attempts, failures and duration
//! - Read cache rebuilds
//! - Store age and active subscribers
//!
//! # Examples
//!
//! ```rust,no_run
//! use hotswap_store::prelude::*;
//! use opentelemetry::global;
//!
//! # async fn example() -> Result<()> {
//! let store = HotswapStore::builder()
//!     .with_metrics(global::meter("my-app"))
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod store_metrics;

pub use store_metrics::StoreMetrics;
