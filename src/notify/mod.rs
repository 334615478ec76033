//! Change notification: subscriber callbacks and file watching.
//!
//! Subscribers are always available; the file watcher needs the `file-watch` feature.

pub mod subscriber;

#[cfg(feature = "file-watch")]
pub mod watcher;

pub use subscriber::{SubscriberRegistry, SubscriptionHandle};

#[cfg(feature = "file-watch")]
pub use watcher::FileWatcher;
