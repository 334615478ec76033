//! File watching for automatic store reloads.

use crate::error::{ConfigError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Watches persisted configuration files and emits a debounced "changed" signal.
///
/// The parent directory is watched rather than the file itself, because the
/// file backend replaces files by renaming a temporary sibling over them.
/// Events for other files in that directory are ignored.
///
/// # Examples
///
/// ```rust,no_run
/// use hotswap_store::notify::FileWatcher;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (watcher, mut rx) = FileWatcher::new(Duration::from_millis(500))?;
/// watcher.watch("/path/to/config.yaml")?;
///
/// while let Some(()) = rx.recv().await {
///     println!("configuration file changed");
/// }
/// # Ok(())
/// # }
/// ```
pub struct FileWatcher {
    watcher: Mutex<RecommendedWatcher>,
    debounce_duration: Duration,
    watched_files: Arc<RwLock<Vec<PathBuf>>>,
}

impl FileWatcher {
    /// Create a watcher whose signal fires once events have been quiet for `debounce_duration`.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file watcher cannot be created.
    pub fn new(debounce_duration: Duration) -> Result<(Self, mpsc::Receiver<()>)> {
        let (tx, rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<()>();
        let watched_files: Arc<RwLock<Vec<PathBuf>>> = Arc::default();

        let filter = Arc::clone(&watched_files);
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                let files = filter.read();
                if event.paths.iter().any(|path| files.contains(path)) {
                    let _ = event_tx.send(());
                }
            }
            Err(e) => tracing::warn!(error = %e, "file watcher error"),
        })
        .map_err(|e| ConfigError::WatchError(format!("Failed to create file watcher: {e}")))?;

        tokio::spawn(async move {
            while event_rx.recv().await.is_some() {
                // Swallow the rest of the burst.
                loop {
                    match tokio::time::timeout(debounce_duration, event_rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        });

        Ok((
            Self {
                watcher: Mutex::new(watcher),
                debounce_duration,
                watched_files,
            },
            rx,
        ))
    }

    /// Start watching `path`. The file itself need not exist yet; its directory must.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be resolved or watched.
    pub fn watch(&self, path: impl AsRef<Path>) -> Result<()> {
        let (dir, file) = resolve(path.as_ref())?;

        self.watcher
            .lock()
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ConfigError::WatchError(format!("Failed to watch {}: {e}", dir.display()))
            })?;

        let mut files = self.watched_files.write();
        if !files.contains(&file) {
            files.push(file);
        }
        Ok(())
    }

    /// Stop watching `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be resolved or unwatched.
    pub fn unwatch(&self, path: impl AsRef<Path>) -> Result<()> {
        let (dir, file) = resolve(path.as_ref())?;

        let mut files = self.watched_files.write();
        files.retain(|p| p != &file);
        if !files.iter().any(|p| p.parent() == Some(dir.as_path())) {
            self.watcher
                .lock()
                .unwatch(&dir)
                .map_err(|e| {
                    ConfigError::WatchError(format!("Failed to unwatch {}: {e}", dir.display()))
                })?;
        }
        Ok(())
    }

    /// Get the debounce duration for this watcher.
    pub fn debounce_duration(&self) -> Duration {
        self.debounce_duration
    }

    /// Files currently watched, as resolved absolute paths.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.watched_files.read().clone()
    }
}

/// Canonical parent directory plus the absolute file path inside it.
fn resolve(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let name = path
        .file_name()
        .ok_or_else(|| ConfigError::WatchError(format!("{} has no file name", path.display())))?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let dir = parent.canonicalize().map_err(|e| {
        ConfigError::WatchError(format!("Failed to resolve {}: {e}", parent.display()))
    })?;
    let file = dir.join(name);
    Ok((dir, file))
}
