//! Durable storage backends.

use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Durable storage for the serialized configuration.
///
/// Writes must replace the stored bytes as a whole: a failed write leaves the
/// previously stored bytes intact.
pub trait StorageBackend: Send + Sync {
    /// Read the stored bytes, or `None` if nothing has been stored yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the location exists but cannot be read.
    fn read(&self) -> io::Result<Option<Vec<u8>>>;

    /// Replace the stored bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes could not be written durably.
    fn write(&self, bytes: &[u8]) -> io::Result<()>;

    /// Human-readable location for logs and errors.
    fn location(&self) -> String;

    /// Filesystem path to watch for external changes, if any.
    fn watch_path(&self) -> Option<PathBuf> {
        None
    }
}

impl<T: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<T> {
    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        (**self).read()
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        (**self).write(bytes)
    }

    fn location(&self) -> String {
        (**self).location()
    }

    fn watch_path(&self) -> Option<PathBuf> {
        (**self).watch_path()
    }
}

/// File backend at `{dir}/{name}.{ext}`.
///
/// Before each overwrite the existing file is copied to
/// `{file}.backup.{timestamp}` (best-effort); only the newest backups are kept.
/// New contents go to a temporary sibling first and are renamed into place.
///
/// # Examples
///
/// ```rust,no_run
/// use hotswap_store::persist::{FileBackend, StorageBackend};
///
/// let backend = FileBackend::new("/etc/myapp/app.yaml").with_backup_limit(3);
/// backend.write(b"port: 8080\n").unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
    backup_limit: usize,
}

impl FileBackend {
    /// Backend for an explicit file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_limit: 5,
        }
    }

    /// Backend for `{dir}/{name}.{extension}`.
    pub fn in_dir(dir: impl AsRef<Path>, name: &str, extension: &str) -> Self {
        Self::new(dir.as_ref().join(format!("{name}.{extension}")))
    }

    /// Keep at most `limit` backups (0 disables backups).
    pub fn with_backup_limit(mut self, limit: usize) -> Self {
        self.backup_limit = limit;
        self
    }

    /// The file this backend writes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Existing backups, oldest first.
    pub fn backups(&self) -> Vec<PathBuf> {
        let Some(dir) = self.path.parent() else {
            return Vec::new();
        };
        let prefix = format!("{}.backup.", self.file_name());
        let mut backups: Vec<PathBuf> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|path| {
                        path.file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.starts_with(&prefix))
                    })
                    .collect()
            })
            .unwrap_or_default();
        // Timestamps are fixed-width, so lexical order is chronological.
        backups.sort();
        backups
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn backup_existing(&self) {
        if self.backup_limit == 0 || !self.path.exists() {
            return;
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.9fZ");
        let backup = self
            .path
            .with_file_name(format!("{}.backup.{stamp}", self.file_name()));
        if let Err(e) = fs::copy(&self.path, &backup) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to back up configuration file"
            );
            return;
        }

        let backups = self.backups();
        let excess = backups.len().saturating_sub(self.backup_limit);
        for old in &backups[..excess] {
            if let Err(e) = fs::remove_file(old) {
                tracing::warn!(path = %old.display(), error = %e, "failed to prune old backup");
            }
        }
    }
}

impl StorageBackend for FileBackend {
    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        self.backup_existing();

        let tmp = self.path.with_file_name(format!(".{}.tmp", self.file_name()));
        if let Err(e) = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, &self.path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn watch_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}
