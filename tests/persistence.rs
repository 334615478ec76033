//! End-to-end persistence: flushing, rollback, encryption, reload and watching.

use hotswap_store::prelude::*;
use std::fs;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Backend that counts writes and fails on demand.
#[derive(Default)]
struct FlakyBackend {
    data: parking_lot::Mutex<Option<Vec<u8>>>,
    writes: AtomicUsize,
    fail: AtomicBool,
}

impl StorageBackend for FlakyBackend {
    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.data.lock().clone())
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only volume"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.data.lock() = Some(bytes.to_vec());
        Ok(())
    }

    fn location(&self) -> String {
        "flaky://test".to_string()
    }
}

fn server(port: i64) -> Value {
    Value::from_iter([("server", Value::from_iter([("port", port)]))])
}

#[tokio::test]
async fn test_rejected_port_keeps_previous_value() {
    let temp_dir = TempDir::new().unwrap();
    let store = HotswapStore::builder()
        .with_defaults(server(8080))
        .with_location(temp_dir.path(), "app", StorageFormat::Ini)
        .with_flush_delay(Duration::ZERO)
        .with_validator(RuleSet::new("ports").rule(Rule::range("server.port", 1, 65535)))
        .build()
        .await
        .unwrap();

    assert!(store.set("server.port", 70000).await.is_err());
    assert_eq!(store.get("server.port"), Some(Value::Integer(8080)));
    // Nothing was written for the rejected change.
    assert!(!temp_dir.path().join("app.ini").exists());
}

#[tokio::test]
async fn test_synchronous_write_failure_rolls_back() {
    let backend = Arc::new(FlakyBackend::default());
    let store = HotswapStore::builder()
        .with_backend(Arc::clone(&backend), StorageFormat::Ini)
        .with_flush_delay(Duration::ZERO)
        .build()
        .await
        .unwrap();

    store.set("k", "v1").await.unwrap();
    assert_eq!(backend.writes.load(Ordering::SeqCst), 1);

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    let _handle = store.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    backend.fail.store(true, Ordering::SeqCst);
    let err = store.set("k", "v2").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PersistenceFailure);
    assert!(matches!(
        &err,
        ConfigError::Persistence { source, .. } if source.kind() == io::ErrorKind::PermissionDenied
    ));

    assert_eq!(store.get("k"), Some(Value::from("v1")));
    assert_eq!(notified.load(Ordering::SeqCst), 0);
    assert_eq!(store.persistence_status().unwrap().consecutive_failures, 1);
}

#[tokio::test]
async fn test_debounced_writes_coalesce() {
    let backend = Arc::new(FlakyBackend::default());
    let store = HotswapStore::builder()
        .with_backend(Arc::clone(&backend), StorageFormat::Ini)
        .with_flush_delay(Duration::from_millis(50))
        .build()
        .await
        .unwrap();

    for i in 0..20 {
        store.set("counter", i).await.unwrap();
    }
    assert_eq!(backend.writes.load(Ordering::SeqCst), 0);
    assert!(store.persistence_status().unwrap().dirty);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(backend.writes.load(Ordering::SeqCst), 1);

    let written = String::from_utf8(backend.data.lock().clone().unwrap()).unwrap();
    assert!(written.contains("counter = 19"), "{written}");
}

#[tokio::test]
async fn test_async_failure_keeps_memory_and_recovers() {
    let backend = Arc::new(FlakyBackend::default());
    backend.fail.store(true, Ordering::SeqCst);
    let store = HotswapStore::builder()
        .with_backend(Arc::clone(&backend), StorageFormat::Ini)
        .with_flush_delay(Duration::from_millis(20))
        .build()
        .await
        .unwrap();

    // Debounced mode accepts the change; the failure shows up in status only.
    store.set("k", "v").await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.get("k"), Some(Value::from("v")));
    assert!(store.persistence_status().unwrap().consecutive_failures >= 1);

    backend.fail.store(false, Ordering::SeqCst);
    store.flush().await.unwrap();
    assert_eq!(store.persistence_status().unwrap().consecutive_failures, 0);
}

#[tokio::test]
async fn test_backup_before_overwrite() {
    let temp_dir = TempDir::new().unwrap();
    let store = HotswapStore::builder()
        .with_location(temp_dir.path().join("nested"), "app", StorageFormat::Dotenv)
        .with_flush_delay(Duration::ZERO)
        .build()
        .await
        .unwrap();

    store.set("server.port", 1).await.unwrap();
    store.set("server.port", 2).await.unwrap();

    let backend = FileBackend::in_dir(temp_dir.path().join("nested"), "app", "env");
    let backups = backend.backups();
    assert_eq!(backups.len(), 1);
    assert_eq!(fs::read_to_string(&backups[0]).unwrap().trim(), "SERVER__PORT=1");
    assert_eq!(
        fs::read_to_string(backend.path()).unwrap().trim(),
        "SERVER__PORT=2"
    );
}

#[cfg(feature = "encryption")]
#[tokio::test]
async fn test_encrypted_store_reopens_with_exported_key() {
    let temp_dir = TempDir::new().unwrap();
    let store = HotswapStore::builder()
        .with_location(temp_dir.path(), "secrets", StorageFormat::Ini)
        .with_encryption(ChaChaProvider::generate())
        .build()
        .await
        .unwrap();

    store.set("secret.key", "abc").await.unwrap();
    store.flush().await.unwrap();
    let exported = store.export_key().unwrap();
    store.shutdown();

    let raw = fs::read(temp_dir.path().join("secrets.ini")).unwrap();
    assert!(!String::from_utf8_lossy(&raw).contains("abc"));

    let reopened = HotswapStore::builder()
        .with_location(temp_dir.path(), "secrets", StorageFormat::Ini)
        .with_encryption(ChaChaProvider::import_key(&exported).unwrap())
        .require_encryption(true)
        .build()
        .await
        .unwrap();
    assert_eq!(reopened.get("secret.key"), Some(Value::from("abc")));

    let wrong_key = HotswapStore::builder()
        .with_location(temp_dir.path(), "secrets", StorageFormat::Ini)
        .with_encryption_key(b"not the key")
        .build()
        .await
        .unwrap_err();
    assert_eq!(wrong_key.kind(), ErrorKind::DecryptionFailure);

    let no_key = HotswapStore::builder()
        .with_location(temp_dir.path(), "secrets", StorageFormat::Ini)
        .build()
        .await
        .unwrap_err();
    assert_eq!(no_key.kind(), ErrorKind::DecryptionFailure);
}

#[tokio::test]
async fn test_reload_publishes_external_edit() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("app.ini");
    fs::write(&path, "[server]\nport = 8080\n").unwrap();

    let store = HotswapStore::builder()
        .with_file(&path)
        .with_validator(RuleSet::new("ports").rule(Rule::range("server.port", 1, 65535)))
        .build()
        .await
        .unwrap();

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    let _handle = store.subscribe(move |snapshot| {
        seen_clone.lock().push(snapshot.get("server.port").cloned());
    });

    fs::write(&path, "[server]\nport = 9090\n").unwrap();
    store.reload().await.unwrap();
    assert_eq!(store.get("server.port"), Some(Value::Integer(9090)));

    // Unchanged file: no notification.
    store.reload().await.unwrap();
    assert_eq!(*seen.lock(), vec![Some(Value::Integer(9090))]);
}

#[tokio::test]
async fn test_failed_reload_keeps_last_good_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("app.ini");
    fs::write(&path, "[server]\nport = 8080\n").unwrap();

    let store = HotswapStore::builder()
        .with_file(&path)
        .with_validator(RuleSet::new("ports").rule(Rule::range("server.port", 1, 65535)))
        .build()
        .await
        .unwrap();

    fs::write(&path, "[server]\nport = 123456\n").unwrap();
    let err = store.reload().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    assert_eq!(store.get("server.port"), Some(Value::Integer(8080)));

    fs::write(&path, "[server\nport = 1\n").unwrap();
    let err = store.reload().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FormatFailure);
    assert_eq!(store.get("server.port"), Some(Value::Integer(8080)));
}

#[tokio::test]
async fn test_reload_skipped_while_changes_pending() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("app.ini");
    fs::write(&path, "k = 1\n").unwrap();

    let store = HotswapStore::builder()
        .with_file(&path)
        .with_flush_delay(Duration::from_secs(60))
        .build()
        .await
        .unwrap();

    store.set("k", 2).await.unwrap();
    store.reload().await.unwrap();
    assert_eq!(store.get("k"), Some(Value::Integer(2)));
    store.shutdown();
}

#[tokio::test]
async fn test_unencodable_value_rejected_before_commit() {
    let temp_dir = TempDir::new().unwrap();
    let store = HotswapStore::builder()
        .with_defaults(server(8080))
        .with_location(temp_dir.path(), "app", StorageFormat::Ini)
        .with_flush_delay(Duration::from_millis(50))
        .build()
        .await
        .unwrap();

    let replicas = Value::from(vec![
        Value::from_iter([("host", "a")]),
        Value::from_iter([("host", "b")]),
    ]);
    let err = store.set("replicas", replicas).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FormatFailure);
    assert_eq!(store.get("replicas"), None);
    assert!(!store.persistence_status().unwrap().dirty);

    // Plain lists still go through.
    store.set("tags", vec!["a", "b"]).await.unwrap();
    store.flush().await.unwrap();
    store.shutdown();
}

#[tokio::test]
async fn test_debounced_store_rejects_writes_after_shutdown() {
    let temp_dir = TempDir::new().unwrap();
    let store = HotswapStore::builder()
        .with_defaults(server(8080))
        .with_location(temp_dir.path(), "app", StorageFormat::Ini)
        .with_flush_delay(Duration::from_millis(50))
        .build()
        .await
        .unwrap();

    store.shutdown();
    let err = store.set("server.port", 9090).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PersistenceFailure);
    assert_eq!(store.get("server.port"), Some(Value::Integer(8080)));
}

#[cfg(feature = "file-watch")]
#[tokio::test]
async fn test_watch_reloads_on_file_change() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("app.ini");
    fs::write(&path, "[server]\nport = 8080\n").unwrap();

    let store = HotswapStore::builder()
        .with_file(&path)
        .with_flush_delay(Duration::ZERO)
        .build()
        .await
        .unwrap();
    store.watch(Duration::from_millis(50)).unwrap();
    assert!(store.is_watching());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _handle = store.subscribe(move |snapshot| {
        let _ = tx.send(snapshot.get("server.port").cloned());
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    fs::write(&path, "[server]\nport = 9090\n").unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .unwrap();
    assert_eq!(seen, Some(Some(Value::Integer(9090))));
    assert_eq!(store.get("server.port"), Some(Value::Integer(9090)));

    store.shutdown();
    assert!(!store.is_watching());
}

async fn round_trip(format: StorageFormat) {
    let temp_dir = TempDir::new().unwrap();
    let tree = Value::from_iter([
        ("app", Value::from_iter([("name", Value::from("demo")), ("debug", Value::from(true))])),
        (
            "server",
            Value::from_iter([
                ("port", Value::from(8080)),
                ("ratio", Value::from(0.5)),
                ("tags", Value::from(vec!["a", "b"])),
            ]),
        ),
    ]);

    let store = HotswapStore::builder()
        .with_defaults(tree)
        .with_location(temp_dir.path(), "app", format)
        .with_flush_delay(Duration::ZERO)
        .build()
        .await
        .unwrap();
    store.set("server.port", 9000).await.unwrap();

    let reopened = HotswapStore::builder()
        .with_location(temp_dir.path(), "app", format)
        .build()
        .await
        .unwrap();
    assert_eq!(*reopened.snapshot(), *store.snapshot(), "{format:?}");
}

#[tokio::test]
async fn test_every_format_reopens_identically() {
    round_trip(StorageFormat::Ini).await;
    round_trip(StorageFormat::Dotenv).await;
    #[cfg(feature = "yaml")]
    round_trip(StorageFormat::Yaml).await;
    #[cfg(feature = "json")]
    round_trip(StorageFormat::Json).await;
    #[cfg(feature = "toml")]
    round_trip(StorageFormat::Toml).await;
}
