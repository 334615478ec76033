//! Behavioural properties of the in-memory store: atomicity, merge semantics,
//! validation rollback and cache consistency.

use hotswap_store::prelude::*;
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn pair(n: i64) -> Value {
    Value::from_iter([("left", n), ("right", n)])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_a_partial_commit() {
    let store = HotswapStore::builder()
        .with_defaults(Value::from_iter([("pair", pair(0))]))
        .with_cache_rebuild_delay(Duration::ZERO)
        .build()
        .await
        .unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let running = Arc::clone(&running);
            std::thread::spawn(move || {
                let mut reads = 0u64;
                while running.load(Ordering::Relaxed) {
                    let pair = store.get("pair").unwrap();
                    let map = pair.as_map().unwrap();
                    assert_eq!(map["left"], map["right"], "torn read: {pair}");

                    let snapshot = store.snapshot();
                    assert_eq!(snapshot.get("pair.left"), snapshot.get("pair.right"));
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for n in 1..=500 {
        store.set("pair", pair(n)).await.unwrap();
    }
    running.store(false, Ordering::Relaxed);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
}

#[tokio::test]
async fn test_prefix_replacement_leaves_siblings() {
    let store = HotswapStore::builder().build().await.unwrap();
    store.set("a.b.e", "old").await.unwrap();
    store.set("a.z", 26).await.unwrap();

    store.set("a.b", Value::from_iter([("c", 1), ("d", 2)])).await.unwrap();

    assert_eq!(store.get("a.b.c"), Some(Value::Integer(1)));
    assert_eq!(store.get("a.b.d"), Some(Value::Integer(2)));
    assert_eq!(store.get("a.b.e"), None);
    assert_eq!(store.get("a.z"), Some(Value::Integer(26)));
}

#[tokio::test]
async fn test_leaf_replaces_subtree_and_back() {
    let store = HotswapStore::builder().build().await.unwrap();
    store.set("db", Value::from_iter([("host", "h"), ("user", "u")])).await.unwrap();

    store.set("db", "sqlite://memory").await.unwrap();
    assert_eq!(store.get("db.host"), None);
    assert_eq!(store.get("db"), Some(Value::from("sqlite://memory")));

    store.set("db.host", "h2").await.unwrap();
    assert_eq!(store.get("db.host"), Some(Value::from("h2")));
}

#[tokio::test]
async fn test_validation_failure_leaves_state_untouched() {
    let store = HotswapStore::builder()
        .with_defaults(Value::from_iter([("server", Value::from_iter([("port", 8080)]))]))
        .with_validator(RuleSet::new("ports").rule(Rule::max("server.port", 65535)))
        .build()
        .await
        .unwrap();
    let before = store.snapshot();

    let err = store.set("server.port", 999_999).await.unwrap_err();
    match &err {
        ConfigError::Validation { validator, field, value, .. } => {
            assert_eq!(validator, "ports");
            assert_eq!(field, "server.port");
            assert_eq!(value.as_ref(), Some(&Value::Integer(999_999)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.get("server.port"), Some(Value::Integer(8080)));
    assert_eq!(*store.snapshot(), *before);
}

#[tokio::test]
async fn test_partial_update_does_not_cascade_required_failures() {
    let store = HotswapStore::builder()
        .with_defaults(Value::from_iter([(
            "db",
            Value::from_iter([("host", "db.internal")]),
        )]))
        .build()
        .await
        .unwrap();
    // Registered after build: the initial state is missing db.user.
    store.add_validator(
        RuleSet::new("database")
            .rule(Rule::required("db.host"))
            .rule(Rule::required("db.user"))
            .rule(Rule::format("db.host", hotswap_store::core::FieldFormat::Hostname)),
    );

    // db.user is still missing, but only db.host is being set.
    store.set("db.host", "new-host").await.unwrap();
    assert_eq!(store.get("db.host"), Some(Value::from("new-host")));

    // Other rules on the touched key still apply.
    assert!(store.set("db.host", "not a host!").await.is_err());

    let err = store.validate_all().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    assert!(err.to_string().contains("db.user"), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscribers_end_on_the_latest_commit() {
    let store = HotswapStore::builder()
        .with_defaults(Value::from_iter([("counter", 0)]))
        .build()
        .await
        .unwrap();

    let mirrored = Arc::new(std::sync::Mutex::new(None));
    let sink = Arc::clone(&mirrored);
    let _handle = store.subscribe(move |snapshot| {
        *sink.lock().unwrap() = snapshot.get("counter").cloned();
    });

    let writers: Vec<_> = (0..8i64)
        .map(|task| {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    store.set("counter", task * 1000 + i).await.unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let latest = store.snapshot().get("counter").cloned();
    assert!(latest.is_some());
    assert_eq!(*mirrored.lock().unwrap(), latest);
}

#[tokio::test]
async fn test_reads_stay_current_after_shutdown() {
    let store = HotswapStore::builder()
        .with_defaults(Value::from_iter([("server", Value::from_iter([("port", 8080)]))]))
        .with_cache_rebuild_delay(Duration::ZERO)
        .build()
        .await
        .unwrap();
    assert_eq!(store.get("server.port"), Some(Value::Integer(8080)));

    store.shutdown();
    store.set("server.port", 1).await.unwrap();
    assert_eq!(store.get("server.port"), Some(Value::Integer(1)));
    assert_eq!(store.snapshot().get("server.port"), Some(&Value::Integer(1)));
}

#[tokio::test]
async fn test_field_aware_validators_only_see_their_group() {
    let store = HotswapStore::builder()
        .with_validator(
            FnValidator::new("cache-only", |config| {
                if config.contains("server") {
                    return Err(ValidationError::custom("saw an unrelated group"));
                }
                Ok(())
            })
            .for_groups(["cache"]),
        )
        .build()
        .await
        .unwrap();

    store.set("server.port", 80).await.unwrap();
    store.set("cache.ttl", "30s").await.unwrap();
}

#[tokio::test]
async fn test_cache_converges_on_snapshot() {
    let store = HotswapStore::builder()
        .with_defaults(Value::from_iter([("k", "v0")]))
        .with_cache_rebuild_delay(Duration::from_millis(20))
        .build()
        .await
        .unwrap();

    for i in 1..=20 {
        store.set("k", format!("v{i}")).await.unwrap();
        // Until the rebuild lands, reads fall through to the snapshot.
        assert_eq!(store.get("k"), Some(Value::from(format!("v{i}"))));
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    let snapshot = store.snapshot();
    assert_eq!(store.get("k").as_ref(), snapshot.get("k"));
    assert_eq!(store.get("missing"), None);
}

#[tokio::test]
async fn test_disabled_cache_reads_snapshot() {
    let store = HotswapStore::builder()
        .with_cache(false)
        .build()
        .await
        .unwrap();
    store.set("x.y", 1).await.unwrap();
    assert_eq!(store.get("x.y"), Some(Value::Integer(1)));
    assert_eq!(store.get("x"), Some(Value::from_iter([("y", 1)])));
}

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::Integer),
        "[a-z]{0,8}".prop_map(Value::from),
    ]
}

fn tree() -> impl Strategy<Value = Value> {
    scalar().prop_recursive(3, 16, 4, |inner| {
        prop::collection::btree_map("[a-z]{1,4}", inner, 1..4).prop_map(Value::Map)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_set_is_idempotent(key in "[a-z]{1,4}(\\.[a-z]{1,4}){0,2}", value in tree()) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let store = HotswapStore::builder()
                .with_defaults(Value::from_iter([("keep", 1)]))
                .with_validator(FnValidator::new("accept", |_| Ok(())))
                .build()
                .await
                .unwrap();

            store.set(&key, value.clone()).await.unwrap();
            let once = store.snapshot();
            store.set(&key, value).await.unwrap();
            let twice = store.snapshot();

            assert_eq!(*once, *twice);
        });
    }
}
