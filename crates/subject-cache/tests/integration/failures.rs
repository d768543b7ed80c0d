use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use subject_cache::coordinator::{FallbackReason, LoadError, Resolved};
use subject_cache_test::{MockStorage, StorageBehavior, TransientFallback, coordinator, setup};

#[tokio::test(start_paused = true)]
async fn test_slow_loads_fall_back() {
    setup();

    let storage = Arc::new(MockStorage::new().with_latency(Duration::from_secs(60)));
    let fallback = TransientFallback::default();
    let coordinator = coordinator(storage.clone(), fallback.clone());
    let key = Uuid::new_v4().to_string();

    let start = Instant::now();
    let (first, second) = futures::join!(coordinator.resolve(&key), coordinator.resolve(&key));
    let waited = start.elapsed();

    assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11));
    for resolved in [first, second] {
        match resolved {
            Resolved::Fallback { substitute, reason } => {
                assert_eq!(substitute.key, key);
                assert_eq!(reason, FallbackReason::TimedOut(Duration::from_secs(10)));
            }
            Resolved::Loaded(_) => panic!("slow load resolved within the timeout"),
        }
    }
    assert_eq!(fallback.calls(), 2);
    assert!(!coordinator.has_registered(&key));

    // the load keeps running in the background and populates the cache eventually
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(coordinator.has_registered(&key));

    let start = Instant::now();
    let entry = coordinator.resolve(&key).await.into_entry().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(entry.setups(), 1);
    assert_eq!(storage.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_callers_join_running_load() {
    setup();

    let storage = Arc::new(MockStorage::new().with_latency(Duration::from_secs(15)));
    let coordinator = coordinator(storage.clone(), TransientFallback::default());
    let key = Uuid::new_v4().to_string();

    let resolved = coordinator.resolve(&key).await;
    assert!(matches!(
        resolved.fallback_reason(),
        Some(FallbackReason::TimedOut(_))
    ));

    // 10s into a 15s load, a new caller only has to wait for the remainder
    let start = Instant::now();
    let resolved = coordinator.resolve(&key).await;
    assert!(resolved.is_loaded());
    assert!(start.elapsed() <= Duration::from_secs(6));
    assert_eq!(storage.fetches(), 1);
}

#[tokio::test]
async fn test_failed_loads_are_retried() {
    setup();

    let storage = Arc::new(MockStorage::new().with_behavior(StorageBehavior::Fail));
    let coordinator = coordinator(storage.clone(), TransientFallback::default());
    let key = Uuid::new_v4().to_string();

    let resolved = coordinator.resolve(&key).await;
    assert_eq!(
        resolved.fallback_reason(),
        Some(&FallbackReason::LoadFailed(LoadError::Storage(
            "connection refused".into()
        )))
    );
    assert!(!coordinator.has_registered(&key));

    storage.set_behavior(StorageBehavior::Populate);
    assert!(coordinator.resolve(&key).await.is_loaded());
    assert_eq!(storage.fetches(), 2);
}

#[tokio::test]
async fn test_load_without_entry() {
    setup();

    let storage = Arc::new(MockStorage::new().with_behavior(StorageBehavior::Skip));
    let coordinator = coordinator(storage.clone(), TransientFallback::default());
    let key = Uuid::new_v4().to_string();

    let resolved = coordinator.resolve(&key).await;
    assert_eq!(
        resolved.fallback_reason(),
        Some(&FallbackReason::LoadFailed(LoadError::Missing))
    );
    assert!(coordinator.cache().all_entries().is_empty());
}

#[tokio::test]
async fn test_panicking_load() {
    setup();

    let storage = Arc::new(MockStorage::new().with_behavior(StorageBehavior::Panic));
    let coordinator = coordinator(storage.clone(), TransientFallback::default());
    let key = Uuid::new_v4().to_string();

    let resolved = coordinator.resolve(&key).await;
    assert_eq!(
        resolved.fallback_reason(),
        Some(&FallbackReason::LoadFailed(LoadError::Aborted))
    );

    // the aborted load must not block the key
    storage.set_behavior(StorageBehavior::Populate);
    let entry = coordinator.resolve(&key).await.into_entry().unwrap();
    assert_eq!(entry.setups(), 1);
    assert_eq!(storage.fetches(), 2);
}
