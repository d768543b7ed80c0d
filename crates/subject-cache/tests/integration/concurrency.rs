use std::sync::{Arc, Barrier};
use std::time::Duration;

use uuid::Uuid;

use subject_cache::coordinator::FallbackReason;
use subject_cache::types::Identity;
use subject_cache_test::{MockStorage, TransientFallback, coordinator, setup};

const KEY: &str = "11111111-1111-1111-1111-111111111111";

#[test]
fn test_blocking_resolves_from_many_threads() {
    setup();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let storage = Arc::new(MockStorage::new().with_latency(Duration::from_millis(200)));
    let coordinator = {
        let _guard = runtime.enter();
        coordinator(storage.clone(), TransientFallback::default())
    };

    let barrier = Arc::new(Barrier::new(5));
    let threads: Vec<_> = (0..5)
        .map(|_| {
            let coordinator = coordinator.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                coordinator.resolve_blocking(KEY)
            })
        })
        .collect();

    let entries: Vec<_> = threads
        .into_iter()
        .map(|thread| thread.join().unwrap().into_entry().unwrap())
        .collect();

    assert_eq!(storage.fetches(), 1);
    for entry in &entries {
        assert!(Arc::ptr_eq(&entries[0], entry));
    }
    assert_eq!(entries[0].identity().id(), Uuid::parse_str(KEY).unwrap());
    assert_eq!(entries[0].setups(), 1);
    assert_eq!(coordinator.cache().all_entries().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalidation_races_with_loads() {
    setup();

    let storage = Arc::new(MockStorage::new());
    let coordinator = coordinator(storage.clone(), TransientFallback::default());
    let ids: Vec<_> = (0..4).map(|_| Uuid::new_v4()).collect();

    let mut tasks = Vec::new();
    for worker in 0..4 {
        let coordinator = coordinator.clone();
        let ids = ids.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..200 {
                let id = ids[(worker + round) % ids.len()];
                let resolved = coordinator.resolve(&id.to_string()).await;
                if let Some(reason) = resolved.fallback_reason() {
                    // losing against an invalidation is fine, anything else is not
                    assert!(
                        matches!(
                            reason,
                            FallbackReason::Missing | FallbackReason::LoadFailed(_)
                        ),
                        "unexpected fallback: {reason}"
                    );
                }
            }
        }));
    }
    {
        let coordinator = coordinator.clone();
        let ids = ids.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..200 {
                coordinator.unload(&Identity::new(ids[round % ids.len()]));
                if round % 50 == 0 {
                    coordinator.unload_all();
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    {
        let coordinator = coordinator.clone();
        let scanner = coordinator.cleanup_scanner();
        let ids = ids.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..200 {
                if let Some(entry) = coordinator.get_loaded(&ids[round % ids.len()].to_string()) {
                    entry.set_cleanup(round % 3 == 0);
                }
                scanner.sweep();
                tokio::task::yield_now().await;
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    // let loads that were still in flight settle
    tokio::time::sleep(Duration::from_millis(50)).await;

    for id in &ids {
        let entry = coordinator.resolve(&id.to_string()).await.into_entry().unwrap();
        assert!(entry.setups() >= 1);
    }
}
