use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use uuid::Uuid;

use subject_cache::coordinator::{FallbackReason, LoadCoordinator, Resolved};
use subject_cache::services::{IdentityTranslator, MappingTranslator};
use subject_cache::types::Identity;
use subject_cache_test::{
    MockStorage, StorageBehavior, TransientFallback, coordinator, setup, subject_cache,
};

#[tokio::test]
async fn test_concurrent_resolves_load_once() {
    setup();

    let storage = Arc::new(MockStorage::new().with_latency(Duration::from_millis(50)));
    let coordinator = coordinator(storage.clone(), TransientFallback::default());
    let key = Uuid::new_v4().to_string();

    let results = join_all((0..16).map(|_| coordinator.resolve(&key))).await;

    assert_eq!(storage.fetches(), 1);
    let first = results[0].entry().unwrap();
    for resolved in &results {
        assert!(Arc::ptr_eq(first, resolved.entry().unwrap()));
    }
    assert_eq!(first.setups(), 1);
    assert_eq!(first.permission("chat.send"), Some(true));
}

#[tokio::test]
async fn test_loaded_subjects_stay_cached() {
    setup();

    let storage = Arc::new(MockStorage::new());
    let coordinator = coordinator(storage.clone(), TransientFallback::default());
    let key = Uuid::new_v4().to_string();

    assert!(!coordinator.has_registered(&key));
    assert!(coordinator.get_loaded(&key).is_none());

    let first = coordinator.resolve(&key).await.into_entry().unwrap();
    assert!(coordinator.has_registered(&key));

    for _ in 0..10 {
        let again = coordinator.resolve(&key).await.into_entry().unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }
    let loaded = coordinator.get_loaded(&key).unwrap();
    assert!(Arc::ptr_eq(&first, &loaded));

    assert_eq!(storage.fetches(), 1);
    assert_eq!(first.setups(), 1);
}

#[tokio::test]
async fn test_unload_triggers_reload() {
    setup();

    let storage = Arc::new(MockStorage::new());
    let coordinator = coordinator(storage.clone(), TransientFallback::default());
    let id = Uuid::new_v4();
    let key = id.to_string();

    let first = coordinator.resolve(&key).await.into_entry().unwrap();
    coordinator.unload(&Identity::new(id));
    assert!(!coordinator.has_registered(&key));

    let second = coordinator.resolve(&key).await.into_entry().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.setups(), 1);
    assert_eq!(storage.fetches(), 2);

    let other = Uuid::new_v4().to_string();
    coordinator.resolve(&other).await;
    coordinator.unload_all();
    assert!(!coordinator.has_registered(&key));
    assert!(!coordinator.has_registered(&other));
    assert!(coordinator.cache().all_entries().is_empty());
}

#[tokio::test]
async fn test_malformed_keys() {
    setup();

    let storage = Arc::new(MockStorage::new());
    let fallback = TransientFallback::default();
    let coordinator = coordinator(storage.clone(), fallback.clone());

    for key in ["", "jeb_", "11111111-1111-1111-1111"] {
        match coordinator.resolve(key).await {
            Resolved::Fallback { substitute, reason } => {
                assert_eq!(substitute.key, key);
                assert_eq!(reason, FallbackReason::InvalidKey);
            }
            Resolved::Loaded(_) => panic!("{key:?} resolved to a subject"),
        }
        assert!(!coordinator.has_registered(key));
    }

    assert_eq!(storage.fetches(), 0);
    assert_eq!(fallback.calls(), 3);
    assert!(coordinator.cache().all_entries().is_empty());
}

#[tokio::test]
async fn test_keys_are_trimmed() {
    setup();

    let storage = Arc::new(MockStorage::new());
    let coordinator = coordinator(storage.clone(), TransientFallback::default());
    let key = Uuid::new_v4().to_string();

    let entry = coordinator.resolve(&key).await.into_entry().unwrap();
    let padded = coordinator
        .resolve(&format!("  {key}\n"))
        .await
        .into_entry()
        .unwrap();

    assert!(Arc::ptr_eq(&entry, &padded));
    assert_eq!(storage.fetches(), 1);
}

/// Refuses to translate a single external id.
struct Banned(Uuid);

impl IdentityTranslator for Banned {
    fn translate(&self, external: &Uuid) -> Option<Uuid> {
        (*external != self.0).then_some(*external)
    }
}

#[tokio::test]
async fn test_untranslatable_keys() {
    setup();

    let storage = Arc::new(MockStorage::new());
    let banned = Uuid::new_v4();
    let coordinator = LoadCoordinator::builder(
        subject_cache(),
        storage.clone(),
        TransientFallback::default(),
    )
    .translator(Arc::new(Banned(banned)))
    .build(tokio::runtime::Handle::current());

    let resolved = coordinator.resolve(&banned.to_string()).await;
    assert_eq!(
        resolved.fallback_reason(),
        Some(&FallbackReason::TranslationFailed)
    );
    assert!(!coordinator.has_registered(&banned.to_string()));
    assert_eq!(storage.fetches(), 0);

    assert!(coordinator.resolve(&Uuid::new_v4().to_string()).await.is_loaded());
    assert_eq!(storage.fetches(), 1);
}

#[tokio::test]
async fn test_keys_translating_to_one_identity() {
    setup();

    let storage = Arc::new(MockStorage::new().with_latency(Duration::from_millis(20)));
    let translator = Arc::new(MappingTranslator::new());
    let external = Uuid::new_v4();
    let internal = Uuid::new_v4();
    translator.register(external, internal);

    let coordinator = LoadCoordinator::builder(
        subject_cache(),
        storage.clone(),
        TransientFallback::default(),
    )
    .translator(translator)
    .build(tokio::runtime::Handle::current());

    let external_key = external.to_string();
    let internal_key = internal.to_string();
    let (by_external, by_internal) = futures::join!(
        coordinator.resolve(&external_key),
        coordinator.resolve(&internal_key),
    );

    // loads are deduplicated per raw key, so both keys trigger a fetch of the same subject
    assert_eq!(storage.fetches(), 2);
    let by_external = by_external.into_entry().unwrap();
    let by_internal = by_internal.into_entry().unwrap();
    assert!(Arc::ptr_eq(&by_external, &by_internal));
    assert_eq!(by_external.identity().id(), internal);
    assert_eq!(by_external.setups(), 2);

    assert!(coordinator.has_registered(&external_key));
    assert!(coordinator.has_registered(&internal_key));
    assert_eq!(coordinator.cache().all_entries().len(), 1);
}

#[tokio::test]
async fn test_subject_without_data() {
    setup();

    let storage =
        Arc::new(MockStorage::new().with_behavior(StorageBehavior::PopulateWithoutData));
    let coordinator = coordinator(storage.clone(), TransientFallback::default());
    let key = Uuid::new_v4().to_string();

    let entry = coordinator.resolve(&key).await.into_entry().unwrap();
    assert_eq!(entry.permission("chat.send"), None);
    assert_eq!(entry.setups(), 1);
}

#[tokio::test]
async fn test_refresh_all() {
    setup();

    let storage = Arc::new(MockStorage::new());
    let coordinator = coordinator(storage.clone(), TransientFallback::default());
    let online: Vec<_> = (0..3).map(|_| Uuid::new_v4()).collect();

    for id in &online[..2] {
        coordinator.resolve(&id.to_string()).await;
    }
    assert_eq!(storage.fetches(), 2);

    let ids = online.clone();
    let refreshed = coordinator.refresh_all(move || ids).await;
    assert_eq!(refreshed, Ok(3));
    assert_eq!(storage.refreshes(), 3);
    assert_eq!(storage.fetches(), 2);

    // refreshes populate subjects without running their setup
    let unseen = coordinator.get_loaded(&online[2].to_string()).unwrap();
    assert_eq!(unseen.permission("chat.send"), Some(true));
    assert_eq!(unseen.setups(), 0);

    storage.set_behavior(StorageBehavior::Fail);
    let refreshed = coordinator.refresh_all(move || online).await;
    assert_eq!(refreshed, Ok(0));
    assert_eq!(storage.refreshes(), 6);
}
