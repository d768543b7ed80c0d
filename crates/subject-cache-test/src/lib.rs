//! Helpers for testing the subject cache and its coordinator.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - [`MockStorage`] counts every fetch it receives. Share it with the coordinator through an
//!    `Arc` and hold on to a clone to make assertions about the number of loads.
//!
//!  - The coordinator built by [`coordinator`] spawns its loads onto the current tokio runtime, so
//!    it has to be created from within a runtime.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use subject_cache::caching::{Entry, IdentityCache};
use subject_cache::coordinator::{LoadCoordinator, LoadError};
use subject_cache::services::{FallbackProvider, FetchReason, Storage};
use subject_cache::types::Identity;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `subject_cache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("subject_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A cached subject with a set of named permissions.
#[derive(Debug)]
pub struct TestSubject {
    identity: Identity,
    cleanup: AtomicBool,
    setups: AtomicUsize,
    permissions: Mutex<Option<BTreeMap<String, bool>>>,
}

impl TestSubject {
    pub fn new(identity: &Identity) -> Self {
        Self {
            identity: identity.clone(),
            cleanup: AtomicBool::new(false),
            setups: AtomicUsize::new(0),
            permissions: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Marks the subject as eligible for cleanup.
    pub fn set_cleanup(&self, cleanup: bool) {
        self.cleanup.store(cleanup, Ordering::SeqCst);
    }

    /// How often [`Entry::setup`] has been called on this subject.
    pub fn setups(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }

    pub fn populate(&self, permissions: BTreeMap<String, bool>) {
        *self.permissions.lock().unwrap() = Some(permissions);
    }

    pub fn permission(&self, name: &str) -> Option<bool> {
        self.permissions.lock().unwrap().as_ref()?.get(name).copied()
    }
}

impl Entry for TestSubject {
    fn display_name(&self) -> Option<String> {
        self.identity.name().map(Into::into)
    }

    fn should_cleanup(&self) -> bool {
        self.cleanup.load(Ordering::SeqCst)
    }

    fn setup(&self) {
        self.setups.fetch_add(1, Ordering::SeqCst);
    }

    fn has_data(&self) -> bool {
        self.permissions.lock().unwrap().is_some()
    }
}

/// Creates an empty cache of [`TestSubject`]s.
pub fn subject_cache() -> Arc<IdentityCache<TestSubject>> {
    Arc::new(IdentityCache::new(TestSubject::new))
}

/// What [`MockStorage`] does when asked to fetch a subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBehavior {
    /// Creates the entry and fills in the permissions.
    Populate,
    /// Creates the entry, but leaves its data empty.
    PopulateWithoutData,
    /// Reports an error without creating the entry.
    Fail,
    /// Reports success without creating the entry.
    Skip,
    /// Panics in the middle of the fetch.
    Panic,
}

/// An in-memory backing store.
#[derive(Debug)]
pub struct MockStorage {
    behavior: Mutex<StorageBehavior>,
    latency: Mutex<Duration>,
    permissions: BTreeMap<String, bool>,
    fetches: AtomicUsize,
    refreshes: AtomicUsize,
}

impl Default for MockStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStorage {
    pub fn new() -> Self {
        let permissions = BTreeMap::from([
            ("chat.send".to_owned(), true),
            ("world.build".to_owned(), false),
        ]);
        Self {
            behavior: Mutex::new(StorageBehavior::Populate),
            latency: Mutex::new(Duration::ZERO),
            permissions,
            fetches: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn with_behavior(self, behavior: StorageBehavior) -> Self {
        self.set_behavior(behavior);
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_behavior(&self, behavior: StorageBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// The number of fetches for [`FetchReason::Resolve`].
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// The number of fetches for [`FetchReason::Refresh`].
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl Storage<TestSubject> for MockStorage {
    fn fetch<'a>(
        &'a self,
        cache: &'a IdentityCache<TestSubject>,
        identity: &'a Identity,
        reason: FetchReason,
    ) -> BoxFuture<'a, Result<(), LoadError>> {
        Box::pin(async move {
            match reason {
                FetchReason::Resolve => self.fetches.fetch_add(1, Ordering::SeqCst),
                FetchReason::Refresh => self.refreshes.fetch_add(1, Ordering::SeqCst),
            };

            let latency = *self.latency.lock().unwrap();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            let behavior = *self.behavior.lock().unwrap();
            match behavior {
                StorageBehavior::Populate => {
                    cache
                        .get_or_load(identity)
                        .populate(self.permissions.clone());
                    Ok(())
                }
                StorageBehavior::PopulateWithoutData => {
                    cache.get_or_load(identity);
                    Ok(())
                }
                StorageBehavior::Fail => Err(LoadError::Storage("connection refused".into())),
                StorageBehavior::Skip => Ok(()),
                StorageBehavior::Panic => panic!("storage exploded while fetching {identity}"),
            }
        })
    }
}

/// The substitute handed out by [`TransientFallback`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransientSubject {
    pub key: String,
}

/// A [`FallbackProvider`] that counts how often it was asked for a substitute.
#[derive(Clone, Debug, Default)]
pub struct TransientFallback {
    calls: Arc<AtomicUsize>,
}

impl TransientFallback {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FallbackProvider for TransientFallback {
    type Substitute = TransientSubject;

    fn get(&self, key: &str) -> TransientSubject {
        self.calls.fetch_add(1, Ordering::SeqCst);
        TransientSubject {
            key: key.to_owned(),
        }
    }
}

/// Creates a coordinator over a fresh cache, loading from `storage` on the current runtime.
///
/// # Panics
///
/// Panics when called outside of a tokio runtime.
pub fn coordinator(
    storage: Arc<MockStorage>,
    fallback: TransientFallback,
) -> LoadCoordinator<TestSubject, TransientFallback> {
    LoadCoordinator::builder(subject_cache(), storage, fallback).build(Handle::current())
}
