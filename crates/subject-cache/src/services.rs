//! Interfaces to the collaborators of the [`LoadCoordinator`](crate::coordinator::LoadCoordinator).
//!
//! All of them are injected at construction time. Default implementations are provided for the
//! identity translation and the scheduling of background work.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::caching::{Entry, IdentityCache};
use crate::coordinator::LoadError;
use crate::types::Identity;

/// Maps an external subject id to the internal id used as cache key.
pub trait IdentityTranslator: Send + Sync {
    /// Returns the internal id, or `None` if the external id cannot be resolved.
    fn translate(&self, external: &Uuid) -> Option<Uuid>;
}

/// Uses external ids as internal ids unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughTranslator;

impl IdentityTranslator for PassthroughTranslator {
    fn translate(&self, external: &Uuid) -> Option<Uuid> {
        Some(*external)
    }
}

/// Translates external ids through a table of registered mappings.
///
/// Ids without a registered mapping translate to themselves.
#[derive(Debug, Default)]
pub struct MappingTranslator {
    mappings: RwLock<HashMap<Uuid, Uuid>>,
}

impl MappingTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, external: Uuid, internal: Uuid) {
        self.mappings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(external, internal);
    }

    pub fn unregister(&self, external: &Uuid) {
        self.mappings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(external);
    }
}

impl IdentityTranslator for MappingTranslator {
    fn translate(&self, external: &Uuid) -> Option<Uuid> {
        let mappings = self.mappings.read().unwrap_or_else(PoisonError::into_inner);
        Some(mappings.get(external).copied().unwrap_or(*external))
    }
}

/// Why the backing store is asked to fetch a subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FetchReason {
    /// A caller is waiting for the subject in [`resolve`](crate::coordinator::LoadCoordinator::resolve).
    Resolve,
    /// A bulk refresh of subjects that are already known.
    Refresh,
}

impl FetchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchReason::Resolve => "resolve",
            FetchReason::Refresh => "refresh",
        }
    }
}

impl fmt::Display for FetchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The backing store of subjects.
pub trait Storage<E: Entry>: Send + Sync {
    /// Fetches the subject for `identity` and populates its entry in `cache`.
    ///
    /// Implementations typically call [`IdentityCache::get_or_load`] and fill the returned entry
    /// with the loaded data. Returning `Ok` without having created an entry is reported as a
    /// failed load by the coordinator.
    fn fetch<'a>(
        &'a self,
        cache: &'a IdentityCache<E>,
        identity: &'a Identity,
        reason: FetchReason,
    ) -> BoxFuture<'a, Result<(), LoadError>>;
}

/// Executes work outside of the caller's control flow.
pub trait Scheduler: Send + Sync {
    /// Runs `job` in the background.
    fn run_async(&self, job: BoxFuture<'static, ()>);

    /// Runs `job` on the scheduler's synchronous context.
    fn run_sync(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

/// A [`Scheduler`] backed by a tokio runtime.
///
/// Asynchronous jobs are spawned onto the runtime. Synchronous jobs run on the calling thread.
#[derive(Clone, Debug)]
pub struct TokioScheduler {
    runtime: Handle,
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Creates a scheduler for the runtime this is called from.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }
}

impl Scheduler for TokioScheduler {
    fn run_async(&self, job: BoxFuture<'static, ()>) {
        self.runtime.spawn(job);
    }

    fn run_sync(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        job()
    }
}

/// Supplies a substitute whenever no real entry can be produced for a key.
pub trait FallbackProvider: Send + Sync {
    type Substitute;

    fn get(&self, key: &str) -> Self::Substitute;
}
