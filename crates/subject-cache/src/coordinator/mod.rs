//! Single-flight loading of subjects with a bounded wait.
//!
//! Every external key is in one of three states: *idle* (neither cached nor loading), *loading*
//! (a [`LoadToken`] is registered for the key) or *ready* (the entry is cached). The first
//! [`resolve`](LoadCoordinator::resolve) for an idle key registers a token and starts a background
//! load, every later call for the same key joins that token until the load has finished. Callers
//! wait for the token outside of the coordinator lock and give up after the configured timeout.
//!
//! In-flight loads are tracked by the *raw* external key, not by the internal identity it
//! translates to. Two different keys that translate to the same identity may therefore load it
//! concurrently; the cache still holds at most one entry for it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use tokio::runtime::{Handle, RuntimeFlavor};
use uuid::Uuid;

use crate::caching::{CleanupScanner, Entry, IdentityCache};
use crate::config::{Config, DEFAULT_LOAD_TIMEOUT};
use crate::services::{
    FallbackProvider, FetchReason, IdentityTranslator, PassthroughTranslator, Scheduler, Storage,
    TokioScheduler,
};
use crate::types::{Identity, parse_key};
use crate::utils::defer;

mod error;
mod token;

pub use error::{FallbackReason, LoadError};
pub use token::LoadOutcome;

use token::{LoadCompleter, LoadToken};

/// What a caller of [`LoadCoordinator::resolve`] receives.
#[derive(Debug)]
pub enum Resolved<E, S> {
    /// The cached entry. Its data may be incomplete, see [`Entry::has_data`].
    Loaded(Arc<E>),
    /// A substitute from the [`FallbackProvider`], along with the reason why no entry was
    /// available.
    Fallback { substitute: S, reason: FallbackReason },
}

impl<E, S> Resolved<E, S> {
    pub fn entry(&self) -> Option<&Arc<E>> {
        match self {
            Resolved::Loaded(entry) => Some(entry),
            Resolved::Fallback { .. } => None,
        }
    }

    pub fn into_entry(self) -> Option<Arc<E>> {
        match self {
            Resolved::Loaded(entry) => Some(entry),
            Resolved::Fallback { .. } => None,
        }
    }

    pub fn fallback_reason(&self) -> Option<&FallbackReason> {
        match self {
            Resolved::Loaded(_) => None,
            Resolved::Fallback { reason, .. } => Some(reason),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Resolved::Loaded(_))
    }
}

/// The loads currently in flight, keyed by the raw external key.
#[derive(Debug, Default)]
struct PendingLoads {
    tokens: HashMap<String, LoadToken>,
    next_load_id: u64,
}

/// The outcome of the decision step, taken under the coordinator lock.
enum Decision<E> {
    /// The entry is cached and nothing is loading.
    Ready(Arc<E>),
    /// Nothing is cached or loading, the caller has to start the load.
    Start(LoadToken, LoadCompleter),
    /// A load is in flight.
    Join(LoadToken),
}

/// Resolves external keys to cached subjects, loading them from [`Storage`] on demand.
///
/// See the [module docs](self) for the protocol.
pub struct LoadCoordinator<E: Entry, F: FallbackProvider> {
    cache: Arc<IdentityCache<E>>,
    translator: Arc<dyn IdentityTranslator>,
    storage: Arc<dyn Storage<E>>,
    scheduler: Arc<dyn Scheduler>,
    fallback: Arc<F>,
    /// Guards the decision step, and nothing else.
    pending: Arc<Mutex<PendingLoads>>,
    load_timeout: Duration,
    runtime: Handle,
}

impl<E: Entry, F: FallbackProvider> Clone for LoadCoordinator<E, F> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            translator: Arc::clone(&self.translator),
            storage: Arc::clone(&self.storage),
            scheduler: Arc::clone(&self.scheduler),
            fallback: Arc::clone(&self.fallback),
            pending: Arc::clone(&self.pending),
            load_timeout: self.load_timeout,
            runtime: self.runtime.clone(),
        }
    }
}

impl<E: Entry, F: FallbackProvider> fmt::Debug for LoadCoordinator<E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self
            .pending
            .try_lock()
            .map(|p| p.tokens.len())
            .unwrap_or_default();
        f.debug_struct("LoadCoordinator")
            .field("cache", &self.cache)
            .field("pending loads", &pending)
            .field("load_timeout", &self.load_timeout)
            .finish()
    }
}

impl<E: Entry, F: FallbackProvider> LoadCoordinator<E, F> {
    pub fn builder(
        cache: Arc<IdentityCache<E>>,
        storage: Arc<dyn Storage<E>>,
        fallback: F,
    ) -> LoadCoordinatorBuilder<E, F> {
        LoadCoordinatorBuilder {
            cache,
            storage,
            fallback,
            translator: None,
            scheduler: None,
            load_timeout: DEFAULT_LOAD_TIMEOUT,
        }
    }

    pub fn cache(&self) -> &Arc<IdentityCache<E>> {
        &self.cache
    }

    /// Creates a [`CleanupScanner`] for the cache of this coordinator.
    pub fn cleanup_scanner(&self) -> CleanupScanner<E> {
        CleanupScanner::new(Arc::clone(&self.cache))
    }

    pub fn load_timeout(&self) -> Duration {
        self.load_timeout
    }

    /// Resolves `key` to its cached entry, loading it if necessary.
    ///
    /// This never fails: if no entry can be produced in time, the [`FallbackProvider`]'s
    /// substitute is returned together with the reason. Waiting is bounded by the configured load
    /// timeout, after which the load continues in the background.
    pub async fn resolve(&self, key: &str) -> Resolved<E, F::Substitute> {
        let start = Instant::now();
        let resolved = self.resolve_inner(key).await;

        let result = match &resolved {
            Resolved::Loaded(_) => "loaded",
            Resolved::Fallback { reason, .. } => match reason {
                FallbackReason::InvalidKey | FallbackReason::TranslationFailed => "invalid",
                FallbackReason::TimedOut(_) => "timeout",
                FallbackReason::LoadFailed(_) | FallbackReason::Missing => "fallback",
            },
        };
        metric!(counter("subjects.resolve") += 1, "result" => result);
        metric!(timer("subjects.resolve.duration") = start.elapsed(), "result" => result);

        resolved
    }

    /// Blocking version of [`resolve`](Self::resolve) for callers outside of the runtime.
    ///
    /// The coordinator has to run on a multi-thread runtime, whose workers drive the load and the
    /// wait bound while the calling thread is blocked.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context, or when the coordinator
    /// was built for a current-thread runtime.
    pub fn resolve_blocking(&self, key: &str) -> Resolved<E, F::Substitute> {
        // Nothing drives a current-thread runtime while we block on its handle, so the load and
        // the timeout would never make progress.
        assert!(
            self.runtime.runtime_flavor() != RuntimeFlavor::CurrentThread,
            "resolve_blocking requires a multi-thread runtime"
        );
        self.runtime.block_on(self.resolve(key))
    }

    async fn resolve_inner(&self, key: &str) -> Resolved<E, F::Substitute> {
        let Some(external) = parse_key(key) else {
            tracing::warn!(key, "Couldn't get subject for key (not a uuid)");
            return self.fall_back(key, FallbackReason::InvalidKey);
        };
        let Some(internal) = self.translator.translate(&external) else {
            tracing::warn!(key, "Couldn't get subject for key (no internal identity)");
            return self.fall_back(key, FallbackReason::TranslationFailed);
        };
        let identity = Identity::new(internal);

        let token = match self.decide(key, &identity) {
            Decision::Ready(entry) => return Resolved::Loaded(entry),
            Decision::Start(token, completer) => {
                self.spawn_load(key.to_owned(), identity.clone(), token.load_id(), completer);
                token
            }
            Decision::Join(token) => token,
        };

        let outcome = token.wait(self.load_timeout).await;

        match self.cache.get_if_present(&identity) {
            Some(entry) => {
                if !entry.has_data() {
                    tracing::warn!(key, "Subject data not present for requested key");
                }
                Resolved::Loaded(entry)
            }
            None => {
                let reason = match outcome {
                    None => FallbackReason::TimedOut(self.load_timeout),
                    Some(Err(err)) => FallbackReason::LoadFailed(err),
                    Some(Ok(())) => FallbackReason::Missing,
                };
                tracing::warn!(key, %reason, "Failed to load subject");
                self.fall_back(key, reason)
            }
        }
    }

    /// Decides whether the caller can use the cached entry, or has to start or join a load.
    ///
    /// Reading the state and registering a new token happen under one lock, so that exactly one
    /// caller starts a load for a key.
    fn decide(&self, key: &str, identity: &Identity) -> Decision<E> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        // A load registered for the key may belong to a cycle that started before the entry was
        // cached, so it takes precedence over a cached entry.
        if let Some(token) = pending.tokens.get(key) {
            return Decision::Join(token.clone());
        }
        if let Some(entry) = self.cache.get_if_present(identity) {
            return Decision::Ready(entry);
        }

        let load_id = pending.next_load_id;
        pending.next_load_id += 1;
        let (token, completer) = LoadToken::new(load_id);
        pending.tokens.insert(key.to_owned(), token.clone());

        Decision::Start(token, completer)
    }

    /// Hands the load of `identity` to the scheduler.
    ///
    /// Whichever way the job ends, its token is completed and unregistered from `key`, provided
    /// that `key` still maps to this load.
    fn spawn_load(&self, key: String, identity: Identity, load_id: u64, completer: LoadCompleter) {
        let cache = Arc::clone(&self.cache);
        let storage = Arc::clone(&self.storage);
        let pending = Arc::clone(&self.pending);

        tracing::trace!(%key, load_id, "Spawning subject load");

        // Must live outside of the job: a job dropped before its first poll still unregisters.
        let done = defer(move || {
            let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending
                .tokens
                .get(&key)
                .is_some_and(|token| token.load_id() == load_id)
            {
                pending.tokens.remove(&key);
            }
        });

        let job = async move {
            let _done = done;

            let outcome = load_entry(&*storage, &cache, &identity).await;
            completer.complete(outcome);
        };
        self.scheduler.run_async(Box::pin(job));
    }

    /// Whether `key` refers to a subject that is currently cached.
    ///
    /// This never triggers a load. Invalid keys are never registered.
    pub fn has_registered(&self, key: &str) -> bool {
        self.lookup_identity(key)
            .is_some_and(|identity| self.cache.is_loaded(&identity))
    }

    /// Returns the cached entry for `key` without loading it.
    pub fn get_loaded(&self, key: &str) -> Option<Arc<E>> {
        let identity = self.lookup_identity(key)?;
        self.cache.get_if_present(&identity)
    }

    pub fn unload(&self, identity: &Identity) {
        self.cache.invalidate(identity);
    }

    pub fn unload_all(&self) {
        self.cache.invalidate_all();
    }

    /// Re-fetches a set of subjects from storage in the background.
    ///
    /// The external ids are collected by `online` on the scheduler's synchronous context, the
    /// fetches then run one after the other on its asynchronous context. The returned receiver
    /// yields the number of successful fetches once the batch is done.
    ///
    /// Refreshes do not go through the single-flight bookkeeping of [`resolve`](Self::resolve) and
    /// never run [`Entry::setup`].
    pub fn refresh_all<O>(&self, online: O) -> oneshot::Receiver<usize>
    where
        O: FnOnce() -> Vec<Uuid> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let scheduler = Arc::clone(&self.scheduler);
        let translator = Arc::clone(&self.translator);
        let storage = Arc::clone(&self.storage);
        let cache = Arc::clone(&self.cache);

        self.scheduler.run_sync(Box::new(move || {
            let subjects = online();

            scheduler.run_async(Box::pin(async move {
                let mut refreshed = 0;
                for external in subjects {
                    let Some(internal) = translator.translate(&external) else {
                        tracing::warn!(%external, "Skipping refresh of untranslatable subject");
                        continue;
                    };
                    let identity = Identity::new(internal);

                    match storage
                        .fetch(&cache, &identity, FetchReason::Refresh)
                        .await
                    {
                        Ok(()) => refreshed += 1,
                        Err(err) => {
                            tracing::error!(
                                error = &err as &dyn std::error::Error,
                                %identity,
                                "Failed to refresh subject",
                            );
                        }
                    }
                }

                metric!(counter("subjects.refresh") += refreshed as i64);
                sender.send(refreshed).ok();
            }));
        }));

        receiver
    }

    fn lookup_identity(&self, key: &str) -> Option<Identity> {
        let external = parse_key(key)?;
        let internal = self.translator.translate(&external)?;
        Some(Identity::new(internal))
    }

    fn fall_back(&self, key: &str, reason: FallbackReason) -> Resolved<E, F::Substitute> {
        Resolved::Fallback {
            substitute: self.fallback.get(key),
            reason,
        }
    }
}

/// Fetches `identity` from storage and runs the one-time setup of the resulting entry.
async fn load_entry<E: Entry>(
    storage: &dyn Storage<E>,
    cache: &IdentityCache<E>,
    identity: &Identity,
) -> LoadOutcome {
    let start = Instant::now();
    let reason = FetchReason::Resolve;

    let fetched = storage.fetch(cache, identity, reason).await;
    if let Err(err) = &fetched {
        tracing::error!(
            error = err as &dyn std::error::Error,
            %identity,
            "Failed to fetch subject from storage",
        );
    }

    let outcome = match cache.get_if_present(identity) {
        Some(entry) => {
            entry.setup();
            Ok(())
        }
        None => {
            tracing::error!(%identity, "Error whilst loading subject");
            Err(fetched.err().unwrap_or(LoadError::Missing))
        }
    };

    let status = if outcome.is_ok() { "ok" } else { "failed" };
    metric!(counter("subjects.load") += 1, "reason" => reason.as_str(), "status" => status);
    metric!(timer("subjects.load.duration") = start.elapsed(), "reason" => reason.as_str());

    outcome
}

/// Builds a [`LoadCoordinator`].
pub struct LoadCoordinatorBuilder<E: Entry, F: FallbackProvider> {
    cache: Arc<IdentityCache<E>>,
    storage: Arc<dyn Storage<E>>,
    fallback: F,
    translator: Option<Arc<dyn IdentityTranslator>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    load_timeout: Duration,
}

impl<E: Entry, F: FallbackProvider> LoadCoordinatorBuilder<E, F> {
    /// Applies the settings of `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.load_timeout = config.load_timeout;
        self
    }

    /// Sets the translator from external to internal ids. Defaults to [`PassthroughTranslator`].
    pub fn translator(mut self, translator: Arc<dyn IdentityTranslator>) -> Self {
        self.translator = Some(translator);
        self
    }

    /// Sets the scheduler for background loads. Defaults to a [`TokioScheduler`] on the runtime
    /// passed to [`build`](Self::build).
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn load_timeout(mut self, load_timeout: Duration) -> Self {
        self.load_timeout = load_timeout;
        self
    }

    pub fn build(self, runtime: Handle) -> LoadCoordinator<E, F> {
        let translator = self
            .translator
            .unwrap_or_else(|| Arc::new(PassthroughTranslator));
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(TokioScheduler::new(runtime.clone())));

        LoadCoordinator {
            cache: self.cache,
            translator,
            storage: self.storage,
            scheduler,
            fallback: Arc::new(self.fallback),
            pending: Default::default(),
            load_timeout: self.load_timeout,
            runtime,
        }
    }
}
