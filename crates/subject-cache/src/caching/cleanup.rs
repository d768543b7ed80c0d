use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::types::Identity;

use super::{Entry, IdentityCache};

/// Evicts cached entries that report themselves as eligible for cleanup.
pub struct CleanupScanner<E: Entry> {
    cache: Arc<IdentityCache<E>>,
}

impl<E: Entry> Clone for CleanupScanner<E> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<E: Entry> CleanupScanner<E> {
    pub fn new(cache: Arc<IdentityCache<E>>) -> Self {
        Self { cache }
    }

    /// Evicts every entry whose [`should_cleanup`](Entry::should_cleanup) answers `true`.
    ///
    /// The predicates are evaluated against a snapshot first, and only the collected identities
    /// are invalidated afterwards. Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        let eligible: HashSet<Identity> = self
            .cache
            .all_entries()
            .into_iter()
            .filter(|(_, entry)| entry.should_cleanup())
            .map(|(identity, _)| identity)
            .collect();

        self.cache.invalidate_many(&eligible);

        let evicted = eligible.len();
        if evicted > 0 {
            tracing::debug!(evicted, "Cleaned up cached subjects");
        }
        metric!(counter("subjects.cleanup.evicted") += evicted as i64);
        metric!(gauge("subjects.cache.entries") = self.cache.len());

        evicted
    }

    /// Evicts a single entry if it is cached and eligible for cleanup.
    ///
    /// Returns `true` if the entry was evicted.
    pub fn cleanup_one(&self, identity: &Identity) -> bool {
        match self.cache.get_if_present(identity) {
            Some(entry) if entry.should_cleanup() => {
                self.cache.invalidate(identity);
                metric!(counter("subjects.cleanup.evicted") += 1);
                true
            }
            _ => false,
        }
    }

    /// Runs [`sweep`](Self::sweep) every `interval` on the given runtime.
    ///
    /// The first sweep happens one `interval` after spawning. Abort the returned handle to stop.
    pub fn spawn_periodic(&self, interval: Duration, runtime: &Handle) -> JoinHandle<()> {
        let scanner = self.clone();
        runtime.spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticks = tokio::time::interval_at(start, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticks.tick().await;
                scanner.sweep();
            }
        })
    }
}
