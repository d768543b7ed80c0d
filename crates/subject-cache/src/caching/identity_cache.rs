use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::types::Identity;

use super::Entry;

/// Creates a fresh entry for an identity that is not cached yet.
///
/// Entries are never refreshed, so the loader has to produce an equivalent entry every time it is
/// invoked with the same identity.
pub type Loader<E> = Box<dyn Fn(&Identity) -> E + Send + Sync>;

type InMemoryCache<E> = moka::sync::Cache<Identity, Arc<E>>;

/// A non-expiring, concurrent mapping from [`Identity`] to a cached [`Entry`].
///
/// The underlying moka cache is built without capacity, time-to-live or time-to-idle, so entries
/// stay resident until they are invalidated explicitly. Entries accumulate in-memory state between
/// loads, which a reload would throw away.
///
/// Invalidations are not coordinated with loads that are in flight for the same identity. If both
/// race, either outcome is possible once they have finished.
pub struct IdentityCache<E: Entry> {
    cache: InMemoryCache<E>,
    loader: Loader<E>,
}

impl<E: Entry> fmt::Debug for IdentityCache<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityCache")
            .field("in-memory items", &self.cache.entry_count())
            .finish()
    }
}

impl<E: Entry> IdentityCache<E> {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn(&Identity) -> E + Send + Sync + 'static,
    {
        let cache = InMemoryCache::builder().name("subjects").build();
        Self {
            cache,
            loader: Box::new(loader),
        }
    }

    /// Returns the cached entry, creating it with the loader if it is missing.
    ///
    /// Concurrent calls for the same identity invoke the loader only once.
    pub fn get_or_load(&self, identity: &Identity) -> Arc<E> {
        self.cache
            .get_with_by_ref(identity, || Arc::new((self.loader)(identity)))
    }

    /// Returns the cached entry without loading it.
    pub fn get_if_present(&self, identity: &Identity) -> Option<Arc<E>> {
        self.cache.get(identity)
    }

    pub fn is_loaded(&self, identity: &Identity) -> bool {
        self.cache.contains_key(identity)
    }

    /// Takes a point-in-time copy of all cached entries.
    ///
    /// Later mutations of the cache are not reflected in the returned map.
    pub fn all_entries(&self) -> HashMap<Identity, Arc<E>> {
        self.cache
            .iter()
            .map(|(identity, entry)| (Identity::clone(&identity), entry))
            .collect()
    }

    /// Takes a point-in-time copy of all cached entries, without their identities.
    pub fn entries(&self) -> Vec<Arc<E>> {
        self.cache.iter().map(|(_, entry)| entry).collect()
    }

    /// The approximate number of cached entries.
    ///
    /// Bookkeeping of the underlying cache is deferred, so this may lag behind recent
    /// insertions and invalidations.
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.iter().next().is_none()
    }

    pub fn invalidate(&self, identity: &Identity) {
        self.cache.invalidate(identity);
    }

    pub fn invalidate_many<'a, I>(&self, identities: I)
    where
        I: IntoIterator<Item = &'a Identity>,
    {
        for identity in identities {
            self.cache.invalidate(identity);
        }
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}
