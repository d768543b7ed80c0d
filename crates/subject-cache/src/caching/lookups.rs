use std::sync::Arc;

use super::{Entry, IdentityCache};

impl<E: Entry> IdentityCache<E> {
    /// Finds a cached entry by its display name, ignoring case.
    ///
    /// This never loads anything. If several entries share a name, whichever comes first in the
    /// snapshot wins; the order is otherwise unspecified.
    pub fn find_by_display_name(&self, name: &str) -> Option<Arc<E>> {
        let needle = name.to_lowercase();
        self.entries().into_iter().find(|entry| {
            entry
                .display_name()
                .is_some_and(|candidate| candidate.to_lowercase() == needle)
        })
    }

    /// Derives a value from every cached entry, keeping those for which it is defined.
    ///
    /// For example, this can collect every subject together with the value of a permission it
    /// has set explicitly.
    pub fn filter_by_capability<V, F>(&self, f: F) -> Vec<(Arc<E>, V)>
    where
        F: Fn(&E) -> Option<V>,
    {
        self.entries()
            .into_iter()
            .filter_map(|entry| {
                let value = f(&*entry)?;
                Some((entry, value))
            })
            .collect()
    }
}
