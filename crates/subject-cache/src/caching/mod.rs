//! The in-memory subject cache and the maintenance performed on it.

mod cleanup;
mod identity_cache;
mod lookups;

pub use cleanup::CleanupScanner;
pub use identity_cache::{IdentityCache, Loader};

/// A cached subject.
///
/// Entries are shared as `Arc<Self>` and live in the [`IdentityCache`] until they are
/// explicitly invalidated, so any mutable state has to use interior mutability.
pub trait Entry: Send + Sync + 'static {
    /// The name this subject is known under, if any.
    fn display_name(&self) -> Option<String>;

    /// Tells the [`CleanupScanner`] whether this entry may be evicted now.
    fn should_cleanup(&self) -> bool;

    /// Post-load initialization, invoked once by the coordinator after the backing store has
    /// populated the entry.
    fn setup(&self) {}

    /// Whether the backing store has populated this entry's data.
    ///
    /// An entry without data is still handed out to callers, it only triggers a warning.
    fn has_data(&self) -> bool {
        true
    }
}
