/// Runs a closure exactly once when dropped.
///
/// The closure also runs while unwinding, which makes this suitable for bookkeeping that must
/// happen on every exit path of a task. It must not panic itself.
#[must_use = "the closure runs immediately if the guard is not bound"]
pub struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Defers `f` until the returned [`DeferGuard`] goes out of scope.
pub fn defer<F: FnOnce()>(f: F) -> DeferGuard<F> {
    DeferGuard(Some(f))
}
