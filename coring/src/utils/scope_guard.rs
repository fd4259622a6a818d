/// Runs a closure when it goes out of scope, including while unwinding.
///
/// The guard is armed on creation. [`ScopeGuard::disarm`] drops the closure
/// without running it.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // Taken on drop or disarm, so the closure runs at most once.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.closure.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}
