// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Drop hooks backing the install/restore pairs of the scope engine.

/// Runs its hook exactly once when dropped. [`ScopeHandle::install`] and the
/// bus re-entrancy guard build their restore steps out of this.
///
/// [`ScopeHandle::install`]: crate::scope::ScopeHandle::install
#[must_use]
pub struct OnDrop<F: FnOnce()> {
    hook: Option<F>,
}

impl<F: FnOnce()> OnDrop<F> {
    pub fn run_on_drop(hook: F) -> Self {
        Self { hook: Some(hook) }
    }

    /// Consume the hook without running it.
    pub fn cancel(mut self) {
        self.hook = None;
    }
}

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            hook();
        }
    }
}
