// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Scope propagation across asynchronous suspension.
//!
//! [`InScope`] binds a [`ScopeHandle`] to a future and installs it at every
//! poll, so everything executed inside the poll slice (including nested
//! futures polled within it) sees the correct task-local store. The outermost
//! request future must be bound, otherwise the scope is lost at the first
//! await point.

use std::task::Poll;

use crate::scope::ScopeHandle;

impl<T: std::future::Future> ScopeExt for T {}

/// Extension trait binding futures to a scope.
pub trait ScopeExt: std::future::Future + Sized {
    /// Install `scope` for every poll of this future.
    #[inline]
    fn in_scope(self, scope: ScopeHandle) -> InScope<Self> {
        InScope {
            inner: self,
            scope: Some(scope),
        }
    }
}

/// Adapter for [`ScopeExt::in_scope`].
#[pin_project::pin_project]
pub struct InScope<T> {
    #[pin]
    inner: T,
    scope: Option<ScopeHandle>,
}

impl<T: std::future::Future> std::future::Future for InScope<T> {
    type Output = T::Output;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let _guard = this.scope.as_ref().map(|scope| scope.install());
        let res = this.inner.poll(cx);

        match res {
            r @ Poll::Pending => r,
            other => {
                this.scope.take();
                other
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ScopeId;
    use crate::scope;

    #[tokio::test]
    async fn scope_visible_across_awaits() {
        let handle = ScopeHandle::new(ScopeId(11));
        let seen = async {
            let before = scope::current().map(|s| s.scope_id());
            tokio::task::yield_now().await;
            let after = scope::current().map(|s| s.scope_id());
            (before, after)
        }
        .in_scope(handle)
        .await;

        assert_eq!(seen, (Some(ScopeId(11)), Some(ScopeId(11))));
        assert!(scope::current().is_none());
    }

    #[tokio::test]
    async fn concurrent_scopes_stay_isolated() {
        let run = |id: u64| async move {
            let handle = ScopeHandle::new(ScopeId(id));
            async move {
                for _ in 0..8 {
                    tokio::task::yield_now().await;
                    assert_eq!(scope::current().unwrap().scope_id(), ScopeId(id));
                }
            }
            .in_scope(handle)
            .await;
        };

        tokio::join!(run(1), run(2), run(3));
    }
}
