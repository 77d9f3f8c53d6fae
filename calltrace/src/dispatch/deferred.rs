// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Deferred-work handling: awaited futures, fire-and-forget futures and
//! query builders.

use std::fmt;
use std::task::Poll;

use parking_lot::Mutex;
use serde_json::Value;

use crate::dispatch::classify;
use crate::dispatch::Treatment;
use crate::event::CallMeta;
use crate::event::FrameInfo;
use crate::event::SpanId;
use crate::sanitize;
use crate::scope;
use crate::scope::ExitDetail;
use crate::scope::ScopeHandle;

enum FutureMode {
    /// No scope at creation, or a skip-wrap callee.
    Passthrough,
    /// Body-traced callee: install the snapshot at each poll, emit nothing.
    Install { scope: ScopeHandle },
    /// Emit the pair here: enter on first poll, exit on completion.
    Emit {
        scope: ScopeHandle,
        info: FrameInfo,
        args: Option<Value>,
        entered: bool,
    },
    /// Un-awaited completion: the span is already closed in the caller's
    /// timeline; re-emit its exit with the resolved value.
    Reemit {
        scope: ScopeHandle,
        info: FrameInfo,
        span_id: SpanId,
        depth: usize,
    },
}

/// Adapter returned by [`relay_future`](crate::dispatch::relay_future).
#[pin_project::pin_project]
pub struct RelayFuture<F> {
    #[pin]
    inner: F,
    mode: FutureMode,
}

pub(crate) fn relay_future<F>(meta: &'static CallMeta, args: Option<Value>, fut: F) -> RelayFuture<F>
where
    F: std::future::Future,
    F::Output: fmt::Debug,
{
    let mode = match scope::current() {
        None => FutureMode::Passthrough,
        Some(scope) => {
            // The future's events are parented at the call site: everything
            // it does runs against a copy of the stack taken here, released
            // when the exit emits.
            let snapshot = scope.snapshot();
            match classify(meta.name) {
                Treatment::Skip => FutureMode::Passthrough,
                Treatment::BodyTraced => FutureMode::Install { scope: snapshot },
                Treatment::Emit => FutureMode::Emit {
                    scope: snapshot,
                    info: FrameInfo::from(meta),
                    args,
                    entered: false,
                },
            }
        }
    };
    RelayFuture { inner: fut, mode }
}

impl<F> std::future::Future for RelayFuture<F>
where
    F: std::future::Future,
    F::Output: fmt::Debug,
{
    type Output = F::Output;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.mode {
            FutureMode::Passthrough => this.inner.poll(cx),
            FutureMode::Install { scope } => {
                let _guard = scope.install();
                this.inner.poll(cx)
            }
            FutureMode::Emit {
                scope,
                info,
                args,
                entered,
            } => {
                let _guard = scope.install();
                if !*entered {
                    scope.enter(info, args.take());
                    *entered = true;
                } else {
                    scope.set_top_suspended(false);
                }
                match this.inner.poll(cx) {
                    Poll::Ready(out) => {
                        scope.exit(
                            info,
                            ExitDetail {
                                ret: Some(sanitize::debug_value(&out)),
                                ..ExitDetail::default()
                            },
                        );
                        Poll::Ready(out)
                    }
                    Poll::Pending => {
                        scope.set_top_suspended(true);
                        Poll::Pending
                    }
                }
            }
            FutureMode::Reemit {
                scope,
                info,
                span_id,
                depth,
            } => {
                let _guard = scope.install();
                match this.inner.poll(cx) {
                    Poll::Ready(out) => {
                        scope.reemit_exit(
                            info,
                            *span_id,
                            *depth,
                            ExitDetail {
                                ret: Some(sanitize::debug_value(&out)),
                                unawaited: true,
                                ..ExitDetail::default()
                            },
                        );
                        Poll::Ready(out)
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

/// The un-awaited mark: a future wrapped by
/// [`relay_unawaited`](crate::dispatch::relay_unawaited). It runs under a
/// fork of the caller's scope.
#[pin_project::pin_project]
pub struct Unawaited<F> {
    #[pin]
    inner: RelayFuture<F>,
}

impl<F> std::future::Future for Unawaited<F>
where
    F: std::future::Future,
    F::Output: fmt::Debug,
{
    type Output = F::Output;

    #[inline]
    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.project().inner.poll(cx)
    }
}

pub(crate) fn relay_unawaited<F>(
    meta: &'static CallMeta,
    args: Option<Value>,
    fut: F,
) -> Unawaited<F>
where
    F: std::future::Future,
    F::Output: fmt::Debug,
{
    if crate::installed()
        .map(|i| i.config.debug_unawaited)
        .unwrap_or(false)
    {
        log::debug!(
            "un-awaited call {} at {}:{}",
            meta.name,
            meta.file,
            meta.line
        );
    }
    let mode = match scope::current() {
        None => FutureMode::Passthrough,
        Some(scope) => {
            let fork = scope.fork_for_unawaited();
            match classify(meta.name) {
                Treatment::Skip => FutureMode::Passthrough,
                Treatment::BodyTraced => {
                    // The body emits its own pair inside the fork; the
                    // pending marker flags that frame as un-awaited.
                    fork.push_pending_unawaited();
                    FutureMode::Install { scope: fork }
                }
                Treatment::Emit => {
                    // Close the span in the caller's timeline right away.
                    let info = FrameInfo::from(meta);
                    let span_id = scope.enter(&info, args);
                    let depth = scope.depth();
                    scope.exit(
                        &info,
                        ExitDetail {
                            ret: Some(sanitize::pending_future_value()),
                            unawaited: true,
                            ..ExitDetail::default()
                        },
                    );
                    FutureMode::Reemit {
                        scope: fork,
                        info,
                        span_id,
                        depth,
                    }
                }
            }
        }
    };
    Unawaited {
        inner: RelayFuture { inner: fut, mode },
    }
}

/// Finalizer drained by a query builder's `exec`.
pub type Finalizer = Box<dyn FnOnce(&Value) + Send>;

/// Storage for query finalizers; embed one in each builder implementation.
#[derive(Default)]
pub struct FinalizerQueue {
    queue: Mutex<Vec<Finalizer>>,
}

impl FinalizerQueue {
    pub fn push(&self, finalizer: Finalizer) {
        self.queue.lock().push(finalizer);
    }

    pub fn drain(&self, resolved: &Value) {
        let finalizers = std::mem::take(&mut *self.queue.lock());
        for finalizer in finalizers {
            finalizer(resolved);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// A deferred query: resolution is triggered by `exec` and must never be
/// forced by the tracer.
pub trait QueryBuilder {
    fn model(&self) -> &str;
    fn operation(&self) -> &str;
    /// Bounded description of the query shape (filter/update/options).
    fn summary(&self) -> Value;
    fn finalizers(&self) -> &FinalizerQueue;
}

pub(crate) fn relay_query<Q: QueryBuilder>(
    meta: &'static CallMeta,
    args: Option<Value>,
    builder: Q,
) -> Q {
    let Some(scope) = scope::current() else {
        return builder;
    };
    if classify(meta.name) != Treatment::Emit {
        return builder;
    }

    let info = FrameInfo::from(meta);
    let span_id = scope.enter(&info, args);
    let depth = scope.depth();
    scope.exit(
        &info,
        ExitDetail {
            ret: Some(builder.summary()),
            ..ExitDetail::default()
        },
    );

    let finalizer_scope = scope.clone();
    builder.finalizers().push(Box::new(move |resolved| {
        finalizer_scope.reemit_exit(
            &info,
            span_id,
            depth,
            ExitDetail {
                ret: Some(sanitize::Sanitizer::default().value(resolved)),
                unawaited: true,
                ..ExitDetail::default()
            },
        );
    }));
    builder
}

/// Called by the ORM integration when a query resolves: drains the
/// builder's finalizers with the resolved value.
pub fn complete_query<Q: QueryBuilder>(builder: &Q, resolved: &Value) {
    builder.finalizers().drain(resolved);
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::event::FunctionKind;
    use crate::event::Phase;
    use crate::event::ScopeId;
    use crate::origin;
    use crate::test_support::capture_scope_events;
    use crate::test_support::capture_scope_events_async;

    static ASYNC_CALL: CallMeta = CallMeta {
        name: "fetch_rows",
        file: "src/db.rs",
        line: 21,
        kind: FunctionKind::Function,
    };

    static QUERY_CALL: CallMeta = CallMeta {
        name: "find",
        file: "src/db.rs",
        line: 30,
        kind: FunctionKind::Method,
    };

    #[tokio::test]
    #[serial]
    async fn awaited_future_emits_enter_then_exit() {
        origin::clear();
        let events = capture_scope_events_async(ScopeId(91), async {
            let out = relay_future(&ASYNC_CALL, None, async {
                tokio::task::yield_now().await;
                3u32
            })
            .await;
            assert_eq!(out, 3);
        })
        .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phase, Phase::Enter);
        assert_eq!(events[1].phase, Phase::Exit);
        assert_eq!(events[1].ret, Some(serde_json::json!("3")));
        assert_eq!(events[1].span_id, events[0].span_id);
    }

    #[tokio::test]
    #[serial]
    async fn concurrent_arms_have_distinct_parents() {
        origin::clear();
        let events = capture_scope_events_async(ScopeId(92), async {
            let a = relay_future(&ASYNC_CALL, None, async {
                tokio::task::yield_now().await;
                1u32
            });
            let b = relay_future(&ASYNC_CALL, None, async {
                tokio::task::yield_now().await;
                2u32
            });
            let (a, b) = tokio::join!(a, b);
            assert_eq!((a, b), (1, 2));
        })
        .await;

        let enters: Vec<_> = events.iter().filter(|e| e.phase == Phase::Enter).collect();
        assert_eq!(enters.len(), 2);
        // Both arms were created at scope depth 0: neither is the other's
        // child even though their polls interleave.
        assert!(enters.iter().all(|e| e.parent_span_id.is_none()));
        assert_ne!(enters[0].span_id, enters[1].span_id);
    }

    #[tokio::test]
    #[serial]
    async fn unawaited_closes_in_caller_timeline_then_reemits() {
        origin::clear();
        let events = capture_scope_events_async(ScopeId(93), async {
            let pending = relay_unawaited(&ASYNC_CALL, None, async {
                tokio::task::yield_now().await;
                7u32
            });
            // The span is already closed before the future is driven.
            let driven = tokio::spawn(pending);
            assert_eq!(driven.await.unwrap(), 7);
            tokio::task::yield_now().await;
        })
        .await;

        assert!(events.len() >= 3);
        assert_eq!(events[0].phase, Phase::Enter);
        assert_eq!(events[1].phase, Phase::Exit);
        assert!(events[1].unawaited);
        assert_eq!(
            events[1].ret,
            Some(serde_json::json!(sanitize::PENDING_FUTURE))
        );
        let reemitted = &events[2];
        assert_eq!(reemitted.phase, Phase::Exit);
        assert_eq!(reemitted.span_id, events[0].span_id);
        assert_eq!(reemitted.ret, Some(serde_json::json!("7")));
    }

    struct FakeQuery {
        finalizers: FinalizerQueue,
        executions: std::sync::atomic::AtomicUsize,
    }

    impl FakeQuery {
        fn new() -> Self {
            Self {
                finalizers: FinalizerQueue::default(),
                executions: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        fn exec(&self) -> Value {
            self.executions
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let resolved = serde_json::json!([{"id": 1}]);
            complete_query(self, &resolved);
            resolved
        }
    }

    impl QueryBuilder for FakeQuery {
        fn model(&self) -> &str {
            "User"
        }

        fn operation(&self) -> &str {
            "find"
        }

        fn summary(&self) -> Value {
            sanitize::query_summary(self.model(), self.operation(), None, None, None)
        }

        fn finalizers(&self) -> &FinalizerQueue {
            &self.finalizers
        }
    }

    #[test]
    #[serial]
    fn query_builder_never_forced_and_reemits_on_exec() {
        origin::clear();
        let events = capture_scope_events(ScopeId(94), || {
            let query = relay_query(&QUERY_CALL, None, FakeQuery::new());
            // The tracer must not have executed the query.
            assert_eq!(query.executions.load(std::sync::atomic::Ordering::SeqCst), 0);
            assert_eq!(query.finalizers.len(), 1);

            query.exec();
            assert_eq!(query.executions.load(std::sync::atomic::Ordering::SeqCst), 1);
            assert!(query.finalizers.is_empty());
        });

        assert_eq!(events.len(), 3);
        assert_eq!(events[1].ret.as_ref().unwrap()["model"], "User");
        assert_eq!(events[2].span_id, events[0].span_id);
        assert_eq!(events[2].ret, Some(serde_json::json!([{"id": 1}])));
    }

    #[test]
    #[serial]
    fn relay_query_without_scope_returns_builder_untouched() {
        origin::clear();
        let query = relay_query(&QUERY_CALL, None, FakeQuery::new());
        assert!(query.finalizers.is_empty());
    }
}
