// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! The per-request scope engine.
//!
//! A [`Scope`] is the task-local store behind one logical request: the active
//! span stack, the depth counter and the bookkeeping for un-awaited calls.
//! The current scope lives in a thread-local slot and is re-installed at
//! every poll of the request future by the [`InScope`] adapter, so the store
//! follows the request across asynchronous suspension without bleeding into
//! concurrently served requests.
//!
//! Forks ([`ScopeHandle::fork_for_unawaited`]) give fire-and-forget callees a
//! sibling store that shares the scope id but not the live span stack, and
//! snapshots ([`ScopeHandle::snapshot`]) freeze the stack for callbacks
//! handed to third-party code.

pub mod future;
pub mod guard;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bus;
use crate::event::FrameInfo;
use crate::event::Phase;
use crate::event::ScopeId;
use crate::event::SpanId;
use crate::event::TraceEvent;
use crate::scope::guard::OnDrop;

pub use future::InScope;
pub use future::ScopeExt;

/// One open frame on the span stack.
#[derive(Clone, Debug)]
pub struct Span {
    pub id: SpanId,
    pub parent: Option<SpanId>,
    pub depth: usize,
    pub suspended: bool,
}

struct ScopeInner {
    scope_id: ScopeId,
    depth: usize,
    span_stack: Vec<Span>,
    pending_unawaited: VecDeque<()>,
    frame_unawaited: Vec<bool>,
}

impl ScopeInner {
    fn new(scope_id: ScopeId) -> Self {
        Self {
            scope_id,
            depth: 0,
            span_stack: Vec::with_capacity(16),
            pending_unawaited: VecDeque::new(),
            frame_unawaited: Vec::new(),
        }
    }
}

/// Everything an exit event may carry besides its identity.
#[derive(Debug, Default, Clone)]
pub struct ExitDetail {
    pub ret: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub threw: bool,
    pub unawaited: bool,
}

/// Shared handle to a [`Scope`]'s store. Cheap to clone; clones refer to the
/// same store.
#[derive(Clone)]
pub struct ScopeHandle {
    inner: Arc<Mutex<ScopeInner>>,
}

thread_local! {
    static CURRENT_SCOPE: RefCell<Option<ScopeHandle>> = RefCell::new(None);
}

/// The scope currently installed on this thread, if any.
pub fn current() -> Option<ScopeHandle> {
    CURRENT_SCOPE
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
}

/// Run `f` inside a fresh scope installed on the current thread.
pub fn open<R>(scope_id: ScopeId, f: impl FnOnce() -> R) -> R {
    let handle = ScopeHandle::new(scope_id);
    let _guard = handle.install();
    f()
}

impl ScopeHandle {
    pub fn new(scope_id: ScopeId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScopeInner::new(scope_id))),
        }
    }

    pub fn scope_id(&self) -> ScopeId {
        self.inner.lock().scope_id
    }

    /// Install this scope on the current thread; the previous scope is
    /// restored when the guard drops.
    pub fn install(&self) -> OnDrop<impl FnOnce()> {
        let prev = CURRENT_SCOPE
            .try_with(|slot| slot.borrow_mut().replace(self.clone()))
            .ok()
            .flatten();
        OnDrop::run_on_drop(move || {
            let _ = CURRENT_SCOPE.try_with(|slot| *slot.borrow_mut() = prev);
        })
    }

    /// Open a span: bump the depth, consume one pending un-awaited marker
    /// into the frame stack, push the span and emit the enter event.
    pub fn enter(&self, info: &FrameInfo, args: Option<serde_json::Value>) -> SpanId {
        let event = {
            let mut inner = self.inner.lock();
            inner.depth += 1;
            let marker = inner.pending_unawaited.pop_front().is_some();
            inner.frame_unawaited.push(marker);

            let parent = inner.span_stack.last().map(|span| span.id);
            let span = Span {
                id: SpanId::next_id(),
                parent,
                depth: inner.depth,
                suspended: false,
            };
            let event = TraceEvent {
                phase: Phase::Enter,
                ts_unix_ns: TraceEvent::now_unix_ns(),
                name: info.name.clone(),
                file: info.file.clone(),
                line: info.line,
                kind: info.kind,
                scope_id: inner.scope_id,
                depth: span.depth,
                span_id: span.id,
                parent_span_id: parent,
                args,
                ret: None,
                error: None,
                threw: false,
                unawaited: false,
            };
            inner.span_stack.push(span);
            debug_assert_eq!(inner.depth, inner.span_stack.len());
            event
        };
        let id = event.span_id;
        bus::emit(event);
        id
    }

    /// Close the top span. The effective un-awaited flag is the disjunction
    /// of the caller-provided flag and the frame marker recorded at enter.
    /// The depth counter is decremented only after the span is popped.
    pub fn exit(&self, info: &FrameInfo, detail: ExitDetail) {
        let event = {
            let mut inner = self.inner.lock();
            let frame_flag = inner.frame_unawaited.pop().unwrap_or(false);
            let Some(span) = inner.span_stack.pop() else {
                log::debug!("exit without matching enter in scope {:?}", inner.scope_id);
                return;
            };
            inner.depth -= 1;

            TraceEvent {
                phase: Phase::Exit,
                ts_unix_ns: TraceEvent::now_unix_ns(),
                name: info.name.clone(),
                file: info.file.clone(),
                line: info.line,
                kind: info.kind,
                scope_id: inner.scope_id,
                depth: span.depth,
                span_id: span.id,
                parent_span_id: span.parent,
                args: None,
                ret: detail.ret,
                error: detail.error,
                threw: detail.threw,
                unawaited: detail.unawaited || frame_flag,
            }
        };
        bus::emit(event);
    }

    /// Re-emit an exit for a span that was already closed in the caller's
    /// timeline (an un-awaited completion or a drained query finalizer). The
    /// assembler reconciles the duplicate under the span's node.
    pub fn reemit_exit(&self, info: &FrameInfo, span_id: SpanId, depth: usize, detail: ExitDetail) {
        let event = {
            let inner = self.inner.lock();
            TraceEvent {
                phase: Phase::Exit,
                ts_unix_ns: TraceEvent::now_unix_ns(),
                name: info.name.clone(),
                file: info.file.clone(),
                line: info.line,
                kind: info.kind,
                scope_id: inner.scope_id,
                depth,
                span_id,
                parent_span_id: None,
                args: None,
                ret: detail.ret,
                error: detail.error,
                threw: detail.threw,
                unawaited: true,
            }
        };
        bus::emit(event);
    }

    /// Queue an un-awaited marker; the next `enter` pops it into its frame.
    pub fn push_pending_unawaited(&self) {
        self.inner.lock().pending_unawaited.push_back(());
    }

    /// Mark the top span as suspended: it belongs to a frame that is parked
    /// at an await point and must not leak into forks.
    pub fn set_top_suspended(&self, suspended: bool) {
        let mut inner = self.inner.lock();
        if let Some(span) = inner.span_stack.last_mut() {
            span.suspended = suspended;
        }
    }

    /// A sibling scope for an un-awaited callee: same scope id, independent
    /// span stack with suspended spans filtered out.
    pub fn fork_for_unawaited(&self) -> ScopeHandle {
        let inner = self.inner.lock();
        let span_stack: Vec<Span> = inner
            .span_stack
            .iter()
            .filter(|span| !span.suspended)
            .cloned()
            .collect();
        let depth = span_stack.len();
        ScopeHandle {
            inner: Arc::new(Mutex::new(ScopeInner {
                scope_id: inner.scope_id,
                depth,
                span_stack,
                pending_unawaited: VecDeque::new(),
                frame_unawaited: Vec::new(),
            })),
        }
    }

    /// A frozen copy of the scope at this moment, for callbacks handed to
    /// third-party code. Each invocation of the callback installs the copy,
    /// so sibling callbacks never inherit each other's span stacks.
    pub fn snapshot(&self) -> ScopeHandle {
        let inner = self.inner.lock();
        ScopeHandle {
            inner: Arc::new(Mutex::new(ScopeInner {
                scope_id: inner.scope_id,
                depth: inner.depth,
                span_stack: inner.span_stack.clone(),
                pending_unawaited: inner.pending_unawaited.clone(),
                frame_unawaited: inner.frame_unawaited.clone(),
            })),
        }
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().depth
    }

    pub fn current_span(&self) -> Option<Span> {
        self.inner.lock().span_stack.last().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CallMeta;
    use crate::event::FunctionKind;

    const META: CallMeta = CallMeta {
        name: "f",
        file: "src/app.rs",
        line: 1,
        kind: FunctionKind::Function,
    };

    fn info() -> FrameInfo {
        FrameInfo::from(&META)
    }

    #[test]
    fn depth_tracks_span_stack() {
        let handle = ScopeHandle::new(ScopeId(7));
        assert_eq!(handle.depth(), 0);

        handle.enter(&info(), None);
        handle.enter(&info(), None);
        assert_eq!(handle.depth(), 2);
        let top = handle.current_span().unwrap();
        assert_eq!(top.depth, 2);

        handle.exit(&info(), ExitDetail::default());
        assert_eq!(handle.depth(), 1);
        handle.exit(&info(), ExitDetail::default());
        assert_eq!(handle.depth(), 0);
    }

    #[test]
    fn parent_is_top_of_stack() {
        let handle = ScopeHandle::new(ScopeId(7));
        let outer = handle.enter(&info(), None);
        handle.enter(&info(), None);
        let inner = handle.current_span().unwrap();
        assert_eq!(inner.parent, Some(outer));
    }

    #[test]
    fn install_restores_previous() {
        let a = ScopeHandle::new(ScopeId(1));
        let b = ScopeHandle::new(ScopeId(2));
        let _ga = a.install();
        {
            let _gb = b.install();
            assert_eq!(current().unwrap().scope_id(), ScopeId(2));
        }
        assert_eq!(current().unwrap().scope_id(), ScopeId(1));
    }

    #[test]
    fn fork_filters_suspended_spans() {
        let handle = ScopeHandle::new(ScopeId(7));
        handle.enter(&info(), None);
        handle.enter(&info(), None);
        handle.set_top_suspended(true);

        let fork = handle.fork_for_unawaited();
        assert_eq!(fork.scope_id(), ScopeId(7));
        assert_eq!(fork.depth(), 1);
        // The fork has its own stack: pushing there leaves the origin alone.
        fork.enter(&info(), None);
        assert_eq!(fork.depth(), 2);
        assert_eq!(handle.depth(), 2);
    }

    #[test]
    fn pending_unawaited_consumed_by_next_enter() {
        let handle = ScopeHandle::new(ScopeId(7));
        handle.push_pending_unawaited();
        handle.enter(&info(), None);
        // The marker flags the frame: even a plain exit reports un-awaited.
        let inner = handle.inner.lock();
        assert_eq!(inner.frame_unawaited, vec![true]);
        assert!(inner.pending_unawaited.is_empty());
    }

    #[test]
    fn snapshot_is_independent() {
        let handle = ScopeHandle::new(ScopeId(7));
        handle.enter(&info(), None);
        let snap = handle.snapshot();
        handle.enter(&info(), None);
        assert_eq!(handle.depth(), 2);
        assert_eq!(snap.depth(), 1);
    }

    #[test]
    fn exit_without_enter_is_ignored() {
        let handle = ScopeHandle::new(ScopeId(7));
        handle.exit(&info(), ExitDetail::default());
        assert_eq!(handle.depth(), 0);
    }
}
