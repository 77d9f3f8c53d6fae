// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! The call dispatcher.
//!
//! Every rewritten call site routes through one of the `relay_*` entry
//! points below; the rewriter picks the entry point from the call's
//! syntactic position (sync, fallible, awaited, fire-and-forget, query).
//! The dispatcher decides at runtime whether the call opens a span: callees
//! marked skip-wrap are invoked directly, body-traced callees emit their own
//! pair and only need scope plumbing, and everything else gets an
//! enter/exit pair emitted here.
//!
//! Deferred work keeps two contracts: an un-awaited future closes its span
//! in the caller's timeline immediately and re-emits an exit when it
//! completes, and a query builder is never driven by the tracer; its exit is
//! re-emitted by a finalizer drained from the builder's own `exec`.

mod deferred;

use std::fmt;

use serde_json::Value;

use crate::event::CallMeta;
use crate::event::FrameInfo;
use crate::event::FunctionKind;
use crate::origin;
use crate::sanitize;
use crate::scope;
use crate::scope::ExitDetail;

pub use deferred::complete_query;
pub use deferred::Finalizer;
pub use deferred::FinalizerQueue;
pub use deferred::QueryBuilder;
pub use deferred::RelayFuture;
pub use deferred::Unawaited;

/// How the dispatcher treats a callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Treatment {
    /// Invoke directly; never trace.
    Skip,
    /// The body emits its own pair; only propagate scope state.
    BodyTraced,
    /// Emit the enter/exit pair here.
    Emit,
}

pub(crate) fn classify(label: &str) -> Treatment {
    match origin::lookup_label(label) {
        Some(o) if o.skip_wrap => Treatment::Skip,
        Some(o) if o.body_traced => Treatment::BodyTraced,
        // A missing mark on a callee defined in an application file still
        // traces: the mark is an optimization, not a gate.
        _ => Treatment::Emit,
    }
}

/// Relay a synchronous call.
pub fn relay<R: fmt::Debug>(
    meta: &'static CallMeta,
    args: Option<Value>,
    f: impl FnOnce() -> R,
) -> R {
    let Some(scope) = scope::current() else {
        return f();
    };
    if classify(meta.name) != Treatment::Emit {
        return f();
    }

    let info = FrameInfo::from(meta);
    scope.enter(&info, args);
    let ret = f();
    scope.exit(
        &info,
        ExitDetail {
            ret: Some(sanitize::debug_value(&ret)),
            ..ExitDetail::default()
        },
    );
    ret
}

/// Relay a synchronous fallible call: an `Err` return exits with
/// `threw = true` and the error snapshot, then propagates unchanged.
pub fn relay_result<T: fmt::Debug, E: fmt::Debug>(
    meta: &'static CallMeta,
    args: Option<Value>,
    f: impl FnOnce() -> Result<T, E>,
) -> Result<T, E> {
    let Some(scope) = scope::current() else {
        return f();
    };
    if classify(meta.name) != Treatment::Emit {
        return f();
    }

    let info = FrameInfo::from(meta);
    scope.enter(&info, args);
    let ret = f();
    let detail = match &ret {
        Ok(v) => ExitDetail {
            ret: Some(sanitize::debug_value(v)),
            ..ExitDetail::default()
        },
        Err(e) => ExitDetail {
            error: Some(sanitize::debug_value(e)),
            threw: true,
            ..ExitDetail::default()
        },
    };
    scope.exit(&info, detail);
    ret
}

/// Relay a call in awaited position. The span opens when the future is
/// first polled and closes when it resolves; the future runs against a
/// snapshot of the caller's scope taken here, so sibling arms driven
/// concurrently never see each other's span stacks.
pub fn relay_future<F>(meta: &'static CallMeta, args: Option<Value>, fut: F) -> RelayFuture<F>
where
    F: std::future::Future,
    F::Output: fmt::Debug,
{
    deferred::relay_future(meta, args, fut)
}

/// Relay a fire-and-forget call. The span closes in the caller's timeline
/// immediately; the callee runs under a fork of the caller's scope and its
/// completion re-emits an exit reconciled by the assembler. The returned
/// wrapper type is the un-awaited mark on the future.
pub fn relay_unawaited<F>(meta: &'static CallMeta, args: Option<Value>, fut: F) -> Unawaited<F>
where
    F: std::future::Future,
    F::Output: fmt::Debug,
{
    deferred::relay_unawaited(meta, args, fut)
}

/// Relay a call returning a deferred query builder. The exit is emitted
/// immediately with the builder summary; no continuation is ever attached
/// to the builder (that would force the query). The builder is returned
/// with its identity untouched.
pub fn relay_query<Q: QueryBuilder>(meta: &'static CallMeta, args: Option<Value>, builder: Q) -> Q {
    deferred::relay_query(meta, args, builder)
}

/// The dependency-wrap path: trace a call whose identity is only known at
/// runtime. The un-awaited flag is forced false on this path.
pub fn shim<R: fmt::Debug>(
    name: &str,
    file: Option<&str>,
    line: Option<u32>,
    args: Option<Value>,
    f: impl FnOnce() -> R,
) -> R {
    let Some(scope) = scope::current() else {
        return f();
    };
    if classify(name) != Treatment::Emit {
        return f();
    }

    let info = FrameInfo {
        name: std::borrow::Cow::Owned(name.to_string()),
        file: file.map(|f| std::borrow::Cow::Owned(f.to_string())),
        line,
        kind: FunctionKind::Function,
    };
    scope.enter(&info, args);
    let ret = f();
    scope.exit(
        &info,
        ExitDetail {
            ret: Some(sanitize::debug_value(&ret)),
            ..ExitDetail::default()
        },
    );
    ret
}

/// Wrap a nullary callback so every invocation starts from a snapshot of
/// the scope taken now, not the live scope at invocation time.
///
/// The rewriter suppresses this wrapping when the callee receiving the
/// callback is the scope installer itself.
pub fn isolate0<R>(mut f: impl FnMut() -> R) -> impl FnMut() -> R {
    let snapshot = scope::current().map(|s| s.snapshot());
    move || {
        let _guard = snapshot.as_ref().map(|s| s.install());
        f()
    }
}

/// Unary variant of [`isolate0`].
pub fn isolate1<A, R>(mut f: impl FnMut(A) -> R) -> impl FnMut(A) -> R {
    let snapshot = scope::current().map(|s| s.snapshot());
    move |a| {
        let _guard = snapshot.as_ref().map(|s| s.install());
        f(a)
    }
}

/// Binary variant of [`isolate0`].
pub fn isolate2<A, B, R>(mut f: impl FnMut(A, B) -> R) -> impl FnMut(A, B) -> R {
    let snapshot = scope::current().map(|s| s.snapshot());
    move |a, b| {
        let _guard = snapshot.as_ref().map(|s| s.install());
        f(a, b)
    }
}
