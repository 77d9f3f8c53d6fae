// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! The structured event model shared by every component.
//!
//! A [`TraceEvent`] is an immutable record describing either the entry into or
//! the exit out of one function frame. Events are emitted through the
//! [`bus`](crate::bus), collected per request by the
//! [`middleware`](crate::middleware) and rewritten into a tree-consistent
//! sequence by the [`assemble`](crate::assemble) module before egress.

use std::borrow::Cow;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use minstant::Anchor;
use minstant::Instant;
use serde::Serialize;

/// An identifier for a collection scope. One scope corresponds to one logical
/// request; it is derived from the client-supplied start timestamp when
/// present.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default, Serialize)]
pub struct ScopeId(pub u64);

/// An identifier for a span, unique within the process.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default, Serialize, PartialOrd, Ord)]
pub struct SpanId(pub u64);

// Zero is the "no span" value carried by synthetic and span-less events, so
// the counter starts above it.
static SPAN_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl SpanId {
    /// Allocate the next process-unique, non-zero `SpanId`.
    #[inline]
    pub fn next_id() -> SpanId {
        SpanId(SPAN_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Whether an event records the entry into or the exit out of a frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Enter,
    Exit,
}

/// The syntactic kind of the traced function, as classified by the rewriter.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FunctionKind {
    Function,
    Closure,
    Method,
    StaticMethod,
    Constructor,
    Getter,
    Setter,
}

impl FunctionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionKind::Function => "function",
            FunctionKind::Closure => "closure",
            FunctionKind::Method => "method",
            FunctionKind::StaticMethod => "static-method",
            FunctionKind::Constructor => "constructor",
            FunctionKind::Getter => "getter",
            FunctionKind::Setter => "setter",
        }
    }
}

/// Static identity of a wrapped function or rewritten call site. The rewriter
/// emits one `CallMeta` constant per wrapped location.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CallMeta {
    pub name: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub kind: FunctionKind,
}

/// Identity of a frame as carried by enter/exit events. Static wrapped
/// locations convert from [`CallMeta`]; the dependency-wrap path builds
/// owned instances at call time.
#[derive(Clone, Debug)]
pub struct FrameInfo {
    pub name: Cow<'static, str>,
    pub file: Option<Cow<'static, str>>,
    pub line: Option<u32>,
    pub kind: FunctionKind,
}

impl From<&CallMeta> for FrameInfo {
    fn from(meta: &CallMeta) -> Self {
        Self {
            name: Cow::Borrowed(meta.name),
            file: Some(Cow::Borrowed(meta.file)),
            line: Some(meta.line),
            kind: meta.kind,
        }
    }
}

/// A single enter or exit record.
///
/// `ts_unix_ns` is taken from a monotonic clock anchored to the unix epoch at
/// emission time; the per-request collector shifts it by the clock-skew
/// offset before buffering.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    pub phase: Phase,
    pub ts_unix_ns: u64,
    pub name: Cow<'static, str>,
    pub file: Option<Cow<'static, str>>,
    pub line: Option<u32>,
    pub kind: FunctionKind,
    pub scope_id: ScopeId,
    pub depth: usize,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ret: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    pub threw: bool,
    pub unawaited: bool,
}

impl TraceEvent {
    /// Emission timestamp for an event created now.
    #[inline]
    pub(crate) fn now_unix_ns() -> u64 {
        static ANCHOR: once_cell::sync::Lazy<Anchor> = once_cell::sync::Lazy::new(Anchor::new);
        Instant::now().as_unix_nanos(&ANCHOR)
    }

    /// True when the event belongs to a span (synthetic, span-less events are
    /// preserved verbatim by the assembler).
    #[inline]
    pub fn has_span(&self) -> bool {
        self.span_id != SpanId::default()
    }
}
