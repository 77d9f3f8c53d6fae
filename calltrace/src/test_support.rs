// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Helpers shared by unit and integration tests.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bus;
use crate::event::ScopeId;
use crate::event::TraceEvent;
use crate::scope::ScopeExt;
use crate::scope::ScopeHandle;

/// Run `f` inside a fresh scope and return every event the scope emitted.
pub fn capture_scope_events(scope_id: ScopeId, f: impl FnOnce()) -> Vec<TraceEvent> {
    let (handle, collector) = collecting_scope(scope_id);
    {
        let _guard = handle.install();
        f();
    }
    collector.finish()
}

/// Async variant of [`capture_scope_events`]: the scope is bound to the
/// future with `in_scope`, as the middleware does.
pub async fn capture_scope_events_async<F>(scope_id: ScopeId, fut: F) -> Vec<TraceEvent>
where
    F: std::future::Future<Output = ()>,
{
    let (handle, collector) = collecting_scope(scope_id);
    fut.in_scope(handle).await;
    collector.finish()
}

/// A bus subscription collecting one scope's events.
pub struct EventCollector {
    subscription: bus::SubscriberId,
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl EventCollector {
    pub fn finish(self) -> Vec<TraceEvent> {
        bus::unsubscribe(self.subscription);
        self.events.lock().clone()
    }
}

pub fn collecting_scope(scope_id: ScopeId) -> (ScopeHandle, EventCollector) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let subscription = bus::subscribe(Box::new(move |event| {
        if event.scope_id == scope_id {
            sink.lock().push(event.clone());
        }
    }));
    (
        ScopeHandle::new(scope_id),
        EventCollector {
            subscription,
            events,
        },
    )
}

/// Render events as an indented enter/exit listing for tree assertions.
pub fn render_events(events: &[TraceEvent]) -> String {
    let mut out = String::new();
    for event in events {
        let marker = match event.phase {
            crate::event::Phase::Enter => "+",
            crate::event::Phase::Exit => "-",
        };
        out.push('\n');
        out.push_str(&"    ".repeat(event.depth.saturating_sub(1)));
        out.push_str(marker);
        out.push_str(&event.name);
        if event.unawaited && event.phase == crate::event::Phase::Exit {
            out.push_str(" (unawaited)");
        }
    }
    out.push('\n');
    out
}
