// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! The per-request middleware.
//!
//! Layer [`trace_requests`] onto an axum router with
//! `axum::middleware::from_fn`. Requests carrying both the session and the
//! action header get a scope opened around the inner service, a bus
//! subscription collecting the scope's events, request/response snapshots,
//! and a deferred flush to the installed transport. Requests without the
//! headers pass through untouched.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/users", get(list_users))
//!     .layer(axum::middleware::from_fn(calltrace::middleware::trace_requests));
//! ```

pub mod capture;

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use axum::extract::MatchedPath;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use parking_lot::Mutex;

use crate::assemble;
use crate::bus;
use crate::event::Phase;
use crate::event::ScopeId;
use crate::event::TraceEvent;
use crate::ext;
use crate::ingest;
use crate::ingest::Entry;
use crate::ingest::RequestPayload;
use crate::sanitize::Sanitizer;
use crate::scope::ScopeExt;
use crate::scope::ScopeHandle;

/// Session identifier header; collection requires it.
pub const SESSION_HEADER: &str = "x-bug-session-id";
/// Per-action identifier header; collection requires it.
pub const ACTION_HEADER: &str = "x-bug-action-id";
/// Client-side request start (milliseconds); scope id and clock-skew source.
pub const REQUEST_START_HEADER: &str = "x-bug-request-start";

const BODY_CAPTURE_LIMIT: usize = 512 * 1024;

struct CollectorState {
    events: Vec<TraceEvent>,
    last_event_at: Instant,
    controller_entry: Option<(String, usize)>,
    first_app_entry: Option<String>,
}

/// axum middleware collecting one trace per tagged request.
pub async fn trace_requests(req: Request, next: Next) -> Response {
    let Some(installed) = crate::installed() else {
        return next.run(req).await;
    };
    let matched = req.extensions().get::<MatchedPath>().cloned();

    let session_id = header_string(&req, SESSION_HEADER);
    let action_id = header_string(&req, ACTION_HEADER);
    let (Some(session_id), Some(action_id)) = (session_id, action_id) else {
        return next.run(req).await;
    };

    let local_start_ms = ingest::now_ms();
    let client_start_ms = header_string(&req, REQUEST_START_HEADER)
        .and_then(|v| v.trim().parse::<u64>().ok());
    let skew_ms = client_start_ms
        .map(|client| client as i64 - local_start_ms as i64)
        .unwrap_or(0);
    let scope_id = ScopeId(client_start_ms.unwrap_or(local_start_ms));
    let rid = format!("{:016x}", rand::random::<u64>());

    // Request snapshot, with the body buffered and re-attached.
    let method = req.method().to_string();
    let url = req.uri().to_string();
    let path = req.uri().path().to_string();
    let key = match &matched {
        Some(matched) => format!("{} {}", method, matched.as_str()),
        None => format!("{} {}", method, path),
    };
    let query = capture::query_value(req.uri().query());
    let params_value = matched
        .as_ref()
        .and_then(|matched| capture::params_from_match(matched.as_str(), &path));
    let req_headers = capture::headers_value(req.headers());

    let (parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, BODY_CAPTURE_LIMIT)
        .await
        .unwrap_or_default();
    let req_body = capture::body_value(&parts.headers, &body_bytes);
    let req = Request::from_parts(parts, axum::body::Body::from(body_bytes));

    // Collection: subscribe before the first instruction of the handler
    // runs so no event is missed.
    let collector = Arc::new(Mutex::new(CollectorState {
        events: Vec::new(),
        last_event_at: Instant::now(),
        controller_entry: None,
        first_app_entry: None,
    }));
    let subscription = {
        let collector = collector.clone();
        let installed = installed.clone();
        let sanitizer = Sanitizer::default();
        bus::subscribe(Box::new(move |event| {
            if event.scope_id != scope_id {
                return;
            }
            let mut event = event.clone();
            event.ts_unix_ns = shift_ns(event.ts_unix_ns, skew_ms);
            if let Some(args) = &event.args {
                event.args = Some(sanitizer.value(args));
            }
            if let Some(ret) = &event.ret {
                event.ret = Some(sanitizer.value(ret));
            }
            if let Some(error) = &event.error {
                event.error = Some(sanitizer.value(error));
            }
            if !installed.filters.admits(&event) {
                return;
            }

            let mut state = collector.lock();
            if event.phase == Phase::Enter {
                track_entry_point(&mut state, &event, &installed);
            }
            state.events.push(event);
            state.last_event_at = Instant::now();
        }))
    };

    let _extras_sink = ext::register_session(scope_id, &session_id, &action_id);
    let scope = ScopeHandle::new(scope_id);

    let response = next.run(req).in_scope(scope).await;

    // Response snapshot: buffer, interpret, re-attach.
    let status = response.status().as_u16();
    let (parts, body) = response.into_parts();
    let resp_bytes = axum::body::to_bytes(body, BODY_CAPTURE_LIMIT)
        .await
        .unwrap_or_default();
    let resp_body = capture::body_value(&parts.headers, &resp_bytes);
    let response = Response::from_parts(parts, axum::body::Body::from(resp_bytes));

    let dur_ms = ingest::now_ms().saturating_sub(local_start_ms);

    // Flush off the response path: idle timer bounded by a hard deadline,
    // then assemble and hand off to the transport.
    let installed_for_flush = installed.clone();
    tokio::spawn(async move {
        let idle = installed_for_flush.config.idle_flush;
        let deadline = tokio::time::Instant::now() + installed_for_flush.config.linger_after_finish;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            if collector.lock().last_event_at.elapsed() >= idle {
                break;
            }
            let tick = Duration::from_millis(25).min(deadline - now);
            tokio::time::sleep(tick).await;
        }

        bus::unsubscribe(subscription);
        let extra_entries = ext::deregister_session(scope_id);
        let (mut events, entry_point) = {
            let mut state = collector.lock();
            let entry_point = state
                .controller_entry
                .take()
                .map(|(name, _)| name)
                .or_else(|| state.first_app_entry.take());
            (std::mem::take(&mut state.events), entry_point)
        };

        assemble::balance(&mut events);
        let events = assemble::reorder(events);
        let batches = assemble::batch(scope_id, events, installed_for_flush.config.batch_size);

        let mut entries = Vec::with_capacity(1 + batches.len() + extra_entries.len());
        entries.push(Entry::request(
            &action_id,
            RequestPayload {
                rid: rid.clone(),
                method,
                url,
                path,
                status,
                dur_ms,
                headers: req_headers,
                key,
                body: req_body,
                params: params_value,
                query,
                resp_body,
                entry_point,
                trace: None,
            },
        ));
        for batch in &batches {
            entries.push(Entry::trace_batch(&action_id, &rid, batch));
        }
        entries.extend(extra_entries);

        let body = ingest::IngestBody { entries };
        let transport = installed_for_flush.transport.clone();
        let send = tokio::task::spawn_blocking(move || {
            if let Err(err) = transport.lock().send(&session_id, &body) {
                log::debug!("trace egress failed: {}", err);
            }
        })
        .await;
        if let Err(err) = send {
            log::debug!("trace egress task failed: {}", err);
        }
    });

    response
}

fn header_string(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .filter(|v| !v.is_empty())
}

fn shift_ns(ts_unix_ns: u64, skew_ms: i64) -> u64 {
    let shifted = ts_unix_ns as i64 + skew_ms * 1_000_000;
    shifted.max(0) as u64
}

fn track_entry_point(
    state: &mut CollectorState,
    event: &TraceEvent,
    installed: &crate::Installed,
) {
    let Some(file) = event.file.as_deref() else {
        return;
    };
    if file.contains("controller") {
        let deeper = state
            .controller_entry
            .as_ref()
            .map(|(_, depth)| event.depth > *depth)
            .unwrap_or(true);
        if deeper {
            state.controller_entry = Some((event.name.to_string(), event.depth));
        }
    } else if state.first_app_entry.is_none()
        && event.depth <= 2
        && installed.matcher.is_app(file)
    {
        state.first_app_entry = Some(event.name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skew_shift() {
        assert_eq!(shift_ns(1_000_000_000, 2), 1_002_000_000);
        assert_eq!(shift_ns(1_000_000_000, -2), 998_000_000);
        assert_eq!(shift_ns(1_000_000, -100), 0);
    }
}
