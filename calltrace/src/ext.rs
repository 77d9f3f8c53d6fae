// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Contracts consumed by out-of-tree collaborators.
//!
//! The ORM integration reports each observed database operation through
//! [`emit_db_query`]; the mail integration reports sent messages through
//! [`emit_email`]. Both resolve the active session the same way the
//! middleware does: through the scope installed for the current request.
//! Calls made outside any collected request are dropped.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::json;
use serde_json::Value;

use crate::event::ScopeId;
use crate::ingest::Entry;
use crate::sanitize::Sanitizer;
use crate::scope;

#[derive(Clone)]
pub(crate) struct SessionRef {
    pub session_id: String,
    pub action_id: String,
    sink: std::sync::Arc<Mutex<Vec<Entry>>>,
}

static ACTIVE_SESSIONS: Lazy<Mutex<HashMap<ScopeId, SessionRef>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Register the session behind a scope; returns the sink collecting
/// out-of-band entries until the scope flushes.
pub(crate) fn register_session(
    scope_id: ScopeId,
    session_id: &str,
    action_id: &str,
) -> std::sync::Arc<Mutex<Vec<Entry>>> {
    let sink = std::sync::Arc::new(Mutex::new(Vec::new()));
    ACTIVE_SESSIONS.lock().insert(
        scope_id,
        SessionRef {
            session_id: session_id.to_string(),
            action_id: action_id.to_string(),
            sink: sink.clone(),
        },
    );
    sink
}

/// Remove the session and drain whatever the collaborators appended.
pub(crate) fn deregister_session(scope_id: ScopeId) -> Vec<Entry> {
    match ACTIVE_SESSIONS.lock().remove(&scope_id) {
        Some(session) => std::mem::take(&mut *session.sink.lock()),
        None => Vec::new(),
    }
}

fn current_session() -> Option<SessionRef> {
    let scope = scope::current()?;
    ACTIVE_SESSIONS.lock().get(&scope.scope_id()).cloned()
}

/// Report one observed database operation.
pub fn emit_db_query(
    collection: &str,
    op: &str,
    query: &Value,
    result_meta: &Value,
    dur_ms: u64,
) {
    let Some(session) = current_session() else {
        return;
    };
    let sanitizer = Sanitizer::default();
    let entry = Entry::db(
        &session.action_id,
        json!({
            "collection": collection,
            "op": op,
            "query": sanitizer.value(query),
            "result": sanitizer.value(result_meta),
            "durMs": dur_ms,
        }),
    );
    session.sink.lock().push(entry);
}

/// Report one sent email, already normalized by the mail integration.
pub fn emit_email(message: &Value) {
    let Some(session) = current_session() else {
        return;
    };
    let sanitizer = Sanitizer::default();
    let entry = Entry::email(&session.action_id, sanitizer.value(message));
    session.sink.lock().push(entry);
}
