// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Egress to the ingestion API.
//!
//! The wire format is `POST {api_base}/v1/sessions/{session_id}/backend`
//! with a JSON body of `{ "entries": [...] }`. Each entry carries the action
//! id, one payload variant (request snapshot, trace batch, db query or
//! email) and a wall-clock timestamp. Transports are pluggable; the HTTP
//! transport is invoked from a blocking task and every transport error is
//! swallowed.

use std::error::Error;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::assemble::TraceBatch;

pub type TransportError = Box<dyn Error + Send + Sync + 'static>;

/// Delivery of assembled payloads. Implementations must not retry and must
/// not buffer to disk.
pub trait Transport: Send {
    fn send(&mut self, session_id: &str, body: &IngestBody) -> Result<(), TransportError>;
}

/// The request snapshot attached to a request entry.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub rid: String,
    pub method: String,
    pub url: String,
    pub path: String,
    pub status: u16,
    pub dur_ms: u64,
    pub headers: Value,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resp_body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Identification of one trace batch within its request.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceBatchMeta {
    pub rid: String,
    pub index: usize,
    pub total: usize,
}

/// One element of the `entries` array.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub action_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_batch: Option<TraceBatchMeta>,
    pub t: u64,
}

impl Entry {
    fn empty(action_id: &str) -> Self {
        Self {
            action_id: action_id.to_string(),
            request: None,
            db: None,
            email: None,
            trace: None,
            trace_batch: None,
            t: now_ms(),
        }
    }

    pub fn request(action_id: &str, payload: RequestPayload) -> Self {
        Self {
            request: Some(payload),
            ..Self::empty(action_id)
        }
    }

    /// A trace batch entry: the event array rides as a JSON string.
    pub fn trace_batch(action_id: &str, rid: &str, batch: &TraceBatch) -> Self {
        Self {
            trace: serde_json::to_string(&batch.events).ok(),
            trace_batch: Some(TraceBatchMeta {
                rid: rid.to_string(),
                index: batch.index,
                total: batch.total,
            }),
            ..Self::empty(action_id)
        }
    }

    pub fn db(action_id: &str, query: Value) -> Self {
        Self {
            db: Some(query),
            ..Self::empty(action_id)
        }
    }

    pub fn email(action_id: &str, message: Value) -> Self {
        Self {
            email: Some(message),
            ..Self::empty(action_id)
        }
    }
}

/// The POST body.
#[derive(Clone, Debug, Serialize)]
pub struct IngestBody {
    pub entries: Vec<Entry>,
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Credentials and endpoint of the ingestion API.
#[derive(Clone, Debug)]
pub struct IngestTarget {
    pub api_base: String,
    pub app_id: String,
    pub app_secret: String,
    pub tenant_id: String,
    pub app_name: Option<String>,
}

/// Blocking HTTP transport. Run it from `spawn_blocking`; errors are
/// logged at debug level and dropped.
pub struct HttpTransport {
    target: IngestTarget,
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(target: IngestTarget) -> Self {
        Self {
            target,
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl Transport for HttpTransport {
    fn send(&mut self, session_id: &str, body: &IngestBody) -> Result<(), TransportError> {
        let url = format!(
            "{}/v1/sessions/{}/backend",
            self.target.api_base.trim_end_matches('/'),
            session_id
        );
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-App-Id", &self.target.app_id)
            .header("X-App-Secret", &self.target.app_secret)
            .header("X-Tenant-Id", &self.target.tenant_id);
        if let Some(app_name) = &self.target.app_name {
            request = request.header("X-App-Name", app_name);
        }
        request.json(body).send()?;
        Ok(())
    }
}

/// Prints each body to stderr; for local debugging.
pub struct ConsoleTransport;

impl Transport for ConsoleTransport {
    fn send(&mut self, session_id: &str, body: &IngestBody) -> Result<(), TransportError> {
        eprintln!("[calltrace] session {}: {:#?}", session_id, body);
        Ok(())
    }
}

/// Captures every body in memory; for tests.
pub struct TestTransport {
    pub sent: Arc<Mutex<Vec<(String, IngestBody)>>>,
}

impl TestTransport {
    pub fn new() -> (Self, Arc<Mutex<Vec<(String, IngestBody)>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (Self { sent: sent.clone() }, sent)
    }
}

impl Transport for TestTransport {
    fn send(&mut self, session_id: &str, body: &IngestBody) -> Result<(), TransportError> {
        self.sent.lock().push((session_id.to_string(), body.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ScopeId;

    #[test]
    fn entry_serialization_shape() {
        let entry = Entry::request(
            "action-1",
            RequestPayload {
                rid: "rid-1".to_string(),
                method: "GET".to_string(),
                url: "/users?limit=2".to_string(),
                path: "/users".to_string(),
                status: 200,
                dur_ms: 12,
                headers: serde_json::json!({}),
                key: "GET /users".to_string(),
                body: None,
                params: None,
                query: Some(serde_json::json!({"limit": "2"})),
                resp_body: None,
                entry_point: Some("list_users".to_string()),
                trace: None,
            },
        );
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["actionId"], "action-1");
        assert_eq!(value["request"]["durMs"], 12);
        assert_eq!(value["request"]["entryPoint"], "list_users");
        assert!(value.get("traceBatch").is_none());
        assert!(value.get("t").is_some());
    }

    #[test]
    fn trace_batch_entry_is_stringified() {
        let batch = crate::assemble::batch(ScopeId(5), Vec::new(), 10);
        assert!(batch.is_empty());

        let batch = TraceBatch {
            scope_id: ScopeId(5),
            index: 0,
            total: 1,
            events: Vec::new(),
        };
        let entry = Entry::trace_batch("action-1", "rid-1", &batch);
        assert_eq!(entry.trace.as_deref(), Some("[]"));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["traceBatch"]["rid"], "rid-1");
        assert_eq!(value["traceBatch"]["total"], 1);
    }

    #[test]
    fn test_transport_captures() {
        let (mut transport, sent) = TestTransport::new();
        transport
            .send("session-9", &IngestBody { entries: vec![] })
            .unwrap();
        assert_eq!(sent.lock().len(), 1);
        assert_eq!(sent.lock()[0].0, "session-9");
    }
}
