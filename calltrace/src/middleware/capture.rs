// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Request/response snapshot helpers for the middleware.

use axum::http::HeaderMap;
use serde_json::Map;
use serde_json::Value;

use crate::sanitize::Sanitizer;

/// Headers rendered as a sanitized JSON object. Credential-bearing headers
/// are redacted wholesale.
pub fn headers_value(headers: &HeaderMap) -> Value {
    const REDACTED: &[&str] = &["authorization", "cookie", "x-app-secret"];

    let sanitizer = Sanitizer::default();
    let mut out = Map::new();
    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        let value = if REDACTED.contains(&name.as_str()) {
            Value::String("[Redacted]".to_string())
        } else {
            match value.to_str() {
                Ok(s) => Value::String(s.to_string()),
                Err(_) => crate::sanitize::bytes_value(value.as_bytes()),
            }
        };
        out.insert(name, value);
    }
    sanitizer.value(&Value::Object(out))
}

/// Parse a query string into a JSON object. Repeated keys keep the last
/// value; keys and values are percent-decoded minimally (`+` and `%xx`).
pub fn query_value(query: Option<&str>) -> Option<Value> {
    let query = query?;
    if query.is_empty() {
        return None;
    }
    let mut out = Map::new();
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let key = decode_component(parts.next().unwrap_or_default());
        let value = decode_component(parts.next().unwrap_or_default());
        if !key.is_empty() {
            out.insert(key, Value::String(value));
        }
    }
    Some(Value::Object(out))
}

fn decode_component(raw: &str) -> String {
    let raw = raw.replace('+', " ");
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(hex) = bytes.get(i + 1..i + 3).and_then(|h| std::str::from_utf8(h).ok()) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Recover route parameters by aligning the matched route pattern
/// (`/users/{id}`) with the concrete path (`/users/7`).
pub fn params_from_match(pattern: &str, path: &str) -> Option<Value> {
    let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if pattern_segments.len() != path_segments.len() {
        return None;
    }

    let mut out = Map::new();
    for (pattern_segment, path_segment) in pattern_segments.iter().zip(&path_segments) {
        if let Some(name) = pattern_segment
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
        {
            out.insert(
                name.trim_start_matches('*').to_string(),
                Value::String(decode_component(path_segment)),
            );
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(Value::Object(out))
    }
}

/// True when the content type announces a JSON body.
pub fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("json"))
        .unwrap_or(false)
}

/// Interpret captured body bytes: JSON when the content type says so, a
/// clipped string otherwise, nothing when empty.
pub fn body_value(headers: &HeaderMap, bytes: &[u8]) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    let sanitizer = Sanitizer::default();
    if is_json(headers) {
        if let Some(value) = sanitizer.json_bytes(bytes) {
            return Some(value);
        }
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Some(sanitizer.value(&Value::String(text.to_string()))),
        Err(_) => Some(crate::sanitize::bytes_value(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn headers_are_redacted_and_lowercased() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer tok"));
        headers.insert("X-Custom", HeaderValue::from_static("1"));
        let value = headers_value(&headers);
        assert_eq!(value["authorization"], "[Redacted]");
        assert_eq!(value["x-custom"], "1");
    }

    #[test]
    fn query_parsing() {
        let value = query_value(Some("limit=2&name=a+b%21&flag")).unwrap();
        assert_eq!(value["limit"], "2");
        assert_eq!(value["name"], "a b!");
        assert_eq!(value["flag"], "");
        assert!(query_value(Some("")).is_none());
        assert!(query_value(None).is_none());
    }

    #[test]
    fn body_interpretation() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        assert_eq!(
            body_value(&headers, br#"{"a":1}"#),
            Some(serde_json::json!({"a": 1}))
        );

        let plain = HeaderMap::new();
        assert_eq!(
            body_value(&plain, b"hello"),
            Some(serde_json::json!("hello"))
        );
        assert_eq!(body_value(&plain, b""), None);
        assert_eq!(
            body_value(&plain, &[0xff, 0xfe]),
            Some(serde_json::json!("[Buffer 2 bytes]"))
        );
    }

    #[test]
    fn params_recovered_from_matched_pattern() {
        let params = params_from_match("/users/{id}/posts/{post}", "/users/7/posts/a%20b").unwrap();
        assert_eq!(params["id"], "7");
        assert_eq!(params["post"], "a b");
        assert!(params_from_match("/users", "/users").is_none());
        assert!(params_from_match("/users/{id}", "/users").is_none());
    }

    #[test]
    fn malformed_json_body_falls_back_to_text() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        assert_eq!(
            body_value(&headers, b"not-json"),
            Some(serde_json::json!("not-json"))
        );
    }
}
