// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! The declarative filter layer applied to the event stream.
//!
//! Filters drop events; they never alter them. A [`FilterSet`] is compiled
//! once from the [`Config`](crate::config::Config) and evaluated per event
//! by the per-request collector.

use regex::Regex;

use crate::config::Config;
use crate::config::DisableRule;
use crate::config::PathMatcher;
use crate::event::FunctionKind;
use crate::event::Phase;
use crate::event::TraceEvent;

/// A pattern over a normalized forward-slash path.
///
/// `re:`-prefixed strings compile to a regex; patterns containing a slash
/// match as substrings; anything else matches as a filename suffix.
#[derive(Debug, Clone)]
pub enum FilePattern {
    Substring(String),
    Suffix(String),
    Regex(Regex),
}

impl FilePattern {
    pub fn parse(pattern: &str) -> Option<FilePattern> {
        if let Some(expr) = pattern.strip_prefix("re:") {
            return match Regex::new(expr) {
                Ok(re) => Some(FilePattern::Regex(re)),
                Err(err) => {
                    log::warn!("ignoring invalid file filter {:?}: {}", pattern, err);
                    None
                }
            };
        }
        if pattern.contains('/') {
            Some(FilePattern::Substring(pattern.to_string()))
        } else {
            Some(FilePattern::Suffix(pattern.to_string()))
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = PathMatcher::normalize(path);
        match self {
            FilePattern::Substring(s) => path.contains(s.as_str()),
            FilePattern::Suffix(s) => path
                .rsplit('/')
                .next()
                .map(|name| name.ends_with(s.as_str()))
                .unwrap_or(false),
            FilePattern::Regex(re) => re.is_match(&path),
        }
    }
}

/// Infer the library a path belongs to: the first segment under a
/// `node_modules/` directory, or the crate name under a cargo registry or
/// `deps/` directory (version suffix stripped).
pub fn infer_library(path: &str) -> Option<String> {
    let path = PathMatcher::normalize(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if let Some(pos) = segments.iter().position(|s| *s == "node_modules") {
        return segments.get(pos + 1).map(|s| s.to_string());
    }
    if let Some(pos) = segments.iter().position(|s| *s == "registry") {
        // .../registry/src/<index>/<crate>-<version>/...
        if segments.get(pos + 1) == Some(&"src") {
            return segments.get(pos + 3).map(|s| strip_version(s));
        }
    }
    if let Some(pos) = segments.iter().position(|s| *s == "deps") {
        return segments.get(pos + 1).map(|s| strip_version(s));
    }
    None
}

fn strip_version(segment: &str) -> String {
    match segment.rfind('-') {
        Some(idx)
            if segment[idx + 1..]
                .chars()
                .next()
                .map(|c| c.is_ascii_digit())
                .unwrap_or(false) =>
        {
            segment[..idx].to_string()
        }
        _ => segment.to_string(),
    }
}

/// User-supplied predicate: returns `true` to keep the event.
pub type EventPredicate = Box<dyn Fn(&TraceEvent) -> bool + Send + Sync>;

/// Compiled filter set. [`FilterSet::admits`] returns `false` for events
/// that must be dropped.
#[derive(Default)]
pub struct FilterSet {
    files: Vec<FilePattern>,
    kinds: Vec<FunctionKind>,
    rules: Vec<DisableRule>,
    predicates: Vec<EventPredicate>,
}

impl FilterSet {
    pub fn from_config(config: &Config) -> Self {
        let mut files: Vec<FilePattern> = config
            .disable_trace_files
            .iter()
            .filter_map(|p| FilePattern::parse(p))
            .collect();
        if !config.trace_interceptors {
            // Request-path interceptor frames stay out of traces by default.
            files.push(FilePattern::Substring("/interceptors/".to_string()));
            files.push(FilePattern::Substring("/middlewares/".to_string()));
        }
        Self {
            files,
            kinds: config.disable_function_types.clone(),
            rules: config.disable_function_traces.clone(),
            predicates: Vec::new(),
        }
    }

    /// Add a user predicate; events for which it returns `false` are
    /// dropped.
    pub fn with_predicate(mut self, predicate: EventPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn admits(&self, event: &TraceEvent) -> bool {
        if self.kinds.contains(&event.kind) {
            return false;
        }
        if let Some(file) = event.file.as_deref() {
            if self.files.iter().any(|p| p.matches(file)) {
                return false;
            }
        }
        if self.rules.iter().any(|rule| rule_matches(rule, event)) {
            return false;
        }
        self.predicates.iter().all(|p| p(event))
    }
}

fn rule_matches(rule: &DisableRule, event: &TraceEvent) -> bool {
    if let Some(name) = &rule.name {
        if event.name != name.as_str() {
            return false;
        }
    }
    if let Some(file) = &rule.file {
        match event.file.as_deref() {
            Some(path) => {
                if !PathMatcher::normalize(path).contains(file.as_str()) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if let Some(library) = &rule.library {
        match event.file.as_deref().and_then(infer_library) {
            Some(lib) => {
                if &lib != library {
                    return false;
                }
            }
            None => return false,
        }
    }
    if let Some(kind) = rule.kind {
        if event.kind != kind {
            return false;
        }
    }
    if let Some(phase) = rule.phase {
        if event.phase != phase {
            return false;
        }
    }
    // An empty rule matches nothing rather than everything.
    rule.name.is_some()
        || rule.file.is_some()
        || rule.library.is_some()
        || rule.kind.is_some()
        || rule.phase.is_some()
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::*;
    use crate::event::ScopeId;
    use crate::event::SpanId;

    fn event(name: &'static str, file: &'static str, kind: FunctionKind) -> TraceEvent {
        TraceEvent {
            phase: Phase::Enter,
            ts_unix_ns: 0,
            name: Cow::Borrowed(name),
            file: Some(Cow::Borrowed(file)),
            line: Some(1),
            kind,
            scope_id: ScopeId(1),
            depth: 1,
            span_id: SpanId(1),
            parent_span_id: None,
            args: None,
            ret: None,
            error: None,
            threw: false,
            unawaited: false,
        }
    }

    #[test]
    fn file_pattern_flavors() {
        let substring = FilePattern::parse("src/generated/").unwrap();
        assert!(substring.matches("app/src/generated/schema.rs"));
        assert!(!substring.matches("app/src/handlers.rs"));

        let suffix = FilePattern::parse("schema.rs").unwrap();
        assert!(suffix.matches("app/src/schema.rs"));
        assert!(!suffix.matches("app/src/schema.rs.bak"));

        let regex = FilePattern::parse(r"re:tests?/").unwrap();
        assert!(regex.matches("crate/tests/lib.rs"));

        assert!(FilePattern::parse("re:(").is_none());
    }

    #[test]
    fn library_inference() {
        assert_eq!(
            infer_library("/app/node_modules/lodash/index.js").as_deref(),
            Some("lodash")
        );
        assert_eq!(
            infer_library("/home/u/.cargo/registry/src/index.crates.io-6f17d22b/serde-1.0.193/src/lib.rs")
                .as_deref(),
            Some("serde")
        );
        assert_eq!(
            infer_library("target/debug/deps/regex-automata/src/lib.rs").as_deref(),
            Some("regex-automata")
        );
        assert_eq!(infer_library("src/app.rs"), None);
    }

    #[test]
    fn kind_and_rule_filters() {
        let config = Config::default()
            .disable_function_types(vec![FunctionKind::Getter])
            .disable_function_traces(vec![DisableRule {
                name: Some("poll_loop".to_string()),
                phase: Some(Phase::Enter),
                ..DisableRule::default()
            }]);
        let filters = FilterSet::from_config(&config);

        assert!(!filters.admits(&event("get_x", "src/a.rs", FunctionKind::Getter)));
        assert!(!filters.admits(&event("poll_loop", "src/a.rs", FunctionKind::Function)));
        assert!(filters.admits(&event("handler", "src/a.rs", FunctionKind::Function)));
    }

    #[test]
    fn empty_rule_matches_nothing() {
        let rule = DisableRule::default();
        assert!(!rule_matches(
            &rule,
            &event("f", "src/a.rs", FunctionKind::Function)
        ));
    }

    #[test]
    fn interceptor_frames_dropped_by_default() {
        let filters = FilterSet::from_config(&Config::default());
        assert!(!filters.admits(&event(
            "check_auth",
            "src/interceptors/auth.rs",
            FunctionKind::Function
        )));

        let tracing_on = Config::default().trace_interceptors(true);
        let filters = FilterSet::from_config(&tracing_on);
        assert!(filters.admits(&event(
            "check_auth",
            "src/interceptors/auth.rs",
            FunctionKind::Function
        )));
    }

    #[test]
    fn user_predicates() {
        let filters = FilterSet::default()
            .with_predicate(Box::new(|e| !e.name.starts_with("__")));
        assert!(filters.admits(&event("f", "src/a.rs", FunctionKind::Function)));
        assert!(!filters.admits(&event("__hidden", "src/a.rs", FunctionKind::Function)));
    }

    #[test]
    fn library_rule() {
        let config = Config::default().disable_function_traces(vec![DisableRule {
            library: Some("lodash".to_string()),
            ..DisableRule::default()
        }]);
        let filters = FilterSet::from_config(&config);
        assert!(!filters.admits(&event(
            "map",
            "/app/node_modules/lodash/map.js",
            FunctionKind::Function
        )));
        assert!(filters.admits(&event("map", "src/app.rs", FunctionKind::Function)));
    }
}
