// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Configuration of the tracer.
//!
//! [`Config`] is a builder in the usual style: every setter consumes and
//! returns the config. Environment variables override the corresponding
//! builder fields at [`Config::from_env`] time so operators can flip the
//! tracer without a redeploy.

use std::time::Duration;

use regex::Regex;

use crate::event::FunctionKind;

/// Operating mode of the SDK.
///
/// `V8` enables the out-of-band sampling profiler which is handled by an
/// external collaborator; the core parses and carries the mode but otherwise
/// behaves identically.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    Trace,
    V8,
}

impl Mode {
    fn parse(s: &str) -> Option<Mode> {
        match s.trim() {
            "trace" => Some(Mode::Trace),
            "v8" => Some(Mode::V8),
            _ => None,
        }
    }
}

/// A declarative rule disabling traces for matching events. All populated
/// fields must match for the rule to drop an event.
#[derive(Debug, Clone, Default)]
pub struct DisableRule {
    pub name: Option<String>,
    pub file: Option<String>,
    pub library: Option<String>,
    pub kind: Option<FunctionKind>,
    pub phase: Option<crate::event::Phase>,
}

/// Path classifier compiled from the `include`/`exclude` regex lists.
///
/// A file is application code iff it matches at least one include pattern and
/// no exclude pattern. Paths are normalized to forward slashes before
/// matching.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl PathMatcher {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .filter_map(|p| match Regex::new(p) {
                    Ok(re) => Some(re),
                    Err(err) => {
                        log::warn!("ignoring invalid path pattern {:?}: {}", p, err);
                        None
                    }
                })
                .collect()
        };
        Self {
            include: compile(include),
            exclude: compile(exclude),
        }
    }

    /// Normalize a path to forward slashes.
    pub fn normalize(path: &str) -> String {
        path.replace('\\', "/")
    }

    pub fn is_app(&self, path: &str) -> bool {
        let path = Self::normalize(path);
        self.include.iter().any(|re| re.is_match(&path))
            && !self.exclude.iter().any(|re| re.is_match(&path))
    }
}

/// Configuration of the tracer core.
#[must_use]
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) instrument: bool,
    pub(crate) include: Vec<String>,
    pub(crate) exclude: Vec<String>,
    pub(crate) parser_plugins: Vec<String>,
    pub(crate) mode: Mode,
    pub(crate) sampling_ms: u64,
    pub(crate) wrap_getters_setters: bool,
    pub(crate) skip_anonymous: bool,
    pub(crate) allow_fns: Vec<String>,
    pub(crate) disable_function_traces: Vec<DisableRule>,
    pub(crate) disable_function_types: Vec<FunctionKind>,
    pub(crate) disable_trace_files: Vec<String>,
    pub(crate) log_function_calls: bool,
    pub(crate) trace_interceptors: bool,
    pub(crate) quiet: bool,
    pub(crate) debug_unawaited: bool,
    pub(crate) linger_after_finish: Duration,
    pub(crate) idle_flush: Duration,
    pub(crate) batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instrument: true,
            include: vec!["src/".to_string()],
            exclude: vec!["/registry/".to_string(), "/deps/".to_string()],
            parser_plugins: Vec::new(),
            mode: Mode::Trace,
            sampling_ms: 10,
            wrap_getters_setters: false,
            skip_anonymous: false,
            allow_fns: Vec::new(),
            disable_function_traces: Vec::new(),
            disable_function_types: Vec::new(),
            disable_trace_files: Vec::new(),
            log_function_calls: false,
            trace_interceptors: false,
            quiet: false,
            debug_unawaited: false,
            linger_after_finish: Duration::from_millis(3000),
            idle_flush: Duration::from_millis(300),
            batch_size: 250,
        }
    }
}

impl Config {
    /// Whether source rewriting is enabled at all.
    pub fn instrument(self, instrument: bool) -> Self {
        Self { instrument, ..self }
    }

    /// Regex patterns selecting application files.
    pub fn include(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.include = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Regex patterns excluding files from the application set.
    pub fn exclude(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclude = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Syntactic dialects the rewriter must accept. Unknown entries are
    /// carried but ignored by the core.
    pub fn parser_plugins(mut self, plugins: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.parser_plugins = plugins.into_iter().map(Into::into).collect();
        self
    }

    pub fn mode(self, mode: Mode) -> Self {
        Self { mode, ..self }
    }

    /// Sampling interval for the out-of-band profiler, when `mode` is
    /// [`Mode::V8`].
    pub fn sampling_ms(self, sampling_ms: u64) -> Self {
        Self {
            sampling_ms,
            ..self
        }
    }

    /// Wrap property accessors. Getters and setters are skipped by default.
    pub fn wrap_getters_setters(self, wrap_getters_setters: bool) -> Self {
        Self {
            wrap_getters_setters,
            ..self
        }
    }

    /// Skip anonymous (closure) functions entirely.
    pub fn skip_anonymous(self, skip_anonymous: bool) -> Self {
        Self {
            skip_anonymous,
            ..self
        }
    }

    /// Allowlist mode: when non-empty, only functions whose display name
    /// matches one of these regexes are wrapped.
    pub fn allow_fns(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allow_fns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Declarative compound rules dropping matching events.
    pub fn disable_function_traces(mut self, rules: Vec<DisableRule>) -> Self {
        self.disable_function_traces = rules;
        self
    }

    /// Function kinds whose events are dropped.
    pub fn disable_function_types(mut self, kinds: Vec<FunctionKind>) -> Self {
        self.disable_function_types = kinds;
        self
    }

    /// File patterns (substring, filename suffix, or `re:`-prefixed regex)
    /// whose events are dropped.
    pub fn disable_trace_files(
        mut self,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.disable_trace_files = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Enable the console logger subscriber.
    pub fn log_function_calls(self, log_function_calls: bool) -> Self {
        Self {
            log_function_calls,
            ..self
        }
    }

    /// Trace request-path interceptor functions. Off by default.
    pub fn trace_interceptors(self, trace_interceptors: bool) -> Self {
        Self {
            trace_interceptors,
            ..self
        }
    }

    /// Number of events per egress batch.
    pub fn batch_size(self, batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            ..self
        }
    }

    /// Hard deadline after the response finishes before a forced flush.
    pub fn linger_after_finish(self, linger_after_finish: Duration) -> Self {
        Self {
            linger_after_finish,
            ..self
        }
    }

    /// Idle duration without new events that triggers the flush.
    pub fn idle_flush(self, idle_flush: Duration) -> Self {
        Self { idle_flush, ..self }
    }

    /// Apply environment overrides: `TRACE_MODE`, `TRACE_QUIET`,
    /// `TRACE_DEBUG_UNAWAITED`, `TRACE_LINGER_AFTER_FINISH_MS` and
    /// `TRACE_IDLE_FLUSH_MS`.
    pub fn from_env(mut self) -> Self {
        if let Ok(mode) = std::env::var("TRACE_MODE") {
            if let Some(mode) = Mode::parse(&mode) {
                self.mode = mode;
            }
        }
        if let Ok(quiet) = std::env::var("TRACE_QUIET") {
            self.quiet = truthy(&quiet);
        }
        if let Ok(dbg) = std::env::var("TRACE_DEBUG_UNAWAITED") {
            self.debug_unawaited = truthy(&dbg);
        }
        if let Some(ms) = env_millis("TRACE_LINGER_AFTER_FINISH_MS") {
            self.linger_after_finish = ms;
        }
        if let Some(ms) = env_millis("TRACE_IDLE_FLUSH_MS") {
            self.idle_flush = ms;
        }
        self
    }

    /// Compile the include/exclude lists into a [`PathMatcher`].
    pub fn path_matcher(&self) -> PathMatcher {
        PathMatcher::new(&self.include, &self.exclude)
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn current_mode(&self) -> Mode {
        self.mode
    }
}

fn truthy(s: &str) -> bool {
    matches!(s.trim(), "1" | "true" | "yes" | "on")
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_matcher_basic() {
        let matcher = PathMatcher::new(
            &["src/".to_string()],
            &["src/vendor/".to_string(), "/registry/".to_string()],
        );
        assert!(matcher.is_app("src/app/handlers.rs"));
        assert!(!matcher.is_app("src/vendor/lib.rs"));
        assert!(!matcher.is_app("/home/u/.cargo/registry/src/idx/serde-1.0.0/src/lib.rs"));
        assert!(!matcher.is_app("build/out.rs"));
    }

    #[test]
    fn path_matcher_normalizes_backslashes() {
        let matcher = PathMatcher::new(&["src/".to_string()], &[]);
        assert!(matcher.is_app("src\\app\\handlers.rs"));
    }

    #[test]
    fn invalid_pattern_is_ignored() {
        let matcher = PathMatcher::new(&["[".to_string(), "src/".to_string()], &[]);
        assert!(matcher.is_app("src/main.rs"));
    }

    #[test]
    #[serial_test::serial]
    fn env_overrides() {
        std::env::set_var("TRACE_MODE", "v8");
        std::env::set_var("TRACE_QUIET", "1");
        std::env::set_var("TRACE_IDLE_FLUSH_MS", "42");
        let config = Config::default().from_env();
        assert_eq!(config.mode, Mode::V8);
        assert!(config.quiet);
        assert_eq!(config.idle_flush, Duration::from_millis(42));
        std::env::remove_var("TRACE_MODE");
        std::env::remove_var("TRACE_QUIET");
        std::env::remove_var("TRACE_IDLE_FLUSH_MS");
    }
}
