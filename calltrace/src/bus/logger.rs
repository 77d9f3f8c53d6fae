// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Console logger subscriber.
//!
//! Renders the live event stream as an indented call log. Exact-repeat lines
//! are coalesced into a single `"… ×N"` line, and when application code
//! calls out into a dependency only the top-most dependency frame is
//! printed; deeper dependency frames stay muted until that frame exits.
//! Coalescing affects the log output only, never the structured stream.

use crate::bus;
use crate::bus::SubscriberId;
use crate::config::PathMatcher;
use crate::event::Phase;
use crate::event::TraceEvent;

type LineSink = Box<dyn FnMut(String) + Send>;

pub struct ConsoleLogger {
    matcher: PathMatcher,
    sink: LineSink,
    last_line: Option<String>,
    repeats: usize,
    mute_below: Option<usize>,
}

impl ConsoleLogger {
    pub fn new(matcher: PathMatcher) -> Self {
        Self::with_sink(matcher, Box::new(|line| log::debug!("{}", line)))
    }

    pub fn with_sink(matcher: PathMatcher, sink: LineSink) -> Self {
        Self {
            matcher,
            sink,
            last_line: None,
            repeats: 0,
            mute_below: None,
        }
    }

    /// Register the logger on the bus. Skipped entirely when `quiet` is set.
    pub fn install(config: &crate::config::Config) -> Option<SubscriberId> {
        if !config.log_function_calls || config.is_quiet() {
            return None;
        }
        let mut logger = ConsoleLogger::new(config.path_matcher());
        Some(bus::subscribe(Box::new(move |event| logger.observe(event))))
    }

    pub fn observe(&mut self, event: &TraceEvent) {
        let is_app = event
            .file
            .as_deref()
            .map(|f| self.matcher.is_app(f))
            .unwrap_or(false);

        match (event.phase, is_app) {
            (Phase::Enter, false) => {
                if let Some(mute_depth) = self.mute_below {
                    if event.depth > mute_depth {
                        return;
                    }
                }
                self.mute_below.get_or_insert(event.depth);
            }
            (Phase::Exit, false) => {
                match self.mute_below {
                    Some(mute_depth) if event.depth > mute_depth => return,
                    Some(mute_depth) if event.depth == mute_depth => {
                        self.mute_below = None;
                    }
                    _ => {}
                }
            }
            // Application frames are always printed, even inside a muted
            // dependency excursion (a dependency may call back into app
            // code).
            (_, true) => {}
        }

        let marker = match event.phase {
            Phase::Enter => "→",
            Phase::Exit => "←",
        };
        let indent = "  ".repeat(event.depth.saturating_sub(1));
        let line = format!("{}{} {}", indent, marker, event.name);
        self.push_line(line);
    }

    fn push_line(&mut self, line: String) {
        if self.last_line.as_deref() == Some(line.as_str()) {
            self.repeats += 1;
            return;
        }
        self.flush();
        self.last_line = Some(line);
        self.repeats = 1;
    }

    /// Emit the pending line (with its repeat count) to the sink.
    pub fn flush(&mut self) {
        if let Some(last) = self.last_line.take() {
            if self.repeats > 1 {
                (self.sink)(format!("{} ×{}", last, self.repeats));
            } else {
                (self.sink)(last);
            }
        }
        self.repeats = 0;
    }
}

impl Drop for ConsoleLogger {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::event::FunctionKind;
    use crate::event::ScopeId;
    use crate::event::SpanId;

    fn event(phase: Phase, name: &'static str, file: &'static str, depth: usize) -> TraceEvent {
        TraceEvent {
            phase,
            ts_unix_ns: 0,
            name: Cow::Borrowed(name),
            file: Some(Cow::Borrowed(file)),
            line: Some(1),
            kind: FunctionKind::Function,
            scope_id: ScopeId(1),
            depth,
            span_id: SpanId(1),
            parent_span_id: None,
            args: None,
            ret: None,
            error: None,
            threw: false,
            unawaited: false,
        }
    }

    fn logger_with_capture() -> (ConsoleLogger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let matcher = PathMatcher::new(&["src/".to_string()], &[]);
        let logger =
            ConsoleLogger::with_sink(matcher, Box::new(move |line| sink.lock().push(line)));
        (logger, lines)
    }

    #[test]
    fn indents_by_depth() {
        let (mut logger, lines) = logger_with_capture();
        logger.observe(&event(Phase::Enter, "outer", "src/a.rs", 1));
        logger.observe(&event(Phase::Enter, "inner", "src/a.rs", 2));
        logger.flush();
        assert_eq!(*lines.lock(), vec!["→ outer", "  → inner"]);
    }

    #[test]
    fn coalesces_exact_repeats() {
        let (mut logger, lines) = logger_with_capture();
        for _ in 0..3 {
            logger.observe(&event(Phase::Enter, "tick", "src/a.rs", 1));
        }
        logger.observe(&event(Phase::Enter, "other", "src/a.rs", 1));
        logger.flush();
        assert_eq!(*lines.lock(), vec!["→ tick ×3", "→ other"]);
    }

    #[test]
    fn mutes_nested_dependency_frames() {
        let (mut logger, lines) = logger_with_capture();
        logger.observe(&event(Phase::Enter, "handler", "src/a.rs", 1));
        logger.observe(&event(Phase::Enter, "dep_top", "/x/node_modules/d/i.js", 2));
        logger.observe(&event(Phase::Enter, "dep_deep", "/x/node_modules/d/j.js", 3));
        logger.observe(&event(Phase::Exit, "dep_deep", "/x/node_modules/d/j.js", 3));
        logger.observe(&event(Phase::Exit, "dep_top", "/x/node_modules/d/i.js", 2));
        logger.observe(&event(Phase::Exit, "handler", "src/a.rs", 1));
        logger.flush();
        assert_eq!(
            *lines.lock(),
            vec!["→ handler", "  → dep_top", "  ← dep_top", "← handler"]
        );
    }

    #[test]
    fn app_frames_print_inside_muted_excursion() {
        let (mut logger, lines) = logger_with_capture();
        logger.observe(&event(Phase::Enter, "dep", "/x/node_modules/d/i.js", 1));
        logger.observe(&event(Phase::Enter, "callback", "src/a.rs", 2));
        logger.flush();
        assert_eq!(*lines.lock(), vec!["→ dep", "  → callback"]);
    }
}
