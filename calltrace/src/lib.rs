// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Per-request function-call tracing with a session-keyed ingestion egress.
//!
//! `calltrace` captures a causally ordered enter/exit event stream for every
//! function executed while serving a tagged HTTP request, together with
//! request/response snapshots and database activity, and ships the result to
//! an ingestion API. Application sources are rewritten ahead of time by the
//! companion `calltrace-rewrite` crate so that every function body and call
//! site reports through this runtime.
//!
//! ## Scope and spans
//!
//! A scope is the task-local store behind one logical request. Spans open on
//! enter and close on exit; the stack lives in the scope and follows the
//! request across await points:
//!
//! ```
//! use calltrace::event::ScopeId;
//! use calltrace::scope;
//!
//! let events = calltrace::test_support::capture_scope_events(ScopeId(1), || {
//!     let scope = scope::current().unwrap();
//!     let info = calltrace::event::FrameInfo {
//!         name: "handler".into(),
//!         file: Some("src/app.rs".into()),
//!         line: Some(1),
//!         kind: calltrace::event::FunctionKind::Function,
//!     };
//!     scope.enter(&info, None);
//!     scope.exit(&info, Default::default());
//! });
//! assert_eq!(events.len(), 2);
//! ```
//!
//! ## Installing
//!
//! The middleware collects only while a transport is installed:
//!
//! ```
//! use calltrace::config::Config;
//! use calltrace::ingest::TestTransport;
//!
//! let (transport, _sent) = TestTransport::new();
//! calltrace::install(transport, Config::default().from_env());
//! # calltrace::uninstall();
//! ```
//!
//! Axum applications then layer
//! [`middleware::trace_requests`](crate::middleware::trace_requests) onto
//! their router; requests carrying `x-bug-session-id` and `x-bug-action-id`
//! are traced, everything else passes through untouched.

pub mod assemble;
pub mod bus;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod ext;
pub mod ingest;
pub mod middleware;
pub mod origin;
pub mod runtime;
pub mod sanitize;
pub mod scope;
#[doc(hidden)]
pub mod test_support;

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use parking_lot::RwLock;

use crate::bus::filter::FilterSet;
use crate::bus::logger::ConsoleLogger;
use crate::bus::SubscriberId;
use crate::config::Config;
use crate::config::PathMatcher;
use crate::ingest::Transport;

/// Global tracer state created by [`install`].
pub struct Installed {
    pub config: Config,
    pub filters: FilterSet,
    pub matcher: PathMatcher,
    pub transport: Arc<Mutex<Box<dyn Transport>>>,
    logger: Option<SubscriberId>,
}

static INSTALLED: Lazy<RwLock<Option<Arc<Installed>>>> = Lazy::new(|| RwLock::new(None));

/// Install the tracer: compile the filters, start the console logger when
/// configured, and make the transport available to the middleware.
/// Installing again replaces the previous transport; it never doubles
/// subscriptions.
pub fn install(transport: impl Transport + 'static, config: Config) {
    let installed = Arc::new(Installed {
        filters: FilterSet::from_config(&config),
        matcher: config.path_matcher(),
        transport: Arc::new(Mutex::new(Box::new(transport))),
        logger: ConsoleLogger::install(&config),
        config,
    });
    if let Some(previous) = INSTALLED.write().replace(installed) {
        if let Some(logger) = previous.logger {
            bus::unsubscribe(logger);
        }
    }
}

/// Tear the tracer down; the middleware passes everything through again.
pub fn uninstall() {
    if let Some(previous) = INSTALLED.write().take() {
        if let Some(logger) = previous.logger {
            bus::unsubscribe(logger);
        }
    }
}

/// The installed tracer, if any.
pub fn installed() -> Option<Arc<Installed>> {
    INSTALLED.read().clone()
}

pub mod prelude {
    //! A "prelude" for crates using `calltrace`.
    #[doc(no_inline)]
    pub use crate::config::Config;
    #[doc(no_inline)]
    pub use crate::dispatch;
    #[doc(no_inline)]
    pub use crate::event::ScopeId;
    #[doc(no_inline)]
    pub use crate::event::SpanId;
    #[doc(no_inline)]
    pub use crate::event::TraceEvent;
    #[doc(no_inline)]
    pub use crate::ingest::HttpTransport;
    #[doc(no_inline)]
    pub use crate::ingest::IngestTarget;
    #[doc(no_inline)]
    pub use crate::scope::ScopeExt as _;
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::ingest::TestTransport;

    #[test]
    #[serial]
    fn install_replaces_previous() {
        let (first, _) = TestTransport::new();
        install(first, Config::default());
        assert!(installed().is_some());

        let (second, sent) = TestTransport::new();
        install(second, Config::default());
        installed()
            .unwrap()
            .transport
            .lock()
            .send("s", &ingest::IngestBody { entries: vec![] })
            .unwrap();
        assert_eq!(sent.lock().len(), 1);

        uninstall();
        assert!(installed().is_none());
    }
}
