// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Source rewriting for `calltrace`.
//!
//! This crate is the build-time half of the tracer: a source-to-source
//! transformer that wraps every function body with enter/exit emission and
//! routes every call expression through the runtime dispatcher, plus the
//! module interceptor that drives it per code unit and feeds the origin
//! registry.
//!
//! ```
//! use calltrace_rewrite::ModuleInterceptor;
//! use calltrace_rewrite::RewriteOptions;
//!
//! let interceptor = ModuleInterceptor::new(
//!     &["src/".to_string()],
//!     &["src/vendor/".to_string()],
//!     RewriteOptions::default(),
//!     true,
//! );
//! let module = interceptor.load("src/app.rs", "fn handle() {}");
//! assert!(module.instrumented);
//! assert!(module.source.contains("__trace_frame"));
//! ```
//!
//! The rewritten source is semantically equivalent to the input: evaluation
//! order is preserved, thrown errors propagate, and returned values are
//! untouched. Rewriting is idempotent; a unit that fails to parse is left
//! exactly as it was.

pub mod interceptor;
pub mod source_map;
pub mod transform;

use proc_macro2::Span;
use regex::Regex;

pub use interceptor::LoadedModule;
pub use interceptor::ModuleInterceptor;
pub use source_map::OriginalPosition;
pub use source_map::SourceMap;
pub use transform::TransformOutput;
pub use transform::Transformer;

/// Options steering the transformer, mirroring the runtime configuration.
#[derive(Debug)]
pub struct RewriteOptions {
    /// Wrap property accessors (off by default).
    pub wrap_getters_setters: bool,
    /// Skip functions with no resolvable display name.
    pub skip_anonymous: bool,
    /// Allowlist mode: when non-empty, only matching names are wrapped.
    pub allow_fns: Vec<Regex>,
    /// Accepted syntactic dialects. Carried for configuration parity;
    /// unknown entries are ignored by this transformer.
    pub parser_plugins: Vec<String>,
    /// Method names that execute a deferred query builder. Calls of these
    /// methods are routed through `relay_query`, which requires the
    /// receiver to implement the runtime's `QueryBuilder` trait. Set this
    /// to the ORM's execute surface; empty disables the query path.
    pub query_methods: Vec<String>,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            wrap_getters_setters: false,
            skip_anonymous: false,
            allow_fns: Vec::new(),
            parser_plugins: Vec::new(),
            query_methods: vec!["exec".to_string()],
        }
    }
}

/// Identity of the module being rewritten: the metadata filename (which may
/// come from a source map rather than the on-disk path) and the optional
/// original-position mapper.
#[derive(Debug)]
pub struct ModuleMeta {
    pub file: String,
    pub mapper: Option<SourceMap>,
}

impl ModuleMeta {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            mapper: None,
        }
    }

    pub fn with_mapper(file: impl Into<String>, mapper: SourceMap) -> Self {
        Self {
            file: file.into(),
            mapper: Some(mapper),
        }
    }

    /// Resolve a span to the reported (file, line), going through the
    /// source map when one is attached.
    pub fn position(&self, span: Span) -> (String, u32) {
        let start = span.start();
        let line = start.line as u32;
        if let Some(mapper) = &self.mapper {
            if let Some(original) = mapper.original(line, start.column as u32) {
                return (original.file, original.line);
            }
        }
        (self.file.clone(), line)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("parse error: {0}")]
    Parse(#[from] syn::Error),
    #[error("source map error: {0}")]
    SourceMap(String),
}
