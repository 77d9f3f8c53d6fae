// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! The source-to-source transformer.
//!
//! Two passes over the parsed module: [`body::BodyWrapper`] wraps every
//! function body with frame entry/exit and return capture, then
//! [`callsite::CallRewriter`] replaces every call expression with a routed
//! dispatch call. The passes run in that order so generated thunks are never
//! mistaken for user closures, and both are no-ops on already-rewritten
//! code.

pub mod analyze;
pub mod body;
pub mod callsite;

use quote::ToTokens;
use syn::visit_mut::VisitMut;

pub use body::WrappedFunction;

use crate::ModuleMeta;
use crate::RewriteError;
use crate::RewriteOptions;

pub struct Transformer {
    options: RewriteOptions,
}

/// The result of rewriting one module.
pub struct TransformOutput {
    pub source: String,
    pub functions: Vec<WrappedFunction>,
    pub rewritten_calls: usize,
}

impl Transformer {
    pub fn new(options: RewriteOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RewriteOptions {
        &self.options
    }

    /// Rewrite one module. Returns the new source plus the function list
    /// for origin tagging; the input is untouched on error.
    pub fn transform(
        &self,
        source: &str,
        meta: &ModuleMeta,
    ) -> Result<TransformOutput, RewriteError> {
        let mut file = syn::parse_file(source)?;

        let mut wrapper = body::BodyWrapper::new(&self.options, meta);
        wrapper.visit_file_mut(&mut file);

        let mut calls = callsite::CallRewriter::new(meta, &self.options.query_methods);
        calls.rewrite_file(&mut file);

        Ok(TransformOutput {
            source: file.into_token_stream().to_string(),
            functions: wrapper.functions,
            rewritten_calls: calls.rewritten,
        })
    }
}

#[cfg(test)]
mod tests {
    use calltrace::event::FunctionKind;

    use super::*;

    fn transformer() -> Transformer {
        Transformer::new(RewriteOptions::default())
    }

    const MODULE: &str = r#"
        pub async fn handler(id: u32) -> Result<u32, String> {
            let user = load_user(id).await?;
            notify(user);
            Ok(user)
        }

        fn notify(user: u32) {
            log_line(user);
        }

        impl Repo {
            pub fn new() -> Self {
                Repo
            }

            async fn load(&self, id: u32) -> u32 {
                self.store.get(id).await
            }
        }
    "#;

    #[test]
    fn whole_module_transform() {
        let meta = ModuleMeta::new("src/handlers.rs");
        let out = transformer().transform(MODULE, &meta).unwrap();

        // Every body wrapped, every call routed.
        assert!(out.source.contains("Frame :: enter"));
        assert!(out.source.contains("relay_future"));
        assert!(out.source.contains("calltrace :: dispatch :: relay"));
        assert!(out.rewritten_calls >= 3);

        let names: Vec<&str> = out.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["handler", "notify", "new", "load"]);
        assert_eq!(out.functions[2].kind, FunctionKind::Constructor);
        assert_eq!(out.functions[3].owner.as_deref(), Some("Repo"));
        assert!(out.functions.iter().all(|f| f.wrapped));
        // Line numbers point at the declarations in the original text.
        assert_eq!(out.functions[0].line, 2);
    }

    #[test]
    fn transform_is_idempotent() {
        let meta = ModuleMeta::new("src/handlers.rs");
        let once = transformer().transform(MODULE, &meta).unwrap();
        let twice = transformer().transform(&once.source, &meta).unwrap();
        assert_eq!(once.source, twice.source);
        // The second pass records the functions but wraps nothing new.
        assert_eq!(twice.rewritten_calls, 0);
    }

    #[test]
    fn query_terminals_route_through_relay_query() {
        let meta = ModuleMeta::new("src/models.rs");
        let out = transformer()
            .transform(
                "fn load(m: Model) { m.find(7).sort().lean().exec(); }",
                &meta,
            )
            .unwrap();
        assert!(out.source.contains("relay_query"));
        assert!(out.source.contains("\"exec\""));
        // The chain calls stay ordinary relays.
        assert!(out.source.contains("\"find\""));
        assert!(out.source.contains("\"sort\""));
        assert!(out.source.contains("\"lean\""));

        let twice = transformer().transform(&out.source, &meta).unwrap();
        assert_eq!(out.source, twice.source);
    }

    #[test]
    fn parse_errors_surface() {
        let meta = ModuleMeta::new("src/broken.rs");
        let err = transformer().transform("fn broken( {", &meta);
        assert!(err.is_err());
    }

    #[test]
    fn mapped_positions_use_the_original_file() {
        let map = crate::SourceMap::parse(
            r#"{"version":3,"file":"gen.rs","sources":["src/original.rs"],"mappings":";AACA"}"#,
        )
        .unwrap();
        let meta = ModuleMeta::with_mapper("src/gen.rs", map);
        let out = transformer()
            .transform("\nfn generated() {}\n", &meta)
            .unwrap();
        assert!(out.source.contains("\"src/original.rs\""));
    }
}
