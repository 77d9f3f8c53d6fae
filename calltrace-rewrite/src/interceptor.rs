// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! The module-load interceptor.
//!
//! The embedding loader hands every code unit (path plus source text) to
//! [`ModuleInterceptor::load`]. Units inside the include set are rewritten;
//! everything that comes back is tagged in the origin registry so the
//! dispatcher can classify callees at runtime. A transformation failure is
//! never allowed to fail a load: the original source is returned and
//! instrumentation of that unit is abandoned.

use std::rc::Rc;

use calltrace::config::PathMatcher;
use calltrace::event::FunctionKind;
use calltrace::origin;
use calltrace::origin::Export;
use calltrace::origin::FnDescriptor;
use parking_lot::Mutex;
use syn::visit_mut::VisitMut;

use crate::source_map::SourceMap;
use crate::transform::body::BodyWrapper;
use crate::transform::Transformer;
use crate::transform::WrappedFunction;
use crate::ModuleMeta;
use crate::RewriteOptions;

/// Surface methods of deferred values that must never be swapped: replacing
/// them would change how the deferral resolves.
const DEFERRED_SURFACE: &[&str] = &["then", "catch", "finally", "exec"];

/// One processed code unit.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub file: String,
    pub source: String,
    pub instrumented: bool,
}

struct LoadedRecord {
    path: String,
    original: String,
    instrumented: bool,
}

pub struct ModuleInterceptor {
    matcher: PathMatcher,
    transformer: Transformer,
    instrument: bool,
    loaded: Mutex<Vec<LoadedRecord>>,
}

impl ModuleInterceptor {
    pub fn new(
        include: &[String],
        exclude: &[String],
        options: RewriteOptions,
        instrument: bool,
    ) -> Self {
        Self {
            matcher: PathMatcher::new(include, exclude),
            transformer: Transformer::new(options),
            instrument,
            loaded: Mutex::new(Vec::new()),
        }
    }

    /// Process one code unit. The returned source replaces the original in
    /// the loader; export tagging happens as a side effect.
    pub fn load(&self, path: &str, source: &str) -> LoadedModule {
        let meta = self.derive_meta(path, source);

        let (out_source, functions, instrumented) =
            if self.instrument && self.matcher.is_app(path) {
                match self.transformer.transform(source, &meta) {
                    Ok(out) => (out.source, out.functions, true),
                    Err(err) => {
                        log::warn!("leaving {} uninstrumented: {}", path, err);
                        (source.to_string(), list_functions(source), false)
                    }
                }
            } else {
                (source.to_string(), list_functions(source), false)
            };

        tag_functions(&meta.file, &functions, &self.matcher, instrumented);

        self.loaded.lock().push(LoadedRecord {
            path: path.to_string(),
            original: source.to_string(),
            instrumented,
        });

        LoadedModule {
            file: meta.file,
            source: out_source,
            instrumented,
        }
    }

    /// The dependency-wrap path: register dispatcher-only tracing for the
    /// exported functions of a unit that is in scope but not rewritten.
    /// Accessors, the deferred surface and already-wrapped functions are
    /// skipped; returns the names actually wrapped.
    pub fn wrap_dependency_exports(
        &self,
        file: &str,
        exports: &[(&str, FunctionKind)],
    ) -> Vec<String> {
        let mut wrapped = Vec::new();
        for (name, kind) in exports {
            if matches!(kind, FunctionKind::Getter | FunctionKind::Setter) {
                continue;
            }
            if DEFERRED_SURFACE.contains(name) {
                continue;
            }
            if origin::lookup(name).map(|o| o.body_traced).unwrap_or(false) {
                continue;
            }
            origin::register(
                name,
                origin::FunctionOrigin {
                    file: Some(file.to_string()),
                    is_app: self.matcher.is_app(file),
                    skip_wrap: false,
                    body_traced: false,
                },
            );
            wrapped.push(name.to_string());
        }
        wrapped
    }

    /// Best-effort retrofit of units that were loaded before the
    /// interceptor was configured: units under the include set are
    /// re-rewritten and their marks upgraded. The caller is expected to
    /// reload the returned modules.
    pub fn retrofit(&self) -> Vec<LoadedModule> {
        let mut reloaded = Vec::new();
        let mut records = self.loaded.lock();
        for record in records.iter_mut() {
            if record.instrumented || !self.instrument || !self.matcher.is_app(&record.path) {
                continue;
            }
            let meta = self.derive_meta(&record.path, &record.original);
            match self.transformer.transform(&record.original, &meta) {
                Ok(out) => {
                    for function in out.functions.iter().filter(|f| f.wrapped) {
                        origin::mark_body_traced(&qualified(function));
                    }
                    record.instrumented = true;
                    reloaded.push(LoadedModule {
                        file: meta.file,
                        source: out.source,
                        instrumented: true,
                    });
                }
                Err(err) => {
                    log::warn!("retrofit of {} failed: {}", record.path, err);
                }
            }
        }
        reloaded
    }

    fn derive_meta(&self, path: &str, source: &str) -> ModuleMeta {
        match SourceMap::extract_inline(source) {
            Some(Ok(map)) => {
                let file = map
                    .primary_source()
                    .unwrap_or(path)
                    .to_string();
                ModuleMeta {
                    file,
                    mapper: Some(map),
                }
            }
            Some(Err(err)) => {
                log::debug!("ignoring malformed source map in {}: {}", path, err);
                ModuleMeta::new(path)
            }
            None => ModuleMeta::new(path),
        }
    }
}

fn qualified(function: &WrappedFunction) -> String {
    match &function.owner {
        Some(owner) => format!("{}::{}", owner, function.name),
        None => function.name.clone(),
    }
}

/// Enumerate functions without rewriting, for units that stay untouched.
fn list_functions(source: &str) -> Vec<WrappedFunction> {
    let Ok(mut file) = syn::parse_file(source) else {
        return Vec::new();
    };
    let options = RewriteOptions::default();
    let meta = ModuleMeta::new("");
    let mut wrapper = BodyWrapper::new(&options, &meta);
    wrapper.visit_file_mut(&mut file);
    wrapper.functions
}

/// Build the export descriptor graph and walk it with the origin tagger.
fn tag_functions(
    file: &str,
    functions: &[WrappedFunction],
    matcher: &PathMatcher,
    body_traced: bool,
) {
    let mut top_level: Vec<Rc<Export>> = Vec::new();
    let mut prototypes: Vec<(String, Option<FnDescriptor>, Vec<FnDescriptor>)> = Vec::new();

    for function in functions {
        let descriptor = FnDescriptor {
            name: function.name.clone(),
            kind: function.kind,
            line: function.line,
        };
        match &function.owner {
            None => top_level.push(Rc::new(Export::Function(descriptor))),
            Some(owner) => {
                let slot = match prototypes.iter_mut().find(|(name, ..)| name == owner) {
                    Some(slot) => slot,
                    None => {
                        prototypes.push((owner.clone(), None, Vec::new()));
                        prototypes.last_mut().unwrap()
                    }
                };
                if function.kind == FunctionKind::Constructor {
                    slot.1 = Some(descriptor);
                } else {
                    slot.2.push(descriptor);
                }
            }
        }
    }
    for (name, constructor, methods) in prototypes {
        top_level.push(Rc::new(Export::Prototype {
            name,
            constructor,
            methods,
        }));
    }

    let root = Rc::new(Export::Object {
        name: file.to_string(),
        children: top_level,
    });
    origin::tag_exports(&root, file, matcher, body_traced);
}
