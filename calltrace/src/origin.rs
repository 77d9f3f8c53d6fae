// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Function origin marks.
//!
//! Rust gives us no way to attach metadata to a function value, so origin
//! marks live in a process-wide side table keyed by the function's qualified
//! display name. The module interceptor feeds the table by walking the
//! export descriptors of every loaded code unit; the dispatcher consults it
//! on every relayed call.

use std::collections::HashMap;
use std::collections::HashSet;
use std::rc::Rc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::config::PathMatcher;
use crate::event::FunctionKind;

/// Marks attached to one function.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FunctionOrigin {
    /// Defining file, when known.
    pub file: Option<String>,
    /// True iff the defining file falls under an include pattern and outside
    /// every exclude pattern.
    pub is_app: bool,
    /// Never trace this function.
    pub skip_wrap: bool,
    /// The function's body was successfully source-rewritten; the dispatcher
    /// must not emit a second enter/exit pair for it.
    pub body_traced: bool,
}

/// Description of one exported function, produced by the rewriter.
#[derive(Clone, Debug)]
pub struct FnDescriptor {
    pub name: String,
    pub kind: FunctionKind,
    pub line: u32,
}

/// The export surface of a loaded code unit. Shared nodes are allowed
/// (`Rc`), so the walk carries cycle detection.
#[derive(Debug)]
pub enum Export {
    Function(FnDescriptor),
    Object {
        name: String,
        children: Vec<Rc<Export>>,
    },
    Prototype {
        name: String,
        constructor: Option<FnDescriptor>,
        methods: Vec<FnDescriptor>,
    },
}

const MAX_TAG_DEPTH: usize = 8;

static REGISTRY: Lazy<RwLock<HashMap<String, FunctionOrigin>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Insert a mark for `name`. Re-tagging an already-tagged function is a
/// no-op: the first mark wins.
pub fn register(name: &str, origin: FunctionOrigin) {
    REGISTRY
        .write()
        .entry(name.to_string())
        .or_insert(origin);
}

/// Upgrade a mark in place (used by the retrofit pass when a module is
/// re-rewritten after a late install).
pub fn mark_body_traced(name: &str) {
    if let Some(origin) = REGISTRY.write().get_mut(name) {
        origin.body_traced = true;
    }
}

pub fn mark_skip_wrap(name: &str) {
    REGISTRY
        .write()
        .entry(name.to_string())
        .or_default()
        .skip_wrap = true;
}

pub fn lookup(name: &str) -> Option<FunctionOrigin> {
    REGISTRY.read().get(name).cloned()
}

/// Look a call label up: first the label itself, then its last `::` segment
/// (member calls carry only the method name).
pub fn lookup_label(label: &str) -> Option<FunctionOrigin> {
    let registry = REGISTRY.read();
    if let Some(origin) = registry.get(label) {
        return Some(origin.clone());
    }
    label
        .rsplit("::")
        .next()
        .and_then(|last| registry.get(last))
        .cloned()
}

/// Drop every mark. Test plumbing: the table is process-wide.
#[doc(hidden)]
pub fn clear() {
    REGISTRY.write().clear();
}

/// Walk an export graph and attach origin marks to every function found.
///
/// `body_traced` reports whether the defining file was successfully
/// source-rewritten. Tagging is best-effort: the walk is capped in depth and
/// shared nodes are visited once.
pub fn tag_exports(
    root: &Rc<Export>,
    file: &str,
    matcher: &PathMatcher,
    body_traced: bool,
) {
    let mut visited = HashSet::new();
    tag_node(root, file, matcher, body_traced, 0, &mut visited);
}

fn tag_node(
    node: &Rc<Export>,
    file: &str,
    matcher: &PathMatcher,
    body_traced: bool,
    depth: usize,
    visited: &mut HashSet<*const Export>,
) {
    if depth > MAX_TAG_DEPTH {
        return;
    }
    if !visited.insert(Rc::as_ptr(node)) {
        return;
    }

    let origin = |kind: FunctionKind| FunctionOrigin {
        file: Some(file.to_string()),
        is_app: matcher.is_app(file),
        skip_wrap: false,
        body_traced: body_traced && kind != FunctionKind::Getter && kind != FunctionKind::Setter,
    };

    match node.as_ref() {
        Export::Function(descriptor) => {
            register(&descriptor.name, origin(descriptor.kind));
        }
        Export::Object { children, .. } => {
            for child in children {
                tag_node(child, file, matcher, body_traced, depth + 1, visited);
            }
        }
        Export::Prototype { name, methods, .. } => {
            // Constructors are intentionally left untagged.
            for method in methods {
                register(
                    &format!("{}::{}", name, method.name),
                    origin(method.kind),
                );
            }
        }
    }
}
