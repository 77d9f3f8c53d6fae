// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Classification of functions before rewriting: display name, syntactic
//! kind, and the decision whether to wrap at all.

use calltrace::event::FunctionKind;
use syn::FnArg;
use syn::ReturnType;
use syn::Signature;
use syn::Type;

use crate::RewriteOptions;

pub const ANONYMOUS: &str = "(anonymous)";

/// What the body of a function syntactically returns, used to pick the
/// capture flavor for `return`/`?` rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnFlavor {
    Plain,
    Result,
    Option,
}

pub fn return_flavor(output: &ReturnType) -> ReturnFlavor {
    let ReturnType::Type(_, ty) = output else {
        return ReturnFlavor::Plain;
    };
    let Type::Path(path) = ty.as_ref() else {
        return ReturnFlavor::Plain;
    };
    match path.path.segments.last().map(|s| s.ident.to_string()) {
        Some(name) if name == "Result" => ReturnFlavor::Result,
        Some(name) if name == "Option" => ReturnFlavor::Option,
        _ => ReturnFlavor::Plain,
    }
}

/// Classify a named function or method.
///
/// Accessor classification follows the naming convention: a `get_`-prefixed
/// method taking only `&self` is a getter, a `set_`-prefixed method taking
/// `&mut self` plus one value is a setter. `new` associated functions are
/// constructors.
pub fn classify_signature(sig: &Signature, in_impl: bool) -> FunctionKind {
    let name = sig.ident.to_string();
    let has_receiver = sig
        .inputs
        .first()
        .map(|arg| matches!(arg, FnArg::Receiver(_)))
        .unwrap_or(false);

    if !in_impl {
        return FunctionKind::Function;
    }
    if name == "new" && !has_receiver {
        return FunctionKind::Constructor;
    }
    if has_receiver {
        if name.starts_with("get_") && sig.inputs.len() == 1 {
            return FunctionKind::Getter;
        }
        if name.starts_with("set_") && sig.inputs.len() == 2 {
            return FunctionKind::Setter;
        }
        return FunctionKind::Method;
    }
    FunctionKind::StaticMethod
}

/// Resolve a display name with the tie-break order: declared name →
/// method key → enclosing `let` identifier → assignment target →
/// `(anonymous)`.
pub fn display_name(
    declared: Option<&str>,
    method_key: Option<&str>,
    name_hint: Option<&str>,
) -> String {
    if let Some(declared) = declared {
        if let Some(owner) = method_key {
            return format!("{}::{}", owner, declared);
        }
        return declared.to_string();
    }
    name_hint.unwrap_or(ANONYMOUS).to_string()
}

/// The wrap decision for one function.
pub fn should_wrap(options: &RewriteOptions, name: &str, kind: FunctionKind) -> bool {
    match kind {
        FunctionKind::Getter | FunctionKind::Setter if !options.wrap_getters_setters => {
            return false;
        }
        _ => {}
    }
    if options.skip_anonymous && name == ANONYMOUS {
        return false;
    }
    if !options.allow_fns.is_empty() {
        return options.allow_fns.iter().any(|re| re.is_match(name));
    }
    true
}
