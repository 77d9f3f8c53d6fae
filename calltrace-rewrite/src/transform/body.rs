// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Function-body wrapping.
//!
//! Every wrapped body gains a leading frame that emits the enter event and,
//! on drop, the exit event. `return` expressions and the trailing
//! expression are rewritten to capture the produced value into the frame;
//! `?` operands capture errors before they propagate. A body that already
//! starts with a frame binding is never wrapped again.

use calltrace::event::FunctionKind;
use proc_macro2::Span;
use quote::format_ident;
use syn::parse_quote;
use syn::spanned::Spanned;
use syn::visit_mut::{self, VisitMut};
use syn::Block;
use syn::Expr;
use syn::FnArg;
use syn::Ident;
use syn::LitStr;
use syn::Pat;
use syn::ReturnType;
use syn::Stmt;

use crate::transform::analyze;
use crate::transform::analyze::ReturnFlavor;
use crate::ModuleMeta;
use crate::RewriteOptions;

/// Record of one function seen by the wrapper, fed to the export builder.
#[derive(Debug, Clone)]
pub struct WrappedFunction {
    pub name: String,
    pub owner: Option<String>,
    pub kind: FunctionKind,
    pub line: u32,
    pub wrapped: bool,
}

pub struct BodyWrapper<'a> {
    options: &'a RewriteOptions,
    meta: &'a ModuleMeta,
    pub functions: Vec<WrappedFunction>,
    impl_type: Option<String>,
    name_hint: Option<String>,
}

impl<'a> BodyWrapper<'a> {
    pub fn new(options: &'a RewriteOptions, meta: &'a ModuleMeta) -> Self {
        Self {
            options,
            meta,
            functions: Vec::new(),
            impl_type: None,
            name_hint: None,
        }
    }

    fn wrap_fn_like(
        &mut self,
        name: String,
        owner: Option<String>,
        kind: FunctionKind,
        span: Span,
        inputs: Vec<Ident>,
        output: &ReturnType,
        block: &mut Block,
    ) {
        if is_wrapped(block) {
            return;
        }
        let wrapped = analyze::should_wrap(self.options, &name, kind);
        let (file, line) = self.meta.position(span);
        self.functions.push(WrappedFunction {
            name: name.clone(),
            owner: owner.clone(),
            kind,
            line,
            wrapped,
        });
        if !wrapped {
            return;
        }

        let flavor = analyze::return_flavor(output);
        let mut returns = ReturnRewriter { flavor };
        returns.visit_block_mut(block);

        // The trailing expression feeds the frame before it is returned.
        if let Some(Stmt::Expr(tail)) = block.stmts.last_mut() {
            if capturable_tail(tail) {
                let method = capture_method(flavor);
                *tail = parse_quote!(__trace_frame.#method(#tail));
            }
        }

        let display = match &owner {
            Some(owner) => format!("{}::{}", owner, name),
            None => name,
        };
        let name_lit = LitStr::new(&display, Span::call_site());
        let file_lit = LitStr::new(&file, Span::call_site());
        let kind_debug = format!("{:?}", kind);
        let kind_ident = format_ident!("{}", kind_debug);
        let args: Expr = if inputs.is_empty() {
            parse_quote!(::core::option::Option::None)
        } else {
            parse_quote!(calltrace::args_snapshot![#(#inputs),*])
        };
        let frame: Stmt = parse_quote! {
            let mut __trace_frame = calltrace::runtime::Frame::enter(
                &calltrace::event::CallMeta {
                    name: #name_lit,
                    file: #file_lit,
                    line: #line,
                    kind: calltrace::event::FunctionKind::#kind_ident,
                },
                #args,
            );
        };
        block.stmts.insert(0, frame);
    }
}

impl VisitMut for BodyWrapper<'_> {
    fn visit_item_fn_mut(&mut self, item: &mut syn::ItemFn) {
        let kind = analyze::classify_signature(&item.sig, false);
        self.wrap_fn_like(
            item.sig.ident.to_string(),
            None,
            kind,
            item.sig.ident.span(),
            signature_params(&item.sig),
            &item.sig.output.clone(),
            &mut item.block,
        );
        visit_mut::visit_item_fn_mut(self, item);
    }

    fn visit_impl_item_method_mut(&mut self, item: &mut syn::ImplItemMethod) {
        let kind = analyze::classify_signature(&item.sig, true);
        self.wrap_fn_like(
            item.sig.ident.to_string(),
            self.impl_type.clone(),
            kind,
            item.sig.ident.span(),
            signature_params(&item.sig),
            &item.sig.output.clone(),
            &mut item.block,
        );
        visit_mut::visit_impl_item_method_mut(self, item);
    }

    fn visit_item_impl_mut(&mut self, item: &mut syn::ItemImpl) {
        let previous = self.impl_type.take();
        self.impl_type = type_name(&item.self_ty);
        visit_mut::visit_item_impl_mut(self, item);
        self.impl_type = previous;
    }

    fn visit_local_mut(&mut self, local: &mut syn::Local) {
        let previous = self.name_hint.take();
        self.name_hint = pat_name(&local.pat);
        visit_mut::visit_local_mut(self, local);
        self.name_hint = previous;
    }

    fn visit_expr_mut(&mut self, expr: &mut Expr) {
        if crate::transform::callsite::sdk_call(expr) {
            // Dispatch calls generated by a previous run carry thunks that
            // must not be mistaken for user closures.
            return;
        }
        match expr {
            Expr::Assign(assign) => {
                let previous = self.name_hint.take();
                self.name_hint = assign_target_name(&assign.left);
                visit_mut::visit_expr_mut(self, expr);
                self.name_hint = previous;
            }
            Expr::Closure(closure) => {
                let name = analyze::display_name(None, None, self.name_hint.as_deref());
                // Expression bodies are promoted to blocks before wrapping.
                if !matches!(closure.body.as_ref(), Expr::Block(_)) {
                    let body = closure.body.clone();
                    closure.body = Box::new(parse_quote!({ #body }));
                }
                let span = closure.or1_token.span();
                let inputs = closure_params(closure);
                let output = closure.output.clone();
                if let Expr::Block(body) = closure.body.as_mut() {
                    self.wrap_fn_like(
                        name,
                        None,
                        FunctionKind::Closure,
                        span,
                        inputs,
                        &output,
                        &mut body.block,
                    );
                }
                visit_mut::visit_expr_mut(self, expr);
            }
            _ => visit_mut::visit_expr_mut(self, expr),
        }
    }

    fn visit_macro_mut(&mut self, _: &mut syn::Macro) {}
}

/// Rewrites `return e` and `e?` to capture through the frame. Does not
/// descend into nested functions or closures: their returns are their own.
struct ReturnRewriter {
    flavor: ReturnFlavor,
}

impl VisitMut for ReturnRewriter {
    fn visit_expr_mut(&mut self, expr: &mut Expr) {
        match expr {
            Expr::Closure(_) | Expr::Async(_) => {}
            Expr::Return(ret) => {
                if let Some(value) = ret.expr.as_mut() {
                    self.visit_expr_mut(value);
                    let method = capture_method(self.flavor);
                    let inner = value.clone();
                    **value = parse_quote!(__trace_frame.#method(#inner));
                }
            }
            Expr::Try(try_expr) => {
                self.visit_expr_mut(&mut try_expr.expr);
                if matches!(self.flavor, ReturnFlavor::Result | ReturnFlavor::Option) {
                    let method = match self.flavor {
                        ReturnFlavor::Result => format_ident!("capture_result"),
                        _ => format_ident!("capture_option"),
                    };
                    let inner = try_expr.expr.clone();
                    *try_expr.expr = parse_quote!(__trace_frame.#method(#inner));
                }
            }
            _ => visit_mut::visit_expr_mut(self, expr),
        }
    }

    fn visit_item_mut(&mut self, _: &mut syn::Item) {}

    fn visit_macro_mut(&mut self, _: &mut syn::Macro) {}
}

fn capture_method(flavor: ReturnFlavor) -> Ident {
    match flavor {
        ReturnFlavor::Plain => format_ident!("capture"),
        ReturnFlavor::Result => format_ident!("capture_result"),
        ReturnFlavor::Option => format_ident!("capture_option"),
    }
}

/// Whether the trailing expression can be wrapped in a capture call without
/// changing its meaning. Loop-style tails stay untouched.
fn capturable_tail(expr: &Expr) -> bool {
    !matches!(
        expr,
        Expr::ForLoop(_) | Expr::While(_) | Expr::Loop(_) | Expr::Macro(_) | Expr::Return(_)
    )
}

pub fn is_wrapped(block: &Block) -> bool {
    match block.stmts.first() {
        Some(Stmt::Local(local)) => pat_name(&local.pat)
            .map(|name| name == "__trace_frame")
            .unwrap_or(false),
        _ => false,
    }
}

fn signature_params(sig: &syn::Signature) -> Vec<Ident> {
    sig.inputs
        .iter()
        .filter_map(|arg| match arg {
            FnArg::Typed(pat) => match pat.pat.as_ref() {
                Pat::Ident(ident) => Some(ident.ident.clone()),
                _ => None,
            },
            FnArg::Receiver(_) => None,
        })
        .collect()
}

fn closure_params(closure: &syn::ExprClosure) -> Vec<Ident> {
    closure
        .inputs
        .iter()
        .filter_map(|pat| match pat {
            Pat::Ident(ident) => Some(ident.ident.clone()),
            Pat::Type(pat) => match pat.pat.as_ref() {
                Pat::Ident(ident) => Some(ident.ident.clone()),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

fn pat_name(pat: &Pat) -> Option<String> {
    match pat {
        Pat::Ident(ident) => Some(ident.ident.to_string()),
        Pat::Type(pat) => pat_name(&pat.pat),
        _ => None,
    }
}

fn assign_target_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Path(path) => path.path.get_ident().map(|i| i.to_string()),
        Expr::Field(field) => match &field.member {
            syn::Member::Named(name) => Some(name.to_string()),
            syn::Member::Unnamed(_) => None,
        },
        _ => None,
    }
}

fn type_name(ty: &syn::Type) -> Option<String> {
    match ty {
        syn::Type::Path(path) => path.path.segments.last().map(|s| s.ident.to_string()),
        syn::Type::Reference(inner) => type_name(&inner.elem),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use quote::ToTokens;

    use super::*;

    fn wrap(source: &str) -> String {
        wrap_with(source, &RewriteOptions::default())
    }

    fn wrap_with(source: &str, options: &RewriteOptions) -> String {
        let mut file = syn::parse_file(source).unwrap();
        let meta = ModuleMeta::new("src/app.rs");
        let mut wrapper = BodyWrapper::new(options, &meta);
        wrapper.visit_file_mut(&mut file);
        file.into_token_stream().to_string()
    }

    #[test]
    fn plain_fn_gains_frame_and_tail_capture() {
        let out = wrap("fn add(a: u32, b: u32) -> u32 { a + b }");
        assert!(out.contains("__trace_frame"));
        assert!(out.contains("Frame :: enter"));
        assert!(out.contains("args_snapshot ! [a , b]"));
        assert!(out.contains(". capture (a + b)"));
    }

    #[test]
    fn returns_are_captured_in_place() {
        let out = wrap("fn f(c: bool) -> u32 { if c { return 1; } 2 }");
        assert!(out.contains("return __trace_frame . capture (1)"));
    }

    #[test]
    fn result_fn_uses_capture_result() {
        let out = wrap("fn f() -> Result<u32, String> { g()?; Ok(2) }");
        assert!(out.contains("capture_result (g () ?)") || out.contains("capture_result (g ())"));
        assert!(out.contains("capture_result (Ok (2))"));
    }

    #[test]
    fn option_fn_uses_capture_option() {
        let out = wrap("fn f(v: Option<u32>) -> Option<u32> { let x = v?; Some(x + 1) }");
        assert!(out.contains("capture_option"));
    }

    #[test]
    fn wrapping_is_idempotent() {
        let once = wrap("fn add(a: u32) -> u32 { a }");
        let twice = wrap_with(&once, &RewriteOptions::default());
        assert_eq!(once.matches("__trace_frame").count(), twice.matches("__trace_frame").count());
    }

    #[test]
    fn method_display_name_includes_owner() {
        let out = wrap("impl Server { fn run(&self) {} }");
        assert!(out.contains("\"Server::run\""));
        assert!(out.contains("FunctionKind :: Method"));
    }

    #[test]
    fn getters_skipped_unless_enabled() {
        let source = "impl User { fn get_name(&self) -> String { self.name.clone() } }";
        let out = wrap(source);
        assert!(!out.contains("__trace_frame"));

        let enabled = RewriteOptions {
            wrap_getters_setters: true,
            ..RewriteOptions::default()
        };
        let out = wrap_with(source, &enabled);
        assert!(out.contains("__trace_frame"));
        assert!(out.contains("FunctionKind :: Getter"));
    }

    #[test]
    fn expression_closure_promoted_to_block() {
        let out = wrap("fn f() { let double = |x: u32| x * 2; }");
        assert!(out.contains("\"double\""));
        assert!(out.contains("FunctionKind :: Closure"));
        assert!(out.contains(". capture (x * 2)"));
    }

    #[test]
    fn anonymous_closures_can_be_skipped() {
        let options = RewriteOptions {
            skip_anonymous: true,
            ..RewriteOptions::default()
        };
        let out = wrap_with("fn outer() { run(|| 1); }", &options);
        // The outer fn is wrapped; the unnamed closure is not.
        assert_eq!(out.matches("__trace_frame").count(), 1);

        let default = wrap("fn outer() { run(|| 1); }");
        // Without skip_anonymous the closure gets its own frame and tail
        // capture under the "(anonymous)" label.
        assert!(default.contains("\"(anonymous)\""));
        assert_eq!(default.matches("Frame :: enter").count(), 2);
    }

    #[test]
    fn allowlist_limits_wrapping() {
        let options = RewriteOptions {
            allow_fns: vec![regex::Regex::new("^handle_").unwrap()],
            ..RewriteOptions::default()
        };
        let out = wrap_with("fn handle_user() {} fn load_user() {}", &options);
        assert_eq!(out.matches("__trace_frame").count(), 1);
        assert!(out.contains("\"handle_user\""));
    }

    #[test]
    fn loop_tail_is_not_captured() {
        let out = wrap("fn f(n: u32) { for _ in 0..n {} }");
        assert!(out.contains("__trace_frame"));
        assert!(!out.contains("capture (for"));
    }
}
