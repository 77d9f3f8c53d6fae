// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Call-site rewriting.
//!
//! Every call expression is replaced by a routed dispatch call. The entry
//! point is chosen from the call's syntactic position: the operand of an
//! `.await` (traced through parentheses, casts, conditional branches and
//! block tails) relays as an awaited future, an argument to a spawn-like
//! entry relays as fire-and-forget, the operand of `?` relays as fallible,
//! everything else relays synchronously. Closure literals handed to callees
//! are wrapped so they capture the scope at the moment they are passed.

use proc_macro2::Span;
use quote::format_ident;
use syn::parse_quote;
use syn::spanned::Spanned;
use syn::visit_mut::{self, VisitMut};
use syn::Block;
use syn::Expr;
use syn::ExprClosure;
use syn::Ident;
use syn::LitStr;
use syn::Stmt;

use crate::ModuleMeta;

/// Syntactic position of a call expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Plain,
    Awaited,
    Spawned,
    TryOperand,
}

const SPAWN_ENTRIES: &[&str] = &["spawn", "spawn_local", "spawn_blocking"];
const CONTEXT_SETTERS: &[&str] = &["install", "in_scope", "open", "scope"];

pub struct CallRewriter<'a> {
    meta: &'a ModuleMeta,
    query_methods: &'a [String],
    pub rewritten: usize,
}

impl<'a> CallRewriter<'a> {
    pub fn new(meta: &'a ModuleMeta, query_methods: &'a [String]) -> Self {
        Self {
            meta,
            query_methods,
            rewritten: 0,
        }
    }

    /// Rewrite every call in a parsed module.
    pub fn rewrite_file(&mut self, file: &mut syn::File) {
        let mut children = ChildRewriter { outer: self };
        children.visit_file_mut(file);
    }

    /// Rewrite every call inside a function body.
    pub fn rewrite_block(&mut self, block: &mut Block) {
        self.rewrite_stmts(block, Position::Plain);
    }

    fn rewrite_stmts(&mut self, block: &mut Block, tail: Position) {
        let last = block.stmts.len().saturating_sub(1);
        for (idx, stmt) in block.stmts.iter_mut().enumerate() {
            match stmt {
                Stmt::Expr(expr) if idx == last => self.rewrite_expr(expr, tail),
                Stmt::Expr(expr) | Stmt::Semi(expr, _) => {
                    self.rewrite_expr(expr, Position::Plain)
                }
                Stmt::Local(local) => {
                    if let Some((_, init)) = local.init.as_mut() {
                        self.rewrite_expr(init, Position::Plain);
                    }
                }
                Stmt::Item(item) => {
                    let mut children = ChildRewriter { outer: self };
                    children.visit_item_mut(item);
                }
            }
        }
    }

    fn rewrite_expr(&mut self, expr: &mut Expr, pos: Position) {
        match expr {
            Expr::Await(inner) => {
                self.rewrite_expr(&mut inner.base, Position::Awaited);
            }
            Expr::Try(inner) => {
                self.rewrite_expr(&mut inner.expr, Position::TryOperand);
            }
            Expr::Paren(inner) => {
                self.rewrite_expr(&mut inner.expr, pos);
            }
            Expr::Group(inner) => {
                self.rewrite_expr(&mut inner.expr, pos);
            }
            Expr::Cast(inner) => {
                self.rewrite_expr(&mut inner.expr, pos);
            }
            Expr::Return(inner) => {
                if let Some(value) = inner.expr.as_mut() {
                    self.rewrite_expr(value, Position::Plain);
                }
            }
            Expr::If(inner) => {
                self.rewrite_expr(&mut inner.cond, Position::Plain);
                self.rewrite_stmts(&mut inner.then_branch, pos);
                if let Some((_, else_branch)) = inner.else_branch.as_mut() {
                    self.rewrite_expr(else_branch, pos);
                }
            }
            Expr::Match(inner) => {
                self.rewrite_expr(&mut inner.expr, Position::Plain);
                for arm in &mut inner.arms {
                    self.rewrite_expr(&mut arm.body, pos);
                }
            }
            Expr::Block(inner) => {
                self.rewrite_stmts(&mut inner.block, pos);
            }
            Expr::Async(inner) => {
                self.rewrite_stmts(&mut inner.block, Position::Plain);
            }
            Expr::Unsafe(inner) => {
                self.rewrite_stmts(&mut inner.block, pos);
            }
            Expr::Closure(inner) => {
                self.rewrite_expr(&mut inner.body, Position::Plain);
            }
            Expr::Call(_) => {
                self.rewrite_call(expr, pos);
            }
            Expr::MethodCall(_) => {
                self.rewrite_method_call(expr, pos);
            }
            Expr::Macro(_) => {}
            other => {
                let mut children = ChildRewriter { outer: self };
                visit_mut::visit_expr_mut(&mut children, other);
            }
        }
    }

    fn rewrite_call(&mut self, expr: &mut Expr, pos: Position) {
        let Expr::Call(call) = expr else { return };

        let callee_path = path_of(&call.func);
        // A call into the SDK is left entirely alone, arguments included:
        // its arguments are either plumbing or already-routed code.
        if callee_path
            .as_deref()
            .map(|p| p.starts_with("calltrace"))
            .unwrap_or(false)
        {
            return;
        }

        let spawn_like = callee_path
            .as_deref()
            .and_then(|p| p.rsplit("::").next())
            .map(|last| SPAWN_ENTRIES.contains(&last))
            .unwrap_or(false);

        // Arguments first, with spawn arguments classified fire-and-forget.
        let arg_pos = if spawn_like {
            Position::Spawned
        } else {
            Position::Plain
        };
        self.rewrite_expr(&mut call.func, Position::Plain);
        for arg in call.args.iter_mut() {
            self.rewrite_expr(arg, arg_pos);
        }

        if self.skip_callee(callee_path.as_deref()) {
            return;
        }

        let label = callee_path.unwrap_or_else(|| ANON_CALL.to_string());
        let span = call.func.span();
        let (callee, args): (Expr, Vec<Expr>) =
            ((*call.func).clone(), call.args.iter().cloned().collect());
        let replacement = self.emit_dispatch(&label, span, pos, args, false, move |new_args| {
            parse_quote!(#callee(#(#new_args),*))
        });
        *expr = replacement;
        self.rewritten += 1;
    }

    fn rewrite_method_call(&mut self, expr: &mut Expr, pos: Position) {
        let Expr::MethodCall(call) = expr else { return };

        let method = call.method.to_string();
        let spawn_like = SPAWN_ENTRIES.contains(&method.as_str());
        let arg_pos = if spawn_like {
            Position::Spawned
        } else {
            Position::Plain
        };
        self.rewrite_expr(&mut call.receiver, Position::Plain);
        for arg in call.args.iter_mut() {
            self.rewrite_expr(arg, arg_pos);
        }

        // Calls on rewriter-introduced locals are plumbing, not user calls.
        if receiver_is_trace_local(&call.receiver) {
            return;
        }

        let span = call.method.span();
        let receiver = (*call.receiver).clone();
        let method_ident = call.method.clone();
        let turbofish = call.turbofish.clone();
        let args: Vec<Expr> = call.args.iter().cloned().collect();

        // A query-execute method: the receiver is a deferred builder, so it
        // goes through `relay_query` (exit now with the builder summary, a
        // re-emitted exit when the query resolves) and the terminal method
        // runs on the returned builder, untouched. A receiver that is
        // already a `relay_query` call was routed by a previous run.
        if self.query_methods.iter().any(|m| m == &method) {
            if receiver_is_query_routed(&call.receiver) {
                return;
            }
            let prepared = self.prepare_args(args, true);
            let bindings = prepared.bindings;
            let args_expr = prepared.snapshot;
            let new_args = prepared.args;
            let meta = self.meta_expr(&method, span);
            let dispatch: Expr = parse_quote!(
                calltrace::dispatch::relay_query(#meta, #args_expr, #receiver)
                    .#method_ident #turbofish(#(#new_args),*)
            );
            *expr = if bindings.is_empty() {
                dispatch
            } else {
                parse_quote!(({ #(#bindings)* #dispatch }))
            };
            self.rewritten += 1;
            return;
        }

        let suppress_isolation = CONTEXT_SETTERS.contains(&method.as_str());
        let replacement = self.emit_dispatch(
            &method,
            span,
            pos,
            args,
            suppress_isolation,
            move |new_args| {
                parse_quote!(#receiver.#method_ident #turbofish(#(#new_args),*))
            },
        );
        *expr = replacement;
        self.rewritten += 1;
    }

    /// Hoist effect-free arguments into snapshot temporaries and isolate
    /// closure literals; everything else stays in place.
    fn prepare_args(&self, args: Vec<Expr>, suppress_isolation: bool) -> PreparedArgs {
        let mut bindings: Vec<Stmt> = Vec::new();
        let mut snapshots: Vec<Ident> = Vec::new();
        let mut new_args: Vec<Expr> = Vec::new();

        for (idx, arg) in args.into_iter().enumerate() {
            if !suppress_isolation {
                if let Expr::Closure(closure) = &arg {
                    if let Some(wrapped) = isolate_closure(closure) {
                        new_args.push(wrapped);
                        continue;
                    }
                }
            }
            if snapshot_safe(&arg) {
                let ident = format_ident!("__trace_arg{}", idx);
                bindings.push(parse_quote!(let #ident = #arg;));
                snapshots.push(ident.clone());
                new_args.push(parse_quote!(#ident));
            } else {
                new_args.push(arg);
            }
        }

        let snapshot: Expr = if snapshots.is_empty() {
            parse_quote!(::core::option::Option::None)
        } else {
            parse_quote!(calltrace::args_snapshot![#(#snapshots),*])
        };

        PreparedArgs {
            bindings,
            snapshot,
            args: new_args,
        }
    }

    /// Build the dispatch expression for one call. `rebuild` receives the
    /// final argument expressions and reconstructs the underlying call.
    fn emit_dispatch(
        &mut self,
        label: &str,
        span: Span,
        pos: Position,
        args: Vec<Expr>,
        suppress_isolation: bool,
        rebuild: impl FnOnce(&[Expr]) -> Expr,
    ) -> Expr {
        let prepared = self.prepare_args(args, suppress_isolation);
        let bindings = prepared.bindings;
        let args_expr = prepared.snapshot;
        let new_args = prepared.args;

        let meta = self.meta_expr(label, span);
        let rebuilt = rebuild(&new_args);
        let dispatch: Expr = match pos {
            Position::Plain => {
                parse_quote!(calltrace::dispatch::relay(#meta, #args_expr, || #rebuilt))
            }
            Position::TryOperand => {
                parse_quote!(calltrace::dispatch::relay_result(#meta, #args_expr, || #rebuilt))
            }
            Position::Awaited => {
                parse_quote!(calltrace::dispatch::relay_future(#meta, #args_expr, #rebuilt))
            }
            Position::Spawned => {
                parse_quote!(calltrace::dispatch::relay_unawaited(#meta, #args_expr, #rebuilt))
            }
        };

        // Parenthesized so the block is a valid operand in every position
        // the original call appeared in (`.await`, `?`, statement start).
        if bindings.is_empty() {
            dispatch
        } else {
            parse_quote!(({ #(#bindings)* #dispatch }))
        }
    }

    fn meta_expr(&self, label: &str, span: Span) -> Expr {
        let (file, line) = self.meta.position(span);
        let name = LitStr::new(label, Span::call_site());
        let file = LitStr::new(&file, Span::call_site());
        parse_quote!(&calltrace::event::CallMeta {
            name: #name,
            file: #file,
            line: #line,
            kind: calltrace::event::FunctionKind::Function,
        })
    }

    fn skip_callee(&self, path: Option<&str>) -> bool {
        let Some(path) = path else {
            // A computed callee (closure call through an expression).
            return false;
        };
        // `Self::` calls inside constructors stay untouched; their
        // arguments are still rewritten above. A capitalized final segment
        // is a tuple-struct or enum-variant constructor (`Ok`, `Some`,
        // `Vec3`), which is value construction, not a call worth a span.
        if path.starts_with("Self::") || path == "Self" {
            return true;
        }
        path.rsplit("::")
            .next()
            .and_then(|last| last.chars().next())
            .map(|c| c.is_ascii_uppercase())
            .unwrap_or(false)
    }
}

const ANON_CALL: &str = "(anonymous)";

struct PreparedArgs {
    bindings: Vec<Stmt>,
    snapshot: Expr,
    args: Vec<Expr>,
}

/// A call expression into the SDK itself (dispatcher, bus, runtime).
pub(crate) fn sdk_call(expr: &Expr) -> bool {
    match expr {
        Expr::Call(call) => path_of(&call.func)
            .map(|p| p.starts_with("calltrace"))
            .unwrap_or(false),
        _ => false,
    }
}

struct ChildRewriter<'a, 'b> {
    outer: &'a mut CallRewriter<'b>,
}

impl VisitMut for ChildRewriter<'_, '_> {
    fn visit_expr_mut(&mut self, expr: &mut Expr) {
        self.outer.rewrite_expr(expr, Position::Plain);
    }

    fn visit_item_fn_mut(&mut self, item: &mut syn::ItemFn) {
        self.outer.rewrite_block(&mut item.block);
    }

    fn visit_impl_item_method_mut(&mut self, item: &mut syn::ImplItemMethod) {
        self.outer.rewrite_block(&mut item.block);
    }

    fn visit_macro_mut(&mut self, _: &mut syn::Macro) {}
}

fn path_of(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Path(path) => Some(
            path.path
                .segments
                .iter()
                .map(|s| s.ident.to_string())
                .collect::<Vec<_>>()
                .join("::"),
        ),
        Expr::Paren(inner) => path_of(&inner.expr),
        Expr::Field(field) => match &field.member {
            syn::Member::Named(name) => Some(name.to_string()),
            syn::Member::Unnamed(_) => None,
        },
        _ => None,
    }
}

fn receiver_is_trace_local(receiver: &Expr) -> bool {
    match receiver {
        Expr::Path(path) => path
            .path
            .get_ident()
            .map(|ident| ident.to_string().starts_with("__trace"))
            .unwrap_or(false),
        _ => false,
    }
}

/// A receiver produced by the query branch of a previous run.
fn receiver_is_query_routed(receiver: &Expr) -> bool {
    match receiver {
        Expr::Call(call) => path_of(&call.func)
            .map(|p| p.starts_with("calltrace") && p.ends_with("relay_query"))
            .unwrap_or(false),
        _ => false,
    }
}

/// Only effect-free argument expressions are hoisted into snapshot
/// temporaries; anything else stays in place so evaluation order is
/// untouched.
fn snapshot_safe(expr: &Expr) -> bool {
    match expr {
        Expr::Lit(_) => true,
        Expr::Path(path) => path.path.get_ident().is_some(),
        Expr::Reference(inner) => snapshot_safe(&inner.expr),
        _ => false,
    }
}

fn isolate_closure(closure: &ExprClosure) -> Option<Expr> {
    let arity = closure.inputs.len();
    let wrapper = match arity {
        0 => format_ident!("isolate0"),
        1 => format_ident!("isolate1"),
        2 => format_ident!("isolate2"),
        _ => return None,
    };
    Some(parse_quote!(calltrace::dispatch::#wrapper(#closure)))
}
