// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Runtime support called by rewritten function bodies.
//!
//! The rewriter prepends one [`Frame`] to every wrapped body. The frame
//! emits the enter event on construction and the exit event on drop, so
//! every path out of the function (plain return, `?` propagation, panic
//! unwinding aside) closes its span. Return values are captured into the
//! frame by the rewritten `return` expressions.

use std::fmt;

use serde_json::Value;

use crate::event::CallMeta;
use crate::event::FrameInfo;
use crate::sanitize;
use crate::scope;
use crate::scope::ExitDetail;
use crate::scope::ScopeHandle;

/// RAII frame for one invocation of a body-traced function.
pub struct Frame {
    slot: Option<FrameSlot>,
}

struct FrameSlot {
    scope: ScopeHandle,
    info: FrameInfo,
    ret: Option<Value>,
    error: Option<Value>,
    threw: bool,
}

impl Frame {
    /// Open the frame in the current scope. A no-op frame is returned when
    /// no scope is installed, mirroring the noop span idiom.
    pub fn enter(meta: &'static CallMeta, args: Option<Value>) -> Frame {
        let Some(scope) = scope::current() else {
            return Frame { slot: None };
        };
        let info = FrameInfo::from(meta);
        scope.enter(&info, args);
        Frame {
            slot: Some(FrameSlot {
                scope,
                info,
                ret: None,
                error: None,
                threw: false,
            }),
        }
    }

    /// Record the value produced by a `return` expression (or the trailing
    /// expression) and hand it back unchanged.
    #[inline]
    pub fn capture<T: fmt::Debug>(&mut self, value: T) -> T {
        if let Some(slot) = self.slot.as_mut() {
            slot.ret = Some(sanitize::debug_value(&value));
        }
        value
    }

    /// Record a `Result` return: an `Err` marks the frame as thrown and
    /// captures the error; the value is handed back unchanged either way.
    #[inline]
    pub fn capture_result<T: fmt::Debug, E: fmt::Debug>(
        &mut self,
        value: Result<T, E>,
    ) -> Result<T, E> {
        if let Some(slot) = self.slot.as_mut() {
            match &value {
                Ok(v) => slot.ret = Some(sanitize::debug_value(v)),
                Err(e) => {
                    slot.threw = true;
                    slot.error = Some(sanitize::debug_value(e));
                }
            }
        }
        value
    }

    /// Record an `Option` return for functions propagating with `?` over
    /// `Option`.
    #[inline]
    pub fn capture_option<T: fmt::Debug>(&mut self, value: Option<T>) -> Option<T> {
        if let Some(slot) = self.slot.as_mut() {
            slot.ret = Some(sanitize::debug_value(&value));
        }
        value
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.scope.exit(
                &slot.info,
                ExitDetail {
                    ret: slot.ret,
                    error: slot.error,
                    threw: slot.threw,
                    unawaited: false,
                },
            );
        }
    }
}

/// Build the bounded argument snapshot bound at the top of a wrapped body.
///
/// Expands to `None` for empty parameter lists.
#[macro_export]
macro_rules! args_snapshot {
    () => {
        ::core::option::Option::None
    };
    ($($arg:expr),+ $(,)?) => {
        ::core::option::Option::Some($crate::sanitize::args_array(
            vec![$($crate::sanitize::debug_value(&$arg)),+],
        ))
    };
}
