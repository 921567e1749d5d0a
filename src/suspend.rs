//! Suspendable host calls: result types, the private suspend token, and
//! the wrapper constructors.
//!
//! A suspendable wraps a host operation returning a future. Calling it from
//! script builds a token carrying the operation and its captured arguments,
//! then yields that token through the system coroutine namespace to the
//! invocation supervisor. The supervisor runs the operation with the VM
//! unlocked, awaits its future, and resumes the coroutine with the outcome.
//! The yield has to happen on the Lua side of the boundary (a Rust callback
//! cannot yield the VM), so the wrapper is split: Rust builds the token,
//! a small Lua shim installed at startup performs the yield and interprets
//! the reply.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use mlua::{Lua, UserData, Variadic};

use crate::context::{ExecutionContext, InvocationMode};
use crate::error::RuntimeError;
use crate::value::Value;

/// Error raised when a suspendable is called from an immediate invocation.
pub(crate) const IMMEDIATE_SUSPEND_ERROR: &str =
    "Cannot use long-running editor function in immediate context.";

/// Error substituted when a suspend attempt reaches the VM's main thread.
pub(crate) const MAIN_THREAD_SUSPEND_ERROR: &str =
    "Cannot use long-running editor function in this context";

/// Lua 5.4's canonical message for a yield outside any coroutine.
pub(crate) const YIELD_OUTSIDE_COROUTINE: &str = "attempt to yield from outside a coroutine";

/// Future returned by a suspendable host operation.
pub type HostFuture = Pin<Box<dyn Future<Output = Result<SuspendResult, RuntimeError>> + Send>>;

/// A suspendable host operation: captured script arguments in, future out.
///
/// Arguments arrive as already-wrapped Lua values; the operation converts
/// what it needs. Returning (or resolving to) `RuntimeError::Script` raises
/// the error inside the suspended call; any other error fails the whole
/// invocation without resuming the script.
pub type SuspendableFn = Arc<dyn Fn(Vec<mlua::Value>) -> Result<HostFuture, RuntimeError> + Send + Sync>;

/// A regular host operation, run synchronously under the VM lock.
pub type RegularFn = Arc<dyn Fn(Vec<mlua::Value>) -> Result<Value, RuntimeError> + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Suspend results
// ─────────────────────────────────────────────────────────────────────────────

/// How a suspended host operation reports back to the script.
#[derive(Debug, Clone, PartialEq)]
pub enum SuspendResult {
    /// Return `value` to the script. When `refresh` is set the supervisor
    /// commits the current evaluation context's pending cache updates on
    /// the UI thread and adopts a fresh context before resuming.
    Value { value: Value, refresh: bool },
    /// Raise a script error inside the suspended call.
    Error(String),
}

impl SuspendResult {
    /// A successful result, optionally demanding a context refresh.
    pub fn success(value: Value, refresh: bool) -> Self {
        SuspendResult::Value { value, refresh }
    }

    /// A script-visible error.
    pub fn error(message: impl Into<String>) -> Self {
        SuspendResult::Error(message.into())
    }

    /// An already-completed future of this result, for host operations that
    /// finish synchronously.
    pub fn into_future(self) -> HostFuture {
        Box::pin(std::future::ready(Ok(self)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Suspend tokens
// ─────────────────────────────────────────────────────────────────────────────

/// Host-private payload yielded by a suspendable wrapper to the supervisor.
///
/// Built exclusively inside the wrapper, consumed exclusively by the drive
/// loop; never observable by script code.
#[derive(Clone)]
pub(crate) struct SuspendToken {
    pub func: SuspendableFn,
    pub args: Vec<mlua::Value>,
}

impl UserData for SuspendToken {}

/// Build the Rust half of a suspendable wrapper: a Lua function that checks
/// the current execution context and returns a fresh token userdata. The
/// shim installed at startup calls it and yields the token.
pub(crate) fn make_token_fn(lua: &Lua, func: SuspendableFn) -> mlua::Result<mlua::Function> {
    lua.create_function(move |lua, args: Variadic<mlua::Value>| {
        if let Some(ctx) = ExecutionContext::current() {
            if ctx.mode() == InvocationMode::Immediate {
                return Err(mlua::Error::RuntimeError(IMMEDIATE_SUSPEND_ERROR.to_string()));
            }
        }
        lua.create_userdata(SuspendToken {
            func: func.clone(),
            args: args.into_iter().collect(),
        })
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Wrapper constructors
// ─────────────────────────────────────────────────────────────────────────────

/// Wrap a long-running host operation as a suspendable callable, usable as
/// an env leaf or anywhere a [`Value`] is installed into the VM.
pub fn suspendable_fn(
    func: impl Fn(Vec<mlua::Value>) -> Result<HostFuture, RuntimeError> + Send + Sync + 'static,
) -> Value {
    Value::Suspendable(Arc::new(func))
}

/// Wrap a synchronous host operation as a regular callable. It runs under
/// the VM lock with the current execution context bound.
pub fn host_fn(
    func: impl Fn(Vec<mlua::Value>) -> Result<Value, RuntimeError> + Send + Sync + 'static,
) -> Value {
    Value::HostFn(Arc::new(func))
}
