//! Embedded Lua scripting runtime for editor hosts.
//!
//! Untrusted scripts call privileged host operations as ordinary
//! synchronous functions even when those operations are asynchronous on
//! the host side; the host evaluates short snippets synchronously from any
//! thread while long-running scripts are parked; and scripts keep the full
//! `coroutine` library for their own control flow, untouched by the host's
//! suspension machinery.
//!
//! # Architecture
//!
//! - Each [`Runtime`] owns one Lua VM serialised behind a reentrant lock;
//!   every entry into the VM happens under it.
//! - A bootstrap script (`coronest.lua`) manufactures two independent
//!   coroutine namespaces from the native library: the *user* namespace is
//!   rebound as the global `coroutine` table, the *system* namespace is
//!   runtime-private and parks suspending invocations.
//! - A suspendable host call yields an opaque token to the system
//!   coroutine; the invocation supervisor runs the host operation with the
//!   VM unlocked, awaits its future and resumes the coroutine with the
//!   outcome, repeating until the coroutine is dead.
//! - Values cross the boundary through the bridge in `value`; host
//!   callbacks observe their invocation through the dynamically-scoped
//!   [`ExecutionContext`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use edlua::{NullHost, Runtime, RuntimeOptions};
//!
//! let runtime = Runtime::make(Arc::new(NullHost), RuntimeOptions::default())?;
//! let chunk = runtime.read("return 1 + 1", None)?;
//! let value = runtime.eval(&chunk)?;
//! assert_eq!(value, edlua::mlua::Value::Integer(2));
//! # Ok::<(), edlua::RuntimeError>(())
//! ```

mod context;
mod error;
mod host;
mod runtime;
mod sandbox;
mod suspend;
mod value;
mod vm;

pub use context::{EvaluationContext, ExecutionContext, InvocationMode};
pub use error::RuntimeError;
pub use host::{NullHost, OutputSink, RuntimeOptions, ScriptHost};
pub use runtime::{CompiledChunk, Runtime, SuspendingCall};
pub use suspend::{host_fn, suspendable_fn, HostFuture, RegularFn, SuspendResult, SuspendableFn};
pub use value::{FloatKey, OpaqueValue, TableKey, Value};

// Script values in the public API are mlua values; re-export the crate so
// hosts don't need their own version pin.
pub use mlua;
