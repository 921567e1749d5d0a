//! Runtime construction, VM startup, and the invocation supervisor.
//!
//! Startup installs the sandbox, redirects the script's standard streams,
//! splits the coroutine library into independent user and system
//! namespaces, and merges the host's environment overlay. The supervisor
//! then offers two entry points: `invoke_immediate` runs a script function
//! synchronously under the VM lock with suspension forbidden, and
//! `invoke_suspending` parks the function on a system coroutine and drives
//! it to completion, awaiting one host future per suspension with the VM
//! unlocked in between.

use std::sync::Arc;

use mlua::{Function, Lua, Table, Variadic};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::context::{EvaluationContext, ExecutionContext, InvocationMode};
use crate::error::{lua_error_message, RuntimeError};
use crate::host::{OutputSink, RuntimeOptions, ScriptHost};
use crate::suspend::{SuspendResult, SuspendToken, MAIN_THREAD_SUSPEND_ERROR, YIELD_OUTSIDE_COROUTINE};
use crate::value::{lua_to_value, value_to_lua, table_key_to_lua, ConvertCtx, TableKey, Value};
use crate::vm::{SystemNamespace, VmContainer, VmState};

/// The coroutine-namespace bootstrap, shipped with the runtime.
const CORONEST: &str = include_str!("coronest.lua");

/// Lua half of the suspendable wrapper. Loaded once with the system
/// namespace's yield; applied to each token builder to produce the
/// script-visible function.
const SUSPENDABLE_SHIM: &str = r#"
local sys_yield = ...
return function(make_token)
  return function(...)
    local ok, result = sys_yield(make_token(...))
    if ok then
      return result
    end
    error(result, 0)
  end
end
"#;

const REPL_CHUNK_NAME: &str = "REPL";

// ─────────────────────────────────────────────────────────────────────────────
// Runtime handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to one script VM and its invocation supervisor.
///
/// Cheap to clone; all clones share the VM. Safe to use from any thread:
/// VM access is serialised by the container's reentrant lock. Script
/// values obtained from one runtime must never be passed to another.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    vm: VmContainer,
    host: Arc<dyn ScriptHost>,
    driver: Mutex<Option<tokio::runtime::Runtime>>,
    driver_handle: tokio::runtime::Handle,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        // shutdown_background is safe even when the handle is dropped
        // inside another tokio runtime.
        if let Some(driver) = self.driver.lock().take() {
            driver.shutdown_background();
        }
    }
}

/// A compiled, reusable chunk of script code.
pub struct CompiledChunk {
    function: Function,
}

impl Runtime {
    /// Create a runtime over a fresh Lua VM.
    pub fn make(host: Arc<dyn ScriptHost>, options: RuntimeOptions) -> Result<Runtime, RuntimeError> {
        let out = options.out.unwrap_or_else(default_out);
        let err = options.err.unwrap_or_else(default_err);

        let driver = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("edlua-driver")
            .enable_all()
            .build()
            .map_err(|e| RuntimeError::host(format!("failed to start driver runtime: {e}")))?;
        let driver_handle = driver.handle().clone();

        let lua = Lua::new();
        crate::sandbox::install(&lua, &host)?;
        install_output(&lua, out, err)?;
        let system = split_coroutines(&lua)?;
        let suspend_factory = make_suspend_factory(&lua, &system.yield_fn)?;
        let tostring: Function = lua.globals().get("tostring")?;

        if let Some(env) = options.env {
            merge_env(&lua, &suspend_factory, env)?;
        }

        let state = VmState {
            lua,
            system,
            suspend_factory,
            tostring,
        };
        tracing::debug!("[runtime] VM initialised");
        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                vm: VmContainer::new(state),
                host,
                driver: Mutex::new(Some(driver)),
                driver_handle,
            }),
        })
    }

    /// The host collaborators this runtime was created with.
    pub fn host(&self) -> &Arc<dyn ScriptHost> {
        &self.inner.host
    }

    // ─────────────────────────────────────────────────────────────────────
    // Code operations
    // ─────────────────────────────────────────────────────────────────────

    /// Compile a chunk into a reusable code object.
    pub fn read(&self, source: &str, name: Option<&str>) -> Result<CompiledChunk, RuntimeError> {
        self.inner.vm.with_lock(|state| {
            let function = state
                .lua
                .load(source)
                .set_name(name.unwrap_or(REPL_CHUNK_NAME))
                .into_function()?;
            Ok(CompiledChunk { function })
        })
    }

    /// Run a compiled chunk under the lock and return its single result.
    pub fn eval(&self, chunk: &CompiledChunk) -> Result<mlua::Value, RuntimeError> {
        Ok(self.inner.vm.invoke_1(&chunk.function, ())?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Value helpers
    // ─────────────────────────────────────────────────────────────────────

    /// Convert a host value into a Lua value owned by this runtime.
    pub fn to_lua(&self, value: Value) -> Result<mlua::Value, RuntimeError> {
        self.inner.vm.with_lock(|state| {
            let cx = ConvertCtx {
                lua: &state.lua,
                suspend_factory: &state.suspend_factory,
            };
            Ok(value_to_lua(&cx, value)?)
        })
    }

    /// Convert a Lua value into a host value. Locks the VM for the table
    /// walk.
    pub fn from_lua(&self, value: mlua::Value) -> Result<Value, RuntimeError> {
        self.inner.vm.with_lock(|_| Ok(lua_to_value(value)?))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Invocation supervisor
    // ─────────────────────────────────────────────────────────────────────

    /// Call a script function synchronously. Suspension is forbidden: a
    /// suspendable call raises a script error instead of parking.
    ///
    /// When the caller supplies no evaluation context a fresh one is
    /// derived and its pending cache updates are committed on success.
    pub fn invoke_immediate(
        &self,
        func: &Function,
        args: Vec<Value>,
        evaluation_context: Option<EvaluationContext>,
    ) -> Result<mlua::Value, RuntimeError> {
        let caller_supplied = evaluation_context.is_some();
        let ec = evaluation_context.unwrap_or_else(|| self.inner.host.evaluation_context());
        let ctx = ExecutionContext::new(ec.clone(), self.clone(), InvocationMode::Immediate);
        let _guard = ctx.enter();

        let call_result: mlua::Result<mlua::Value> = self.inner.vm.with_lock(|state| {
            let cx = ConvertCtx {
                lua: &state.lua,
                suspend_factory: &state.suspend_factory,
            };
            let lua_args = args
                .into_iter()
                .map(|v| value_to_lua(&cx, v))
                .collect::<mlua::Result<Vec<_>>>()?;
            self.inner.vm.invoke_1(func, Variadic::from_iter(lua_args))
        });

        match call_result {
            Ok(value) => {
                if !caller_supplied {
                    self.inner.host.commit_evaluation_context(ec);
                }
                Ok(value)
            }
            Err(error) => {
                let message = lua_error_message(&error);
                if message.trim_end().ends_with(YIELD_OUTSIDE_COROUTINE) {
                    Err(RuntimeError::Script(MAIN_THREAD_SUSPEND_ERROR.to_string()))
                } else {
                    Err(error.into())
                }
            }
        }
    }

    /// Call a script function on a system coroutine, driving it through any
    /// suspensions. The returned handle completes with the function's final
    /// value; when the script never suspends it is already complete before
    /// this method returns.
    pub fn invoke_suspending(&self, func: Function, args: Vec<Value>) -> SuspendingCall {
        let (tx, rx) = oneshot::channel();

        let created: Result<(mlua::Value, Variadic<mlua::Value>), RuntimeError> =
            self.inner.vm.with_lock(|state| {
                let co = self.inner.vm.invoke_1(&state.system.create, func)?;
                let cx = ConvertCtx {
                    lua: &state.lua,
                    suspend_factory: &state.suspend_factory,
                };
                let lua_args = args
                    .into_iter()
                    .map(|v| value_to_lua(&cx, v))
                    .collect::<mlua::Result<Vec<_>>>()?;
                Ok((co, Variadic::from_iter(lua_args)))
            });

        match created {
            Ok((co, lua_args)) => {
                let ec = self.inner.host.evaluation_context();
                self.drive(tx, co, ec, ResumeArgs::Initial(lua_args));
            }
            Err(error) => {
                let _ = tx.send(Err(error));
            }
        }

        SuspendingCall { rx }
    }

    /// One step of the drive loop: resume under the lock, then either
    /// complete the invocation, or run the yielded host operation with the
    /// lock released and chain the next step onto its future. Recursive in
    /// form, iterative in effect; each continuation runs on whichever
    /// driver thread completes the awaited future.
    fn drive(
        &self,
        tx: oneshot::Sender<Result<mlua::Value, RuntimeError>>,
        co: mlua::Value,
        ec: EvaluationContext,
        resume: ResumeArgs,
    ) {
        let ctx = ExecutionContext::new(ec.clone(), self.clone(), InvocationMode::Suspendable);
        let guard = ctx.enter();

        let step = self.resume_step(&co, resume);
        match step {
            Err(error) => {
                drop(guard);
                let _ = tx.send(Err(error));
            }
            Ok(Step::Done(value)) => {
                drop(guard);
                let _ = tx.send(Ok(value));
            }
            Ok(Step::Suspended(token)) => {
                tracing::trace!("[invoke_suspending] suspension yielded, invoking host operation");
                // The lock is released here; the host operation must not
                // run under it.
                let future = match (token.func)(token.args) {
                    Ok(future) => future,
                    Err(RuntimeError::Script(message)) => SuspendResult::Error(message).into_future(),
                    Err(error) => {
                        drop(guard);
                        let _ = tx.send(Err(error));
                        return;
                    }
                };
                drop(guard);

                let runtime = self.clone();
                let _ = self.inner.driver_handle.spawn(async move {
                    let result = match future.await {
                        Ok(result) => result,
                        Err(RuntimeError::Script(message)) => SuspendResult::Error(message),
                        Err(error) => {
                            let _ = tx.send(Err(error));
                            return;
                        }
                    };

                    let next_ec = if matches!(result, SuspendResult::Value { refresh: true, .. }) {
                        tracing::debug!("[invoke_suspending] refresh requested, committing evaluation context on UI thread");
                        let host = runtime.inner.host.clone();
                        let stale = ec;
                        runtime
                            .inner
                            .host
                            .run_on_ui(Box::new(move || host.commit_evaluation_context(stale)));
                        runtime.inner.host.evaluation_context()
                    } else {
                        ec
                    };

                    runtime.drive(tx, co, next_ec, ResumeArgs::Result(result));
                });
            }
        }
    }

    /// Resume the system coroutine once and classify the outcome.
    fn resume_step(&self, co: &mlua::Value, resume: ResumeArgs) -> Result<Step, RuntimeError> {
        self.inner.vm.with_lock(|state| {
            let results = match resume {
                ResumeArgs::Initial(args) => self
                    .inner
                    .vm
                    .invoke_all(&state.system.resume, (co.clone(), args))?,
                ResumeArgs::Result(SuspendResult::Value { value, .. }) => {
                    let cx = ConvertCtx {
                        lua: &state.lua,
                        suspend_factory: &state.suspend_factory,
                    };
                    let lua_value = value_to_lua(&cx, value)?;
                    self.inner
                        .vm
                        .invoke_all(&state.system.resume, (co.clone(), true, lua_value))?
                }
                ResumeArgs::Result(SuspendResult::Error(message)) => self
                    .inner
                    .vm
                    .invoke_all(&state.system.resume, (co.clone(), false, message))?,
            };

            let mut results = results.into_iter();
            let ok = matches!(results.next(), Some(mlua::Value::Boolean(true)));
            let payload = results.next().unwrap_or(mlua::Value::Nil);

            if !ok {
                return Err(RuntimeError::Script(error_text(state, payload)));
            }

            let status: String = self.inner.vm.invoke_1(&state.system.status, co.clone())?
                .as_string()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            if status == "dead" {
                return Ok(Step::Done(payload));
            }

            match payload {
                mlua::Value::UserData(ud) => match ud.borrow::<SuspendToken>() {
                    Ok(token) => Ok(Step::Suspended((*token).clone())),
                    Err(_) => Err(RuntimeError::host(
                        "script yielded a non-token value to the supervisor",
                    )),
                },
                _ => Err(RuntimeError::host(
                    "script yielded a non-token value to the supervisor",
                )),
            }
        })
    }
}

/// Outcome of one resume.
enum Step {
    Done(mlua::Value),
    Suspended(SuspendToken),
}

/// What the next resume delivers into the coroutine.
enum ResumeArgs {
    /// First resume: the invocation's arguments.
    Initial(Variadic<mlua::Value>),
    /// Later resumes: the outcome of the awaited host operation.
    Result(SuspendResult),
}

/// Render a script error value as text.
fn error_text(state: &VmState, value: mlua::Value) -> String {
    match state.tostring.call::<mlua::String>(value) {
        Ok(s) => s.to_string_lossy().to_string(),
        Err(_) => "unknown error".to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Suspending call handle
// ─────────────────────────────────────────────────────────────────────────────

/// Future-like handle to a suspending invocation.
pub struct SuspendingCall {
    rx: oneshot::Receiver<Result<mlua::Value, RuntimeError>>,
}

impl SuspendingCall {
    /// Non-blocking check: the invocation's result if it has completed.
    pub fn try_result(&mut self) -> Option<Result<mlua::Value, RuntimeError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(RuntimeError::Canceled)),
        }
    }

    /// Block the calling thread until the invocation completes. Must not be
    /// called from async code; use the `Future` impl there.
    pub fn wait(self) -> Result<mlua::Value, RuntimeError> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Canceled),
        }
    }
}

impl std::future::Future for SuspendingCall {
    type Output = Result<mlua::Value, RuntimeError>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        std::pin::Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Canceled),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// VM startup
// ─────────────────────────────────────────────────────────────────────────────

fn default_out() -> OutputSink {
    Arc::new(|text: &str| print!("{text}"))
}

fn default_err() -> OutputSink {
    Arc::new(|text: &str| eprint!("{text}"))
}

/// Load the bootstrap and split the coroutine library: the user namespace
/// replaces the global `coroutine` table (and its `package.loaded` entry),
/// the system namespace is retained only by the runtime.
fn split_coroutines(lua: &Lua) -> mlua::Result<SystemNamespace> {
    let bootstrap: Function = lua.load(CORONEST).set_name("@coronest.lua").eval()?;
    let user: Table = bootstrap.call("user")?;
    let system: Table = bootstrap.call("system")?;

    let globals = lua.globals();
    globals.set("coroutine", user.clone())?;
    let package: Table = globals.get("package")?;
    let loaded: Table = package.get("loaded")?;
    loaded.set("coroutine", user)?;

    Ok(SystemNamespace {
        create: system.get("create")?,
        resume: system.get("resume")?,
        status: system.get("status")?,
        yield_fn: system.get("yield")?,
    })
}

fn make_suspend_factory(lua: &Lua, yield_fn: &Function) -> mlua::Result<Function> {
    lua.load(SUSPENDABLE_SHIM)
        .set_name("=suspendable")
        .into_function()?
        .call(yield_fn.clone())
}

/// Redirect the script's standard streams into the host sinks.
fn install_output(lua: &Lua, out: OutputSink, err: OutputSink) -> mlua::Result<()> {
    let globals = lua.globals();
    let tostring: Function = globals.get("tostring")?;

    let sink = out.clone();
    let to_text = tostring.clone();
    let print = lua.create_function(move |_, args: Variadic<mlua::Value>| {
        let mut line = String::new();
        for (index, arg) in args.into_iter().enumerate() {
            if index > 0 {
                line.push('\t');
            }
            let text: mlua::String = to_text.call(arg)?;
            line.push_str(&text.to_string_lossy());
        }
        line.push('\n');
        sink(&line);
        Ok(())
    })?;
    globals.set("print", print)?;

    let io: Table = globals.get("io")?;
    let sink = out.clone();
    let to_text = tostring.clone();
    let write = lua.create_function(move |_, args: Variadic<mlua::Value>| {
        for arg in args {
            let text: mlua::String = to_text.call(arg)?;
            sink(&text.to_string_lossy());
        }
        Ok(())
    })?;
    io.set("write", write)?;
    io.set("stdout", sink_file(lua, out, tostring.clone())?)?;
    io.set("stderr", sink_file(lua, err, tostring)?)?;
    Ok(())
}

/// Duck-typed file whose `write` feeds a host sink, standing in for
/// `io.stdout`/`io.stderr`.
fn sink_file(lua: &Lua, sink: OutputSink, tostring: Function) -> mlua::Result<Table> {
    let file = lua.create_table()?;
    let write = lua.create_function(
        move |_, (this, args): (mlua::Value, Variadic<mlua::Value>)| {
            for arg in args {
                let text: mlua::String = tostring.call(arg)?;
                sink(&text.to_string_lossy());
            }
            Ok(this)
        },
    )?;
    file.set("write", write)?;
    Ok(file)
}

/// Merge the environment overlay into the globals: recurse into existing
/// tables, overwrite leaves.
fn merge_env(lua: &Lua, suspend_factory: &Function, env: Value) -> mlua::Result<()> {
    let Value::Map(entries) = env else {
        return Err(mlua::Error::RuntimeError(
            "env overlay must be a map".to_string(),
        ));
    };
    let cx = ConvertCtx {
        lua,
        suspend_factory,
    };
    merge_table(&cx, &lua.globals(), entries)
}

fn merge_table(
    cx: &ConvertCtx<'_>,
    target: &Table,
    entries: std::collections::HashMap<TableKey, Value>,
) -> mlua::Result<()> {
    for (key, value) in entries {
        let lua_key = table_key_to_lua(cx.lua, &key)?;
        match value {
            Value::Map(nested) => {
                let existing: mlua::Value = target.get(lua_key.clone())?;
                match existing {
                    mlua::Value::Table(table) => merge_table(cx, &table, nested)?,
                    _ => target.set(lua_key, value_to_lua(cx, Value::Map(nested))?)?,
                }
            }
            leaf => target.set(lua_key, value_to_lua(cx, leaf)?)?,
        }
    }
    Ok(())
}
