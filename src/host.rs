//! Host collaborator interface.
//!
//! The runtime core stays independent of the application embedding it; the
//! pieces it needs from outside are bundled in [`ScriptHost`]: project
//! resource lookup (backing `require`, `loadfile` and `dofile`), the
//! filesystem sandbox predicate (backing `io.open`), evaluation-context
//! management for the host's data graph, and a UI-thread scheduler for
//! refresh commits. Every method has a permissive default so a minimal
//! host embeds with a unit struct.

use std::path::PathBuf;
use std::sync::Arc;

use crate::context::EvaluationContext;
use crate::error::RuntimeError;
use crate::value::Value;

/// External collaborators supplied by the embedding application.
pub trait ScriptHost: Send + Sync + 'static {
    /// Look up a project resource by absolute project path (for example
    /// `/main/helpers.lua`). Backs the sandboxed module searcher and
    /// `loadfile`/`dofile`.
    fn find_resource(&self, path: &str) -> Option<Vec<u8>> {
        let _ = path;
        None
    }

    /// Map a script-supplied filename to a real filesystem path, or refuse
    /// it. Backs the sandboxed `io.open`; a refusal surfaces as a script
    /// error.
    fn resolve_path(&self, path: &str) -> Result<PathBuf, RuntimeError> {
        Err(RuntimeError::script(format!(
            "{path} is not inside the project directory"
        )))
    }

    /// A fresh snapshot of the host's data graph.
    fn evaluation_context(&self) -> EvaluationContext {
        EvaluationContext::empty()
    }

    /// Commit cache updates accumulated against `ctx`. Called after
    /// immediate invocations that derived their own context, and on the UI
    /// thread after refresh-demanding suspensions.
    fn commit_evaluation_context(&self, ctx: EvaluationContext) {
        let _ = ctx;
    }

    /// Submit a task to the host's UI thread. The default runs it inline.
    fn run_on_ui(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        task();
    }
}

/// Host with no project, no file access and inline UI scheduling.
pub struct NullHost;

impl ScriptHost for NullHost {}

/// Sink receiving text a script writes to one of its standard streams.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Options for [`Runtime::make`](crate::Runtime::make).
#[derive(Default, Clone)]
pub struct RuntimeOptions {
    /// Sink for the script's standard output (`print`, `io.write`,
    /// `io.stdout`). Defaults to the process's stdout.
    pub out: Option<OutputSink>,
    /// Sink for the script's standard error (`io.stderr`). Defaults to the
    /// process's stderr.
    pub err: Option<OutputSink>,
    /// Environment overlay merged into the globals: recurses into existing
    /// tables, overwrites leaves. Callable leaves become host functions.
    pub env: Option<Value>,
}
