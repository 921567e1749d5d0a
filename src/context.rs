//! Per-invocation execution context.
//!
//! Host code called back from script (regular host functions, suspendable
//! token builders) needs to know which runtime invoked it, against which
//! snapshot of the host's data graph it should evaluate, and whether
//! suspension is allowed. That record is held in a dynamically-scoped
//! binding: a thread-local stack pushed around every VM entry and every
//! coroutine resume. Because mlua resumes coroutines on the calling OS
//! thread, the binding established by the supervisor is visible to all
//! script-invoked host code for the duration of the step.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use crate::runtime::Runtime;

/// Whether the current invocation may suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// Synchronous entry; suspendable calls are rejected.
    Immediate,
    /// System-coroutine entry; suspendable calls park the invocation.
    Suspendable,
}

/// Opaque host value naming a consistent snapshot of the host's data graph.
///
/// The runtime never looks inside; it only threads the context through to
/// host callbacks and hands it back for committing when a refresh is
/// requested.
#[derive(Clone)]
pub struct EvaluationContext(Arc<dyn Any + Send + Sync>);

impl EvaluationContext {
    /// Wrap a host snapshot.
    pub fn new<T: Any + Send + Sync>(snapshot: T) -> Self {
        EvaluationContext(Arc::new(snapshot))
    }

    /// A context carrying no host data, for hosts without a graph cache.
    pub fn empty() -> Self {
        EvaluationContext(Arc::new(()))
    }

    /// Borrow the wrapped snapshot, if it has the expected type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (&*self.0 as &dyn Any).downcast_ref()
    }
}

impl fmt::Debug for EvaluationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EvaluationContext(..)")
    }
}

/// The record exposed to host code for the dynamic extent of a VM entry.
#[derive(Clone)]
pub struct ExecutionContext {
    evaluation_context: EvaluationContext,
    runtime: Runtime,
    mode: InvocationMode,
}

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ExecutionContext>> = RefCell::new(Vec::new());
}

impl ExecutionContext {
    pub(crate) fn new(
        evaluation_context: EvaluationContext,
        runtime: Runtime,
        mode: InvocationMode,
    ) -> Self {
        ExecutionContext {
            evaluation_context,
            runtime,
            mode,
        }
    }

    /// The ambient evaluation context of the invocation.
    pub fn evaluation_context(&self) -> &EvaluationContext {
        &self.evaluation_context
    }

    /// The runtime that entered the VM.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Whether the invocation may suspend.
    pub fn mode(&self) -> InvocationMode {
        self.mode
    }

    /// The context bound around the innermost VM entry on this thread.
    pub fn current() -> Option<ExecutionContext> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().cloned())
    }

    /// Bind this context for the extent of the returned guard.
    pub(crate) fn enter(self) -> ContextGuard {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(self));
        ContextGuard(())
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Pops the context pushed by [`ExecutionContext::enter`] on drop, on every
/// exit path including unwinds.
pub(crate) struct ContextGuard(());

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
