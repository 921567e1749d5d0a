//! VM container: one Lua state behind a reentrant lock.
//!
//! Every public operation that touches the VM goes through [`VmContainer::with_lock`].
//! The lock is reentrant because script execution calls back into host code
//! on the same OS thread: while the supervisor is parked inside a resume it
//! owns the lock, and a host callback that needs the VM re-enters instead
//! of deadlocking against its own invocation.

use mlua::{Function, IntoLuaMulti, Lua, Variadic};
use parking_lot::ReentrantMutex;

/// The four functions of the runtime-private coroutine namespace.
pub(crate) struct SystemNamespace {
    pub create: Function,
    pub resume: Function,
    pub status: Function,
    pub yield_fn: Function,
}

/// Lua handles the runtime retains. Only reachable under the container
/// lock; no handle may outlive its runtime or flow to another one.
pub(crate) struct VmState {
    pub lua: Lua,
    pub system: SystemNamespace,
    pub suspend_factory: Function,
    pub tostring: Function,
}

pub(crate) struct VmContainer {
    state: ReentrantMutex<VmState>,
}

impl VmContainer {
    pub fn new(state: VmState) -> Self {
        VmContainer {
            state: ReentrantMutex::new(state),
        }
    }

    /// Run `body` with the VM locked. The guard releases on every exit
    /// path, including unwinds.
    pub fn with_lock<R>(&self, body: impl FnOnce(&VmState) -> R) -> R {
        let guard = self.state.lock();
        body(&guard)
    }

    /// Call a Lua function under the lock and return its first result.
    pub fn invoke_1(&self, func: &Function, args: impl IntoLuaMulti) -> mlua::Result<mlua::Value> {
        self.with_lock(|_| func.call(args))
    }

    /// Call a Lua function under the lock and return all results.
    pub fn invoke_all(
        &self,
        func: &Function,
        args: impl IntoLuaMulti,
    ) -> mlua::Result<Variadic<mlua::Value>> {
        self.with_lock(|_| func.call(args))
    }
}
