//! Error types for the scripting runtime.
//!
//! Errors live in two worlds that must never mix: `Script` errors carry a
//! message that Lua code can observe (and may be re-raised inside the VM),
//! while `Host` errors are host-side failures that fail the invocation
//! without ever being delivered to the script.

/// Errors produced by runtime operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// A Lua-level error with its message.
    #[error("Lua error: {0}")]
    Script(String),

    /// A host-side failure; fails the invocation without resuming the script.
    #[error("host error: {0}")]
    Host(String),

    /// The invocation was dropped before it completed.
    #[error("invocation dropped before completion")]
    Canceled,
}

impl RuntimeError {
    /// A script-visible error with the given message.
    pub fn script(message: impl Into<String>) -> Self {
        RuntimeError::Script(message.into())
    }

    /// A host-side error with the given message.
    pub fn host(message: impl Into<String>) -> Self {
        RuntimeError::Host(message.into())
    }

    /// The message of a script-visible error, if this is one.
    pub fn script_message(&self) -> Option<&str> {
        match self {
            RuntimeError::Script(message) => Some(message),
            _ => None,
        }
    }
}

/// Extract the root message of a Lua error, unwrapping callback chains.
///
/// Callback errors wrap the Rust-side cause that was raised inside the VM;
/// the innermost message is the one the script (and the host caller) care
/// about.
pub(crate) fn lua_error_message(error: &mlua::Error) -> String {
    match error {
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::CallbackError { cause, .. } => lua_error_message(cause),
        mlua::Error::ExternalError(cause) => cause.to_string(),
        other => other.to_string(),
    }
}

/// Re-raise a runtime error inside the VM as a Lua error.
pub(crate) fn to_lua_error(error: RuntimeError) -> mlua::Error {
    match error {
        RuntimeError::Script(message) => mlua::Error::RuntimeError(message),
        other => mlua::Error::RuntimeError(other.to_string()),
    }
}

impl From<mlua::Error> for RuntimeError {
    fn from(error: mlua::Error) -> Self {
        RuntimeError::Script(lua_error_message(&error))
    }
}
