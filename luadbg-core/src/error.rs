//! Debugger error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DebuggerError {
    #[error("Cannot attach: the Lua state handle is null")]
    NullState,

    #[error("Debugger is already attached to a Lua state")]
    AlreadyAttached,

    #[error("Another debugger is already attached to this Lua state")]
    StateInUse,

    #[error("Failed to load chunk '{chunk}': {message}")]
    Load { chunk: String, message: String },

    #[error("Error while running '{chunk}': {message}")]
    Runtime { chunk: String, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Failure of a pause-time evaluation. Never fatal; the frame is left
/// untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("No paused frame to evaluate in")]
    NotPaused,

    #[error("No stack frame at level {0}")]
    InvalidLevel(usize),

    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl DebuggerError {
    pub fn load(chunk: impl Into<String>, message: impl Into<String>) -> Self {
        DebuggerError::Load {
            chunk: chunk.into(),
            message: message.into(),
        }
    }

    pub fn runtime(chunk: impl Into<String>, message: impl Into<String>) -> Self {
        DebuggerError::Runtime {
            chunk: chunk.into(),
            message: message.into(),
        }
    }
}
