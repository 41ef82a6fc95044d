//! luadbg Core Library
//!
//! In-process debugger engine for Lua 5.4 states:
//! - Breakpoints, step in/over/out with per-coroutine depth tracking
//! - Frame inspection, local variable edits and expression evaluation
//! - Lua ↔ JSON-compatible value marshaling
//! - JSON-RPC protocol types for the `luadbg-server` front-end

pub mod config;
pub mod debugger;
pub mod error;
pub mod lua;
pub mod protocol;
pub mod value;

pub use config::DebuggerConfig;
pub use debugger::breakpoint::{Breakpoint, BreakpointRegistry};
pub use debugger::inspect::{DebugInfo, StackFrame};
pub use debugger::session::{DebugSession, PauseReason};
pub use debugger::step::{StepRequest, ThreadId};
pub use debugger::Debugger;
pub use error::{DebuggerError, EvalError};
pub use lua::LuaHost;
pub use protocol::{Event, Request, Response};
pub use value::Value;
