//! JSON-RPC Protocol definitions
//!
//! Defines the newline-delimited protocol between a front-end and
//! luadbg-server. Requests and responses are wrapped in [`RpcMessage`];
//! notifications from the debuggee side are [`Event`]s without an id.

use crate::debugger::breakpoint::Breakpoint;
use crate::debugger::inspect::StackFrame;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Request from the front-end to luadbg-server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    #[serde(rename = "add_breakpoint")]
    AddBreakpoint { file: String, line: u32 },

    #[serde(rename = "remove_breakpoint")]
    RemoveBreakpoint { file: String, line: u32 },

    #[serde(rename = "enable_breakpoint")]
    EnableBreakpoint { file: String, line: u32 },

    #[serde(rename = "disable_breakpoint")]
    DisableBreakpoint { file: String, line: u32 },

    #[serde(rename = "list_breakpoints")]
    ListBreakpoints,

    /// Resume without a pending step
    #[serde(rename = "continue")]
    Continue,

    #[serde(rename = "step_in")]
    StepIn,

    #[serde(rename = "step_over")]
    StepOver,

    #[serde(rename = "step_out")]
    StepOut,

    /// Stop at the next executed line
    #[serde(rename = "pause")]
    Pause,

    #[serde(rename = "get_call_stack")]
    GetCallStack,

    #[serde(rename = "get_local_vars")]
    GetLocalVars {
        #[serde(default)]
        level: usize,
    },

    #[serde(rename = "set_local_var")]
    SetLocalVar {
        #[serde(default)]
        level: usize,
        name: String,
        value: Value,
    },

    /// Evaluate an expression in a paused frame
    #[serde(rename = "eval")]
    Eval {
        #[serde(default)]
        level: usize,
        expr: String,
    },

    /// Detach and stop the server
    #[serde(rename = "shutdown")]
    Shutdown,
}

impl Request {
    /// Whether the request ends the current pause.
    pub fn resumes(&self) -> bool {
        matches!(
            self,
            Request::Continue
                | Request::StepIn
                | Request::StepOver
                | Request::StepOut
                | Request::Shutdown
        )
    }
}

/// A named value in a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: Value,
}

impl From<(String, Value)> for Variable {
    fn from((name, value): (String, Value)) -> Self {
        Variable { name, value }
    }
}

/// Response from luadbg-server to the front-end
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Breakpoint { breakpoint: Breakpoint },
    Breakpoints { breakpoints: Vec<Breakpoint> },
    CallStack { frames: Vec<StackFrame> },
    Variables { variables: Vec<Variable> },
    EvalResult { values: Vec<Value> },
    Success { ok: bool },
    Error { error: String },
}

impl Response {
    pub fn success() -> Self {
        Response::Success { ok: true }
    }

    /// `ok: false` for lookups that found nothing.
    pub fn not_found() -> Self {
        Response::Success { ok: false }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Response::Error { error: msg.into() }
    }

    pub fn variables(vars: Vec<(String, Value)>) -> Self {
        Response::Variables {
            variables: vars.into_iter().map(Variable::from).collect(),
        }
    }

    pub fn eval_result(values: Vec<Value>) -> Self {
        Response::EvalResult { values }
    }
}

/// Notification sent by the server without a request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "body")]
pub enum Event {
    /// Execution stopped; `breakpoint` is absent for step pauses.
    #[serde(rename = "paused")]
    Paused {
        file: String,
        line: i32,
        breakpoint: Option<Breakpoint>,
    },

    /// The script finished; `error` carries the failure message, if any.
    #[serde(rename = "exited")]
    Exited { error: Option<String> },
}

/// JSON-RPC message wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage<T> {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(flatten)]
    pub content: T,
}

impl<T> RpcMessage<T> {
    pub fn new(id: u64, content: T) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            content,
        }
    }

    pub fn notification(content: T) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            content,
        }
    }
}
