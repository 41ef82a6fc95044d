//! Frame inspector
//!
//! Read/write access to the suspended stack during a pause: call stack,
//! locals, varargs, upvalues and expression evaluation. Level 0 is the
//! innermost frame.

use log::warn;
use mlua_sys as ffi;
use serde::Serialize;
use std::ffi::{c_char, c_int};

use crate::config::DebuggerConfig;
use crate::error::EvalError;
use crate::lua::marshal::{push_value, to_value};
use crate::lua::stack::{
    cstr_lossy, error_message, new_activation, push_globals, push_str, source_id, StackGuard,
};
use crate::value::Value;

const EVAL_CHUNK: &[u8] = b"=(eval)\0";
const SCOPE_CHUNK: &[u8] = b"=(debugger scope)\0";

/// Builds the metatable of an evaluation scope. Names bound in the frame
/// resolve in the scope table even when nil; everything else goes to the
/// globals.
const SCOPE_META: &str = r#"
local G, names = ...
return {
  __index = function(_, k)
    if names[k] then return nil end
    return G[k]
  end,
  __newindex = function(t, k, v)
    if names[k] then rawset(t, k, v) else G[k] = v end
  end,
}
"#;

/// One activation record of the suspended thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackFrame {
    pub level: usize,
    /// Function name as Lua infers it from the call site.
    pub name: Option<String>,
    /// `"Lua"`, `"C"` or `"main"`.
    pub what: String,
    pub source: String,
    pub short_src: String,
    /// Current line, `-1` when unknown (C functions).
    pub line: i32,
    pub line_defined: i32,
    pub is_variadic: bool,
}

impl StackFrame {
    pub fn display_name(&self) -> &str {
        match (&self.name, self.what.as_str()) {
            (Some(name), _) => name,
            (None, "main") => "main chunk",
            (None, _) => "?",
        }
    }
}

/// View over the stack of the paused thread.
///
/// Only valid for the duration of the pause that produced it.
pub struct DebugInfo<'a> {
    state: *mut ffi::lua_State,
    config: &'a DebuggerConfig,
}

/// Frame bindings copied into an evaluation scope, remembered for
/// write-back.
struct Scope {
    env: c_int,
    /// Values bound into `env` before evaluation.
    original: c_int,
    /// `(local index, name)`, last binding of each name only.
    locals: Vec<(c_int, String)>,
    /// `(upvalue index, name)`, minus names a local shadows.
    upvalues: Vec<(c_int, String)>,
}

impl<'a> DebugInfo<'a> {
    pub(crate) fn new(state: *mut ffi::lua_State, config: &'a DebuggerConfig) -> Self {
        Self { state, config }
    }

    /// Line the innermost frame is stopped at.
    pub fn currentline(&self) -> i32 {
        unsafe {
            let Some(mut ar) = self.activation(0) else {
                return -1;
            };
            if ffi::lua_getinfo(self.state, c"l".as_ptr(), &mut ar) == 0 {
                return -1;
            }
            ar.currentline
        }
    }

    pub fn get_call_stack(&self) -> Vec<StackFrame> {
        let mut frames = Vec::new();
        unsafe {
            while let Some(mut ar) = self.activation(frames.len()) {
                if ffi::lua_getinfo(self.state, c"nSlu".as_ptr(), &mut ar) == 0 {
                    break;
                }
                let source = cstr_lossy(ar.source).unwrap_or_default();
                frames.push(StackFrame {
                    level: frames.len(),
                    name: cstr_lossy(ar.name).map(|n| n.into_owned()),
                    what: cstr_lossy(ar.what).unwrap_or_default().into_owned(),
                    source: source_id(&source).to_string(),
                    short_src: cstr_lossy(ar.short_src.as_ptr()).unwrap_or_default().into_owned(),
                    line: ar.currentline,
                    line_defined: ar.linedefined,
                    is_variadic: ar.isvararg != 0,
                });
            }
        }
        frames
    }

    /// Named locals of the frame at `level` in declaration order, followed by
    /// the extra variadic arguments (if any) as one array entry.
    pub fn get_local_vars(&self, level: usize) -> Vec<(String, Value)> {
        let mut vars = Vec::new();
        unsafe {
            let Some(ar) = self.activation(level) else {
                return vars;
            };
            let _guard = StackGuard::new(self.state);
            if ffi::lua_checkstack(self.state, 4) == 0 {
                return vars;
            }
            for (idx, name) in self.local_slots(&ar) {
                if !ffi::lua_getlocal(self.state, &ar, idx).is_null() {
                    vars.push((name, to_value(self.state, -1, self.config.max_depth)));
                    ffi::lua_pop(self.state, 1);
                }
            }
            let extra = self.varargs(&ar);
            if !extra.is_empty() {
                vars.push((self.config.vararg_name.clone(), Value::Array(extra)));
            }
        }
        vars
    }

/// Whether the function of the innermost frame declares `...`.
    pub fn is_variadic_arg(&self) -> bool {
        self.is_variadic_arg_at(0)
    }

    /// Whether the function running at `level` declares `...`, whether or
    /// not extra arguments were passed.
    pub fn is_variadic_arg_at(&self, level: usize) -> bool {
        unsafe {
            let Some(mut ar) = self.activation(level) else {
                return false;
            };
            ffi::lua_getinfo(self.state, c"u".as_ptr(), &mut ar) != 0 && ar.isvararg != 0
        }
    }

    /// Assigns a local of the innermost frame.
    pub fn set_local_var(&self, name: &str, value: &Value) -> bool {
        self.set_local_var_at(0, name, value)
    }

    /// Assigns the innermost binding called `name` in the frame at `level`.
    /// Returns `false` when no such local exists.
    pub fn set_local_var_at(&self, level: usize, name: &str, value: &Value) -> bool {
        unsafe {
            let Some(ar) = self.activation(level) else {
                return false;
            };
            let Some(idx) = self
                .local_slots(&ar)
                .into_iter()
                .rev()
                .find_map(|(idx, n)| (n == name).then_some(idx))
            else {
                return false;
            };
            let _guard = StackGuard::new(self.state);
            push_value(self.state, value);
            !ffi::lua_setlocal(self.state, &ar, idx).is_null()
        }
    }

    /// Upvalues of the function running at `level`, `_ENV` excluded.
    pub fn get_upvalues(&self, level: usize) -> Vec<(String, Value)> {
        let mut vars = Vec::new();
        unsafe {
            let Some(mut ar) = self.activation(level) else {
                return vars;
            };
            let _guard = StackGuard::new(self.state);
            if ffi::lua_checkstack(self.state, 4) == 0
                || ffi::lua_getinfo(self.state, c"f".as_ptr(), &mut ar) == 0
            {
                return vars;
            }
            let func = ffi::lua_gettop(self.state);
            for (idx, name) in upvalue_slots(self.state, func) {
                if !ffi::lua_getupvalue(self.state, func, idx).is_null() {
                    vars.push((name, to_value(self.state, -1, self.config.max_depth)));
                    ffi::lua_pop(self.state, 1);
                }
            }
        }
        vars
    }

    /// Evaluates `expr` in the innermost frame.
    pub fn eval(&self, expr: &str) -> Result<Vec<Value>, EvalError> {
        self.eval_at(0, expr)
    }

    /// Evaluates `expr` in the frame at `level`.
    ///
    /// The text is first compiled as `return <expr>`, then verbatim, so both
    /// expressions and statements are accepted. Locals, upvalues and the
    /// extra variadic arguments of the frame are visible by name; globals
    /// resolve as usual. Assignments to frame locals and upvalues are written
    /// back once evaluation succeeds.
    pub fn eval_at(&self, level: usize, expr: &str) -> Result<Vec<Value>, EvalError> {
        let result = unsafe { self.eval_in_frame(level, expr) };
        if let Err(e) = &result {
            warn!("eval of {:?} at level {} failed: {}", expr, level, e);
        }
        result
    }

    unsafe fn eval_in_frame(&self, level: usize, expr: &str) -> Result<Vec<Value>, EvalError> {
        let state = self.state;
        let _guard = StackGuard::new(state);
        if ffi::lua_checkstack(state, 16) == 0 {
            return Err(EvalError::Runtime("stack overflow".to_string()));
        }
        let ar = self.activation(level).ok_or(EvalError::InvalidLevel(level))?;
        let scope = self.build_scope(ar)?;

        compile(state, expr)?;
        ffi::lua_pushvalue(state, scope.env);
        if ffi::lua_setupvalue(state, -2, 1).is_null() {
            ffi::lua_pop(state, 1);
        }

        let base = ffi::lua_gettop(state) - 1;
        if ffi::lua_pcall(state, 0, ffi::LUA_MULTRET, 0) != ffi::LUA_OK {
            return Err(EvalError::Runtime(error_message(state)));
        }
        let top = ffi::lua_gettop(state);
        let results = (base + 1..=top)
            .map(|idx| to_value(state, idx, self.config.max_depth))
            .collect();

        self.write_back(level, &scope);
        Ok(results)
    }

    unsafe fn activation(&self, level: usize) -> Option<ffi::lua_Debug> {
        let level = c_int::try_from(level).ok()?;
        let mut ar = new_activation();
        if ffi::lua_getstack(self.state, level, &mut ar) == 0 {
            None
        } else {
            Some(ar)
        }
    }

    /// Indices and names of the named locals of `ar`, in declaration order.
    /// Temporaries such as `(for state)` are skipped.
    unsafe fn local_slots(&self, ar: &ffi::lua_Debug) -> Vec<(c_int, String)> {
        let mut slots = Vec::new();
        for idx in 1.. {
            let name = ffi::lua_getlocal(self.state, ar, idx);
            let Some(name) = cstr_lossy(name) else {
                break;
            };
            ffi::lua_pop(self.state, 1);
            if !name.starts_with('(') {
                slots.push((idx, name.into_owned()));
            }
        }
        slots
    }

    unsafe fn varargs(&self, ar: &ffi::lua_Debug) -> Vec<Value> {
        let mut extra = Vec::new();
        for n in 1.. {
            if ffi::lua_getlocal(self.state, ar, -n).is_null() {
                break;
            }
            extra.push(to_value(self.state, -1, self.config.max_depth));
            ffi::lua_pop(self.state, 1);
        }
        extra
    }

    /// Pushes the scope table for evaluating in the frame `ar`.
    unsafe fn build_scope(&self, mut ar: ffi::lua_Debug) -> Result<Scope, EvalError> {
        let state = self.state;
        ffi::lua_createtable(state, 0, 0);
        let env = ffi::lua_gettop(state);
        ffi::lua_createtable(state, 0, 0);
        let names = ffi::lua_gettop(state);
        ffi::lua_createtable(state, 0, 0);
        let original = ffi::lua_gettop(state);
        let tables = [env, names, original];

        let mut upvalues = Vec::new();
        if ffi::lua_getinfo(state, c"f".as_ptr(), &mut ar) != 0 {
            let func = ffi::lua_gettop(state);
            for (idx, name) in upvalue_slots(state, func) {
                bind(state, tables, &name, |s| {
                    ffi::lua_getupvalue(s, func, idx);
                });
                upvalues.push((idx, name));
            }
            ffi::lua_pop(state, 1);
        }

        let slots = self.local_slots(&ar);
        for (idx, name) in &slots {
            bind(state, tables, name, |s| {
                ffi::lua_getlocal(s, &ar, *idx);
            });
        }
        let mut locals: Vec<(c_int, String)> = Vec::new();
        for (idx, name) in slots.into_iter().rev() {
            if !locals.iter().any(|(_, n)| *n == name) {
                locals.push((idx, name));
            }
        }
        upvalues.retain(|(_, name)| !locals.iter().any(|(_, local)| local == name));

        let mut n = 0;
        while !ffi::lua_getlocal(state, &ar, -(n + 1)).is_null() {
            ffi::lua_pop(state, 1);
            n += 1;
        }
        if n > 0 {
            push_str(state, &self.config.vararg_name);
            ffi::lua_createtable(state, n, 0);
            for i in 1..=n {
                ffi::lua_getlocal(state, &ar, -i);
                ffi::lua_rawseti(state, -2, ffi::lua_Integer::from(i));
            }
            ffi::lua_rawset(state, env);
        }

        let status = ffi::luaL_loadbufferx(
            state,
            SCOPE_META.as_ptr() as *const c_char,
            SCOPE_META.len(),
            SCOPE_CHUNK.as_ptr() as *const c_char,
            std::ptr::null(),
        );
        if status != ffi::LUA_OK {
            return Err(EvalError::Runtime(error_message(state)));
        }
        push_globals(state);
        ffi::lua_pushvalue(state, names);
        if ffi::lua_pcall(state, 2, 1, 0) != ffi::LUA_OK {
            return Err(EvalError::Runtime(error_message(state)));
        }
        ffi::lua_setmetatable(state, env);

        Ok(Scope {
            env,
            original,
            locals,
            upvalues,
        })
    }

    /// Copies scope entries the evaluation assigned back into the frame at
    /// `level`. Entries still holding their original value are left alone,
    /// so the frame keeps whatever the evaluated code did to it directly.
    unsafe fn write_back(&self, level: usize, scope: &Scope) {
        let state = self.state;
        let Some(mut ar) = self.activation(level) else {
            return;
        };
        for (idx, name) in &scope.locals {
            if push_if_assigned(state, scope, name)
                && ffi::lua_setlocal(state, &ar, *idx).is_null()
            {
                ffi::lua_pop(state, 1);
            }
        }

        if scope.upvalues.is_empty() || ffi::lua_getinfo(state, c"f".as_ptr(), &mut ar) == 0 {
            return;
        }
        let func = ffi::lua_gettop(state);
        for (idx, name) in &scope.upvalues {
            if push_if_assigned(state, scope, name)
                && ffi::lua_setupvalue(state, func, *idx).is_null()
            {
                ffi::lua_pop(state, 1);
            }
        }
        ffi::lua_pop(state, 1);
    }
}

/// Number of active frames on `state`.
pub(crate) unsafe fn stack_depth(state: *mut ffi::lua_State) -> usize {
    let mut ar = new_activation();
    let mut level = 0;
    while ffi::lua_getstack(state, level, &mut ar) != 0 {
        level += 1;
    }
    level as usize
}

/// Named upvalues of the function at `func`, `_ENV` excluded.
unsafe fn upvalue_slots(state: *mut ffi::lua_State, func: c_int) -> Vec<(c_int, String)> {
    let mut slots = Vec::new();
    for idx in 1.. {
        let name = ffi::lua_getupvalue(state, func, idx);
        let Some(name) = cstr_lossy(name) else {
            break;
        };
        ffi::lua_pop(state, 1);
        if !name.is_empty() && name != "_ENV" {
            slots.push((idx, name.into_owned()));
        }
    }
    slots
}

/// `env[name] = original[name] = <value pushed by push>` and
/// `names[name] = true`.
unsafe fn bind(
    state: *mut ffi::lua_State,
    [env, names, original]: [c_int; 3],
    name: &str,
    push: impl FnOnce(*mut ffi::lua_State),
) {
    push_str(state, name);
    push(state);
    push_str(state, name);
    ffi::lua_pushvalue(state, -2);
    ffi::lua_rawset(state, original);
    ffi::lua_rawset(state, env);
    push_str(state, name);
    ffi::lua_pushboolean(state, 1);
    ffi::lua_rawset(state, names);
}

/// Pushes `env[name]` and returns `true` when it differs from the value
/// bound before evaluation. Leaves the stack unchanged otherwise.
unsafe fn push_if_assigned(state: *mut ffi::lua_State, scope: &Scope, name: &str) -> bool {
    push_str(state, name);
    ffi::lua_rawget(state, scope.env);
    push_str(state, name);
    ffi::lua_rawget(state, scope.original);
    let assigned = ffi::lua_rawequal(state, -1, -2) == 0;
    ffi::lua_pop(state, if assigned { 1 } else { 2 });
    assigned
}

/// Compiles `expr` as an expression, falling back to a statement block.
unsafe fn compile(state: *mut ffi::lua_State, expr: &str) -> Result<(), EvalError> {
    let as_return = format!("return {expr}");
    if load(state, &as_return) == ffi::LUA_OK {
        return Ok(());
    }
    ffi::lua_pop(state, 1);
    if load(state, expr) == ffi::LUA_OK {
        return Ok(());
    }
    let message = error_message(state);
    ffi::lua_pop(state, 1);
    Err(EvalError::Compile(message))
}

unsafe fn load(state: *mut ffi::lua_State, text: &str) -> c_int {
    ffi::luaL_loadbufferx(
        state,
        text.as_ptr() as *const c_char,
        text.len(),
        EVAL_CHUNK.as_ptr() as *const c_char,
        std::ptr::null(),
    )
}
