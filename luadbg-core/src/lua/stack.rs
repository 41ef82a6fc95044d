//! Helpers over the raw Lua C API

use mlua_sys as ffi;
use std::borrow::Cow;
use std::ffi::{c_char, c_int, CStr};

/// Restores a thread's stack top when dropped, so early returns cannot leak
/// slots onto the debuggee's stack.
pub(crate) struct StackGuard {
    state: *mut ffi::lua_State,
    top: c_int,
}

impl StackGuard {
    /// # Safety
    /// `state` must be a valid Lua thread that outlives the guard.
    pub(crate) unsafe fn new(state: *mut ffi::lua_State) -> Self {
        Self {
            state,
            top: ffi::lua_gettop(state),
        }
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        unsafe { ffi::lua_settop(self.state, self.top) }
    }
}

/// An all-zero `lua_Debug`, ready to be filled by `lua_getstack`.
pub(crate) fn new_activation() -> ffi::lua_Debug {
    // SAFETY: lua_Debug is a plain C struct; all-zero is a valid "empty" record.
    unsafe { std::mem::zeroed() }
}

pub(crate) unsafe fn cstr_lossy<'a>(ptr: *const c_char) -> Option<Cow<'a, str>> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy())
    }
}

pub(crate) unsafe fn push_str(state: *mut ffi::lua_State, s: &str) {
    ffi::lua_pushlstring(state, s.as_ptr() as *const c_char, s.len());
}

/// Reads the string at `idx` without coercing numbers.
pub(crate) unsafe fn read_string(state: *mut ffi::lua_State, idx: c_int) -> Option<String> {
    if ffi::lua_type(state, idx) != ffi::LUA_TSTRING {
        return None;
    }
    let mut len = 0usize;
    let ptr = ffi::lua_tolstring(state, idx, &mut len);
    if ptr.is_null() {
        return None;
    }
    let bytes = std::slice::from_raw_parts(ptr as *const u8, len);
    Some(String::from_utf8_lossy(bytes).into_owned())
}

pub(crate) unsafe fn type_name(state: *mut ffi::lua_State, idx: c_int) -> String {
    let tp = ffi::lua_type(state, idx);
    cstr_lossy(ffi::lua_typename(state, tp))
        .map(Cow::into_owned)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Describes the error object on top of the stack the way `lua.c` does.
pub(crate) unsafe fn error_message(state: *mut ffi::lua_State) -> String {
    read_string(state, -1)
        .unwrap_or_else(|| format!("(error object is a {} value)", type_name(state, -1)))
}

/// Resolves the main thread of the state that `state` belongs to.
pub(crate) unsafe fn main_thread(state: *mut ffi::lua_State) -> *mut ffi::lua_State {
    ffi::lua_rawgeti(
        state,
        ffi::LUA_REGISTRYINDEX,
        ffi::LUA_RIDX_MAINTHREAD as ffi::lua_Integer,
    );
    let main = ffi::lua_tothread(state, -1);
    ffi::lua_pop(state, 1);
    main
}

pub(crate) unsafe fn push_globals(state: *mut ffi::lua_State) {
    ffi::lua_rawgeti(
        state,
        ffi::LUA_REGISTRYINDEX,
        ffi::LUA_RIDX_GLOBALS as ffi::lua_Integer,
    );
}

/// Source identifier of a chunk: its chunk name without the `@`/`=` marker
/// Lua prepends for file and literal names.
pub(crate) fn source_id(chunkname: &str) -> &str {
    chunkname
        .strip_prefix('@')
        .or_else(|| chunkname.strip_prefix('='))
        .unwrap_or(chunkname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_id_strips_marker() {
        assert_eq!(source_id("@scripts/main.lua"), "scripts/main.lua");
        assert_eq!(source_id("=stdin"), "stdin");
        assert_eq!(source_id("return 1"), "return 1");
        assert_eq!(source_id("@@odd"), "@odd");
    }

    #[test]
    fn test_stack_guard_restores_top() {
        let host = crate::lua::LuaHost::new().unwrap();
        let state = host.as_ptr();
        unsafe {
            let top = ffi::lua_gettop(state);
            {
                let _guard = StackGuard::new(state);
                push_str(state, "a");
                push_str(state, "b");
                assert_eq!(ffi::lua_gettop(state), top + 2);
            }
            assert_eq!(ffi::lua_gettop(state), top);
        }
    }
}
