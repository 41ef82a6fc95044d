//! Owned Lua state for hosts and tests
//!
//! The debugger never owns the interpreter; `LuaHost` is the small piece of
//! embedding glue a host needs to create a state and run scripts in it.

use mlua_sys as ffi;
use std::ffi::{c_char, CString};
use std::path::Path;
use std::ptr::NonNull;

use super::marshal::{push_value, to_value};
use super::stack::{error_message, push_globals, push_str, StackGuard};
use crate::error::DebuggerError;
use crate::value::Value;

/// A Lua 5.4 state with the standard libraries opened.
///
/// Scripts loaded through `do_file`/`do_string` get the chunk name
/// `@<name>`, so their source identifier (what breakpoints match against)
/// is exactly the path or name passed in.
pub struct LuaHost {
    state: NonNull<ffi::lua_State>,
}

impl LuaHost {
    pub fn new() -> Result<Self, DebuggerError> {
        let state = unsafe { ffi::luaL_newstate() };
        let state = NonNull::new(state).ok_or(DebuggerError::NullState)?;
        unsafe { ffi::luaL_openlibs(state.as_ptr()) };
        Ok(Self { state })
    }

    /// Raw handle for [`Debugger::attach`](crate::Debugger::attach).
    pub fn as_ptr(&self) -> *mut ffi::lua_State {
        self.state.as_ptr()
    }

    /// Loads and runs the script at `path`.
    pub fn do_file(&self, path: impl AsRef<Path>) -> Result<(), DebuggerError> {
        let path = path.as_ref().to_string_lossy().into_owned();
        let state = self.as_ptr();
        let chunkname = chunk_cstring(&path)?;
        unsafe {
            let _guard = StackGuard::new(state);
            let text = std::fs::read(&path).map_err(|e| DebuggerError::load(&path, e.to_string()))?;
            let status = ffi::luaL_loadbufferx(
                state,
                text.as_ptr() as *const c_char,
                text.len(),
                chunkname.as_ptr(),
                std::ptr::null(),
            );
            if status != ffi::LUA_OK {
                return Err(DebuggerError::load(&path, error_message(state)));
            }
            self.call_loaded(&path)
        }
    }

    /// Loads and runs `chunk` under the source identifier `name`.
    pub fn do_string(&self, chunk: &str, name: &str) -> Result<(), DebuggerError> {
        let state = self.as_ptr();
        unsafe {
            let _guard = StackGuard::new(state);
            self.load_string(chunk, name)?;
            self.call_loaded(name)
        }
    }

    /// Compiles `chunk` and leaves the resulting function on the stack.
    pub fn load_string(&self, chunk: &str, name: &str) -> Result<(), DebuggerError> {
        let state = self.as_ptr();
        let chunkname = chunk_cstring(name)?;
        unsafe {
            let status = ffi::luaL_loadbufferx(
                state,
                chunk.as_ptr() as *const c_char,
                chunk.len(),
                chunkname.as_ptr(),
                std::ptr::null(),
            );
            if status != ffi::LUA_OK {
                let message = error_message(state);
                ffi::lua_pop(state, 1);
                return Err(DebuggerError::load(name, message));
            }
        }
        Ok(())
    }

    pub fn get_global(&self, name: &str) -> Value {
        let state = self.as_ptr();
        unsafe {
            let _guard = StackGuard::new(state);
            push_globals(state);
            push_str(state, name);
            ffi::lua_rawget(state, -2);
            to_value(state, -1, 16)
        }
    }

    pub fn set_global(&self, name: &str, value: &Value) {
        let state = self.as_ptr();
        unsafe {
            let _guard = StackGuard::new(state);
            push_globals(state);
            push_str(state, name);
            push_value(state, value);
            ffi::lua_rawset(state, -3);
        }
    }

    unsafe fn call_loaded(&self, chunk: &str) -> Result<(), DebuggerError> {
        let state = self.as_ptr();
        if ffi::lua_pcall(state, 0, 0, 0) != ffi::LUA_OK {
            return Err(DebuggerError::runtime(chunk, error_message(state)));
        }
        Ok(())
    }
}

impl Drop for LuaHost {
    fn drop(&mut self) {
        unsafe { ffi::lua_close(self.state.as_ptr()) }
    }
}

fn chunk_cstring(name: &str) -> Result<CString, DebuggerError> {
    CString::new(format!("@{name}"))
        .map_err(|_| DebuggerError::load(name, "chunk name contains a NUL byte"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_do_string_and_globals() {
        let host = LuaHost::new().unwrap();
        host.do_string("answer = 6 * 7", "answer.lua").unwrap();
        assert_eq!(host.get_global("answer"), Value::Number(42.0));

        host.set_global("greeting", &Value::from("hi"));
        host.do_string("shout = greeting .. '!'", "shout.lua").unwrap();
        assert_eq!(host.get_global("shout"), Value::from("hi!"));
    }

    #[test]
    fn test_errors_are_reported() {
        let host = LuaHost::new().unwrap();
        let err = host.do_string("local = 1", "broken.lua").unwrap_err();
        assert!(matches!(err, DebuggerError::Load { ref chunk, .. } if chunk == "broken.lua"));

        let err = host.do_string("error('boom')", "raise.lua").unwrap_err();
        match err {
            DebuggerError::Runtime { chunk, message } => {
                assert_eq!(chunk, "raise.lua");
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_do_file() {
        let mut file = tempfile::Builder::new().suffix(".lua").tempfile().unwrap();
        writeln!(file, "from_file = 'yes'").unwrap();

        let host = LuaHost::new().unwrap();
        host.do_file(file.path()).unwrap();
        assert_eq!(host.get_global("from_file"), Value::from("yes"));

        let missing = host.do_file("/definitely/not/here.lua");
        assert!(matches!(missing, Err(DebuggerError::Load { .. })));
    }
}
