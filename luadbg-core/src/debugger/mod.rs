//! In-process Lua debugger
//!
//! [`Debugger`] attaches to a host-owned `lua_State` through the debug hook
//! and pauses execution synchronously on breakpoints and step completion.
//! While paused, the pause handler receives the [`DebugSession`] and can
//! inspect and modify the suspended stack before choosing how to resume.
//!
//! ```no_run
//! use luadbg_core::{Debugger, LuaHost};
//!
//! let host = LuaHost::new()?;
//! let mut debugger = Debugger::new();
//! unsafe { debugger.attach(host.as_ptr())? };
//! debugger.add_breakpoint("main.lua", 3);
//! debugger.set_pause_handler(|session| {
//!     if let Some(info) = session.current_debug_info() {
//!         for (name, value) in info.get_local_vars(0) {
//!             println!("{name} = {value}");
//!         }
//!     }
//!     session.step_over();
//! });
//! host.do_file("main.lua")?;
//! # Ok::<(), luadbg_core::DebuggerError>(())
//! ```

pub mod breakpoint;
mod hook;
pub mod inspect;
pub mod session;
pub mod step;

use log::debug;
use mlua_sys as ffi;
use std::ptr::NonNull;

use crate::config::DebuggerConfig;
use crate::error::DebuggerError;
use crate::lua::stack::main_thread;
use breakpoint::{Breakpoint, BreakpointRegistry};
use session::DebugSession;

/// Owner of a debug session and its attachment to a Lua state.
///
/// The session lives on the heap at a fixed address because the hook
/// reaches it through a pointer stored in the Lua registry. Dropping the
/// debugger detaches it first; it must therefore be dropped before the Lua
/// state is closed.
pub struct Debugger {
    session: NonNull<DebugSession>,
}

impl Debugger {
    pub fn new() -> Self {
        Self::with_config(DebuggerConfig::default())
    }

    pub fn with_config(config: DebuggerConfig) -> Self {
        let session = Box::new(DebugSession::new(config));
        Self {
            session: NonNull::from(Box::leak(session)),
        }
    }

    pub fn session(&self) -> &DebugSession {
        // SAFETY: the session is owned by `self` and freed only in `drop`.
        unsafe { self.session.as_ref() }
    }

    pub fn session_mut(&mut self) -> &mut DebugSession {
        // SAFETY: as above; `&mut self` guarantees exclusive access from Rust.
        unsafe { self.session.as_mut() }
    }

    pub fn config(&self) -> &DebuggerConfig {
        self.session().config()
    }

    /// Attaches to the state that `state` belongs to.
    ///
    /// Hooks are installed on the main thread (and on `state` when it is a
    /// coroutine); coroutines created afterwards inherit them.
    ///
    /// # Safety
    /// `state` must be a valid Lua 5.4 thread, and the debugger must be
    /// detached or dropped before that state is closed.
    pub unsafe fn attach(&mut self, state: *mut ffi::lua_State) -> Result<(), DebuggerError> {
        if state.is_null() {
            return Err(DebuggerError::NullState);
        }
        if self.is_attached() {
            return Err(DebuggerError::AlreadyAttached);
        }
        let main = main_thread(state);
        if main.is_null() {
            return Err(DebuggerError::NullState);
        }
        hook::register_session(main, self.session.as_ptr())?;

        let session = self.session_mut();
        session.main_state = main;
        hook::install(main, session);
        if state != main {
            hook::install(state, session);
        }
        debug!(
            "debugger attached (tick interval {}, {} breakpoints)",
            session.config.tick_interval,
            session.breakpoints.len()
        );
        Ok(())
    }

    /// Removes every hook and forgets the state. Breakpoints and handlers
    /// are kept for a later `attach`; pending steps are dropped.
    pub fn detach(&mut self) {
        let session = self.session_mut();
        let main = std::mem::replace(&mut session.main_state, std::ptr::null_mut());
        if main.is_null() {
            return;
        }
        // SAFETY: `attach` requires the state to outlive the attachment.
        unsafe { hook::unregister_session(main) };
        session.threads.clear();
        session.steps.clear();
        session.paused = None;
        debug!("debugger detached");
    }

    pub fn is_attached(&self) -> bool {
        self.session().is_attached()
    }

    pub fn add_breakpoint(&mut self, file: &str, line: u32) -> &Breakpoint {
        self.session_mut().add_breakpoint(file, line)
    }

    pub fn remove_breakpoint(&mut self, file: &str, line: u32) -> bool {
        self.session_mut().remove_breakpoint(file, line)
    }

    pub fn enable_breakpoint(&mut self, file: &str, line: u32) -> bool {
        self.session_mut().enable_breakpoint(file, line)
    }

    pub fn disable_breakpoint(&mut self, file: &str, line: u32) -> bool {
        self.session_mut().disable_breakpoint(file, line)
    }

    pub fn clear_breakpoints(&mut self) {
        self.session_mut().clear_breakpoints();
    }

    pub fn breakpoints(&self) -> &BreakpointRegistry {
        self.session().breakpoints()
    }

    pub fn step_in(&mut self) {
        self.session_mut().step_in();
    }

    pub fn step_over(&mut self) {
        self.session_mut().step_over();
    }

    pub fn step_out(&mut self) {
        self.session_mut().step_out();
    }

    pub fn pause(&mut self) {
        self.session_mut().pause();
    }

    pub fn continue_running(&mut self) {
        self.session_mut().continue_running();
    }

    pub fn set_pause_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut DebugSession) + 'static,
    {
        self.session_mut().set_pause_handler(handler);
    }

    pub fn clear_pause_handler(&mut self) {
        self.session_mut().clear_pause_handler();
    }

    pub fn set_tick_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut DebugSession) + 'static,
    {
        self.session_mut().set_tick_handler(handler);
    }

    pub fn clear_tick_handler(&mut self) {
        self.session_mut().clear_tick_handler();
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        self.detach();
        // SAFETY: allocated with `Box::leak` in `with_config`; the registry
        // no longer refers to it after `detach`.
        unsafe { drop(Box::from_raw(self.session.as_ptr())) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::LuaHost;

    #[test]
    fn test_attach_rejects_null_and_double_attach() {
        let host = LuaHost::new().unwrap();
        let mut debugger = Debugger::new();
        unsafe {
            assert_eq!(debugger.attach(std::ptr::null_mut()), Err(DebuggerError::NullState));
            debugger.attach(host.as_ptr()).unwrap();
            assert_eq!(debugger.attach(host.as_ptr()), Err(DebuggerError::AlreadyAttached));
        }
        assert!(debugger.is_attached());
    }

    #[test]
    fn test_second_debugger_cannot_share_state() {
        let host = LuaHost::new().unwrap();
        let mut first = Debugger::new();
        let mut second = Debugger::new();
        unsafe {
            first.attach(host.as_ptr()).unwrap();
            assert_eq!(second.attach(host.as_ptr()), Err(DebuggerError::StateInUse));
            first.detach();
            second.attach(host.as_ptr()).unwrap();
        }
        assert!(!first.is_attached());
        assert!(second.is_attached());
    }

    #[test]
    fn test_detach_keeps_breakpoints() {
        let host = LuaHost::new().unwrap();
        let mut debugger = Debugger::new();
        debugger.add_breakpoint("main.lua", 4);
        unsafe { debugger.attach(host.as_ptr()).unwrap() };
        debugger.step_in();
        debugger.detach();
        debugger.detach();
        assert!(!debugger.is_attached());
        assert_eq!(debugger.breakpoints().len(), 1);
        assert!(!debugger.session().steps.is_armed());
    }

    #[test]
    fn test_failed_coroutines_leave_no_thread_records() {
        let host = LuaHost::new().unwrap();
        let mut debugger = Debugger::new();
        unsafe { debugger.attach(host.as_ptr()).unwrap() };

        host.do_string(
            "for i = 1, 200 do\n  local co = coroutine.create(function() error('boom') end)\n  coroutine.resume(co)\nend",
            "resume_errors.lua",
        )
        .unwrap();
        assert!(debugger.session().threads.is_empty());

        host.do_string(
            "for i = 1, 200 do\n  pcall(coroutine.wrap(function() error('boom') end))\nend",
            "wrap_errors.lua",
        )
        .unwrap();
        assert!(debugger.session().threads.len() < 64);
    }
}
