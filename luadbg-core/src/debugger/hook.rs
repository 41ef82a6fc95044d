//! Lua hook installation and event dispatch
//!
//! A single `extern "C-unwind"` trampoline is installed on every thread the
//! debugger watches. It finds the owning [`DebugSession`] through a light
//! userdata stored in the registry and turns raw hook events into depth
//! bookkeeping, step/breakpoint pauses and ticks.
//!
//! Lua copies the hook of the creating thread into new coroutines. Threads
//! created before attach are picked up when they are handed to a C function
//! (`coroutine.resume`, or a `coroutine.wrap` closure) and still unhooked.
//!
//! Errors unwind frames without return events. Depth is therefore measured
//! on the stack while a step compares it, and the record of a coroutine is
//! dropped once it is seen finished or failed: when the C function it was
//! handed to returns, before it is resumed again, or by a sweep over the
//! watched threads once records pile up.

use log::{debug, trace};
use mlua_sys as ffi;
use std::collections::HashSet;
use std::ffi::{c_char, c_int, c_void};

use super::inspect::stack_depth;
use super::session::{DebugSession, PauseReason};
use super::step::ThreadId;
use crate::error::DebuggerError;
use crate::lua::stack::{cstr_lossy, new_activation, push_str, source_id, StackGuard};

static SESSION_KEY: u8 = b's';
static THREADS_KEY: u8 = b't';

fn registry_key(key: &'static u8) -> *const c_void {
    key as *const u8 as *const c_void
}

unsafe extern "C-unwind" fn hook_trampoline(state: *mut ffi::lua_State, ar: *mut ffi::lua_Debug) {
    let Some(session) = session_for(state) else {
        // Stale hook on a thread that outlived its debugger.
        uninstall(state);
        return;
    };
    if ar.is_null() {
        return;
    }
    (*session).on_hook(state, &mut *ar);
}

unsafe fn session_for(state: *mut ffi::lua_State) -> Option<*mut DebugSession> {
    let _guard = StackGuard::new(state);
    if ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, registry_key(&SESSION_KEY))
        != ffi::LUA_TLIGHTUSERDATA
    {
        return None;
    }
    let ptr = ffi::lua_touserdata(state, -1) as *mut DebugSession;
    (!ptr.is_null()).then_some(ptr)
}

pub(crate) unsafe fn install(state: *mut ffi::lua_State, session: &DebugSession) {
    let count = c_int::try_from(session.config.tick_interval).unwrap_or(c_int::MAX);
    let mut mask = ffi::LUA_MASKCALL | ffi::LUA_MASKRET | ffi::LUA_MASKLINE;
    if count > 0 {
        mask |= ffi::LUA_MASKCOUNT;
    }
    ffi::lua_sethook(state, Some(hook_trampoline), mask, count);
}

pub(crate) unsafe fn uninstall(state: *mut ffi::lua_State) {
    ffi::lua_sethook(state, None, 0, 0);
}

/// Publishes `session` in the registry of `main` and creates the weak table
/// of watched threads.
pub(crate) unsafe fn register_session(
    main: *mut ffi::lua_State,
    session: *mut DebugSession,
) -> Result<(), DebuggerError> {
    let _guard = StackGuard::new(main);
    if ffi::lua_rawgetp(main, ffi::LUA_REGISTRYINDEX, registry_key(&SESSION_KEY)) != ffi::LUA_TNIL {
        return Err(DebuggerError::StateInUse);
    }
    ffi::lua_pop(main, 1);

    ffi::lua_pushlightuserdata(main, session as *mut c_void);
    ffi::lua_rawsetp(main, ffi::LUA_REGISTRYINDEX, registry_key(&SESSION_KEY));

    ffi::lua_createtable(main, 0, 0);
    ffi::lua_createtable(main, 0, 1);
    push_str(main, "k");
    ffi::lua_setfield(main, -2, b"__mode\0".as_ptr() as *const c_char);
    ffi::lua_setmetatable(main, -2);
    ffi::lua_rawsetp(main, ffi::LUA_REGISTRYINDEX, registry_key(&THREADS_KEY));
    Ok(())
}

/// Removes every hook the session installed and forgets the session.
pub(crate) unsafe fn unregister_session(main: *mut ffi::lua_State) {
    let _guard = StackGuard::new(main);
    if ffi::lua_rawgetp(main, ffi::LUA_REGISTRYINDEX, registry_key(&THREADS_KEY)) == ffi::LUA_TTABLE {
        let mut unhooked = 0usize;
        ffi::lua_pushnil(main);
        while ffi::lua_next(main, -2) != 0 {
            let thread = ffi::lua_tothread(main, -2);
            if !thread.is_null() {
                uninstall(thread);
                unhooked += 1;
            }
            ffi::lua_pop(main, 1);
        }
        trace!("removed hook from {} watched threads", unhooked);
    }
    ffi::lua_pop(main, 1);
    uninstall(main);

    ffi::lua_pushnil(main);
    ffi::lua_rawsetp(main, ffi::LUA_REGISTRYINDEX, registry_key(&THREADS_KEY));
    ffi::lua_pushnil(main);
    ffi::lua_rawsetp(main, ffi::LUA_REGISTRYINDEX, registry_key(&SESSION_KEY));
}

/// Whether no call is active or suspended on `co`: not started yet, returned,
/// or dead after an error.
unsafe fn is_inactive(co: *mut ffi::lua_State) -> bool {
    match ffi::lua_status(co) {
        ffi::LUA_YIELD => false,
        ffi::LUA_OK => {
            let mut ar = new_activation();
            ffi::lua_getstack(co, 0, &mut ar) == 0
        }
        _ => true,
    }
}

/// Adds the thread value at `idx` to the weak table of watched threads.
unsafe fn track_thread_at(state: *mut ffi::lua_State, idx: c_int) {
    let idx = ffi::lua_absindex(state, idx);
    let _guard = StackGuard::new(state);
    if ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, registry_key(&THREADS_KEY)) == ffi::LUA_TTABLE {
        ffi::lua_pushvalue(state, idx);
        ffi::lua_pushboolean(state, 1);
        ffi::lua_rawset(state, -3);
    }
}

impl DebugSession {
    pub(crate) unsafe fn on_hook(&mut self, state: *mut ffi::lua_State, ar: &mut ffi::lua_Debug) {
        let thread = ThreadId::of(state);
        let (_, inserted) = self.threads.observe(thread);
        if inserted {
            {
                let _guard = StackGuard::new(state);
                ffi::lua_pushthread(state);
                track_thread_at(state, -1);
            }
            if self.threads.needs_sweep() {
                self.sweep_threads(state);
            }
        }

        match ar.event {
            ffi::LUA_HOOKLINE => self.on_line(state, thread, ar),
            ffi::LUA_HOOKCALL => {
                self.threads.push_call(thread);
                self.visit_callee_threads(state, ar, Self::rearm_thread_at);
            }
            ffi::LUA_HOOKRET => {
                self.threads.pop_call(thread);
                self.visit_callee_threads(state, ar, Self::retire_thread_at);
            }
            ffi::LUA_HOOKCOUNT => self.dispatch_tick(),
            // A tail call replaces the running frame; depth is unchanged.
            _ => {}
        }
    }

    unsafe fn on_line(&mut self, state: *mut ffi::lua_State, thread: ThreadId, ar: &mut ffi::lua_Debug) {
        let depth = if self.steps.watches_depth(thread) {
            let measured = stack_depth(state);
            self.threads.resync(thread, measured);
            measured
        } else {
            self.threads.depth(thread)
        };
        if self.steps.take_if_satisfied(thread, depth) {
            self.dispatch_pause(state, thread, PauseReason::Step);
            return;
        }

        let Ok(line) = u32::try_from(ar.currentline) else {
            return;
        };
        if !self.breakpoints.has_line(line) {
            return;
        }
        if ffi::lua_getinfo(state, c"S".as_ptr(), ar) == 0 {
            return;
        }
        let Some(chunk) = cstr_lossy(ar.source) else {
            return;
        };
        let file = source_id(&chunk);
        if self.breakpoints.hit(file, line).is_some() {
            let reason = PauseReason::Breakpoint {
                file: file.to_string(),
                line,
            };
            self.dispatch_pause(state, thread, reason);
        }
    }

    /// Calls `visit` with every coroutine handed to the C function `ar`
    /// describes, either as its first argument or as its first upvalue.
    unsafe fn visit_callee_threads(
        &mut self,
        state: *mut ffi::lua_State,
        ar: &mut ffi::lua_Debug,
        visit: unsafe fn(&mut Self, *mut ffi::lua_State, c_int),
    ) {
        if ffi::lua_getinfo(state, c"S".as_ptr(), ar) == 0
            || ar.what.is_null()
            || *ar.what != b'C' as c_char
        {
            return;
        }
        let _guard = StackGuard::new(state);
        if ffi::lua_checkstack(state, 4) == 0 {
            return;
        }
        if !ffi::lua_getlocal(state, ar, 1).is_null()
            && ffi::lua_type(state, -1) == ffi::LUA_TTHREAD
        {
            visit(self, state, ffi::lua_gettop(state));
        }
        if ffi::lua_getinfo(state, c"f".as_ptr(), ar) != 0
            && !ffi::lua_getupvalue(state, -1, 1).is_null()
            && ffi::lua_type(state, -1) == ffi::LUA_TTHREAD
        {
            visit(self, state, ffi::lua_gettop(state));
        }
    }

    /// Forgets stale depth and hooks the coroutine at `idx` if it has no
    /// hook yet.
    unsafe fn rearm_thread_at(&mut self, state: *mut ffi::lua_State, idx: c_int) {
        let co = ffi::lua_tothread(state, idx);
        if co.is_null() || co == state {
            return;
        }
        if is_inactive(co) {
            self.threads.forget(ThreadId::of(co));
        }
        if ffi::lua_gethookmask(co) != 0 {
            return;
        }
        install(co, self);
        track_thread_at(state, idx);
        debug!("hooked coroutine {:?} on resume", ThreadId::of(co));
    }

    /// Drops the record of the coroutine at `idx` once it finished or failed.
    unsafe fn retire_thread_at(&mut self, state: *mut ffi::lua_State, idx: c_int) {
        let co = ffi::lua_tothread(state, idx);
        if co.is_null() || co == state || !is_inactive(co) {
            return;
        }
        if self.threads.get(ThreadId::of(co)).is_some() {
            trace!("coroutine {:?} is done, dropping its record", ThreadId::of(co));
            self.threads.forget(ThreadId::of(co));
        }
    }

    /// Drops the records of threads that were collected or are inactive.
    /// Covers coroutines whose error escaped a `coroutine.wrap` closure,
    /// which never returns normally.
    unsafe fn sweep_threads(&mut self, state: *mut ffi::lua_State) {
        let _guard = StackGuard::new(state);
        if ffi::lua_checkstack(state, 3) == 0
            || ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, registry_key(&THREADS_KEY))
                != ffi::LUA_TTABLE
        {
            return;
        }
        let mut live = HashSet::new();
        ffi::lua_pushnil(state);
        while ffi::lua_next(state, -2) != 0 {
            let co = ffi::lua_tothread(state, -2);
            if !co.is_null() && (co == state || !is_inactive(co)) {
                live.insert(ThreadId::of(co));
            }
            ffi::lua_pop(state, 1);
        }
        let removed = self.threads.sweep(|thread| live.contains(&thread));
        debug!("swept {} thread records, {} left", removed, self.threads.len());
    }
}
