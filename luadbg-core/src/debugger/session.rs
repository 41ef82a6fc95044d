//! Debug session: handler slots, pause context and the control surface
//! handed to pause/tick handlers.

use log::{trace, warn};
use mlua_sys as ffi;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use super::breakpoint::{Breakpoint, BreakpointRegistry};
use super::inspect::{stack_depth, DebugInfo, StackFrame};
use super::step::{StepController, StepRequest, ThreadArena, ThreadId};
use crate::config::DebuggerConfig;

/// Callback invoked synchronously on the executing thread.
pub type Handler = Box<dyn FnMut(&mut DebugSession)>;

/// Why the current pause happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseReason {
    /// A step request was satisfied.
    Step,
    /// An enabled breakpoint was hit.
    Breakpoint { file: String, line: u32 },
}

/// Holds a handler while letting the handler replace or clear itself.
#[derive(Default)]
struct HandlerSlot {
    handler: Option<Handler>,
    /// Set when the slot is written while its handler is running.
    replaced: bool,
}

impl HandlerSlot {
    fn set(&mut self, handler: Handler) {
        self.handler = Some(handler);
        self.replaced = true;
    }

    fn clear(&mut self) {
        self.handler = None;
        self.replaced = true;
    }

    fn take(&mut self) -> Option<Handler> {
        self.replaced = false;
        self.handler.take()
    }

    fn restore(&mut self, handler: Handler) {
        if !self.replaced {
            self.handler = Some(handler);
        }
    }

    fn is_set(&self) -> bool {
        self.handler.is_some()
    }
}

pub(crate) struct PauseContext {
    pub(crate) state: *mut ffi::lua_State,
    pub(crate) thread: ThreadId,
    pub(crate) reason: PauseReason,
}

/// State owned by one debugger instance.
///
/// Pause and tick handlers receive `&mut DebugSession`; inside a pause the
/// session additionally exposes the suspended stack through
/// [`current_debug_info`](Self::current_debug_info).
pub struct DebugSession {
    pub(crate) config: DebuggerConfig,
    pub(crate) breakpoints: BreakpointRegistry,
    pub(crate) steps: StepController,
    pub(crate) threads: ThreadArena,
    pause_handler: HandlerSlot,
    tick_handler: HandlerSlot,
    pub(crate) paused: Option<PauseContext>,
    /// Main thread of the attached state; null while detached.
    pub(crate) main_state: *mut ffi::lua_State,
}

impl DebugSession {
    pub(crate) fn new(config: DebuggerConfig) -> Self {
        Self {
            config,
            breakpoints: BreakpointRegistry::new(),
            steps: StepController::default(),
            threads: ThreadArena::default(),
            pause_handler: HandlerSlot::default(),
            tick_handler: HandlerSlot::default(),
            paused: None,
            main_state: std::ptr::null_mut(),
        }
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    pub fn is_attached(&self) -> bool {
        !self.main_state.is_null()
    }

    // Breakpoints

    pub fn add_breakpoint(&mut self, file: &str, line: u32) -> &Breakpoint {
        self.breakpoints.add(file, line)
    }

    pub fn remove_breakpoint(&mut self, file: &str, line: u32) -> bool {
        self.breakpoints.remove(file, line)
    }

    pub fn enable_breakpoint(&mut self, file: &str, line: u32) -> bool {
        self.breakpoints.enable(file, line)
    }

    pub fn disable_breakpoint(&mut self, file: &str, line: u32) -> bool {
        self.breakpoints.disable(file, line)
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    pub fn breakpoints(&self) -> &BreakpointRegistry {
        &self.breakpoints
    }

    // Stepping

    /// Stop at the next line executed by the paused thread, entering calls.
    pub fn step_in(&mut self) {
        let origin = self.paused.as_ref().map(|p| p.thread);
        self.steps.step_in(origin);
    }

    /// Stop at the next line of the paused frame or one of its callers.
    pub fn step_over(&mut self) {
        let origin = self.step_origin();
        self.steps.step_over(origin);
    }

    /// Stop once the paused frame has returned to its caller.
    pub fn step_out(&mut self) {
        let origin = self.step_origin();
        self.steps.step_out(origin);
    }

    /// Stop at the next line executed by any thread.
    pub fn pause(&mut self) {
        self.steps.step_in(None);
    }

    /// Drops any pending step request.
    pub fn continue_running(&mut self) {
        self.steps.clear();
    }

    pub fn step_request(&self) -> StepRequest {
        self.steps.request()
    }

    fn step_origin(&self) -> Option<(ThreadId, usize)> {
        let thread = self.paused.as_ref()?.thread;
        Some((thread, self.threads.depth(thread)))
    }

    // Handlers

    pub fn set_pause_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut DebugSession) + 'static,
    {
        self.pause_handler.set(Box::new(handler));
    }

    pub fn clear_pause_handler(&mut self) {
        self.pause_handler.clear();
    }

    pub fn set_tick_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut DebugSession) + 'static,
    {
        self.tick_handler.set(Box::new(handler));
    }

    pub fn clear_tick_handler(&mut self) {
        self.tick_handler.clear();
    }

    pub fn has_pause_handler(&self) -> bool {
        self.pause_handler.is_set()
    }

    // Pause-time introspection

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    pub fn pause_reason(&self) -> Option<&PauseReason> {
        self.paused.as_ref().map(|p| &p.reason)
    }

    /// Thread that is currently suspended.
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.paused.as_ref().map(|p| p.thread)
    }

    /// The breakpoint that caused this pause; `None` for step pauses and
    /// outside of a pause.
    pub fn current_breakpoint(&self) -> Option<&Breakpoint> {
        match self.pause_reason()? {
            PauseReason::Breakpoint { file, line } => self.breakpoints.get(file, *line),
            PauseReason::Step => None,
        }
    }

    /// View over the suspended stack, valid for the current pause only.
    pub fn current_debug_info(&self) -> Option<DebugInfo<'_>> {
        let pause = self.paused.as_ref()?;
        Some(DebugInfo::new(pause.state, &self.config))
    }

    /// Call stack of the suspended thread, innermost first. Empty outside
    /// of a pause.
    pub fn get_call_stack(&self) -> Vec<StackFrame> {
        self.current_debug_info()
            .map(|info| info.get_call_stack())
            .unwrap_or_default()
    }

    // Dispatch

    pub(crate) fn dispatch_pause(
        &mut self,
        state: *mut ffi::lua_State,
        thread: ThreadId,
        reason: PauseReason,
    ) {
        let depth = unsafe { stack_depth(state) };
        self.threads.resync(thread, depth);

        let Some(mut handler) = self.pause_handler.take() else {
            return;
        };
        trace!("pausing thread {:?} at depth {} ({:?})", thread, depth, reason);
        self.paused = Some(PauseContext {
            state,
            thread,
            reason,
        });
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(self)));
        self.paused = None;
        self.pause_handler.restore(handler);

        if let Err(payload) = outcome {
            warn!("pause handler panicked: {}", panic_message(&payload));
        }
    }

    pub(crate) fn dispatch_tick(&mut self) {
        let Some(mut handler) = self.tick_handler.take() else {
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(self)));
        self.tick_handler.restore(handler);

        if let Err(payload) = outcome {
            warn!("tick handler panicked: {}", panic_message(&payload));
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_step_commands_outside_pause_are_unscoped() {
        let mut session = DebugSession::new(DebuggerConfig::default());
        session.step_over();
        assert_eq!(session.step_request(), StepRequest::Into { thread: None });
        session.step_out();
        assert_eq!(session.step_request(), StepRequest::Into { thread: None });
        session.continue_running();
        assert_eq!(session.step_request(), StepRequest::None);
    }

    #[test]
    fn test_no_introspection_outside_pause() {
        let session = DebugSession::new(DebuggerConfig::default());
        assert!(!session.is_paused());
        assert!(session.current_breakpoint().is_none());
        assert!(session.current_debug_info().is_none());
        assert!(session.get_call_stack().is_empty());
    }

    #[test]
    fn test_tick_handler_can_replace_itself() {
        let mut session = DebugSession::new(DebuggerConfig::default());
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        session.set_tick_handler(move |s| {
            seen.set(seen.get() + 1);
            s.clear_tick_handler();
        });

        session.dispatch_tick();
        session.dispatch_tick();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_panicking_tick_handler_stays_installed() {
        let mut session = DebugSession::new(DebuggerConfig::default());
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        session.set_tick_handler(move |_| {
            seen.set(seen.get() + 1);
            panic!("handler failure");
        });

        session.dispatch_tick();
        session.dispatch_tick();
        assert_eq!(calls.get(), 2);
    }
}
