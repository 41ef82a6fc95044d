//! Step controller and per-thread call depth
//!
//! Every Lua thread (the main thread and each coroutine) gets its own depth
//! counter, maintained from call/return hook events. A step request records
//! the thread that armed it and only that thread can satisfy it.

use std::collections::HashMap;

use mlua_sys as ffi;

/// Identity of a Lua thread: the address of its `lua_State`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(usize);

impl ThreadId {
    pub(crate) fn of(state: *mut ffi::lua_State) -> Self {
        ThreadId(state as usize)
    }
}

/// Pending step request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepRequest {
    #[default]
    None,
    /// Stop at the next line. `thread == None` means any thread.
    Into { thread: Option<ThreadId> },
    /// Stop at the next line at `depth` or shallower.
    Over { thread: ThreadId, depth: usize },
    /// Stop at the next line at `depth` or shallower, `depth` being the
    /// caller of the frame the request was armed in.
    Out { thread: ThreadId, depth: usize },
}

#[derive(Debug, Default)]
pub struct StepController {
    request: StepRequest,
}

impl StepController {
    pub fn request(&self) -> StepRequest {
        self.request
    }

    pub fn is_armed(&self) -> bool {
        self.request != StepRequest::None
    }

    /// Arms a step into. Without a paused thread any thread may satisfy it.
    pub fn step_in(&mut self, origin: Option<ThreadId>) {
        self.request = StepRequest::Into { thread: origin };
    }

    pub fn step_over(&mut self, origin: Option<(ThreadId, usize)>) {
        self.request = match origin {
            Some((thread, depth)) => StepRequest::Over { thread, depth },
            None => StepRequest::Into { thread: None },
        };
    }

    pub fn step_out(&mut self, origin: Option<(ThreadId, usize)>) {
        self.request = match origin {
            Some((thread, depth)) => StepRequest::Out {
                thread,
                depth: depth.saturating_sub(1),
            },
            None => StepRequest::Into { thread: None },
        };
    }

    pub fn clear(&mut self) {
        self.request = StepRequest::None;
    }

    /// Whether the pending request compares depths on `thread`.
    pub fn watches_depth(&self, thread: ThreadId) -> bool {
        match self.request {
            StepRequest::Over { thread: t, .. } | StepRequest::Out { thread: t, .. } => t == thread,
            _ => false,
        }
    }

    /// Consumes the request if a line event on `thread` at `depth`
    /// satisfies it.
    pub fn take_if_satisfied(&mut self, thread: ThreadId, depth: usize) -> bool {
        let satisfied = match self.request {
            StepRequest::None => false,
            StepRequest::Into { thread: None } => true,
            StepRequest::Into { thread: Some(t) } => t == thread,
            StepRequest::Over { thread: t, depth: target }
            | StepRequest::Out { thread: t, depth: target } => t == thread && depth <= target,
        };
        if satisfied {
            self.request = StepRequest::None;
        }
        satisfied
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadState {
    /// Active calls on this thread as seen through call/return events.
    pub depth: usize,
}

/// Record count below which [`ThreadArena::needs_sweep`] never asks for a
/// sweep.
const SWEEP_FLOOR: usize = 64;

/// Thread records keyed by native thread identity. A record is created the
/// first time a thread produces an event and dropped when its outermost call
/// returns, or when the thread is found finished or failed.
#[derive(Debug, Default)]
pub struct ThreadArena {
    threads: HashMap<ThreadId, ThreadState>,
    sweep_at: usize,
}

impl ThreadArena {
    /// Returns the record for `thread` and whether it was just created.
    pub fn observe(&mut self, thread: ThreadId) -> (&mut ThreadState, bool) {
        let mut inserted = false;
        let state = self.threads.entry(thread).or_insert_with(|| {
            inserted = true;
            ThreadState::default()
        });
        (state, inserted)
    }

    pub fn get(&self, thread: ThreadId) -> Option<&ThreadState> {
        self.threads.get(&thread)
    }

    pub fn depth(&self, thread: ThreadId) -> usize {
        self.threads.get(&thread).map_or(0, |t| t.depth)
    }

    pub fn push_call(&mut self, thread: ThreadId) {
        self.observe(thread).0.depth += 1;
    }

    /// Pops one call; the record is discarded once the thread is back at
    /// depth zero.
    pub fn pop_call(&mut self, thread: ThreadId) {
        if let Some(state) = self.threads.get_mut(&thread) {
            state.depth = state.depth.saturating_sub(1);
            if state.depth == 0 {
                self.threads.remove(&thread);
            }
        }
    }

    /// Overwrites the bookkept depth with a measured one. Errors unwind
    /// frames without return events, so pauses and armed depth-sensitive
    /// steps resynchronise the counter.
    pub fn resync(&mut self, thread: ThreadId, depth: usize) {
        self.observe(thread).0.depth = depth;
    }

    pub fn forget(&mut self, thread: ThreadId) {
        self.threads.remove(&thread);
    }

    /// Whether enough records piled up since the last sweep to look for
    /// threads that died without returning.
    pub fn needs_sweep(&self) -> bool {
        self.threads.len() >= self.sweep_at.max(SWEEP_FLOOR)
    }

    /// Keeps the records `keep` accepts and pushes the next sweep out to
    /// twice the surviving count.
    pub fn sweep(&mut self, mut keep: impl FnMut(ThreadId) -> bool) -> usize {
        let before = self.threads.len();
        self.threads.retain(|&thread, _| keep(thread));
        self.sweep_at = self.threads.len() * 2;
        before - self.threads.len()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn clear(&mut self) {
        self.threads.clear();
        self.sweep_at = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIN: ThreadId = ThreadId(0x1000);
    const CO: ThreadId = ThreadId(0x2000);

    #[test]
    fn test_step_in_fires_at_any_depth_on_same_thread() {
        let mut steps = StepController::default();
        steps.step_in(Some(MAIN));
        assert!(!steps.take_if_satisfied(CO, 1));
        assert!(steps.take_if_satisfied(MAIN, 7));
        assert!(!steps.is_armed());
    }

    #[test]
    fn test_unscoped_step_fires_anywhere() {
        let mut steps = StepController::default();
        steps.step_over(None);
        assert_eq!(steps.request(), StepRequest::Into { thread: None });
        assert!(steps.take_if_satisfied(CO, 3));
    }

    #[test]
    fn test_step_over_skips_deeper_lines() {
        let mut steps = StepController::default();
        steps.step_over(Some((MAIN, 2)));
        assert!(!steps.take_if_satisfied(MAIN, 3));
        assert!(!steps.take_if_satisfied(CO, 1));
        assert!(steps.take_if_satisfied(MAIN, 2));
    }

    #[test]
    fn test_step_out_waits_for_caller() {
        let mut steps = StepController::default();
        steps.step_out(Some((MAIN, 3)));
        assert_eq!(steps.request(), StepRequest::Out { thread: MAIN, depth: 2 });
        assert!(!steps.take_if_satisfied(MAIN, 3));
        assert!(steps.take_if_satisfied(MAIN, 1));
    }

    #[test]
    fn test_depth_is_tracked_per_thread() {
        let mut arena = ThreadArena::default();
        arena.push_call(MAIN);
        arena.push_call(MAIN);
        arena.push_call(CO);
        assert_eq!(arena.depth(MAIN), 2);
        assert_eq!(arena.depth(CO), 1);

        arena.pop_call(CO);
        assert!(arena.get(CO).is_none());
        assert_eq!(arena.len(), 1);

        arena.resync(MAIN, 5);
        assert_eq!(arena.depth(MAIN), 5);
        let (_, inserted) = arena.observe(MAIN);
        assert!(!inserted);

        arena.forget(MAIN);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_only_scoped_over_and_out_watch_depth() {
        let mut steps = StepController::default();
        steps.step_in(Some(MAIN));
        assert!(!steps.watches_depth(MAIN));
        steps.step_over(Some((MAIN, 2)));
        assert!(steps.watches_depth(MAIN));
        assert!(!steps.watches_depth(CO));
        steps.step_out(Some((CO, 2)));
        assert!(steps.watches_depth(CO));
        steps.clear();
        assert!(!steps.watches_depth(CO));
    }

    #[test]
    fn test_sweep_backs_off() {
        let mut arena = ThreadArena::default();
        for i in 0..SWEEP_FLOOR {
            arena.push_call(ThreadId(0x10_000 + i));
        }
        assert!(arena.needs_sweep());

        let removed = arena.sweep(|thread| thread.0 % 2 == 0);
        assert_eq!(removed, SWEEP_FLOOR / 2);
        assert_eq!(arena.len(), SWEEP_FLOOR / 2);
        assert!(!arena.needs_sweep());
    }
}
