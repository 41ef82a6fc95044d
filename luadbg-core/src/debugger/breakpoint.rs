//! Breakpoint registry

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A `(file, line)` location that pauses execution when reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub file: String,
    pub line: u32,
    pub enabled: bool,
    /// Number of times execution stopped here while enabled.
    pub hit_count: u32,
}

impl Breakpoint {
    fn new(file: String, line: u32) -> Self {
        Self {
            file,
            line,
            enabled: true,
            hit_count: 0,
        }
    }
}

/// Set of breakpoints keyed by `(file, line)`.
///
/// Records are bucketed by line so the per-line check done by the hook is a
/// single map lookup; the file name is only compared once a line matches.
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    by_line: BTreeMap<u32, Vec<Breakpoint>>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a breakpoint. Re-adding an existing one leaves it untouched.
    pub fn add(&mut self, file: &str, line: u32) -> &Breakpoint {
        let bucket = self.by_line.entry(line).or_default();
        let pos = match bucket.iter().position(|bp| bp.file == file) {
            Some(pos) => pos,
            None => {
                bucket.push(Breakpoint::new(file.to_string(), line));
                bucket.len() - 1
            }
        };
        &bucket[pos]
    }

    pub fn remove(&mut self, file: &str, line: u32) -> bool {
        let Some(bucket) = self.by_line.get_mut(&line) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|bp| bp.file != file);
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            self.by_line.remove(&line);
        }
        removed
    }

    pub fn enable(&mut self, file: &str, line: u32) -> bool {
        self.set_enabled(file, line, true)
    }

    pub fn disable(&mut self, file: &str, line: u32) -> bool {
        self.set_enabled(file, line, false)
    }

    fn set_enabled(&mut self, file: &str, line: u32, enabled: bool) -> bool {
        match self.get_mut(file, line) {
            Some(bp) => {
                bp.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, file: &str, line: u32) -> Option<&Breakpoint> {
        self.by_line.get(&line)?.iter().find(|bp| bp.file == file)
    }

    fn get_mut(&mut self, file: &str, line: u32) -> Option<&mut Breakpoint> {
        self.by_line.get_mut(&line)?.iter_mut().find(|bp| bp.file == file)
    }

    /// Whether any breakpoint, enabled or not, sits on `line`.
    pub fn has_line(&self, line: u32) -> bool {
        self.by_line.contains_key(&line)
    }

    /// Records a hit on an enabled breakpoint and returns it.
    pub fn hit(&mut self, file: &str, line: u32) -> Option<&Breakpoint> {
        let bp = self.get_mut(file, line).filter(|bp| bp.enabled)?;
        bp.hit_count += 1;
        Some(bp)
    }

    /// Breakpoints ordered by line.
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.by_line.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_line.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_line.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_line.clear();
    }
}
