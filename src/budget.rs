// ABOUTME: Resource budgets (op count, recursion depth, stack depth, symbol count) shared across a stack family

use crate::error::{EngineError, EngineResult};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A config snapshot copied onto a stack at creation. Individual limits
/// can still be raised/lowered later through the attribute map.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub maxops: u64,
    pub maxrecurse: u32,
    pub maxdepth: usize,
    pub maxsymbols: usize,
    pub register_count: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            maxops: 1_000_000,
            maxrecurse: 1_000,
            maxdepth: 10_000,
            maxsymbols: 10_000,
            register_count: 16,
        }
    }
}

/// Strictly non-decreasing operation counter shared by a stack and all of
/// its substacks. Checked after every increment.
#[derive(Debug)]
pub struct OpCounter {
    current: AtomicU64,
    max: AtomicU64,
}

impl OpCounter {
    pub fn new(max: u64) -> Arc<Self> {
        Arc::new(OpCounter {
            current: AtomicU64::new(0),
            max: AtomicU64::new(max),
        })
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::SeqCst)
    }

    pub fn set_max(&self, max: u64) {
        self.max.store(max, Ordering::SeqCst);
    }

    /// Increments the counter unconditionally (it must be strictly
    /// non-decreasing), then checks the budget.
    pub fn increment(&self) -> EngineResult<()> {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        let max = self.max();
        if current > max {
            return Err(EngineError::OpCountExceeded { current, max });
        }
        Ok(())
    }
}

/// Recursion accounting shared between a stack and its substacks; a
/// substack's recursion guard synchronizes on the parent's lock (spec
/// §4.8, §9 Open Questions).
#[derive(Debug)]
pub struct RecursionState {
    level: Mutex<u32>,
    max: AtomicU32,
}

impl RecursionState {
    pub fn new(max: u32) -> Arc<Self> {
        Arc::new(RecursionState {
            level: Mutex::new(0),
            max: AtomicU32::new(max),
        })
    }

    pub fn level(&self) -> u32 {
        *self.level.lock().expect("recursion lock poisoned")
    }

    pub fn max(&self) -> u32 {
        self.max.load(Ordering::SeqCst)
    }

    pub fn set_max(&self, max: u32) {
        self.max.store(max, Ordering::SeqCst);
    }
}

/// RAII guard: increments the shared recursion counter on entry, and
/// guarantees the matching decrement on every exit path, including an
/// early return or an unwind through `?`.
pub struct RecursionGuard {
    state: Arc<RecursionState>,
}

impl RecursionGuard {
    /// Enters one recursion level, failing if that exceeds `maxrecurse`.
    /// The counter is still incremented even on failure's `Drop` cleanup —
    /// only the *current* entry is rejected, not retried, so the balance
    /// holds either way.
    pub fn enter(state: Arc<RecursionState>) -> EngineResult<Self> {
        {
            let mut level = state.level.lock().expect("recursion lock poisoned");
            *level += 1;
            let max = state.max();
            if *level > max {
                let current = *level;
                drop(level);
                // Unwind this entry's increment immediately: the caller
                // never receives a guard to drop, so do it inline here.
                *state.level.lock().expect("recursion lock poisoned") -= 1;
                return Err(EngineError::RecursionExceeded { current, max });
            }
        }
        Ok(RecursionGuard { state })
    }
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        let mut level = self.state.level.lock().expect("recursion lock poisoned");
        *level = level.saturating_sub(1);
    }
}
