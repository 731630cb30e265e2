// ABOUTME: Macro objects and the entries that make up their compiled body

use crate::audit::AuditEntry;
use crate::error::{windowed_excerpt, Position};
use crate::value::{FunctionRef, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// One compiled element of a macro body.
#[derive(Clone, Debug)]
pub enum Entry {
    Literal(Value),
    Function(FunctionRef),
    Macro(std::rc::Rc<MacroObj>),
    /// `$name` inside a macro under construction: append the symbol lookup,
    /// deferred to call time.
    DeferredLoad(String),
    /// `@name` inside a macro under construction: append the macro
    /// invocation, deferred to call time.
    DeferredRun(String),
    /// `EVAL` inside a macro under construction: pop a macro value off the
    /// stack at call time and run it, deferred the same way `@name` is.
    PopEval,
    /// An error demoted to an in-band statement by audit mode instead of
    /// aborting execution.
    Audit(AuditEntry),
    /// A wrapped entry tagged with the line/column it was parsed from, as
    /// produced by `PositionTrackingFactory`. The executor sets this as the
    /// stack's last error position before running the inner entry, so an
    /// error raised while running it gets framed with a real location
    /// instead of none at all.
    Positioned(Box<Entry>, Position),
}

/// Wraps freshly parsed entries before they are appended to a macro body.
/// The default (identity) factory is a plain pass-through; audit mode and
/// line/column tracking are both expressed as alternate factories.
pub trait EntryFactory {
    fn wrap(&self, entry: Entry, line: usize, start_col: usize, end_col: usize, source: &str) -> Entry;
}

/// The identity factory: returns entries unchanged. `Parser` defaults to
/// this; re-snapshotting a macro parsed with it is idempotent.
pub struct IdentityFactory;

impl EntryFactory for IdentityFactory {
    fn wrap(&self, entry: Entry, _line: usize, _start_col: usize, _end_col: usize, _source: &str) -> Entry {
        entry
    }
}

/// Attaches `(line, start_col, end_col)` to every entry it wraps by tagging
/// it with `Entry::Positioned`, windowed excerpt included. Used for
/// error-position framing and for surfacing hover/diagnostic information
/// to a host; a plain parse that never expects to report positions should
/// stick with `IdentityFactory` instead, since building the excerpt costs
/// an allocation per entry.
pub struct PositionTrackingFactory;

impl EntryFactory for PositionTrackingFactory {
    fn wrap(&self, entry: Entry, line: usize, start_col: usize, end_col: usize, source: &str) -> Entry {
        let token_len = end_col.saturating_sub(start_col);
        let position = Position::with_window(line, start_col, windowed_excerpt(source, start_col, token_len));
        Entry::Positioned(Box::new(entry), position)
    }
}

/// Ordered sequence of entries plus a macro's own attributes: `secure`
/// flag, optional `name`, and call metrics updated atomically on every
/// call. Macros are immutable once closed except for these counters.
#[derive(Debug)]
pub struct MacroObj {
    pub entries: Vec<Entry>,
    pub secure: bool,
    pub name: Option<String>,
    calls: AtomicU64,
    time_nanos: AtomicU64,
}

impl MacroObj {
    pub fn new(entries: Vec<Entry>, secure: bool, name: Option<String>) -> Self {
        MacroObj {
            entries,
            secure,
            name,
            calls: AtomicU64::new(0),
            time_nanos: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn time_nanos(&self) -> u64 {
        self.time_nanos.load(Ordering::Relaxed)
    }

    /// Records one invocation's elapsed time. Called from the executor's
    /// `finally` equivalent; relaxed ordering, so it gives no
    /// happens-before guarantee to other threads observing the counters.
    pub fn record_call(&self, elapsed_nanos: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.time_nanos.fetch_add(elapsed_nanos, Ordering::Relaxed);
    }
}
