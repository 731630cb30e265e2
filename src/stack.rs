// ABOUTME: The depth-limited value stack plus its register file, symbol table, attribute map and redefinition table

use crate::attributes::{AttrValue, AttributeMap, KEY_ALLOW_REDEFINED, KEY_AUDIT_TRAIL,
    KEY_IN_SECURE_MACRO, KEY_MACRO_NAME, KEY_MAXDEPTH, KEY_MAXOPS, KEY_MAXRECURSE,
    KEY_MAXSYMBOLS, KEY_SECTION, KEY_STACK_NAME};
use crate::audit::AuditTrail;
use crate::budget::{Limits, OpCounter, RecursionState};
use crate::error::{EngineError, EngineResult, Position};
use crate::registry;
use crate::signal::SignalCell;
use crate::value::{FunctionRef, Value};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Name→Value mapping used by `STORE`/`LOAD`, capped at `maxsymbols`.
#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: HashMap<String, Value>,
}

impl SymbolTable {
    pub fn get(&self, name: &str) -> Option<Value> {
        self.entries.get(name).cloned()
    }

    pub fn store(&mut self, name: String, value: Value, maxsymbols: usize) -> EngineResult<()> {
        if !self.entries.contains_key(&name) && self.entries.len() >= maxsymbols {
            return Err(EngineError::SymbolTableFull { max: maxsymbols });
        }
        self.entries.insert(name, value);
        Ok(())
    }

    /// `forget(None)` clears everything; `forget(Some(name))` removes one
    /// entry.
    pub fn forget(&mut self, name: Option<&str>) {
        match name {
            Some(n) => {
                self.entries.remove(n);
            }
            None => self.entries.clear(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn snapshot(&self) -> HashMap<String, Value> {
        self.entries.clone()
    }
}

/// Name→callable mapping for user-redefined functions, consulted ahead
/// of the external function resolver.
#[derive(Debug, Default)]
pub struct RedefTable {
    entries: HashMap<String, FunctionRef>,
}

impl RedefTable {
    pub fn get(&self, name: &str) -> Option<FunctionRef> {
        self.entries.get(name).cloned()
    }

    pub fn insert(&mut self, name: String, f: FunctionRef) {
        self.entries.insert(name, f);
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.remove(name);
    }

    fn snapshot(&self) -> HashMap<String, FunctionRef> {
        self.entries.clone()
    }
}

/// Opaque snapshot pushed by `save`/consumed by `restore`. Carries only
/// the symbol table, registers, and redefinition table — never the data
/// stack itself or the attribute map.
#[derive(Debug)]
pub struct Context {
    symbols: HashMap<String, Value>,
    registers: Vec<Value>,
    redefs: HashMap<String, FunctionRef>,
}

impl crate::value::DomainObject for Context {
    fn type_name(&self) -> &'static str {
        "context"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// The stack machine itself: a depth-limited value buffer with a
/// hide/show window, plus the register file, symbol table, attribute map
/// and redefinition table that live alongside it.
pub struct ExecStack {
    buffer: Vec<Value>,
    /// Hidden prefix length; the visible window is `[offset, offset+size)`.
    offset: usize,
    /// Visible element count.
    size: usize,

    pub registers: Vec<Value>,
    pub symbols: SymbolTable,
    pub redefs: RedefTable,
    pub attributes: AttributeMap,

    limits: Limits,
    op_counter: Arc<OpCounter>,
    recursion: Arc<RecursionState>,
    signal: Arc<SignalCell>,

    section: Option<String>,
    macro_name: Option<String>,
    in_secure_macro: bool,
    allow_redefined: bool,
    audit_trail: Option<AuditTrail>,
    last_error_position: Option<Position>,
    name: Option<String>,
}

impl ExecStack {
    pub fn new(limits: Limits) -> Self {
        ExecStack {
            buffer: Vec::new(),
            offset: 0,
            size: 0,
            registers: vec![Value::Null; limits.register_count],
            symbols: SymbolTable::default(),
            redefs: RedefTable::default(),
            attributes: AttributeMap::new(),
            op_counter: OpCounter::new(limits.maxops),
            recursion: RecursionState::new(limits.maxrecurse),
            signal: SignalCell::new(),
            limits,
            section: None,
            macro_name: None,
            in_secure_macro: false,
            allow_redefined: true,
            audit_trail: None,
            last_error_position: None,
            name: None,
        }
    }

    // ===== fast-access fields, kept in sync with the attribute map =====

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn op_counter(&self) -> &Arc<OpCounter> {
        &self.op_counter
    }

    pub fn recursion(&self) -> &Arc<RecursionState> {
        &self.recursion
    }

    pub fn signal(&self) -> &Arc<SignalCell> {
        &self.signal
    }

    pub fn section(&self) -> Option<&str> {
        self.section.as_deref()
    }

    pub fn macro_name(&self) -> Option<&str> {
        self.macro_name.as_deref()
    }

    pub fn in_secure_macro(&self) -> bool {
        self.in_secure_macro
    }

    pub fn set_in_secure_macro(&mut self, v: bool) {
        self.in_secure_macro = v;
    }

    pub fn allow_redefined(&self) -> bool {
        self.allow_redefined
    }

    pub fn audit_trail(&self) -> Option<&AuditTrail> {
        self.audit_trail.as_ref()
    }

    pub fn last_error_position(&self) -> Option<&Position> {
        self.last_error_position.as_ref()
    }

    pub fn set_last_error_position(&mut self, position: Option<Position>) {
        self.last_error_position = position;
    }

    /// Setting a recognized attribute key has side effects: updating a
    /// limit, renaming the section/macro, shrinking the underlying stack
    /// buffer, or registering the stack in the global registry.
    pub fn set_attribute(&mut self, key: &str, value: AttrValue) -> EngineResult<()> {
        match key {
            KEY_MAXOPS => {
                if let AttrValue::Int(n) = &value {
                    self.op_counter.set_max((*n).max(0) as u64);
                }
            }
            KEY_MAXRECURSE => {
                if let AttrValue::Int(n) = &value {
                    self.recursion.set_max((*n).max(0) as u32);
                }
            }
            KEY_MAXDEPTH => {
                if let AttrValue::Int(n) = &value {
                    let new_max = (*n).max(0) as usize;
                    if self.offset + self.size > new_max {
                        return Err(EngineError::StackDepthExceeded {
                            attempted: self.offset + self.size,
                            max: new_max,
                        });
                    }
                    self.limits.maxdepth = new_max;
                }
            }
            KEY_MAXSYMBOLS => {
                if let AttrValue::Int(n) = &value {
                    self.limits.maxsymbols = (*n).max(0) as usize;
                }
            }
            KEY_SECTION => {
                self.section = match &value {
                    AttrValue::Text(s) => Some(s.clone()),
                    AttrValue::Absent => None,
                    _ => self.section.clone(),
                };
            }
            KEY_MACRO_NAME => {
                self.macro_name = match &value {
                    AttrValue::Text(s) => Some(s.clone()),
                    AttrValue::Absent => None,
                    _ => self.macro_name.clone(),
                };
            }
            KEY_ALLOW_REDEFINED => {
                if let AttrValue::Bool(b) = &value {
                    self.allow_redefined = *b;
                }
            }
            KEY_IN_SECURE_MACRO => {
                if let AttrValue::Bool(b) = &value {
                    // Privilege cannot be lowered from within.
                    self.in_secure_macro = self.in_secure_macro || *b;
                }
            }
            KEY_AUDIT_TRAIL => {
                self.audit_trail = match &value {
                    AttrValue::AuditTrail(t) => Some(t.clone()),
                    AttrValue::Absent => None,
                    _ => self.audit_trail.clone(),
                };
            }
            KEY_STACK_NAME => {
                if let AttrValue::Text(s) = &value {
                    self.name = Some(s.clone());
                    registry::register(s.clone());
                } else if matches!(&value, AttrValue::Absent) {
                    self.name = None;
                }
            }
            _ => {}
        }
        self.attributes.set_raw(key, value);
        Ok(())
    }

    // ===== growth / depth invariant =====

    fn ensure_capacity(&self, additional: usize) -> EngineResult<()> {
        let attempted = self.offset + self.size + additional;
        if attempted > self.limits.maxdepth {
            return Err(EngineError::StackDepthExceeded {
                attempted,
                max: self.limits.maxdepth,
            });
        }
        Ok(())
    }

    /// Visible element count.
    pub fn depth(&self) -> usize {
        self.size
    }

    fn top_index(&self) -> Option<usize> {
        if self.size == 0 {
            None
        } else {
            Some(self.offset + self.size - 1)
        }
    }

    // ===== core stack ops =====

    pub fn push(&mut self, value: Value) -> EngineResult<()> {
        self.ensure_capacity(1)?;
        // Invariant: `buffer.len() == offset + size` at every call boundary,
        // so the next slot is always exactly the end of the buffer.
        debug_assert_eq!(self.buffer.len(), self.offset + self.size);
        self.buffer.push(value);
        self.size += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> EngineResult<Value> {
        let idx = self
            .top_index()
            .ok_or_else(|| EngineError::generic("pop: stack is empty"))?;
        let v = self.buffer.remove(idx);
        self.size -= 1;
        Ok(v)
    }

    /// `n` read from the top.
    pub fn popn(&mut self, n: usize) -> EngineResult<Vec<Value>> {
        if n > self.size {
            return Err(EngineError::generic(format!(
                "popn: requested {n}, only {} visible",
                self.size
            )));
        }
        let start = self.offset + self.size - n;
        let drained: Vec<Value> = self.buffer.drain(start..start + n).collect();
        self.size -= n;
        Ok(drained)
    }

    pub fn clear(&mut self) {
        let start = self.offset;
        self.buffer.drain(start..start + self.size);
        self.size = 0;
    }

    /// Truncate to at most `d` visible elements, dropping from the bottom
    /// of the visible window.
    pub fn reset(&mut self, d: usize) {
        if d >= self.size {
            return;
        }
        let drop_count = self.size - d;
        self.buffer.drain(self.offset..self.offset + drop_count);
        self.size = d;
    }

    pub fn drop1(&mut self) -> EngineResult<()> {
        self.pop().map(|_| ())
    }

    pub fn dropn(&mut self, n: usize) -> EngineResult<()> {
        self.popn(n).map(|_| ())
    }

    pub fn dup(&mut self) -> EngineResult<()> {
        let idx = self
            .top_index()
            .ok_or_else(|| EngineError::generic("dup: stack is empty"))?;
        let v = self.buffer[idx].clone();
        self.push(v)
    }

    pub fn dupn(&mut self, n: usize) -> EngineResult<()> {
        if n > self.size {
            return Err(EngineError::generic(format!(
                "dupn: requested {n}, only {} visible",
                self.size
            )));
        }
        let start = self.offset + self.size - n;
        let copies: Vec<Value> = self.buffer[start..start + n].to_vec();
        for v in copies {
            self.push(v)?;
        }
        Ok(())
    }

    pub fn swap(&mut self) -> EngineResult<()> {
        if self.size < 2 {
            return Err(EngineError::generic("swap: requires at least 2 elements"));
        }
        let top = self.offset + self.size - 1;
        self.buffer.swap(top, top - 1);
        Ok(())
    }

    /// Peek at the top without popping.
    pub fn peek(&self) -> EngineResult<&Value> {
        let idx = self
            .top_index()
            .ok_or_else(|| EngineError::generic("peek: stack is empty"))?;
        Ok(&self.buffer[idx])
    }

    /// `peekn`/`get(k)`: the k-th element from the top, 0-indexed, without
    /// popping.
    pub fn get(&self, k: usize) -> EngineResult<&Value> {
        if k >= self.size {
            return Err(EngineError::generic(format!(
                "get: index {k} out of range ({} visible)",
                self.size
            )));
        }
        Ok(&self.buffer[self.offset + self.size - 1 - k])
    }

    /// Cyclic rotation of the top 3 elements: `(a b c -- b c a)`.
    pub fn rot(&mut self) -> EngineResult<()> {
        self.roll(3)
    }

    /// Cyclic rotation of the top `n` elements upward: the bottom of that
    /// window moves to the top.
    pub fn roll(&mut self, n: usize) -> EngineResult<()> {
        if n == 0 {
            return Ok(());
        }
        if n > self.size {
            return Err(EngineError::generic(format!(
                "roll: requested {n}, only {} visible",
                self.size
            )));
        }
        let start = self.offset + self.size - n;
        self.buffer[start..start + n].rotate_left(1);
        Ok(())
    }

    /// Downward cyclic rotation of the top `n` elements: the top moves to
    /// the bottom of that window.
    pub fn rolld(&mut self, n: usize) -> EngineResult<()> {
        if n == 0 {
            return Ok(());
        }
        if n > self.size {
            return Err(EngineError::generic(format!(
                "rolld: requested {n}, only {} visible",
                self.size
            )));
        }
        let start = self.offset + self.size - n;
        self.buffer[start..start + n].rotate_right(1);
        Ok(())
    }

    /// Copies the k-th element from the top to the top.
    pub fn pick(&mut self, k: usize) -> EngineResult<()> {
        let v = self.get(k)?.clone();
        self.push(v)
    }

    // ===== hide / show window =====

    /// `hide()`: hides every currently visible element.
    pub fn hide_all(&mut self) {
        self.offset += self.size;
        self.size = 0;
    }

    /// `hide(n)` for `n >= 0`: hides exactly `n` elements from the bottom
    /// of the visible window, capped at what's available.
    pub fn hide(&mut self, n: usize) {
        let n = n.min(self.size);
        self.offset += n;
        self.size -= n;
    }

    /// `hide(-k)`: keep `k` visible, hide the rest.
    pub fn hide_keep(&mut self, k: usize) {
        if self.size <= k {
            return;
        }
        self.hide(self.size - k);
    }

    /// `show()`: reveals every currently hidden element.
    pub fn show_all(&mut self) {
        self.size += self.offset;
        self.offset = 0;
    }

    /// `show(n)` for `n >= 0`: reveals `n` hidden elements, capped at what's
    /// hidden.
    pub fn show(&mut self, n: usize) {
        let n = n.min(self.offset);
        self.offset -= n;
        self.size += n;
    }

    /// `show(-k)`: leave `k` visible in total; no-op if already reached.
    pub fn show_total(&mut self, k: usize) {
        if self.size >= k {
            return;
        }
        self.show(k - self.size);
    }

    // ===== registers =====

    pub fn register_load(&self, index: usize) -> EngineResult<Value> {
        self.registers
            .get(index)
            .cloned()
            .ok_or_else(|| EngineError::RegisterOutOfRange {
                index,
                size: self.registers.len(),
            })
    }

    pub fn register_store(&mut self, index: usize, value: Value) -> EngineResult<()> {
        let size = self.registers.len();
        let slot = self
            .registers
            .get_mut(index)
            .ok_or(EngineError::RegisterOutOfRange { index, size })?;
        *slot = value;
        Ok(())
    }

    // ===== symbol table =====

    pub fn load(&self, name: &str) -> Option<Value> {
        self.symbols.get(name)
    }

    pub fn store(&mut self, name: String, value: Value) -> EngineResult<()> {
        self.symbols.store(name, value, self.limits.maxsymbols)
    }

    pub fn forget(&mut self, name: Option<&str>) {
        self.symbols.forget(name);
    }

    // ===== context save/restore =====

    /// Snapshots the symbol table, register file, and redefinition table
    /// into an opaque context value — never the stack contents or the
    /// attribute map.
    pub fn save(&self) -> Value {
        Value::Object(Rc::new(Context {
            symbols: self.symbols.snapshot(),
            registers: self.registers.clone(),
            redefs: self.redefs.snapshot(),
        }))
    }

    pub fn restore(&mut self, ctx: &Context) {
        self.symbols.entries = ctx.symbols.clone();
        self.registers = ctx.registers.clone();
        self.redefs.entries = ctx.redefs.clone();
    }

    /// Pops a context from the top and applies it; fails if the top is
    /// not a context.
    pub fn restore_from_top(&mut self) -> EngineResult<()> {
        let v = self.pop()?;
        match &v {
            Value::Object(obj) => {
                let ctx = obj
                    .as_any()
                    .downcast_ref::<Context>()
                    .ok_or_else(|| EngineError::generic("restore: top of stack is not a context"))?;
                self.restore(ctx);
                Ok(())
            }
            _ => Err(EngineError::generic("restore: top of stack is not a context")),
        }
    }

    // ===== substack =====

    /// Derives a child stack sharing the parent's operation/recursion
    /// counters while isolating the secure-mode attribute: a secure parent
    /// forces a secure child, a non-secure parent lets the child enter
    /// secure mode independently.
    pub fn substack(&self) -> ExecStack {
        let mut child = ExecStack::new(self.limits);
        child.op_counter = self.op_counter.clone();
        child.recursion = self.recursion.clone();
        child.signal = self.signal.clone();
        child.in_secure_macro = self.in_secure_macro; // forced if parent is secure
        child.section = self.section.clone();
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> ExecStack {
        ExecStack::new(Limits {
            maxdepth: 8,
            ..Limits::default()
        })
    }

    #[test]
    fn depth_tracks_visible_count() {
        let mut s = stack();
        s.push(Value::Int(1)).unwrap();
        s.push(Value::Int(2)).unwrap();
        assert_eq!(s.depth(), 2);
        s.drop1().unwrap();
        assert_eq!(s.depth(), 1);
    }

    #[test]
    fn hide_then_show_is_a_no_op() {
        let mut s = stack();
        for i in 0..5 {
            s.push(Value::Int(i)).unwrap();
        }
        s.hide(2);
        assert_eq!(s.depth(), 3);
        s.show(2);
        assert_eq!(s.depth(), 5);
        assert!(matches!(s.get(0).unwrap(), Value::Int(4)));
    }

    #[test]
    fn depth_exceeded_on_growth() {
        let mut s = stack();
        for i in 0..8 {
            s.push(Value::Int(i)).unwrap();
        }
        let err = s.push(Value::Int(9)).unwrap_err();
        assert!(matches!(err, EngineError::StackDepthExceeded { .. }));
    }

    #[test]
    fn rot_cycles_top_three() {
        let mut s = stack();
        s.push(Value::Int(1)).unwrap();
        s.push(Value::Int(2)).unwrap();
        s.push(Value::Int(3)).unwrap();
        s.rot().unwrap();
        assert!(matches!(s.get(0).unwrap(), Value::Int(1)));
        assert!(matches!(s.get(1).unwrap(), Value::Int(3)));
        assert!(matches!(s.get(2).unwrap(), Value::Int(2)));
    }

    #[test]
    fn symbol_table_enforces_capacity() {
        let mut s = ExecStack::new(Limits {
            maxsymbols: 1,
            ..Limits::default()
        });
        s.store("a".into(), Value::Int(1)).unwrap();
        let err = s.store("b".into(), Value::Int(2)).unwrap_err();
        assert!(matches!(err, EngineError::SymbolTableFull { .. }));
    }

    #[test]
    fn save_restore_does_not_touch_stack_contents() {
        let mut s = stack();
        s.push(Value::Int(42)).unwrap();
        s.store("x".into(), Value::Int(1)).unwrap();
        let ctx_value = s.save();
        s.store("x".into(), Value::Int(2)).unwrap();
        s.push(Value::Int(99)).unwrap();
        s.push(ctx_value).unwrap();
        s.restore_from_top().unwrap();
        assert_eq!(s.depth(), 2, "stack contents must be untouched by restore");
        assert!(matches!(s.load("x"), Some(Value::Int(1))));
    }
}
