// ABOUTME: Per-stack attribute map with intercepted keys that mirror into fast-access fields

use crate::audit::AuditTrail;
use crate::entry::EntryFactory;
use std::collections::HashMap;
use std::rc::Rc;

/// An opaque attribute value. Unlike `Value` (which lives on the data
/// stack), attributes hold engine-internal configuration objects as well
/// as plain scalars.
#[derive(Clone)]
pub enum AttrValue {
    Int(i64),
    Bool(bool),
    Text(String),
    AuditTrail(AuditTrail),
    ParserFactory(Rc<dyn EntryFactory>),
    ImportRules(Rc<HashMap<String, String>>),
    CreatedAt(u64),
    /// Setting a key to `Absent` removes it.
    Absent,
}

impl std::fmt::Debug for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::Int(i) => write!(f, "Int({i})"),
            AttrValue::Bool(b) => write!(f, "Bool({b})"),
            AttrValue::Text(s) => write!(f, "Text({s:?})"),
            AttrValue::AuditTrail(_) => write!(f, "AuditTrail(..)"),
            AttrValue::ParserFactory(_) => write!(f, "ParserFactory(..)"),
            AttrValue::ImportRules(_) => write!(f, "ImportRules(..)"),
            AttrValue::CreatedAt(t) => write!(f, "CreatedAt({t})"),
            AttrValue::Absent => write!(f, "Absent"),
        }
    }
}

/// Keys the map intercepts: a write to one of these also updates a
/// fast-access field on `ExecStack` directly.
pub const KEY_MAXOPS: &str = "maxops";
pub const KEY_MAXRECURSE: &str = "maxrecurse";
pub const KEY_MAXDEPTH: &str = "maxdepth";
pub const KEY_MAXSYMBOLS: &str = "maxsymbols";
pub const KEY_SECTION: &str = "section";
pub const KEY_MACRO_NAME: &str = "macro_name";
pub const KEY_ALLOW_REDEFINED: &str = "allow_redefined";
pub const KEY_IN_SECURE_MACRO: &str = "in_secure_macro";
pub const KEY_PARSER_FACTORY: &str = "parser_factory";
pub const KEY_IMPORT_RULES: &str = "import_rules";
pub const KEY_AUDIT_TRAIL: &str = "audit_trail";
pub const KEY_CREATED_AT: &str = "created_at";
pub const KEY_STACK_NAME: &str = "name";

/// Name→opaque mapping storing per-stack settings. Stored apart
/// from `ExecStack`'s typed fast-access fields so host code can still
/// enumerate/inspect everything uniformly; `ExecStack::set_attribute`
/// keeps the two in sync.
#[derive(Default)]
pub struct AttributeMap {
    entries: HashMap<String, AttrValue>,
}

impl AttributeMap {
    pub fn new() -> Self {
        AttributeMap {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.entries.get(key)
    }

    /// Raw set, bypassing interception — used by `ExecStack::set_attribute`
    /// after it has already applied the side effect for intercepted keys.
    pub fn set_raw(&mut self, key: impl Into<String>, value: AttrValue) {
        let key = key.into();
        if matches!(value, AttrValue::Absent) {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_removes_the_key() {
        let mut map = AttributeMap::new();
        map.set_raw("section", AttrValue::Text("billing".into()));
        assert!(map.get("section").is_some());
        map.set_raw("section", AttrValue::Absent);
        assert!(map.get("section").is_none());
    }
}
