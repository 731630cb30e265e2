// ABOUTME: Process-global directory of named stacks, for introspection and collision detection

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

/// `ExecStack` holds `Rc`-based values and is not `Send`; a registry that
/// actually reached back into a running stack from another thread would be
/// unsound. What's process-global here is narrowed to just the set of
/// names currently claimed, which is enough for a host to detect a
/// duplicate `name` attribute without needing a handle to the stack itself.
fn names() -> &'static Mutex<HashSet<String>> {
    static NAMES: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    NAMES.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Claims `name` in the process-wide directory, as set by a stack's `name`
/// attribute. Idempotent: registering the same name twice is not an error.
pub fn register(name: String) {
    names()
        .lock()
        .expect("stack registry lock poisoned")
        .insert(name);
}

pub fn unregister(name: &str) {
    names()
        .lock()
        .expect("stack registry lock poisoned")
        .remove(name);
}

pub fn is_registered(name: &str) -> bool {
    names()
        .lock()
        .expect("stack registry lock poisoned")
        .contains(name)
}
