// ABOUTME: The executor: runs a macro's entries against a stack, enforcing budgets and framing errors

use crate::budget::RecursionGuard;
use crate::entry::{Entry, MacroObj};
use crate::error::{ControlFlow, EngineError, ExecError, ExecResult};
use crate::resolver::FunctionResolver;
use crate::stack::ExecStack;
use crate::value::{FunctionRef, Value};
use std::rc::Rc;
use std::time::Instant;

/// The macro repository chain: local symbol table first, then whatever
/// external repository a host wires in — an opaque, host-supplied lookup
/// for `@name` invocations that don't resolve against the stack's own
/// symbol table.
pub trait MacroResolver {
    fn lookup(&self, name: &str) -> Option<Rc<MacroObj>>;
}

/// Runs every entry of `macro_obj` against `stack`: accounts for the call
/// against the op and recursion budgets, escalates secure mode
/// monotonically, runs the body, and restores the caller's section/macro
/// name/secure flag on the way out regardless of outcome.
pub fn exec(
    stack: &mut ExecStack,
    macro_obj: &MacroObj,
    functions: &dyn FunctionResolver,
    macros: &dyn MacroResolver,
) -> ExecResult<()> {
    let started = Instant::now();

    // Step 1: op + recursion accounting.
    stack.op_counter().increment().map_err(ExecError::Engine)?;
    let _recursion_guard =
        RecursionGuard::enter(stack.recursion().clone()).map_err(ExecError::Engine)?;

    // Step 2: save caller's section / macro name / secure flag.
    let saved_section = stack.section().map(str::to_string);
    let saved_macro_name = stack.macro_name().map(str::to_string);
    let saved_secure = stack.in_secure_macro();

    // Step 3: monotonic secure-mode escalation, and make this macro's own
    // name visible as the "current macro name" for the duration of its run.
    let secure_now = saved_secure || macro_obj.secure;
    stack.set_in_secure_macro(secure_now);
    if let Some(name) = &macro_obj.name {
        restore_named_attribute(stack, crate::attributes::KEY_MACRO_NAME, Some(name.clone()));
    }

    let mut result = run_entries(stack, macro_obj, functions, macros);

    // Step 6 continued: a `Return` that has fully unwound (reached level
    // zero) is a normal macro return, not an error — swallow it here,
    // at the frame that received it.
    if matches!(result, Err(ExecError::Control(ControlFlow::Return(0)))) {
        result = Ok(());
    }

    // Step 7 (finally-equivalent): restore section/macro-name/secure flag,
    // recursion guard drops here too, and record call metrics regardless
    // of outcome.
    stack.set_in_secure_macro(saved_secure);
    restore_named_attribute(stack, crate::attributes::KEY_SECTION, saved_section);
    restore_named_attribute(stack, crate::attributes::KEY_MACRO_NAME, saved_macro_name);
    macro_obj.record_call(started.elapsed().as_nanos() as u64);

    result
}

fn restore_named_attribute(stack: &mut ExecStack, key: &str, value: Option<String>) {
    let attr = match value {
        Some(s) => crate::attributes::AttrValue::Text(s),
        None => crate::attributes::AttrValue::Absent,
    };
    // Restoring a saved caller attribute can never itself trip a budget
    // (it is strictly undoing a prior, already-accepted write).
    let _ = stack.set_attribute(key, attr);
}

fn run_entries(
    stack: &mut ExecStack,
    macro_obj: &MacroObj,
    functions: &dyn FunctionResolver,
    macros: &dyn MacroResolver,
) -> ExecResult<()> {
    for (index, entry) in macro_obj.entries.iter().enumerate() {
        // Step 4: per-statement signal check, then op accounting.
        stack.signal().check().map_err(ExecError::Control)?;
        stack.op_counter().increment().map_err(ExecError::Engine)?;
        stack.set_last_error_position(None);

        let step_result = run_one_entry(stack, entry, functions, macros);

        if let Err(err) = step_result {
            return Err(frame_or_pass_through(stack, err, index, macro_obj));
        }
    }

    // Step 5: the op budget was already checked after every increment
    // above (including the invocation's own increment in step 1), so
    // normal completion here has nothing further to verify.
    Ok(())
}

fn run_one_entry(
    stack: &mut ExecStack,
    entry: &Entry,
    functions: &dyn FunctionResolver,
    macros: &dyn MacroResolver,
) -> ExecResult<()> {
    match entry {
        Entry::Literal(v) => {
            stack.push(v.clone()).map_err(ExecError::Engine)?;
            Ok(())
        }
        Entry::Function(fr) => apply_function_ref(stack, fr),
        Entry::Macro(m) => {
            stack
                .push(Value::Macro(m.clone()))
                .map_err(ExecError::Engine)?;
            Ok(())
        }
        Entry::DeferredLoad(name) => {
            let v = stack
                .load(name)
                .ok_or_else(|| EngineError::UnknownSymbol(name.clone()))
                .map_err(ExecError::Engine)?;
            stack.push(v).map_err(ExecError::Engine)?;
            Ok(())
        }
        Entry::DeferredRun(name) => {
            let resolved = resolve_macro(stack, macros, name)?;
            exec(stack, &resolved, functions, macros)
        }
        Entry::PopEval => {
            let popped = stack.pop().map_err(ExecError::Engine)?;
            let Value::Macro(m) = popped else {
                return Err(ExecError::Engine(EngineError::UnsupportedOperand {
                    function: "EVAL",
                    actual: popped.type_name(),
                }));
            };
            exec(stack, &m, functions, macros)
        }
        Entry::Audit(audit_entry) => {
            if let Some(trail) = stack.audit_trail() {
                trail.push(audit_entry.clone());
            }
            Ok(())
        }
        Entry::Positioned(inner, position) => {
            stack.set_last_error_position(Some(position.clone()));
            run_one_entry(stack, inner, functions, macros)
        }
    }
}

/// `@name` resolution: local symbol table first (a `Value::Macro` bound by
/// name), then the external macro repository chain. Shared with the
/// parser, which performs the same resolution for an immediate (not
/// inside a macro under construction) `@name` invocation.
pub fn resolve_macro(
    stack: &ExecStack,
    macros: &dyn MacroResolver,
    name: &str,
) -> ExecResult<Rc<MacroObj>> {
    if let Some(Value::Macro(m)) = stack.load(name) {
        return Ok(m);
    }
    macros
        .lookup(name)
        .ok_or_else(|| ExecError::Engine(EngineError::UnknownMacro(name.to_string())))
}

/// Applies an already-resolved function reference: a stack-function runs
/// for effect, a plain value is pushed.
fn apply_function_ref(stack: &mut ExecStack, fr: &FunctionRef) -> ExecResult<()> {
    match fr {
        FunctionRef::StackFn(sf) => sf.call(stack),
        FunctionRef::Value(v) => stack.push((**v).clone()).map_err(ExecError::Engine),
    }
}

/// Step 6: classify the exceptional exit.
fn frame_or_pass_through(
    stack: &mut ExecStack,
    err: ExecError,
    index: usize,
    macro_obj: &MacroObj,
) -> ExecError {
    match err {
        // Return unwinds one frame per level; `exec` swallows it once it
        // reaches zero, otherwise the decremented signal keeps propagating.
        ExecError::Control(ControlFlow::Return(levels)) => {
            ExecError::Control(ControlFlow::Return(levels.saturating_sub(1)))
        }
        ExecError::Control(cf) => ExecError::Control(cf),
        ExecError::Engine(engine_err) => {
            if stack.in_secure_macro() {
                // Secure frame: propagate the raw cause, undisclosed.
                ExecError::Engine(engine_err)
            } else {
                let position = stack.last_error_position().cloned();
                ExecError::Engine(engine_err.framed(
                    index,
                    stack.section().map(str::to_string),
                    macro_obj.name.clone(),
                    position,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Limits;
    use crate::error::Position;
    use crate::resolver::NamedFn;

    struct NoFunctions;
    impl FunctionResolver for NoFunctions {
        fn lookup(&self, _name: &str) -> Option<FunctionRef> {
            None
        }
    }

    struct NoMacros;
    impl MacroResolver for NoMacros {
        fn lookup(&self, _name: &str) -> Option<Rc<MacroObj>> {
            None
        }
    }

    fn new_stack() -> ExecStack {
        ExecStack::new(Limits::default())
    }

    #[test]
    fn literal_entries_push_in_order() {
        let mut stack = new_stack();
        let m = MacroObj::new(
            vec![
                Entry::Literal(Value::Int(1)),
                Entry::Literal(Value::Int(2)),
            ],
            false,
            None,
        );
        exec(&mut stack, &m, &NoFunctions, &NoMacros).unwrap();
        assert_eq!(stack.depth(), 2);
        assert!(matches!(stack.get(0).unwrap(), Value::Int(2)));
    }

    #[test]
    fn stack_function_entry_runs_for_effect() {
        let mut stack = new_stack();
        let add = FunctionRef::StackFn(Rc::new(NamedFn::new("ADD", |s: &mut ExecStack| {
            let b = s.pop()?;
            let a = s.pop()?;
            if let (Value::Int(a), Value::Int(b)) = (a, b) {
                s.push(Value::Int(a + b))?;
            }
            Ok(())
        })));
        let m = MacroObj::new(
            vec![
                Entry::Literal(Value::Int(1)),
                Entry::Literal(Value::Int(2)),
                Entry::Function(add),
            ],
            false,
            None,
        );
        exec(&mut stack, &m, &NoFunctions, &NoMacros).unwrap();
        assert_eq!(stack.depth(), 1);
        assert!(matches!(stack.get(0).unwrap(), Value::Int(3)));
    }

    #[test]
    fn recursion_after_successful_exec_returns_to_zero() {
        let mut stack = new_stack();
        let inner = Rc::new(MacroObj::new(vec![Entry::Literal(Value::Int(1))], false, None));
        stack.store("f".into(), Value::Macro(inner)).unwrap();
        let outer = MacroObj::new(vec![Entry::DeferredRun("f".into())], false, None);
        exec(&mut stack, &outer, &NoFunctions, &NoMacros).unwrap();
        assert_eq!(stack.recursion().level(), 0, "recursion must balance back to zero");
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn recursion_budget_trips_on_third_nested_call() {
        let mut stack = ExecStack::new(Limits {
            maxrecurse: 2,
            ..Limits::default()
        });
        // A self-recursive macro: calls itself forever via `@f`.
        let recursive = Rc::new(MacroObj::new(vec![Entry::DeferredRun("f".into())], false, None));
        stack.store("f".into(), Value::Macro(recursive)).unwrap();
        let top = MacroObj::new(vec![Entry::DeferredRun("f".into())], false, None);
        let err = exec(&mut stack, &top, &NoFunctions, &NoMacros).unwrap_err();
        assert!(matches!(
            err,
            ExecError::Engine(EngineError::Framed { .. }) | ExecError::Engine(EngineError::RecursionExceeded { .. })
        ));
    }

    #[test]
    fn error_in_secure_macro_is_not_framed() {
        let mut stack = new_stack();
        let m = MacroObj::new(vec![Entry::DeferredLoad("nope".into())], true, Some("m".into()));
        let err = exec(&mut stack, &m, &NoFunctions, &NoMacros).unwrap_err();
        match err {
            ExecError::Engine(EngineError::UnknownSymbol(n)) => assert_eq!(n, "nope"),
            other => panic!("expected an unframed UnknownSymbol, got {other:?}"),
        }
    }

    #[test]
    fn error_in_non_secure_macro_is_framed_with_macro_name() {
        let mut stack = new_stack();
        let m = MacroObj::new(
            vec![Entry::DeferredLoad("nope".into())],
            false,
            Some("myMacro".into()),
        );
        let err = exec(&mut stack, &m, &NoFunctions, &NoMacros).unwrap_err();
        match err {
            ExecError::Engine(e @ EngineError::Framed { .. }) => {
                assert!(e.diagnostic().contains("myMacro"));
            }
            other => panic!("expected a framed error, got {other:?}"),
        }
    }

    #[test]
    fn positioned_entry_carries_its_window_into_the_framed_diagnostic() {
        let mut stack = new_stack();
        let position = Position::with_window(2, 0, "=>$nope<=".to_string());
        let m = MacroObj::new(
            vec![Entry::Positioned(
                Box::new(Entry::DeferredLoad("nope".into())),
                position,
            )],
            false,
            Some("myMacro".into()),
        );
        let err = exec(&mut stack, &m, &NoFunctions, &NoMacros).unwrap_err();
        match err {
            ExecError::Engine(e @ EngineError::Framed { .. }) => {
                let text = e.diagnostic();
                assert!(text.contains("=>$nope<="));
                assert!(text.contains("line 2"));
            }
            other => panic!("expected a framed error, got {other:?}"),
        }
    }

    #[test]
    fn last_error_position_does_not_leak_across_entries() {
        let mut stack = new_stack();
        let position = Position::with_window(1, 0, "=>1<=".to_string());
        let m = MacroObj::new(
            vec![
                Entry::Positioned(Box::new(Entry::Literal(Value::Int(1))), position),
                Entry::DeferredLoad("also_missing".into()),
            ],
            false,
            None,
        );
        let err = exec(&mut stack, &m, &NoFunctions, &NoMacros).unwrap_err();
        match err {
            ExecError::Engine(e @ EngineError::Framed { .. }) => {
                assert!(!e.diagnostic().contains("=>1<="));
            }
            other => panic!("expected a framed error, got {other:?}"),
        }
    }
}
