// ABOUTME: Function resolution chain: redefinition table first, then the external library registry

use crate::error::{ControlFlow, EngineError, EngineResult, ExecError, ExecResult};
use crate::ops::{self, CompareOp};
use crate::stack::ExecStack;
use crate::value::{FunctionRef, Value};
use std::collections::HashMap;
use std::rc::Rc;

/// A stack-function: consumes/produces values on the top of the stack for
/// side effect. The engine doesn't care about a function's help text or
/// declared arity, only that it can be applied to a stack. The result
/// carries `ExecResult` rather than `EngineResult` because a handful of
/// built-ins (`RETURN`, `STOP`, `KILL`) signal control flow rather than
/// failure.
pub trait StackFunction {
    fn call(&self, stack: &mut ExecStack) -> ExecResult<()>;

    /// Declared name, used for readability when framing errors —
    /// preferred over a generated or positional label.
    fn name(&self) -> &str;
}

/// A boxed closure wrapped up as a `StackFunction`, for function pointers
/// and small builtins that don't warrant their own type.
pub struct NamedFn<F>
where
    F: Fn(&mut ExecStack) -> ExecResult<()>,
{
    name: String,
    func: F,
}

impl<F> NamedFn<F>
where
    F: Fn(&mut ExecStack) -> ExecResult<()>,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        NamedFn {
            name: name.into(),
            func,
        }
    }
}

impl<F> StackFunction for NamedFn<F>
where
    F: Fn(&mut ExecStack) -> ExecResult<()>,
{
    fn call(&self, stack: &mut ExecStack) -> ExecResult<()> {
        (self.func)(stack)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// The external function library registry: an opaque collaborator the
/// engine only knows through this interface.
pub trait FunctionResolver {
    fn lookup(&self, name: &str) -> Option<FunctionRef>;
}

/// What happens when a name is redefined to an absent ("null") behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedefPolicy {
    /// Remove the redefinition entirely, letting the external registry
    /// show back through.
    Unshadow,
    /// Install a stub that always fails with `"<name> is undefined"`,
    /// preserving the shadowing pattern (the name still resolves to a
    /// local entry, it just always errors).
    Stub,
}

/// Resolves `name` against the stack's redefinition table first (unless
/// `allow_redefined` is explicitly `false`), then the external resolver,
/// failing with `UnknownFunction` otherwise.
pub fn resolve(
    stack: &ExecStack,
    resolver: &dyn FunctionResolver,
    name: &str,
) -> EngineResult<FunctionRef> {
    if stack.allow_redefined() {
        if let Some(f) = stack.redefs.get(name) {
            return Ok(f.clone());
        }
    }
    resolver
        .lookup(name)
        .ok_or_else(|| EngineError::UnknownFunction(name.to_string()))
}

/// Redefines `name` to `value`. `Value::Null` triggers `policy` instead of
/// literally storing a null function reference.
pub fn redefine(stack: &mut ExecStack, name: &str, value: Value, policy: RedefPolicy) {
    if value.is_null() {
        match policy {
            RedefPolicy::Unshadow => {
                stack.redefs.remove(name);
            }
            RedefPolicy::Stub => {
                let undefined_name = name.to_string();
                let stub = NamedFn::new(name.to_string(), move |_stack: &mut ExecStack| {
                    Err(EngineError::UndefinedRedefinition(undefined_name.clone()).into())
                });
                stack
                    .redefs
                    .insert(name.to_string(), FunctionRef::StackFn(Rc::new(stub)));
            }
        }
        return;
    }
    stack
        .redefs
        .insert(name.to_string(), FunctionRef::Value(Box::new(value)));
}

fn pop_pair(stack: &mut ExecStack) -> ExecResult<(Value, Value)> {
    let b = stack.pop().map_err(ExecError::Engine)?;
    let a = stack.pop().map_err(ExecError::Engine)?;
    Ok((a, b))
}

fn numeric_binop(
    name: &'static str,
    stack: &mut ExecStack,
    int_op: impl Fn(i64, i64) -> i64,
    float_op: impl Fn(f64, f64) -> f64,
) -> ExecResult<()> {
    let (a, b) = pop_pair(stack)?;
    let result = match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(int_op(x, y))),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(float_op(x, y))),
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(float_op(x as f64, y))),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(float_op(x, y as f64))),
        (a, b) => Err(EngineError::HeterogeneousTypes {
            operator: name,
            left: a.type_name(),
            right: b.type_name(),
        }),
    }
    .map_err(ExecError::Engine)?;
    stack.push(result).map_err(ExecError::Engine)
}

fn compare_op(op: CompareOp, stack: &mut ExecStack) -> ExecResult<()> {
    let (a, b) = pop_pair(stack)?;
    let result = ops::compare(op, &a, &b).map_err(ExecError::Engine)?;
    stack.push(Value::Bool(result)).map_err(ExecError::Engine)
}

fn require_index(stack: &mut ExecStack, what: &'static str) -> ExecResult<usize> {
    match stack.pop().map_err(ExecError::Engine)? {
        Value::Int(n) if n >= 0 => Ok(n as usize),
        other => Err(ExecError::Engine(EngineError::UnsupportedOperand {
            function: what,
            actual: other.type_name(),
        })),
    }
}

fn require_signed(stack: &mut ExecStack, what: &'static str) -> ExecResult<i64> {
    match stack.pop().map_err(ExecError::Engine)? {
        Value::Int(n) => Ok(n),
        other => Err(ExecError::Engine(EngineError::UnsupportedOperand {
            function: what,
            actual: other.type_name(),
        })),
    }
}

fn require_name(stack: &mut ExecStack, what: &'static str) -> ExecResult<String> {
    match stack.pop().map_err(ExecError::Engine)? {
        Value::String(s) => Ok(s.to_string()),
        other => Err(ExecError::Engine(EngineError::UnsupportedOperand {
            function: what,
            actual: other.type_name(),
        })),
    }
}

/// A small, illustrative function catalog: arithmetic, comparisons, stack
/// manipulation, symbol storage, context save/restore, and the three
/// control-flow builtins. Not the production function library — that is
/// an external collaborator reached through `FunctionResolver` (see this
/// module's own trait above) — this exists purely so a binary built
/// against this crate, and this crate's own tests, have something
/// runnable to execute against.
pub struct StaticResolver {
    entries: HashMap<String, FunctionRef>,
}

impl Default for StaticResolver {
    fn default() -> Self {
        StaticResolver::new()
    }
}

macro_rules! stackfn {
    ($map:expr, $name:literal, $f:expr) => {
        $map.insert(
            $name.to_string(),
            FunctionRef::StackFn(Rc::new(NamedFn::new($name, $f))),
        );
    };
}

impl StaticResolver {
    pub fn new() -> Self {
        let mut entries: HashMap<String, FunctionRef> = HashMap::new();

        stackfn!(entries, "+", |s: &mut ExecStack| numeric_binop(
            "+",
            s,
            i64::wrapping_add,
            |a, b| a + b
        ));
        stackfn!(entries, "-", |s: &mut ExecStack| numeric_binop(
            "-",
            s,
            i64::wrapping_sub,
            |a, b| a - b
        ));
        stackfn!(entries, "*", |s: &mut ExecStack| numeric_binop(
            "*",
            s,
            i64::wrapping_mul,
            |a, b| a * b
        ));
        stackfn!(entries, "/", |s: &mut ExecStack| numeric_binop(
            "/",
            s,
            |a, b| if b == 0 { 0 } else { a.wrapping_div(b) },
            |a, b| a / b
        ));

        stackfn!(entries, "EQ", |s: &mut ExecStack| compare_op(CompareOp::Eq, s));
        stackfn!(entries, "NE", |s: &mut ExecStack| compare_op(CompareOp::Ne, s));
        stackfn!(entries, "LT", |s: &mut ExecStack| compare_op(CompareOp::Lt, s));
        stackfn!(entries, "LE", |s: &mut ExecStack| compare_op(CompareOp::Le, s));
        stackfn!(entries, "GT", |s: &mut ExecStack| compare_op(CompareOp::Gt, s));
        stackfn!(entries, "GE", |s: &mut ExecStack| compare_op(CompareOp::Ge, s));
        stackfn!(entries, "=", |s: &mut ExecStack| compare_op(CompareOp::Eq, s));
        stackfn!(entries, ">=", |s: &mut ExecStack| compare_op(CompareOp::Ge, s));
        stackfn!(entries, "<=", |s: &mut ExecStack| compare_op(CompareOp::Le, s));
        stackfn!(entries, ">", |s: &mut ExecStack| compare_op(CompareOp::Gt, s));
        stackfn!(entries, "<", |s: &mut ExecStack| compare_op(CompareOp::Lt, s));
        stackfn!(entries, "!=", |s: &mut ExecStack| compare_op(CompareOp::Ne, s));

        // `NaN` has no literal grammar (the float grammar requires a `.`),
        // so it is modeled as a nilary builtin that pushes the constant:
        // a name that isn't a literal resolves to a function, and a
        // non-stack-function reference is simply pushed.
        entries.insert(
            "NaN".to_string(),
            FunctionRef::Value(Box::new(Value::Float(f64::NAN))),
        );

        stackfn!(entries, "DEPTH", |s: &mut ExecStack| {
            let d = s.depth() as i64;
            s.push(Value::Int(d)).map_err(ExecError::Engine)
        });
        stackfn!(entries, "CLEAR", |s: &mut ExecStack| {
            s.clear();
            Ok(())
        });
        stackfn!(entries, "RESET", |s: &mut ExecStack| {
            let d = require_index(s, "RESET")?;
            s.reset(d);
            Ok(())
        });
        stackfn!(entries, "DROP", |s: &mut ExecStack| s
            .drop1()
            .map_err(ExecError::Engine));
        stackfn!(entries, "DROPN", |s: &mut ExecStack| {
            let n = require_index(s, "DROPN")?;
            s.dropn(n).map_err(ExecError::Engine)
        });
        stackfn!(entries, "DUP", |s: &mut ExecStack| s
            .dup()
            .map_err(ExecError::Engine));
        stackfn!(entries, "DUPN", |s: &mut ExecStack| {
            let n = require_index(s, "DUPN")?;
            s.dupn(n).map_err(ExecError::Engine)
        });
        stackfn!(entries, "SWAP", |s: &mut ExecStack| s
            .swap()
            .map_err(ExecError::Engine));
        stackfn!(entries, "PEEK", |s: &mut ExecStack| {
            let v = s.peek().map_err(ExecError::Engine)?.clone();
            s.push(v).map_err(ExecError::Engine)
        });
        stackfn!(entries, "GET", |s: &mut ExecStack| {
            let k = require_index(s, "GET")?;
            let v = s.get(k).map_err(ExecError::Engine)?.clone();
            s.push(v).map_err(ExecError::Engine)
        });
        stackfn!(entries, "ROT", |s: &mut ExecStack| s
            .rot()
            .map_err(ExecError::Engine));
        stackfn!(entries, "ROLL", |s: &mut ExecStack| {
            let n = require_index(s, "ROLL")?;
            s.roll(n).map_err(ExecError::Engine)
        });
        stackfn!(entries, "ROLLD", |s: &mut ExecStack| {
            let n = require_index(s, "ROLLD")?;
            s.rolld(n).map_err(ExecError::Engine)
        });
        stackfn!(entries, "PICK", |s: &mut ExecStack| {
            let n = require_index(s, "PICK")?;
            s.pick(n).map_err(ExecError::Engine)
        });
        stackfn!(entries, "HIDE", |s: &mut ExecStack| {
            let n = require_signed(s, "HIDE")?;
            if n >= 0 {
                s.hide(n as usize);
            } else {
                s.hide_keep((-n) as usize);
            }
            Ok(())
        });
        stackfn!(entries, "SHOW", |s: &mut ExecStack| {
            let n = require_signed(s, "SHOW")?;
            if n >= 0 {
                s.show(n as usize);
            } else {
                s.show_total((-n) as usize);
            }
            Ok(())
        });

        stackfn!(entries, "STORE", |s: &mut ExecStack| {
            let name = require_name(s, "STORE")?;
            let v = s.pop().map_err(ExecError::Engine)?;
            s.store(name, v).map_err(ExecError::Engine)
        });
        stackfn!(entries, "LOAD", |s: &mut ExecStack| {
            let name = require_name(s, "LOAD")?;
            let v = s
                .load(&name)
                .ok_or_else(|| EngineError::UnknownSymbol(name.clone()))
                .map_err(ExecError::Engine)?;
            s.push(v).map_err(ExecError::Engine)
        });
        stackfn!(entries, "FORGET", |s: &mut ExecStack| {
            s.forget(None);
            Ok(())
        });

        stackfn!(entries, "SAVE", |s: &mut ExecStack| {
            let ctx = s.save();
            s.push(ctx).map_err(ExecError::Engine)
        });
        stackfn!(entries, "RESTORE", |s: &mut ExecStack| s
            .restore_from_top()
            .map_err(ExecError::Engine));

        stackfn!(entries, "RETURN", |_s: &mut ExecStack| Err(
            ExecError::Control(ControlFlow::Return(1))
        ));
        stackfn!(entries, "STOP", |_s: &mut ExecStack| Err(ExecError::Control(
            ControlFlow::Stop
        )));
        stackfn!(entries, "KILL", |_s: &mut ExecStack| Err(ExecError::Control(
            ControlFlow::Kill
        )));

        StaticResolver { entries }
    }
}

impl FunctionResolver for StaticResolver {
    fn lookup(&self, name: &str) -> Option<FunctionRef> {
        self.entries.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Limits;

    struct EmptyResolver;
    impl FunctionResolver for EmptyResolver {
        fn lookup(&self, _name: &str) -> Option<FunctionRef> {
            None
        }
    }

    struct OneFnResolver;
    impl FunctionResolver for OneFnResolver {
        fn lookup(&self, name: &str) -> Option<FunctionRef> {
            if name == "ADD" {
                Some(FunctionRef::StackFn(Rc::new(NamedFn::new("ADD", |_s| Ok(())))))
            } else {
                None
            }
        }
    }

    #[test]
    fn redef_table_is_consulted_first() {
        let mut stack = ExecStack::new(Limits::default());
        redefine(
            &mut stack,
            "ADD",
            Value::string("shadowed"),
            RedefPolicy::Unshadow,
        );
        let r = resolve(&stack, &OneFnResolver, "ADD").unwrap();
        assert!(!r.is_stack_fn());
    }

    #[test]
    fn unknown_function_fails() {
        let stack = ExecStack::new(Limits::default());
        let err = resolve(&stack, &EmptyResolver, "NOPE").unwrap_err();
        assert!(matches!(err, EngineError::UnknownFunction(n) if n == "NOPE"));
    }

    #[test]
    fn unshadow_removes_redefinition() {
        let mut stack = ExecStack::new(Limits::default());
        redefine(
            &mut stack,
            "ADD",
            Value::string("shadowed"),
            RedefPolicy::Unshadow,
        );
        redefine(&mut stack, "ADD", Value::Null, RedefPolicy::Unshadow);
        let r = resolve(&stack, &OneFnResolver, "ADD").unwrap();
        assert!(r.is_stack_fn(), "should fall through to the resolver");
    }

    #[test]
    fn stub_fails_with_is_undefined() {
        let mut stack = ExecStack::new(Limits::default());
        redefine(
            &mut stack,
            "ADD",
            Value::string("shadowed"),
            RedefPolicy::Unshadow,
        );
        redefine(&mut stack, "ADD", Value::Null, RedefPolicy::Stub);
        let f = resolve(&stack, &OneFnResolver, "ADD").unwrap();
        let FunctionRef::StackFn(sf) = f else {
            panic!("expected a stub stack-function")
        };
        let mut s = ExecStack::new(Limits::default());
        let err = sf.call(&mut s).unwrap_err();
        assert!(matches!(
            err,
            crate::error::ExecError::Engine(EngineError::UndefinedRedefinition(n)) if n == "ADD"
        ));
    }

    fn call_static(r: &StaticResolver, name: &str, s: &mut ExecStack) -> ExecResult<()> {
        match r.lookup(name).unwrap() {
            FunctionRef::StackFn(f) => f.call(s),
            FunctionRef::Value(v) => s.push((*v).clone()).map_err(ExecError::Engine),
        }
    }

    #[test]
    fn static_resolver_addition_and_comparison() {
        let r = StaticResolver::new();
        let mut s = ExecStack::new(Limits::default());
        s.push(Value::Int(1)).unwrap();
        s.push(Value::Int(2)).unwrap();
        call_static(&r, "+", &mut s).unwrap();
        assert!(matches!(s.get(0).unwrap(), Value::Int(3)));
    }

    #[test]
    fn static_resolver_nan_resolves_to_a_pushed_constant() {
        let r = StaticResolver::new();
        let fr = r.lookup("NaN").unwrap();
        assert!(!fr.is_stack_fn());
    }

    #[test]
    fn static_resolver_nan_reflexive_compare_via_ge() {
        let r = StaticResolver::new();
        let mut s = ExecStack::new(Limits::default());
        call_static(&r, "NaN", &mut s).unwrap();
        call_static(&r, "NaN", &mut s).unwrap();
        call_static(&r, ">=", &mut s).unwrap();
        assert_eq!(s.depth(), 1);
        assert!(matches!(s.get(0).unwrap(), Value::Bool(true)));
    }

    #[test]
    fn static_resolver_stack_ops_round_trip() {
        let r = StaticResolver::new();
        let mut s = ExecStack::new(Limits::default());
        s.push(Value::Int(1)).unwrap();
        s.push(Value::Int(2)).unwrap();
        s.push(Value::Int(3)).unwrap();
        call_static(&r, "ROT", &mut s).unwrap();
        assert!(matches!(s.get(0).unwrap(), Value::Int(1)));
        assert!(matches!(s.get(2).unwrap(), Value::Int(2)));
    }

    #[test]
    fn static_resolver_store_and_load_round_trip() {
        let r = StaticResolver::new();
        let mut s = ExecStack::new(Limits::default());
        s.push(Value::Int(42)).unwrap();
        s.push(Value::string("x")).unwrap();
        call_static(&r, "STORE", &mut s).unwrap();
        assert_eq!(s.depth(), 0);
        s.push(Value::string("x")).unwrap();
        call_static(&r, "LOAD", &mut s).unwrap();
        assert!(matches!(s.get(0).unwrap(), Value::Int(42)));
    }

    #[test]
    fn static_resolver_return_is_control_flow_not_an_error() {
        let r = StaticResolver::new();
        let mut s = ExecStack::new(Limits::default());
        let err = call_static(&r, "RETURN", &mut s).unwrap_err();
        assert!(matches!(err, ExecError::Control(ControlFlow::Return(1))));
    }

    #[test]
    fn static_resolver_heterogeneous_arithmetic_fails() {
        let r = StaticResolver::new();
        let mut s = ExecStack::new(Limits::default());
        s.push(Value::Int(1)).unwrap();
        s.push(Value::string("x")).unwrap();
        let err = call_static(&r, "+", &mut s).unwrap_err();
        assert!(matches!(
            err,
            ExecError::Engine(EngineError::HeterogeneousTypes { .. })
        ));
    }
}
