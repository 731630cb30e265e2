// ABOUTME: Core value operations (comparison) with reflexive-NaN and homogeneous-type rules

use crate::error::EngineError;
use crate::value::Value;

/// The six comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn name(&self) -> &'static str {
        match self {
            CompareOp::Eq => "EQ",
            CompareOp::Ne => "NE",
            CompareOp::Lt => "LT",
            CompareOp::Le => "LE",
            CompareOp::Gt => "GT",
            CompareOp::Ge => "GE",
        }
    }
}

/// Numeric comparison honoring the reflexive-NaN special case of §4.1/§8:
/// `NaN cmp NaN` is treated as equal for `=`, `>=`, `<=` and unequal for
/// `<`, `>`; mixing NaN with a non-NaN value yields the strict relation
/// result (false for `>=`/`<=`/`=`/`>`/`<`, true for `!=`).
fn compare_f64(op: CompareOp, a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        let both_nan = a.is_nan() && b.is_nan();
        return match op {
            CompareOp::Eq | CompareOp::Ge | CompareOp::Le => both_nan,
            CompareOp::Ne => true,
            CompareOp::Lt | CompareOp::Gt => false,
        };
    }
    match op {
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
        CompareOp::Lt => a < b,
        CompareOp::Le => a <= b,
        CompareOp::Gt => a > b,
        CompareOp::Ge => a >= b,
    }
}

fn compare_i64(op: CompareOp, a: i64, b: i64) -> bool {
    match op {
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
        CompareOp::Lt => a < b,
        CompareOp::Le => a <= b,
        CompareOp::Gt => a > b,
        CompareOp::Ge => a >= b,
    }
}

fn compare_str(op: CompareOp, a: &str, b: &str) -> bool {
    match op {
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
        CompareOp::Lt => a < b,
        CompareOp::Le => a <= b,
        CompareOp::Gt => a > b,
        CompareOp::Ge => a >= b,
    }
}

/// Both operands numeric → numeric compare (mixed int/float is promoted to
/// double); both strings → lexicographic on code points; anything else
/// (including one numeric + one string) → `HeterogeneousTypes`.
pub fn compare(op: CompareOp, a: &Value, b: &Value) -> Result<bool, EngineError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(compare_i64(op, *x, *y)),
        (Value::Float(x), Value::Float(y)) => Ok(compare_f64(op, *x, *y)),
        (Value::Int(x), Value::Float(y)) => Ok(compare_f64(op, *x as f64, *y)),
        (Value::Float(x), Value::Int(y)) => Ok(compare_f64(op, *x, *y as f64)),
        (Value::String(x), Value::String(y)) => Ok(compare_str(op, x, y)),
        _ => Err(EngineError::HeterogeneousTypes {
            operator: op.name(),
            left: a.type_name(),
            right: b.type_name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_is_reflexive_for_eq_ge_le() {
        let nan = Value::Float(f64::NAN);
        assert!(compare(CompareOp::Eq, &nan, &nan).unwrap());
        assert!(compare(CompareOp::Ge, &nan, &nan).unwrap());
        assert!(compare(CompareOp::Le, &nan, &nan).unwrap());
        assert!(!compare(CompareOp::Lt, &nan, &nan).unwrap());
        assert!(!compare(CompareOp::Gt, &nan, &nan).unwrap());
    }

    #[test]
    fn nan_mixed_with_non_nan_is_strict() {
        let nan = Value::Float(f64::NAN);
        let one = Value::Float(1.0);
        assert!(!compare(CompareOp::Ge, &nan, &one).unwrap());
        assert!(!compare(CompareOp::Le, &nan, &one).unwrap());
        assert!(!compare(CompareOp::Eq, &nan, &one).unwrap());
        assert!(compare(CompareOp::Ne, &nan, &one).unwrap());
        assert!(!compare(CompareOp::Lt, &nan, &one).unwrap());
        assert!(!compare(CompareOp::Gt, &nan, &one).unwrap());
    }

    #[test]
    fn ge_is_negation_of_lt_for_non_nan() {
        let pairs = [(1i64, 2i64), (5, 5), (9, -3)];
        for (a, b) in pairs {
            let va = Value::Int(a);
            let vb = Value::Int(b);
            let ge = compare(CompareOp::Ge, &va, &vb).unwrap();
            let lt = compare(CompareOp::Lt, &va, &vb).unwrap();
            assert_eq!(ge, !lt);
            let eq = compare(CompareOp::Eq, &va, &vb).unwrap();
            let le = compare(CompareOp::Le, &va, &vb).unwrap();
            assert_eq!(eq, ge && le);
        }
    }

    #[test]
    fn heterogeneous_types_fail() {
        let err = compare(CompareOp::Eq, &Value::Int(1), &Value::string("1")).unwrap_err();
        assert!(matches!(err, EngineError::HeterogeneousTypes { .. }));
    }

    #[test]
    fn strings_compare_lexicographically() {
        assert!(compare(CompareOp::Lt, &Value::string("abc"), &Value::string("abd")).unwrap());
        assert!(compare(CompareOp::Eq, &Value::string("x"), &Value::string("x")).unwrap());
    }
}
