//! Operator semantics shared by the dispatch loop: arithmetic, comparison,
//! unary operators and subscripting.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::bytecode::op::{BinaryOpType, CompareOpType};
use crate::lang::value::{HashKey, Value};
use crate::runtime::runtime_error::{RuntimeError, division_by_zero, index_out_of_bounds};

fn unsupported(symbol: &str, a: &Value, b: &Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "unsupported operand types for {}: '{}' and '{}'",
        symbol,
        a.type_name(),
        b.type_name()
    ))
}

fn overflow(symbol: &str) -> RuntimeError {
    RuntimeError::runtime(format!("integer overflow in '{}'", symbol))
}

fn hash_key(value: &Value) -> Result<HashKey, RuntimeError> {
    HashKey::try_from(value).map_err(RuntimeError::type_error)
}

/// Resolve a possibly negative index against `len`.
fn normalize_index(index: i64, len: usize) -> Result<usize, RuntimeError> {
    let resolved = if index < 0 { index + len as i64 } else { index };
    if resolved < 0 || resolved as usize >= len {
        return Err(index_out_of_bounds(index, len));
    }
    Ok(resolved as usize)
}

/// Longest string (bytes) or list (items) that `*` or `strings.repeat` may
/// build.
pub const MAX_REPEAT_LEN: usize = 1 << 28;

/// Length of `unit` repeated `count` times, or `None` past `MAX_REPEAT_LEN`.
/// Non-positive counts and empty units give zero.
pub fn repeat_len(unit: usize, count: i64) -> Option<usize> {
    if count <= 0 || unit == 0 {
        return Some(0);
    }
    usize::try_from(count)
        .ok()
        .and_then(|n| unit.checked_mul(n))
        .filter(|len| *len <= MAX_REPEAT_LEN)
}

fn repeat_too_large(count: i64) -> RuntimeError {
    RuntimeError::runtime(format!("repeat count too large ({})", count))
}

fn repeat_str(s: &str, count: i64) -> Result<Value, RuntimeError> {
    let len = repeat_len(s.len(), count).ok_or_else(|| repeat_too_large(count))?;
    Ok(Value::str(if len == 0 { String::new() } else { s.repeat(len / s.len()) }))
}

fn repeat_list(items: &[Value], count: i64) -> Result<Value, RuntimeError> {
    let len = repeat_len(items.len(), count).ok_or_else(|| repeat_too_large(count))?;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        out.extend_from_slice(items);
    }
    Ok(Value::list(out))
}

pub fn binary_op(op: BinaryOpType, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    use BinaryOpType::*;
    let sym = op.symbol();

    match op {
        Add => match (a, b) {
            (Value::Int(x), Value::Int(y)) => x.checked_add(*y).map(Value::Int).ok_or_else(|| overflow(sym)),
            (Value::Str(x), Value::Str(y)) => Ok(Value::str(format!("{}{}", x, y))),
            (Value::List(x), Value::List(y)) => {
                let mut items = x.borrow().clone();
                items.extend(y.borrow().iter().cloned());
                Ok(Value::list(items))
            }
            _ => float_op(a, b, sym, |x, y| x + y),
        },
        Subtract => match (a, b) {
            (Value::Int(x), Value::Int(y)) => x.checked_sub(*y).map(Value::Int).ok_or_else(|| overflow(sym)),
            _ => float_op(a, b, sym, |x, y| x - y),
        },
        Multiply => match (a, b) {
            (Value::Int(x), Value::Int(y)) => x.checked_mul(*y).map(Value::Int).ok_or_else(|| overflow(sym)),
            (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) => repeat_str(s, *n),
            (Value::List(items), Value::Int(n)) | (Value::Int(n), Value::List(items)) => {
                repeat_list(items.borrow().as_slice(), *n)
            }
            _ => float_op(a, b, sym, |x, y| x * y),
        },
        Divide => match (a, b) {
            (Value::Int(_), Value::Int(0)) => Err(division_by_zero()),
            (Value::Int(x), Value::Int(y)) => x.checked_div(*y).map(Value::Int).ok_or_else(|| overflow(sym)),
            _ => {
                if b.as_f64() == Some(0.0) && a.as_f64().is_some() {
                    return Err(division_by_zero());
                }
                float_op(a, b, sym, |x, y| x / y)
            }
        },
        Modulo => match (a, b) {
            (Value::Int(_), Value::Int(0)) => Err(division_by_zero()),
            (Value::Int(x), Value::Int(y)) => x.checked_rem(*y).map(Value::Int).ok_or_else(|| overflow(sym)),
            _ => {
                if b.as_f64() == Some(0.0) && a.as_f64().is_some() {
                    return Err(division_by_zero());
                }
                float_op(a, b, sym, |x, y| x % y)
            }
        },
        Power => match (a, b) {
            (Value::Int(x), Value::Int(y)) if *y >= 0 => {
                let exp = u32::try_from(*y).map_err(|_| overflow(sym))?;
                x.checked_pow(exp).map(Value::Int).ok_or_else(|| overflow(sym))
            }
            _ => float_op(a, b, sym, f64::powf),
        },
        And | Or | Xor => bitwise(op, a, b),
        LShift | RShift => match (a, b) {
            (Value::Int(x), Value::Int(y)) => {
                if !(0..64).contains(y) {
                    return Err(RuntimeError::runtime(format!("shift count {} out of range", y)));
                }
                Ok(Value::Int(if op == LShift { x << y } else { x >> y }))
            }
            _ => Err(unsupported(sym, a, b)),
        },
    }
}

fn float_op(a: &Value, b: &Value, sym: &str, f: impl Fn(f64, f64) -> f64) -> Result<Value, RuntimeError> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(Value::Float(f(x, y))),
        _ => Err(unsupported(sym, a, b)),
    }
}

fn bitwise(op: BinaryOpType, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(match op {
            BinaryOpType::And => x & y,
            BinaryOpType::Or => x | y,
            _ => x ^ y,
        })),
        (Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(match op {
            BinaryOpType::And => *x && *y,
            BinaryOpType::Or => *x || *y,
            _ => x ^ y,
        })),
        (Value::Set(x), Value::Set(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            let items = match op {
                BinaryOpType::And => x.intersection(&*y).cloned().collect(),
                BinaryOpType::Or => x.union(&*y).cloned().collect(),
                _ => x.symmetric_difference(&*y).cloned().collect(),
            };
            Ok(Value::set(items))
        }
        _ => Err(unsupported(op.symbol(), a, b)),
    }
}

pub fn compare_op(op: CompareOpType, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    use CompareOpType::*;
    let result = match op {
        Equal => a == b,
        NotEqual => a != b,
        _ => {
            let ordering = ordering(a, b).ok_or_else(|| {
                RuntimeError::type_error(format!(
                    "'{}' not supported between '{}' and '{}'",
                    op.symbol(),
                    a.type_name(),
                    b.type_name()
                ))
            })?;
            match op {
                LessThan => ordering == Ordering::Less,
                LessThanOrEqual => ordering != Ordering::Greater,
                GreaterThan => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }
        }
    };
    Ok(Value::Bool(result))
}

/// Ordering of numbers and strings; `None` for anything else (and NaN).
pub fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

pub fn unary_negative(v: &Value) -> Result<Value, RuntimeError> {
    match v {
        Value::Int(n) => n.checked_neg().map(Value::Int).ok_or_else(|| overflow("-")),
        Value::Float(n) => Ok(Value::Float(-n)),
        other => Err(RuntimeError::type_error(format!("bad operand type for unary -: '{}'", other.type_name()))),
    }
}

pub fn unary_positive(v: &Value) -> Result<Value, RuntimeError> {
    match v {
        Value::Int(_) | Value::Float(_) => Ok(v.clone()),
        other => Err(RuntimeError::type_error(format!("bad operand type for unary +: '{}'", other.type_name()))),
    }
}

pub fn unary_invert(v: &Value) -> Result<Value, RuntimeError> {
    match v {
        Value::Int(n) => Ok(Value::Int(!n)),
        other => Err(RuntimeError::type_error(format!("bad operand type for unary ~: '{}'", other.type_name()))),
    }
}

pub fn get_subscript(container: &Value, key: &Value) -> Result<Value, RuntimeError> {
    match (container, key) {
        (Value::List(items), Value::Int(i)) => {
            let items = items.borrow();
            let idx = normalize_index(*i, items.len())?;
            Ok(items[idx].clone())
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(*i, chars.len())?;
            Ok(Value::str(chars[idx].to_string()))
        }
        (Value::Map(entries), key) => Ok(entries.borrow().get(&hash_key(key)?).cloned().unwrap_or(Value::Nil)),
        (Value::List(_) | Value::Str(_), key) => Err(RuntimeError::type_error(format!(
            "{} indices must be int, not {}",
            container.type_name(),
            key.type_name()
        ))),
        _ => Err(RuntimeError::type_error(format!(
            "'{}' object is not subscriptable",
            container.type_name()
        ))),
    }
}

pub fn set_subscript(container: &Value, key: &Value, value: Value) -> Result<(), RuntimeError> {
    match (container, key) {
        (Value::List(items), Value::Int(i)) => {
            let mut items = items.borrow_mut();
            let idx = normalize_index(*i, items.len())?;
            items[idx] = value;
            Ok(())
        }
        (Value::Map(entries), key) => {
            let key = hash_key(key)?;
            entries.borrow_mut().insert(key, value);
            Ok(())
        }
        _ => Err(RuntimeError::type_error(format!(
            "'{}' object does not support item assignment",
            container.type_name()
        ))),
    }
}

pub fn delete_subscript(container: &Value, key: &Value) -> Result<(), RuntimeError> {
    match (container, key) {
        (Value::List(items), Value::Int(i)) => {
            let mut items = items.borrow_mut();
            let idx = normalize_index(*i, items.len())?;
            items.remove(idx);
            Ok(())
        }
        (Value::Map(entries), key) => {
            entries.borrow_mut().shift_remove(&hash_key(key)?);
            Ok(())
        }
        (Value::Set(items), key) => {
            items.borrow_mut().shift_remove(&hash_key(key)?);
            Ok(())
        }
        _ => Err(RuntimeError::type_error(format!(
            "'{}' object does not support item deletion",
            container.type_name()
        ))),
    }
}

pub fn get_attr(object: &Value, name: &Rc<str>) -> Result<Value, RuntimeError> {
    match object {
        Value::Map(entries) => Ok(entries
            .borrow()
            .get(&HashKey::Str(name.clone()))
            .cloned()
            .unwrap_or(Value::Nil)),
        Value::Module(module) => module.get(name).cloned().ok_or_else(|| {
            RuntimeError::runtime(format!("module '{}' has no attribute '{}'", module.name, name))
        }),
        other => Err(RuntimeError::type_error(format!(
            "'{}' object has no attribute '{}'",
            other.type_name(),
            name
        ))),
    }
}

pub fn set_attr(object: &Value, name: &Rc<str>, value: Value) -> Result<(), RuntimeError> {
    match object {
        Value::Map(entries) => {
            entries.borrow_mut().insert(HashKey::Str(name.clone()), value);
            Ok(())
        }
        Value::Module(module) => Err(RuntimeError::type_error(format!(
            "cannot set attribute '{}' on read-only module '{}'",
            name, module.name
        ))),
        other => Err(RuntimeError::type_error(format!(
            "cannot set attribute '{}' on '{}'",
            name,
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::runtime_error::ErrorKind;
    use indexmap::{IndexMap, IndexSet};

    fn bin(op: BinaryOpType, a: Value, b: Value) -> Result<Value, RuntimeError> {
        binary_op(op, &a, &b)
    }

    #[test]
    fn test_int_arithmetic() {
        assert_eq!(bin(BinaryOpType::Add, Value::Int(2), Value::Int(3)).unwrap(), Value::Int(5));
        assert_eq!(bin(BinaryOpType::Divide, Value::Int(7), Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!(bin(BinaryOpType::Modulo, Value::Int(7), Value::Int(3)).unwrap(), Value::Int(1));
        assert_eq!(bin(BinaryOpType::Power, Value::Int(2), Value::Int(10)).unwrap(), Value::Int(1024));
    }

    #[test]
    fn test_mixed_promotes_to_float() {
        assert_eq!(bin(BinaryOpType::Add, Value::Int(1), Value::Float(0.5)).unwrap(), Value::Float(1.5));
        assert_eq!(bin(BinaryOpType::Power, Value::Int(2), Value::Int(-1)).unwrap(), Value::Float(0.5));
    }

    #[test]
    fn test_overflow_is_error() {
        let err = bin(BinaryOpType::Add, Value::Int(i64::MAX), Value::Int(1)).unwrap_err();
        assert!(err.message.contains("overflow"));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(bin(BinaryOpType::Divide, Value::Int(1), Value::Int(0)).is_err());
        assert!(bin(BinaryOpType::Modulo, Value::Int(1), Value::Int(0)).is_err());
        assert!(bin(BinaryOpType::Divide, Value::Float(1.0), Value::Float(0.0)).is_err());
    }

    #[test]
    fn test_string_and_list_operators() {
        assert_eq!(bin(BinaryOpType::Add, Value::str("ab"), Value::str("c")).unwrap(), Value::str("abc"));
        assert_eq!(bin(BinaryOpType::Multiply, Value::str("ab"), Value::Int(2)).unwrap(), Value::str("abab"));
        let l = bin(BinaryOpType::Multiply, Value::list(vec![Value::Int(1)]), Value::Int(3)).unwrap();
        assert_eq!(l, Value::list(vec![Value::Int(1); 3]));
    }

    #[test]
    fn test_type_error_names_operands() {
        let err = bin(BinaryOpType::Subtract, Value::str("a"), Value::Int(1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
        assert!(err.message.contains("'string' and 'int'"));
    }

    #[test]
    fn test_bitwise_and_sets() {
        assert_eq!(bin(BinaryOpType::Xor, Value::Int(6), Value::Int(3)).unwrap(), Value::Int(5));
        assert_eq!(bin(BinaryOpType::And, Value::Bool(true), Value::Bool(false)).unwrap(), Value::Bool(false));
        let a: IndexSet<HashKey> = [HashKey::Int(1), HashKey::Int(2)].into_iter().collect();
        let b: IndexSet<HashKey> = [HashKey::Int(2), HashKey::Int(3)].into_iter().collect();
        let both = bin(BinaryOpType::And, Value::set(a), Value::set(b)).unwrap();
        assert_eq!(both, Value::set([HashKey::Int(2)].into_iter().collect()));
    }

    #[test]
    fn test_shift_range() {
        assert_eq!(bin(BinaryOpType::LShift, Value::Int(1), Value::Int(4)).unwrap(), Value::Int(16));
        assert!(bin(BinaryOpType::RShift, Value::Int(1), Value::Int(64)).is_err());
    }

    #[test]
    fn test_comparisons() {
        let lt = compare_op(CompareOpType::LessThan, &Value::Int(1), &Value::Float(1.5)).unwrap();
        assert_eq!(lt, Value::Bool(true));
        let ge = compare_op(CompareOpType::GreaterThanOrEqual, &Value::str("b"), &Value::str("a")).unwrap();
        assert_eq!(ge, Value::Bool(true));
        assert!(compare_op(CompareOpType::LessThan, &Value::Int(1), &Value::str("a")).is_err());
        let eq = compare_op(CompareOpType::Equal, &Value::Int(1), &Value::str("a")).unwrap();
        assert_eq!(eq, Value::Bool(false));
    }

    #[test]
    fn test_list_subscript_negative_and_out_of_range() {
        let l = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(get_subscript(&l, &Value::Int(-1)).unwrap(), Value::Int(3));
        assert!(get_subscript(&l, &Value::Int(3)).is_err());
        set_subscript(&l, &Value::Int(0), Value::Int(9)).unwrap();
        delete_subscript(&l, &Value::Int(1)).unwrap();
        assert_eq!(l, Value::list(vec![Value::Int(9), Value::Int(3)]));
    }

    #[test]
    fn test_map_subscript_and_attrs() {
        let m = Value::map(IndexMap::new());
        set_subscript(&m, &Value::str("a"), Value::Int(1)).unwrap();
        assert_eq!(get_subscript(&m, &Value::str("a")).unwrap(), Value::Int(1));
        assert_eq!(get_subscript(&m, &Value::str("missing")).unwrap(), Value::Nil);
        set_attr(&m, &Rc::from("b"), Value::Int(2)).unwrap();
        assert_eq!(get_attr(&m, &Rc::from("b")).unwrap(), Value::Int(2));
        assert!(get_subscript(&m, &Value::Float(1.0)).is_err());
    }

    #[test]
    fn test_string_subscript_by_char() {
        assert_eq!(get_subscript(&Value::str("héllo"), &Value::Int(1)).unwrap(), Value::str("é"));
    }

    #[test]
    fn test_unary() {
        assert_eq!(unary_negative(&Value::Int(3)).unwrap(), Value::Int(-3));
        assert_eq!(unary_invert(&Value::Int(0)).unwrap(), Value::Int(-1));
        assert!(unary_positive(&Value::str("x")).is_err());
    }

    #[test]
    fn test_repeat_sequences() {
        let m = BinaryOpType::Multiply;
        assert_eq!(bin(m, Value::str("ab"), Value::Int(3)).unwrap(), Value::str("ababab"));
        assert_eq!(bin(m, Value::Int(-2), Value::str("ab")).unwrap(), Value::str(""));
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let twice = bin(m, list, Value::Int(2)).unwrap();
        assert_eq!(twice, Value::list([1, 2, 1, 2].into_iter().map(Value::Int).collect()));
    }

    #[test]
    fn test_huge_repeat_count_is_an_error() {
        let m = BinaryOpType::Multiply;
        let err = bin(m, Value::str("ab"), Value::Int(i64::MAX)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Runtime);
        assert!(err.message.contains("repeat count too large"));
        let err = bin(m, Value::list(vec![Value::Int(1)]), Value::Int(i64::MAX)).unwrap_err();
        assert!(err.message.contains("repeat count too large"));
    }

    #[test]
    fn test_empty_sequence_repeat_is_immediate() {
        let m = BinaryOpType::Multiply;
        assert_eq!(bin(m, Value::list(vec![]), Value::Int(i64::MAX)).unwrap(), Value::list(vec![]));
        assert_eq!(bin(m, Value::str(""), Value::Int(i64::MAX)).unwrap(), Value::str(""));
    }

    #[test]
    fn test_repeat_len_bounds() {
        assert_eq!(repeat_len(3, 4), Some(12));
        assert_eq!(repeat_len(0, i64::MAX), Some(0));
        assert_eq!(repeat_len(5, -1), Some(0));
        assert_eq!(repeat_len(2, i64::MAX), None);
        assert_eq!(repeat_len(1, MAX_REPEAT_LEN as i64 + 1), None);
    }
}
