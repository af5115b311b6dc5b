use std::cmp::Ordering;

use indexmap::IndexSet;

use crate::lang::value::{Builtin, HashKey, Outcome, Value};
use crate::modules::{NativeResult, arg_int, expect_args, expect_args_between, native, type_mismatch};
use crate::runtime::ops::{MAX_REPEAT_LEN, ordering};

/// The global builtin functions.
pub fn catalog() -> Vec<Builtin> {
    vec![
        native("len", |_, args| len(args)),
        native("type", |_, args| {
            expect_args("type", args, 1)?;
            Ok(Value::str(args[0].type_name()))
        }),
        native("str", |_, args| {
            expect_args("str", args, 1)?;
            Ok(match &args[0] {
                Value::Str(s) => Value::Str(s.clone()),
                other => Value::str(other.to_string()),
            })
        }),
        native("int", |_, args| to_int(args)),
        native("float", |_, args| to_float(args)),
        native("list", |_, args| to_list(args)),
        native("set", |_, args| to_set(args)),
        native("keys", |_, args| keys(args)),
        native("values", |_, args| values(args)),
        native("append", |_, args| append(args)),
        native("delete", |_, args| delete(args)),
        native("range", |_, args| range(args)),
        native("min", |_, args| extreme("min", args, Ordering::Less)),
        native("max", |_, args| extreme("max", args, Ordering::Greater)),
        native("abs", |_, args| {
            expect_args("abs", args, 1)?;
            match &args[0] {
                Value::Int(n) => n
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| Value::runtime_error("integer overflow in abs()")),
                Value::Float(n) => Ok(Value::Float(n.abs())),
                other => Err(type_mismatch("abs", "a number argument", other)),
            }
        }),
        native("ok", |_, args| {
            expect_args("ok", args, 1)?;
            Ok(Value::ok(args[0].clone()))
        }),
        native("err", |_, args| {
            expect_args("err", args, 1)?;
            Ok(Value::err(args[0].clone()))
        }),
        native("is_ok", |_, args| Ok(Value::Bool(matches!(outcome("is_ok", args)?, Outcome::Ok(_))))),
        native("is_err", |_, args| Ok(Value::Bool(matches!(outcome("is_err", args)?, Outcome::Err(_))))),
        native("unwrap", |_, args| match outcome("unwrap", args)? {
            Outcome::Ok(v) => Ok(v.clone()),
            Outcome::Err(e) => Err(Value::runtime_error(format!("unwrap() called on err({})", message_of(e)))),
        }),
        native("unwrap_or", |_, args| {
            expect_args("unwrap_or", args, 2)?;
            match outcome("unwrap_or", &args[..1])? {
                Outcome::Ok(v) => Ok(v.clone()),
                Outcome::Err(_) => Ok(args[1].clone()),
            }
        }),
        native("error_message", |_, args| {
            expect_args("error_message", args, 1)?;
            match &args[0] {
                Value::Error(e) => Ok(Value::str(&e.message)),
                Value::Result(r) => match r.as_ref() {
                    Outcome::Err(e) => Ok(Value::str(message_of(e))),
                    Outcome::Ok(_) => Ok(Value::Nil),
                },
                other => Err(type_mismatch("error_message", "an error or result", other)),
            }
        }),
    ]
}

fn message_of(value: &Value) -> String {
    match value {
        Value::Error(e) => e.message.clone(),
        other => other.to_string(),
    }
}

fn outcome<'a>(name: &str, args: &'a [Value]) -> Result<&'a Outcome, Value> {
    expect_args(name, args, 1)?;
    match &args[0] {
        Value::Result(r) => Ok(r),
        other => Err(type_mismatch(name, "a result", other)),
    }
}

fn len(args: &[Value]) -> NativeResult {
    expect_args("len", args, 1)?;
    let n = match &args[0] {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.borrow().len(),
        Value::Map(entries) => entries.borrow().len(),
        Value::Set(items) => items.borrow().len(),
        other => return Err(Value::type_error(format!("object of type '{}' has no len()", other.type_name()))),
    };
    Ok(Value::Int(n as i64))
}

fn to_int(args: &[Value]) -> NativeResult {
    expect_args("int", args, 1)?;
    match &args[0] {
        Value::Int(n) => Ok(Value::Int(*n)),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Float(f) if f.is_finite() && f.abs() < 9.2e18 => Ok(Value::Int(f.trunc() as i64)),
        Value::Float(f) => Err(Value::runtime_error(format!("cannot convert {} to int", f))),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| Value::runtime_error(format!("invalid literal for int(): {:?}", s))),
        other => Err(type_mismatch("int", "a number, bool or string", other)),
    }
}

fn to_float(args: &[Value]) -> NativeResult {
    expect_args("float", args, 1)?;
    match &args[0] {
        Value::Int(n) => Ok(Value::Float(*n as f64)),
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| Value::runtime_error(format!("invalid literal for float(): {:?}", s))),
        other => Err(type_mismatch("float", "a number or string", other)),
    }
}

fn to_list(args: &[Value]) -> NativeResult {
    expect_args_between("list", args, 0, 1)?;
    let items = match args.first() {
        None => Vec::new(),
        Some(Value::List(items)) => items.borrow().clone(),
        Some(Value::Set(items)) => items.borrow().iter().map(HashKey::to_value).collect(),
        Some(Value::Map(entries)) => entries.borrow().keys().map(HashKey::to_value).collect(),
        Some(Value::Str(s)) => s.chars().map(|c| Value::str(c.to_string())).collect(),
        Some(other) => return Err(type_mismatch("list", "an iterable", other)),
    };
    Ok(Value::list(items))
}

fn to_set(args: &[Value]) -> NativeResult {
    expect_args_between("set", args, 0, 1)?;
    let items: Vec<Value> = match args.first() {
        None => Vec::new(),
        Some(Value::Set(items)) => return Ok(Value::set(items.borrow().clone())),
        Some(Value::List(items)) => items.borrow().clone(),
        Some(Value::Str(s)) => s.chars().map(|c| Value::str(c.to_string())).collect(),
        Some(other) => return Err(type_mismatch("set", "a list, set or string", other)),
    };
    let set = items
        .iter()
        .map(HashKey::try_from)
        .collect::<Result<IndexSet<_>, _>>()
        .map_err(Value::type_error)?;
    Ok(Value::set(set))
}

fn keys(args: &[Value]) -> NativeResult {
    expect_args("keys", args, 1)?;
    match &args[0] {
        Value::Map(entries) => Ok(Value::list(entries.borrow().keys().map(HashKey::to_value).collect())),
        other => Err(type_mismatch("keys", "a map", other)),
    }
}

fn values(args: &[Value]) -> NativeResult {
    expect_args("values", args, 1)?;
    match &args[0] {
        Value::Map(entries) => Ok(Value::list(entries.borrow().values().cloned().collect())),
        other => Err(type_mismatch("values", "a map", other)),
    }
}

/// `append(list, items...)` mutates the list in place and returns it.
fn append(args: &[Value]) -> NativeResult {
    let Some((target, items)) = args.split_first() else {
        return Err(Value::arity_error("append() takes at least 1 argument (0 given)"));
    };
    match target {
        Value::List(list) => {
            list.borrow_mut().extend(items.iter().cloned());
            Ok(target.clone())
        }
        other => Err(type_mismatch("append", "a list", other)),
    }
}

/// `delete(container, key)` removes an entry and returns it (nil when absent).
fn delete(args: &[Value]) -> NativeResult {
    expect_args("delete", args, 2)?;
    let key = || HashKey::try_from(&args[1]).map_err(Value::type_error);
    match &args[0] {
        Value::Map(entries) => Ok(entries.borrow_mut().shift_remove(&key()?).unwrap_or(Value::Nil)),
        Value::Set(items) => {
            let key = key()?;
            Ok(if items.borrow_mut().shift_remove(&key) {
                key.to_value()
            } else {
                Value::Nil
            })
        }
        Value::List(items) => {
            let idx = arg_int("delete", &args[1])?;
            let mut items = items.borrow_mut();
            let len = items.len() as i64;
            let pos = if idx < 0 { idx + len } else { idx };
            if pos < 0 || pos >= len {
                return Err(Value::runtime_error(format!(
                    "index {} out of range for list of length {}",
                    idx, len
                )));
            }
            Ok(items.remove(pos as usize))
        }
        other => Err(type_mismatch("delete", "a map, set or list", other)),
    }
}

fn range(args: &[Value]) -> NativeResult {
    expect_args_between("range", args, 1, 3)?;
    let ints = args
        .iter()
        .map(|a| arg_int("range", a))
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(Value::arity_error("range() takes from 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(Value::runtime_error("range() step must not be zero"));
    }
    let span = (i128::from(stop) - i128::from(start)) * i128::from(step.signum());
    let len = if span <= 0 { 0 } else { (span + i128::from(step).abs() - 1) / i128::from(step).abs() };
    if len > MAX_REPEAT_LEN as i128 {
        return Err(Value::runtime_error(format!("range() too large ({} items)", len)));
    }
    let mut items = Vec::with_capacity(len as usize);
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        items.push(Value::Int(i));
        i = match i.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(Value::list(items))
}

/// `min`/`max` over the arguments, or over a single list argument.
fn extreme(name: &str, args: &[Value], keep: Ordering) -> NativeResult {
    let candidates: Vec<Value> = match args {
        [] => return Err(Value::arity_error(format!("{}() expected at least 1 argument (0 given)", name))),
        [Value::List(items)] => items.borrow().clone(),
        _ => args.to_vec(),
    };
    let mut iter = candidates.into_iter();
    let Some(mut best) = iter.next() else {
        return Err(Value::runtime_error(format!("{}() of an empty list", name)));
    };
    for candidate in iter {
        match ordering(&candidate, &best) {
            Some(o) if o == keep => best = candidate,
            Some(_) => {}
            None => {
                return Err(Value::type_error(format!(
                    "{}() cannot compare {} and {}",
                    name,
                    candidate.type_name(),
                    best.type_name()
                )));
            }
        }
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::value::Module;
    use crate::modules::testing::{assert_type_error, call_member};
    use crate::runtime::runtime_error::ErrorKind;

    fn call(name: &str, args: &[Value]) -> Value {
        let module = Module::from_builtins("builtins", catalog());
        call_member(&module, name, args)
    }

    fn ints(values: &[i64]) -> Value {
        Value::list(values.iter().map(|n| Value::Int(*n)).collect())
    }

    #[test]
    fn test_len() {
        assert_eq!(call("len", &[Value::str("héllo")]), Value::Int(5));
        assert_eq!(call("len", &[ints(&[1, 2, 3])]), Value::Int(3));
        assert_type_error(&call("len", &[Value::Int(1)]), "has no len()");
    }

    #[test]
    fn test_conversions() {
        assert_eq!(call("int", &[Value::Float(3.9)]), Value::Int(3));
        assert_eq!(call("int", &[Value::str(" 42 ")]), Value::Int(42));
        assert_eq!(call("float", &[Value::Int(2)]), Value::Float(2.0));
        assert_eq!(call("str", &[Value::Int(7)]), Value::str("7"));
        assert_eq!(call("type", &[Value::Nil]), Value::str("nil"));
        assert!(matches!(call("int", &[Value::str("x")]), Value::Error(e) if e.kind == ErrorKind::Runtime));
    }

    #[test]
    fn test_list_and_set() {
        assert_eq!(call("list", &[Value::str("ab")]), Value::list(vec![Value::str("a"), Value::str("b")]));
        let set = call("set", &[ints(&[1, 1, 2])]);
        assert_eq!(call("len", &[set]), Value::Int(2));
        assert_type_error(&call("set", &[Value::list(vec![ints(&[1])])]), "unhashable");
    }

    #[test]
    fn test_append_mutates_in_place() {
        let list = ints(&[1]);
        call("append", &[list.clone(), Value::Int(2), Value::Int(3)]);
        assert_eq!(list, ints(&[1, 2, 3]));
    }

    #[test]
    fn test_delete() {
        let list = ints(&[1, 2, 3]);
        assert_eq!(call("delete", &[list.clone(), Value::Int(-1)]), Value::Int(3));
        assert_eq!(list, ints(&[1, 2]));
    }

    #[test]
    fn test_range() {
        assert_eq!(call("range", &[Value::Int(3)]), ints(&[0, 1, 2]));
        assert_eq!(call("range", &[Value::Int(5), Value::Int(0), Value::Int(-2)]), ints(&[5, 3, 1]));
        assert!(matches!(call("range", &[Value::Int(1), Value::Int(2), Value::Int(0)]), Value::Error(_)));
    }

    #[test]
    fn test_range_too_large() {
        let out = call("range", &[Value::Int(i64::MIN), Value::Int(i64::MAX)]);
        assert!(matches!(out, Value::Error(ref e) if e.message.contains("range() too large")));
        assert_eq!(call("range", &[Value::Int(i64::MAX - 1), Value::Int(i64::MAX)]), ints(&[i64::MAX - 1]));
    }

    #[test]
    fn test_min_max() {
        assert_eq!(call("min", &[Value::Int(3), Value::Float(1.5), Value::Int(2)]), Value::Float(1.5));
        assert_eq!(call("max", &[ints(&[4, 9, 2])]), Value::Int(9));
        assert_type_error(&call("max", &[Value::Int(1), Value::str("a")]), "cannot compare");
    }

    #[test]
    fn test_results() {
        let ok = call("ok", &[Value::Int(1)]);
        let err = call("err", &[Value::str("boom")]);
        assert_eq!(call("is_ok", &[ok.clone()]), Value::Bool(true));
        assert_eq!(call("is_err", &[err.clone()]), Value::Bool(true));
        assert_eq!(call("unwrap", &[ok]), Value::Int(1));
        assert_eq!(call("unwrap_or", &[err.clone(), Value::Int(0)]), Value::Int(0));
        assert_eq!(call("error_message", &[err.clone()]), Value::str("boom"));
        match call("unwrap", &[err]) {
            Value::Error(e) => assert!(e.message.contains("err(boom)")),
            other => panic!("expected error, got {}", other),
        }
    }
}
