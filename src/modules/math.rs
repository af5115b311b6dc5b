use std::rc::Rc;

use indexmap::IndexMap;

use crate::lang::value::{Builtin, Module, Value};
use crate::modules::{NativeResult, arg_number, expect_args, native};
use crate::runtime::ops::ordering;

fn unary(name: &'static str, f: fn(f64) -> f64) -> Builtin {
    native(name, move |_, args| {
        expect_args(name, args, 1)?;
        Ok(Value::Float(f(arg_number(name, &args[0])?)))
    })
}

/// Integer-preserving variant for functions like `floor` whose result is
/// integral.
fn rounding(name: &'static str, f: fn(f64) -> f64) -> Builtin {
    native(name, move |_, args| {
        expect_args(name, args, 1)?;
        match &args[0] {
            Value::Int(n) => Ok(Value::Int(*n)),
            other => {
                let x = f(arg_number(name, other)?);
                if x.is_finite() && x.abs() < 9.2e18 {
                    Ok(Value::Int(x as i64))
                } else {
                    Ok(Value::Float(x))
                }
            }
        }
    })
}

fn pick(name: &'static str, args: &[Value], keep_right: fn(&Value, &Value) -> bool) -> NativeResult {
    expect_args(name, args, 2)?;
    let (a, b) = (&args[0], &args[1]);
    arg_number(name, a)?;
    arg_number(name, b)?;
    Ok(if keep_right(a, b) { b.clone() } else { a.clone() })
}

pub fn module() -> Module {
    let mut members: IndexMap<Rc<str>, Value> = IndexMap::new();
    members.insert(Rc::from("pi"), Value::Float(std::f64::consts::PI));
    members.insert(Rc::from("e"), Value::Float(std::f64::consts::E));
    members.insert(Rc::from("inf"), Value::Float(f64::INFINITY));

    let functions = vec![
        unary("sqrt", f64::sqrt),
        rounding("floor", f64::floor),
        rounding("ceil", f64::ceil),
        native("abs", |_, args| {
            expect_args("abs", args, 1)?;
            match &args[0] {
                Value::Int(n) => n
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| Value::runtime_error("integer overflow in abs()")),
                other => Ok(Value::Float(arg_number("abs", other)?.abs())),
            }
        }),
        native("pow", |_, args| {
            expect_args("pow", args, 2)?;
            let base = arg_number("pow", &args[0])?;
            let exp = arg_number("pow", &args[1])?;
            Ok(Value::Float(base.powf(exp)))
        }),
        native("min", |_, args| {
            pick("min", args, |a, b| ordering(b, a) == Some(std::cmp::Ordering::Less))
        }),
        native("max", |_, args| {
            pick("max", args, |a, b| ordering(b, a) == Some(std::cmp::Ordering::Greater))
        }),
        unary("sin", f64::sin),
        unary("cos", f64::cos),
        unary("tan", f64::tan),
        unary("log", f64::ln),
        unary("exp", f64::exp),
    ];
    for f in functions {
        members.insert(f.name.clone(), Value::Builtin(Rc::new(f)));
    }
    Module::new("math", members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testing::{assert_type_error, call_member};

    #[test]
    fn test_constants() {
        let m = module();
        assert_eq!(m.get("pi"), Some(&Value::Float(std::f64::consts::PI)));
        assert!(matches!(m.get("inf"), Some(Value::Float(f)) if f.is_infinite()));
    }

    #[test]
    fn test_functions() {
        let m = module();
        assert_eq!(call_member(&m, "sqrt", &[Value::Int(9)]), Value::Float(3.0));
        assert_eq!(call_member(&m, "floor", &[Value::Float(2.7)]), Value::Int(2));
        assert_eq!(call_member(&m, "ceil", &[Value::Float(2.1)]), Value::Int(3));
        assert_eq!(call_member(&m, "abs", &[Value::Int(-4)]), Value::Int(4));
        assert_eq!(call_member(&m, "pow", &[Value::Int(2), Value::Int(10)]), Value::Float(1024.0));
        assert_eq!(call_member(&m, "max", &[Value::Int(2), Value::Float(2.5)]), Value::Float(2.5));
        assert_eq!(call_member(&m, "min", &[Value::Int(2), Value::Float(2.5)]), Value::Int(2));
        assert_eq!(call_member(&m, "log", &[Value::Float(1.0)]), Value::Float(0.0));
    }

    #[test]
    fn test_rejects_non_numbers() {
        let m = module();
        assert_type_error(&call_member(&m, "sqrt", &[Value::str("4")]), "sqrt() expected a number argument");
    }
}
