use crate::lang::value::{Module, Value};
use crate::modules::{arg_int, arg_str, expect_args, native};

pub fn module() -> Module {
    Module::from_builtins(
        "strconv",
        vec![
            native("atoi", |_, args| {
                expect_args("atoi", args, 1)?;
                let s = arg_str("atoi", &args[0])?;
                Ok(match s.parse::<i64>() {
                    Ok(n) => Value::ok(Value::Int(n)),
                    Err(e) => Value::external_err(format!("strconv.atoi: parsing {:?}: {}", s, e)),
                })
            }),
            native("atof", |_, args| {
                expect_args("atof", args, 1)?;
                let s = arg_str("atof", &args[0])?;
                Ok(match s.parse::<f64>() {
                    Ok(f) => Value::ok(Value::Float(f)),
                    Err(e) => Value::external_err(format!("strconv.atof: parsing {:?}: {}", s, e)),
                })
            }),
            native("itoa", |_, args| {
                expect_args("itoa", args, 1)?;
                Ok(Value::str(arg_int("itoa", &args[0])?.to_string()))
            }),
            native("parse_bool", |_, args| {
                expect_args("parse_bool", args, 1)?;
                let s = arg_str("parse_bool", &args[0])?;
                Ok(match s {
                    "1" | "t" | "T" | "true" | "TRUE" | "True" => Value::ok(Value::Bool(true)),
                    "0" | "f" | "F" | "false" | "FALSE" | "False" => Value::ok(Value::Bool(false)),
                    _ => Value::external_err(format!("strconv.parse_bool: parsing {:?}: invalid syntax", s)),
                })
            }),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::value::Outcome;
    use crate::modules::testing::{assert_type_error, call_member};

    fn ok_value(v: Value) -> Value {
        match v {
            Value::Result(r) => match r.as_ref() {
                Outcome::Ok(v) => v.clone(),
                Outcome::Err(e) => panic!("unexpected err({})", e),
            },
            other => panic!("expected a result, got {}", other),
        }
    }

    #[test]
    fn test_atoi() {
        let m = module();
        assert_eq!(ok_value(call_member(&m, "atoi", &[Value::str("-12")])), Value::Int(-12));
        let bad = call_member(&m, "atoi", &[Value::str("12x")]);
        assert!(matches!(bad, Value::Result(r) if matches!(r.as_ref(), Outcome::Err(_))));
        assert_type_error(&call_member(&m, "atoi", &[Value::Int(1)]), "atoi() expected a string");
    }

    #[test]
    fn test_atof_itoa_parse_bool() {
        let m = module();
        assert_eq!(ok_value(call_member(&m, "atof", &[Value::str("2.5")])), Value::Float(2.5));
        assert_eq!(call_member(&m, "itoa", &[Value::Int(42)]), Value::str("42"));
        assert_eq!(ok_value(call_member(&m, "parse_bool", &[Value::str("t")])), Value::Bool(true));
        assert!(matches!(
            call_member(&m, "parse_bool", &[Value::str("yes")]),
            Value::Result(r) if matches!(r.as_ref(), Outcome::Err(_))
        ));
    }
}
