use crate::lang::value::{Module, Value};
use crate::modules::{arg_int, arg_str, expect_args, native, type_mismatch};
use crate::runtime::ops::repeat_len;

fn one_str(name: &'static str, f: fn(&str) -> String) -> crate::lang::value::Builtin {
    native(name, move |_, args| {
        expect_args(name, args, 1)?;
        Ok(Value::str(f(arg_str(name, &args[0])?)))
    })
}

fn predicate(name: &'static str, f: fn(&str, &str) -> bool) -> crate::lang::value::Builtin {
    native(name, move |_, args| {
        expect_args(name, args, 2)?;
        Ok(Value::Bool(f(arg_str(name, &args[0])?, arg_str(name, &args[1])?)))
    })
}

pub fn module() -> Module {
    Module::from_builtins(
        "strings",
        vec![
            one_str("to_upper", str::to_uppercase),
            one_str("to_lower", str::to_lowercase),
            one_str("trim", |s| s.trim().to_string()),
            native("split", |_, args| {
                expect_args("split", args, 2)?;
                let s = arg_str("split", &args[0])?;
                let sep = arg_str("split", &args[1])?;
                let parts: Vec<Value> = if sep.is_empty() {
                    s.chars().map(|c| Value::str(c.to_string())).collect()
                } else {
                    s.split(sep).map(Value::str).collect()
                };
                Ok(Value::list(parts))
            }),
            native("join", |_, args| {
                expect_args("join", args, 2)?;
                let Value::List(items) = &args[0] else {
                    return Err(type_mismatch("join", "a list", &args[0]));
                };
                let sep = arg_str("join", &args[1])?;
                let parts = items
                    .borrow()
                    .iter()
                    .map(|v| arg_str("join", v).map(str::to_string))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::str(parts.join(sep)))
            }),
            predicate("contains", |s, sub| s.contains(sub)),
            predicate("has_prefix", |s, p| s.starts_with(p)),
            predicate("has_suffix", |s, p| s.ends_with(p)),
            native("replace", |_, args| {
                expect_args("replace", args, 3)?;
                let s = arg_str("replace", &args[0])?;
                let from = arg_str("replace", &args[1])?;
                let to = arg_str("replace", &args[2])?;
                Ok(Value::str(s.replace(from, to)))
            }),
            native("repeat", |_, args| {
                expect_args("repeat", args, 2)?;
                let s = arg_str("repeat", &args[0])?;
                let n = arg_int("repeat", &args[1])?;
                if n < 0 {
                    return Err(Value::runtime_error("repeat() count must not be negative"));
                }
                if repeat_len(s.len(), n).is_none() {
                    return Err(Value::runtime_error(format!("repeat count too large ({})", n)));
                }
                Ok(Value::str(if s.is_empty() { String::new() } else { s.repeat(n as usize) }))
            }),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testing::{assert_type_error, call_member};

    fn call(name: &str, args: &[Value]) -> Value {
        call_member(&module(), name, args)
    }

    #[test]
    fn test_case_and_trim() {
        assert_eq!(call("to_upper", &[Value::str("abc")]), Value::str("ABC"));
        assert_eq!(call("to_lower", &[Value::str("AbC")]), Value::str("abc"));
        assert_eq!(call("trim", &[Value::str("  x \n")]), Value::str("x"));
    }

    #[test]
    fn test_split_and_join() {
        let parts = call("split", &[Value::str("a,b,c"), Value::str(",")]);
        assert_eq!(parts, Value::list(vec![Value::str("a"), Value::str("b"), Value::str("c")]));
        assert_eq!(call("join", &[parts, Value::str("-")]), Value::str("a-b-c"));
        assert_type_error(
            &call("join", &[Value::list(vec![Value::Int(1)]), Value::str("")]),
            "expected a string argument (got int)",
        );
    }

    #[test]
    fn test_predicates_and_replace() {
        assert_eq!(call("contains", &[Value::str("cinder"), Value::str("nde")]), Value::Bool(true));
        assert_eq!(call("has_prefix", &[Value::str("cinder"), Value::str("ci")]), Value::Bool(true));
        assert_eq!(call("has_suffix", &[Value::str("cinder"), Value::str("ci")]), Value::Bool(false));
        assert_eq!(
            call("replace", &[Value::str("a-a"), Value::str("a"), Value::str("b")]),
            Value::str("b-b")
        );
        assert_eq!(call("repeat", &[Value::str("ab"), Value::Int(2)]), Value::str("abab"));
    }

    #[test]
    fn test_repeat_rejects_huge_counts() {
        let out = call("repeat", &[Value::str("ab"), Value::Int(i64::MAX)]);
        assert!(matches!(out, Value::Error(ref e) if e.message.contains("repeat count too large")));
        assert_eq!(call("repeat", &[Value::str(""), Value::Int(i64::MAX)]), Value::str(""));
    }
}
