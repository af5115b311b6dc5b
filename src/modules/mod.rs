//! Builtin functions and native modules installed in every session.
//!
//! Native functions are written as `fn(&mut CallContext, &[Value]) ->
//! Result<Value, Value>` so argument checks can use `?`; [`native`] folds the
//! error side back into the single `Value` a [`Builtin`] returns. A
//! `Value::Error` aborts the running chunk, while `Result` values are handed
//! to the script.

use crate::lang::value::{Builtin, Module, Value};
use crate::runtime::context::CallContext;
use crate::runtime::globals::{Globals, GlobalsBuilder};

pub mod builtins;
pub mod json;
pub mod math;
pub mod pgx;
pub mod rand;
pub mod strconv;
pub mod strings;
pub mod time;
pub mod uuid;

pub type NativeResult = Result<Value, Value>;

/// Wrap a fallible native function as a [`Builtin`].
pub fn native<F>(name: &str, func: F) -> Builtin
where
    F: Fn(&mut CallContext<'_>, &[Value]) -> NativeResult + 'static,
{
    Builtin::new(name, move |ctx, args| match func(ctx, args) {
        Ok(value) => value,
        Err(error) => error,
    })
}

/// Every native module, in registration order.
pub fn modules() -> Vec<Module> {
    vec![
        self::math::module(),
        self::json::module(),
        self::strings::module(),
        self::time::module(),
        self::uuid::module(),
        self::rand::module(),
        self::strconv::module(),
        self::pgx::module(),
    ]
}

/// Builtin layer of a new session. `extra` comes last so a host can shadow
/// catalog entries.
pub fn globals(extra: Vec<Builtin>) -> Globals {
    let builder: GlobalsBuilder = modules()
        .into_iter()
        .fold(Globals::builder().builtins(builtins::catalog()), |b, m| b.module(m));
    builder.builtins(extra).build()
}

// =============================================================================
// Argument helpers
// =============================================================================

pub fn expect_args(name: &str, args: &[Value], n: usize) -> Result<(), Value> {
    if args.len() != n {
        let plural = if n == 1 { "argument" } else { "arguments" };
        return Err(Value::arity_error(format!(
            "{}() takes exactly {} {} ({} given)",
            name,
            n,
            plural,
            args.len()
        )));
    }
    Ok(())
}

pub fn expect_args_between(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), Value> {
    if args.len() < min || args.len() > max {
        return Err(Value::arity_error(format!(
            "{}() takes from {} to {} arguments ({} given)",
            name,
            min,
            max,
            args.len()
        )));
    }
    Ok(())
}

pub fn type_mismatch(name: &str, expected: &str, got: &Value) -> Value {
    Value::type_error(format!("{}() expected {} (got {})", name, expected, got.type_name()))
}

pub fn arg_str<'a>(name: &str, value: &'a Value) -> Result<&'a str, Value> {
    value.as_str().ok_or_else(|| type_mismatch(name, "a string argument", value))
}

pub fn arg_int(name: &str, value: &Value) -> Result<i64, Value> {
    value.as_int().ok_or_else(|| type_mismatch(name, "an int argument", value))
}

pub fn arg_number(name: &str, value: &Value) -> Result<f64, Value> {
    value.as_f64().ok_or_else(|| type_mismatch(name, "a number argument", value))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::runtime::context::CancelToken;

    /// Call a member of a module the way the VM would.
    pub fn call_member(module: &Module, name: &str, args: &[Value]) -> Value {
        let Some(Value::Builtin(builtin)) = module.get(name) else {
            panic!("{} has no builtin {}", module.name, name);
        };
        let cancel = CancelToken::new();
        let mut ctx = CallContext::new(&cancel);
        builtin.call(&mut ctx, args)
    }

    pub fn assert_type_error(value: &Value, fragment: &str) {
        match value {
            Value::Error(e) => {
                assert_eq!(e.kind, crate::runtime::runtime_error::ErrorKind::Type, "{}", e.message);
                assert!(e.message.contains(fragment), "{:?} does not contain {:?}", e.message, fragment);
            }
            other => panic!("expected a type error, got {}", other),
        }
    }
}
