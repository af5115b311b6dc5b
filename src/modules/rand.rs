use ::rand::Rng;

use crate::lang::value::{Module, Value};
use crate::modules::{arg_int, expect_args, native, type_mismatch};

pub fn module() -> Module {
    Module::from_builtins(
        "rand",
        vec![
            native("int", |_, args| {
                expect_args("int", args, 1)?;
                let n = arg_int("int", &args[0])?;
                if n <= 0 {
                    return Err(Value::runtime_error("rand.int() bound must be positive"));
                }
                Ok(Value::Int(::rand::thread_rng().gen_range(0..n)))
            }),
            native("float", |_, args| {
                expect_args("float", args, 0)?;
                Ok(Value::Float(::rand::thread_rng().r#gen::<f64>()))
            }),
            native("choice", |_, args| {
                expect_args("choice", args, 1)?;
                let Value::List(items) = &args[0] else {
                    return Err(type_mismatch("choice", "a list", &args[0]));
                };
                let items = items.borrow();
                if items.is_empty() {
                    return Err(Value::runtime_error("rand.choice() of an empty list"));
                }
                Ok(items[::rand::thread_rng().gen_range(0..items.len())].clone())
            }),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testing::call_member;

    #[test]
    fn test_int_in_bounds() {
        let m = module();
        for _ in 0..100 {
            let Value::Int(n) = call_member(&m, "int", &[Value::Int(3)]) else { panic!("not an int") };
            assert!((0..3).contains(&n));
        }
        assert!(matches!(call_member(&m, "int", &[Value::Int(0)]), Value::Error(_)));
    }

    #[test]
    fn test_float_in_unit_interval() {
        let Value::Float(f) = call_member(&module(), "float", &[]) else { panic!("not a float") };
        assert!((0.0..1.0).contains(&f));
    }

    #[test]
    fn test_choice() {
        let list = Value::list(vec![Value::Int(7)]);
        assert_eq!(call_member(&module(), "choice", &[list]), Value::Int(7));
        assert!(matches!(call_member(&module(), "choice", &[Value::list(vec![])]), Value::Error(_)));
    }
}
