use ::uuid::Uuid;

use crate::lang::value::{Module, Value};
use crate::modules::{expect_args, native};

pub fn module() -> Module {
    Module::from_builtins(
        "uuid",
        vec![native("v4", |_, args| {
            expect_args("v4", args, 0)?;
            Ok(Value::str(Uuid::new_v4().to_string()))
        })],
    )
}
