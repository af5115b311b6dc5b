//! PostgreSQL access through the blocking `postgres` client.
//!
//! Argument mistakes are type errors that abort the script; anything the
//! server or the network reports comes back as an `Err` result.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use postgres::types::{ToSql, Type};
use postgres::{Client, NoTls, Row};
use tracing::debug;

use crate::lang::value::{HashKey, Module, Resource, Value};
use crate::modules::{NativeResult, native};

/// An open (or closed) database connection held by a script.
pub struct Connection {
    client: RefCell<Option<Client>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.client.borrow().is_some() { "open" } else { "closed" };
        write!(f, "pgx.conn({})", state)
    }
}

impl Resource for Connection {
    fn type_name(&self) -> &'static str {
        "pgx.conn"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn module() -> Module {
    Module::from_builtins(
        "pgx",
        vec![
            native("connect", |_, args| connect(args)),
            native("exec", |_, args| exec(args)),
            native("query", |_, args| query(args)),
            native("close", |_, args| close(args)),
        ],
    )
}

fn connect(args: &[Value]) -> NativeResult {
    if args.len() != 1 {
        return Err(Value::type_error(format!(
            "pgx.connect() takes exactly one argument ({} given)",
            args.len()
        )));
    }
    let Value::Str(url) = &args[0] else {
        return Err(Value::type_error(format!(
            "pgx.connect() expected a string argument (got {})",
            args[0].type_name()
        )));
    };
    match Client::connect(url, NoTls) {
        Ok(client) => {
            debug!("pgx connection opened");
            let conn = Connection {
                client: RefCell::new(Some(client)),
            };
            Ok(Value::ok(Value::Resource(Rc::new(conn))))
        }
        Err(e) => Ok(Value::external_err(e.to_string())),
    }
}

/// Split `(conn, sql, params...)` and check each part's type.
fn statement<'a>(name: &str, args: &'a [Value]) -> Result<(&'a Connection, &'a str, Vec<Param>), Value> {
    if args.len() < 2 {
        return Err(Value::type_error(format!(
            "pgx.{}() takes at least two arguments ({} given)",
            name,
            args.len()
        )));
    }
    let conn = connection(name, &args[0])?;
    let Value::Str(sql) = &args[1] else {
        return Err(Value::type_error(format!(
            "pgx.{}() expected a string argument (got {})",
            name,
            args[1].type_name()
        )));
    };
    let params = args[2..]
        .iter()
        .map(|v| Param::try_from(v).map_err(|t| Value::type_error(format!("pgx.{}() cannot bind a {}", name, t))))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((conn, &**sql, params))
}

fn connection<'a>(name: &str, value: &'a Value) -> Result<&'a Connection, Value> {
    match value {
        Value::Resource(r) => r.as_any().downcast_ref::<Connection>(),
        _ => None,
    }
    .ok_or_else(|| {
        Value::type_error(format!(
            "pgx.{}() expected a connection argument (got {})",
            name,
            value.type_name()
        ))
    })
}

fn exec(args: &[Value]) -> NativeResult {
    let (conn, sql, params) = statement("exec", args)?;
    let mut client = conn.client.borrow_mut();
    let Some(client) = client.as_mut() else {
        return Ok(Value::external_err("pgx: connection is closed"));
    };
    let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(Param::as_sql).collect();
    Ok(match client.execute(sql, &refs) {
        Ok(n) => Value::ok(Value::Int(n as i64)),
        Err(e) => Value::external_err(e.to_string()),
    })
}

fn query(args: &[Value]) -> NativeResult {
    let (conn, sql, params) = statement("query", args)?;
    let mut client = conn.client.borrow_mut();
    let Some(client) = client.as_mut() else {
        return Ok(Value::external_err("pgx: connection is closed"));
    };
    let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(Param::as_sql).collect();
    Ok(match client.query(sql, &refs) {
        Ok(rows) => Value::ok(Value::list(rows.iter().map(row_to_map).collect())),
        Err(e) => Value::external_err(e.to_string()),
    })
}

fn close(args: &[Value]) -> NativeResult {
    if args.len() != 1 {
        return Err(Value::type_error(format!(
            "pgx.close() takes exactly one argument ({} given)",
            args.len()
        )));
    }
    let conn = connection("close", &args[0])?;
    if let Some(client) = conn.client.borrow_mut().take() {
        debug!("pgx connection closed");
        if let Err(e) = client.close() {
            return Ok(Value::external_err(e.to_string()));
        }
    }
    Ok(Value::ok(Value::Nil))
}

/// A script value bound as a statement parameter.
#[derive(Debug, Clone, PartialEq)]
enum Param {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Param {
    fn as_sql(&self) -> &(dyn ToSql + Sync) {
        static NULL: Option<String> = None;
        match self {
            Param::Null => &NULL,
            Param::Bool(b) => b,
            Param::Int(n) => n,
            Param::Float(f) => f,
            Param::Text(s) => s,
        }
    }
}

impl TryFrom<&Value> for Param {
    type Error = &'static str;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Ok(match value {
            Value::Nil => Param::Null,
            Value::Bool(b) => Param::Bool(*b),
            Value::Int(n) => Param::Int(*n),
            Value::Float(f) => Param::Float(*f),
            Value::Str(s) => Param::Text(s.to_string()),
            other => return Err(other.type_name()),
        })
    }
}

fn row_to_map(row: &Row) -> Value {
    let mut entries = IndexMap::new();
    for (i, column) in row.columns().iter().enumerate() {
        entries.insert(HashKey::Str(Rc::from(column.name())), column_value(row, i, column.type_()));
    }
    Value::map(entries)
}

/// Decode one column; types without a script counterpart read as text when
/// the server allows it and nil otherwise.
fn column_value(row: &Row, i: usize, ty: &Type) -> Value {
    let decoded = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(i).map(|v| v.map(Value::Bool))
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(i).map(|v| v.map(|n| Value::Int(n.into())))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(i).map(|v| v.map(|n| Value::Int(n.into())))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(i).map(|v| v.map(Value::Int))
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(i).map(|v| v.map(|f| Value::Float(f.into())))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(i).map(|v| v.map(Value::Float))
    } else {
        row.try_get::<_, Option<String>>(i).map(|v| v.map(Value::str))
    };
    decoded.ok().flatten().unwrap_or(Value::Nil)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::value::Outcome;
    use crate::modules::testing::{assert_type_error, call_member};

    #[test]
    fn test_connect_arity() {
        let out = call_member(&module(), "connect", &[]);
        assert_type_error(&out, "pgx.connect() takes exactly one argument (0 given)");
        let out = call_member(&module(), "connect", &[Value::str("a"), Value::str("b")]);
        assert_type_error(&out, "(2 given)");
    }

    #[test]
    fn test_connect_requires_string() {
        let out = call_member(&module(), "connect", &[Value::Int(5)]);
        assert_type_error(&out, "pgx.connect() expected a string argument (got int)");
    }

    #[test]
    fn test_connect_failure_is_err_result() {
        let out = call_member(&module(), "connect", &[Value::str("definitely not a url")]);
        assert!(matches!(out, Value::Result(r) if matches!(r.as_ref(), Outcome::Err(_))));
    }

    #[test]
    fn test_exec_requires_connection() {
        let out = call_member(&module(), "exec", &[Value::Nil, Value::str("select 1")]);
        assert_type_error(&out, "pgx.exec() expected a connection argument (got nil)");
        let out = call_member(&module(), "query", &[Value::Nil]);
        assert_type_error(&out, "takes at least two arguments (1 given)");
    }

    #[test]
    fn test_param_conversion() {
        assert_eq!(Param::try_from(&Value::Int(3)), Ok(Param::Int(3)));
        assert_eq!(Param::try_from(&Value::str("x")), Ok(Param::Text("x".to_string())));
        assert_eq!(Param::try_from(&Value::list(vec![])), Err("list"));
    }
}
