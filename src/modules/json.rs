use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::{Map, Number, Value as Json};

use crate::lang::value::{HashKey, Module, Value};
use crate::modules::{arg_str, expect_args, native};

pub fn module() -> Module {
    Module::from_builtins(
        "json",
        vec![
            native("marshal", |_, args| {
                expect_args("marshal", args, 1)?;
                let json = to_json(&args[0]).map_err(Value::type_error)?;
                Ok(Value::str(json.to_string()))
            }),
            native("unmarshal", |_, args| {
                expect_args("unmarshal", args, 1)?;
                let text = arg_str("unmarshal", &args[0])?;
                Ok(match serde_json::from_str::<Json>(text) {
                    Ok(json) => Value::ok(from_json(json)),
                    Err(e) => Value::external_err(e.to_string()),
                })
            }),
        ],
    )
}

/// Convert a script value to JSON. Map keys become strings; a container
/// that contains itself is rejected.
pub fn to_json(value: &Value) -> Result<Json, String> {
    encode(value, &mut Vec::new())
}

fn enter(seen: &mut Vec<*const ()>, id: *const (), what: &str) -> Result<(), String> {
    if seen.contains(&id) {
        return Err(format!("cannot encode a cyclic {} as json", what));
    }
    seen.push(id);
    Ok(())
}

fn encode(value: &Value, seen: &mut Vec<*const ()>) -> Result<Json, String> {
    Ok(match value {
        Value::Nil => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(n) => Json::Number((*n).into()),
        Value::Float(f) => Number::from_f64(*f)
            .map(Json::Number)
            .ok_or_else(|| format!("cannot encode {} as json", f))?,
        Value::Str(s) => Json::String(s.to_string()),
        Value::List(items) => {
            enter(seen, Rc::as_ptr(items) as *const (), "list")?;
            let array = items
                .borrow()
                .iter()
                .map(|v| encode(v, seen))
                .collect::<Result<_, _>>()?;
            seen.pop();
            Json::Array(array)
        }
        Value::Set(items) => Json::Array(
            items
                .borrow()
                .iter()
                .map(|k| to_json(&k.to_value()))
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(entries) => {
            enter(seen, Rc::as_ptr(entries) as *const (), "map")?;
            let mut map = Map::new();
            for (key, v) in entries.borrow().iter() {
                let key = match key {
                    HashKey::Str(s) => s.to_string(),
                    other => other.to_value().to_string(),
                };
                map.insert(key, encode(v, seen)?);
            }
            seen.pop();
            Json::Object(map)
        }
        Value::Result(_) | Value::Error(_) => Json::String(value.to_string()),
        other => return Err(format!("cannot encode {} as json", other.type_name())),
    })
}

pub fn from_json(json: Json) -> Value {
    match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::str(s),
        Json::Array(items) => Value::list(items.into_iter().map(from_json).collect()),
        Json::Object(map) => {
            let entries: IndexMap<HashKey, Value> = map
                .into_iter()
                .map(|(k, v)| (HashKey::Str(Rc::from(k)), from_json(v)))
                .collect();
            Value::map(entries)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::value::Outcome;
    use crate::modules::testing::{assert_type_error, call_member};

    #[test]
    fn test_marshal_keeps_map_order() {
        let mut entries = IndexMap::new();
        entries.insert(HashKey::Str(Rc::from("b")), Value::Int(1));
        entries.insert(HashKey::Str(Rc::from("a")), Value::list(vec![Value::Bool(true), Value::Nil]));
        let out = call_member(&module(), "marshal", &[Value::map(entries)]);
        assert_eq!(out, Value::str(r#"{"b":1,"a":[true,null]}"#));
    }

    #[test]
    fn test_unmarshal() {
        let out = call_member(&module(), "unmarshal", &[Value::str(r#"{"x": [1, 2.5, "s"]}"#)]);
        let Value::Result(r) = out else { panic!("expected result") };
        let Outcome::Ok(Value::Map(m)) = r.as_ref() else { panic!("expected ok map") };
        let x = m.borrow().get(&HashKey::Str(Rc::from("x"))).cloned().unwrap();
        assert_eq!(x, Value::list(vec![Value::Int(1), Value::Float(2.5), Value::str("s")]));
    }

    #[test]
    fn test_unmarshal_invalid_is_err_result() {
        let out = call_member(&module(), "unmarshal", &[Value::str("{")]);
        assert!(matches!(out, Value::Result(r) if matches!(r.as_ref(), Outcome::Err(_))));
    }

    #[test]
    fn test_marshal_rejects_functions() {
        let builtin = module().get("marshal").cloned().unwrap();
        assert_type_error(&call_member(&module(), "marshal", &[builtin]), "cannot encode builtin");
    }

    #[test]
    fn test_marshal_rejects_cycles() {
        let list = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        assert_type_error(&call_member(&module(), "marshal", &[list]), "cannot encode a cyclic list");
    }

    #[test]
    fn test_marshal_allows_shared_children() {
        let inner = Value::list(vec![Value::Int(1)]);
        let outer = Value::list(vec![inner.clone(), inner]);
        assert_eq!(call_member(&module(), "marshal", &[outer]), Value::str("[[1],[1]]"));
    }
}
