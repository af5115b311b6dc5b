use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use crate::bytecode::ir::CompiledFunction;
use crate::runtime::context::CallContext;
use crate::runtime::runtime_error::ErrorKind;

/// Runtime value of the Cinder language.
///
/// Containers are shared and mutable (`Rc<RefCell<..>>`); assigning a list to
/// a second variable aliases it.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<IndexMap<HashKey, Value>>>),
    Set(Rc<RefCell<IndexSet<HashKey>>>),
    Function(Rc<CompiledFunction>),
    Closure(Rc<Closure>),
    Builtin(Rc<Builtin>),
    Module(Rc<Module>),
    Result(Rc<Outcome>),
    Error(Rc<ErrorValue>),
    Resource(Rc<dyn Resource>),

    /// Captured variable storage. Only lives in frame slots and on the stack
    /// between `MAKE_CELL` and `LOAD_CLOSURE`.
    Cell(Cell),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn map(entries: IndexMap<HashKey, Value>) -> Value {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    pub fn set(items: IndexSet<HashKey>) -> Value {
        Value::Set(Rc::new(RefCell::new(items)))
    }

    pub fn ok(value: Value) -> Value {
        Value::Result(Rc::new(Outcome::Ok(value)))
    }

    pub fn err(value: Value) -> Value {
        Value::Result(Rc::new(Outcome::Err(value)))
    }

    /// `Err` result wrapping a failure from outside the VM (network, parse, ...).
    pub fn external_err(message: impl Into<String>) -> Value {
        Value::err(Value::Error(Rc::new(ErrorValue {
            kind: ErrorKind::Runtime,
            message: message.into(),
        })))
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Value {
        Value::Error(Rc::new(ErrorValue {
            kind,
            message: message.into(),
        }))
    }

    pub fn type_error(message: impl Into<String>) -> Value {
        Value::error(ErrorKind::Type, message)
    }

    pub fn arity_error(message: impl Into<String>) -> Value {
        Value::error(ErrorKind::Arity, message)
    }

    pub fn runtime_error(message: impl Into<String>) -> Value {
        Value::error(ErrorKind::Runtime, message)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Function(_) => "function",
            Value::Closure(_) => "closure",
            Value::Builtin(_) => "builtin",
            Value::Module(_) => "module",
            Value::Result(_) => "result",
            Value::Error(_) => "error",
            Value::Resource(r) => r.type_name(),
            Value::Cell(_) => "cell",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Map(entries) => !entries.borrow().is_empty(),
            Value::Set(items) => !items.borrow().is_empty(),
            _ => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view used by mixed int/float arithmetic.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Format through `seen`, the containers already open on the current
    /// path. A container met again prints as `[...]` or `{...}`.
    fn write(&self, f: &mut fmt::Formatter<'_>, seen: &mut Vec<*const ()>, nested: bool) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{:?}", n),
            Value::Str(s) if nested => write!(f, "{:?}", s),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                let id = Rc::as_ptr(items) as *const ();
                if seen.contains(&id) {
                    return write!(f, "[...]");
                }
                seen.push(id);
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.write(f, seen, true)?;
                }
                seen.pop();
                write!(f, "]")
            }
            Value::Map(entries) => {
                let id = Rc::as_ptr(entries) as *const ();
                if seen.contains(&id) {
                    return write!(f, "{{...}}");
                }
                seen.push(id);
                write!(f, "{{")?;
                for (i, (k, v)) in entries.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    k.to_value().write(f, seen, true)?;
                    write!(f, ": ")?;
                    v.write(f, seen, true)?;
                }
                seen.pop();
                write!(f, "}}")
            }
            Value::Set(items) => {
                write!(f, "{{")?;
                for (i, k) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    k.to_value().write(f, seen, true)?;
                }
                write!(f, "}}")
            }
            Value::Function(func) => write!(f, "<function {}>", func.name()),
            Value::Closure(c) => write!(f, "<closure {}>", c.function.name()),
            Value::Builtin(b) => write!(f, "<builtin {}>", b.name),
            Value::Module(m) => write!(f, "<module {}>", m.name),
            Value::Result(r) => {
                let (tag, inner) = match r.as_ref() {
                    Outcome::Ok(v) => ("ok", v),
                    Outcome::Err(v) => ("err", v),
                };
                write!(f, "{}(", tag)?;
                inner.write(f, seen, true)?;
                write!(f, ")")
            }
            Value::Error(e) => write!(f, "{}", e),
            Value::Resource(r) => write!(f, "<{}>", r.type_name()),
            Value::Cell(c) => {
                write!(f, "<cell ")?;
                c.get().write(f, seen, true)?;
                write!(f, ">")
            }
        }
    }

    /// Structural equality. `seen` holds container pairs already being
    /// compared; meeting one again counts as equal.
    fn eq_in(&self, other: &Value, seen: &mut Vec<(*const (), *const ())>) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let pair = (Rc::as_ptr(a) as *const (), Rc::as_ptr(b) as *const ());
                if seen.contains(&pair) {
                    return true;
                }
                seen.push(pair);
                let (a, b) = (a.borrow(), b.borrow());
                let equal = a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_in(y, seen));
                seen.pop();
                equal
            }
            (Value::Map(a), Value::Map(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let pair = (Rc::as_ptr(a) as *const (), Rc::as_ptr(b) as *const ());
                if seen.contains(&pair) {
                    return true;
                }
                seen.push(pair);
                let (a, b) = (a.borrow(), b.borrow());
                let equal = a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.eq_in(w, seen)));
                seen.pop();
                equal
            }
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => Rc::ptr_eq(a, b),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            (Value::Result(a), Value::Result(b)) => {
                Rc::ptr_eq(a, b)
                    || match (a.as_ref(), b.as_ref()) {
                        (Outcome::Ok(x), Outcome::Ok(y)) | (Outcome::Err(x), Outcome::Err(y)) => x.eq_in(y, seen),
                        _ => false,
                    }
            }
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Resource(a), Value::Resource(b)) => Rc::ptr_eq(a, b),
            (Value::Cell(a), Value::Cell(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.eq_in(other, &mut Vec::new())
    }
}

impl fmt::Display for Value {
    /// Format a value using Cinder surface syntax.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(f, &mut Vec::new(), false)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(_) => self.write(f, &mut Vec::new(), true),
            Value::Error(e) => write!(f, "Error({:?}: {})", e.kind, e.message),
            _ => self.write(f, &mut Vec::new(), false),
        }
    }
}

// =============================================================================
// Hashable keys
// =============================================================================

/// The subset of values usable as map keys and set members.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    Nil,
    Bool(bool),
    Int(i64),
    Str(Rc<str>),
}

impl HashKey {
    pub fn to_value(&self) -> Value {
        match self {
            HashKey::Nil => Value::Nil,
            HashKey::Bool(b) => Value::Bool(*b),
            HashKey::Int(n) => Value::Int(*n),
            HashKey::Str(s) => Value::Str(s.clone()),
        }
    }
}

impl TryFrom<&Value> for HashKey {
    type Error = String;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Nil => Ok(HashKey::Nil),
            Value::Bool(b) => Ok(HashKey::Bool(*b)),
            Value::Int(n) => Ok(HashKey::Int(*n)),
            Value::Str(s) => Ok(HashKey::Str(s.clone())),
            other => Err(format!("unhashable type: {}", other.type_name())),
        }
    }
}

// =============================================================================
// Objects behind the Rc variants
// =============================================================================

/// Shared mutable slot for a variable captured by a closure.
#[derive(Debug, Clone)]
pub struct Cell(Rc<RefCell<Value>>);

impl Cell {
    pub fn new(value: Value) -> Self {
        Cell(Rc::new(RefCell::new(value)))
    }

    pub fn get(&self) -> Value {
        self.0.borrow().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.borrow_mut() = value;
    }

    pub fn ptr_eq(&self, other: &Cell) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Empty the cell when it holds a closure that captured it and `self`
    /// is the only other handle to either. Such a pair is unreachable once
    /// `self` drops. Returns whether the cell was cleared.
    pub fn clear_if_self_cycle(&self) -> bool {
        let cyclic = match &*self.0.borrow() {
            Value::Closure(c) => {
                let captures = c.cells.iter().filter(|cell| cell.ptr_eq(self)).count();
                captures > 0 && Rc::strong_count(c) == 1 && Rc::strong_count(&self.0) == captures + 1
            }
            _ => false,
        };
        if cyclic {
            self.set(Value::Nil);
        }
        cyclic
    }
}

/// A compiled function paired with the cells it captured when created.
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<CompiledFunction>,
    pub cells: Vec<Cell>,
}

pub type NativeFn = dyn Fn(&mut CallContext<'_>, &[Value]) -> Value;

/// A function implemented in Rust.
pub struct Builtin {
    pub name: Rc<str>,
    func: Rc<NativeFn>,
}

impl Builtin {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&mut CallContext<'_>, &[Value]) -> Value + 'static,
    {
        Builtin {
            name: Rc::from(name),
            func: Rc::new(func),
        }
    }

    pub fn call(&self, ctx: &mut CallContext<'_>, args: &[Value]) -> Value {
        (self.func)(ctx, args)
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Builtin({})", self.name)
    }
}

/// A read-only namespace object such as `math` or `pgx`.
#[derive(Debug)]
pub struct Module {
    pub name: Rc<str>,
    pub members: IndexMap<Rc<str>, Value>,
}

impl Module {
    pub fn new(name: &str, members: IndexMap<Rc<str>, Value>) -> Self {
        Module {
            name: Rc::from(name),
            members,
        }
    }

    /// Module whose members are all builtins.
    pub fn from_builtins(name: &str, functions: Vec<Builtin>) -> Self {
        let members = functions
            .into_iter()
            .map(|b| (b.name.clone(), Value::Builtin(Rc::new(b))))
            .collect();
        Module::new(name, members)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.members.get(name)
    }
}

/// Payload of a result value.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok(Value),
    Err(Value),
}

/// Error produced by a builtin. Returning one from a native function aborts
/// the running chunk with the matching error kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Handle to something owned outside the VM (e.g. a database connection).
pub trait Resource: fmt::Debug {
    fn type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::str("").is_truthy());
        assert!(!Value::list(vec![]).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(Value::str("x").is_truthy());
        assert!(Value::list(vec![Value::Nil]).is_truthy());
    }

    #[test]
    fn test_numeric_equality_across_types() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::str("2"));
    }

    #[test]
    fn test_list_equality_structural() {
        let a = Value::list(vec![Value::Int(1), Value::str("a")]);
        let b = Value::list(vec![Value::Int(1), Value::str("a")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_display() {
        let v = Value::list(vec![Value::Int(1), Value::str("a"), Value::Float(2.0)]);
        assert_eq!(v.to_string(), r#"[1, "a", 2.0]"#);
        assert_eq!(Value::str("plain").to_string(), "plain");
        assert_eq!(Value::Nil.to_string(), "nil");
        assert_eq!(Value::ok(Value::Int(3)).to_string(), "ok(3)");
    }

    #[test]
    fn test_map_display_keeps_insertion_order() {
        let mut m = IndexMap::new();
        m.insert(HashKey::Str(Rc::from("b")), Value::Int(2));
        m.insert(HashKey::Str(Rc::from("a")), Value::Int(1));
        assert_eq!(Value::map(m).to_string(), r#"{"b": 2, "a": 1}"#);
    }

    #[test]
    fn test_hash_key_rejects_floats() {
        assert!(HashKey::try_from(&Value::Float(1.5)).is_err());
        assert_eq!(HashKey::try_from(&Value::Int(4)), Ok(HashKey::Int(4)));
    }

    #[test]
    fn test_cell_shares_storage() {
        let a = Cell::new(Value::Int(1));
        let b = a.clone();
        b.set(Value::Int(9));
        assert_eq!(a.get(), Value::Int(9));
        assert!(a.ptr_eq(&b));
        assert_eq!(Rc::strong_count(&a.0), 2);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Int(1).type_name(), "int");
        assert_eq!(Value::str("s").type_name(), "string");
        assert_eq!(Value::type_error("x").type_name(), "error");
    }

    fn self_containing_list() -> Value {
        let list = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        list
    }

    #[test]
    fn test_display_of_cyclic_containers() {
        assert_eq!(self_containing_list().to_string(), "[1, [...]]");

        let map = Value::map(IndexMap::new());
        if let Value::Map(entries) = &map {
            entries.borrow_mut().insert(HashKey::Str(Rc::from("me")), map.clone());
        }
        assert_eq!(map.to_string(), r#"{"me": {...}}"#);
        assert_eq!(format!("{:?}", map), r#"{"me": {...}}"#);
    }

    #[test]
    fn test_shared_but_acyclic_list_prints_twice() {
        let inner = Value::list(vec![Value::Int(2)]);
        let outer = Value::list(vec![inner.clone(), inner]);
        assert_eq!(outer.to_string(), "[[2], [2]]");
    }

    #[test]
    fn test_equality_of_cyclic_lists() {
        let a = self_containing_list();
        let b = self_containing_list();
        assert_eq!(a, a.clone());
        assert_eq!(a, b);
        assert_ne!(a, Value::list(vec![Value::Int(1)]));
    }
}
