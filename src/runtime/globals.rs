use std::rc::Rc;

use indexmap::IndexMap;

use crate::lang::value::{Builtin, Module, Value};

/// Session-wide namespace: an immutable builtin layer under the mutable
/// layer of top-level bindings.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    builtins: Rc<IndexMap<Rc<str>, Value>>,
    session: IndexMap<Rc<str>, Value>,
}

/// Assembles the builtin layer before a session starts.
#[derive(Debug, Default)]
pub struct GlobalsBuilder {
    builtins: IndexMap<Rc<str>, Value>,
}

impl GlobalsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a builtin, replacing any earlier entry of the same name.
    pub fn builtin(mut self, builtin: Builtin) -> Self {
        self.builtins.insert(builtin.name.clone(), Value::Builtin(Rc::new(builtin)));
        self
    }

    pub fn builtins(self, builtins: impl IntoIterator<Item = Builtin>) -> Self {
        builtins.into_iter().fold(self, |b, f| b.builtin(f))
    }

    pub fn module(mut self, module: Module) -> Self {
        self.builtins.insert(module.name.clone(), Value::Module(Rc::new(module)));
        self
    }

    pub fn build(self) -> Globals {
        Globals {
            builtins: Rc::new(self.builtins),
            session: IndexMap::new(),
        }
    }
}

impl Globals {
    pub fn builder() -> GlobalsBuilder {
        GlobalsBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.session.get(name).or_else(|| self.builtins.get(name))
    }

    pub fn set(&mut self, name: Rc<str>, value: Value) {
        self.session.insert(name, value);
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.contains_key(name)
    }

    pub fn builtin_names(&self) -> impl Iterator<Item = &Rc<str>> {
        self.builtins.keys()
    }
}
