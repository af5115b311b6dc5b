use std::rc::Rc;

use crate::bytecode::scope::{Capture, Scope};
use crate::lang::value::Value;

/// Describes one variable a function captures from its enclosing function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeVar {
    pub name: Rc<str>,
    /// Where the enclosing frame finds the cell when the closure is built.
    pub capture: Capture,
}

/// An immutable compiled function: code, constants, names and frame layout.
///
/// The top-level program of a session is also represented as a
/// `CompiledFunction` (named `main`, zero locals); the VM receives a fresh
/// snapshot of it for every chunk.
#[derive(Debug)]
pub struct CompiledFunction {
    name: Rc<str>,
    params: Vec<Rc<str>>,
    instructions: Vec<u8>,
    constants: Vec<Value>,
    names: Vec<Rc<str>>,
    local_count: usize,
    free_vars: Vec<FreeVar>,
    scope: Rc<Scope>,
}

impl CompiledFunction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: Rc<str>,
        params: Vec<Rc<str>>,
        instructions: Vec<u8>,
        constants: Vec<Value>,
        names: Vec<Rc<str>>,
        local_count: usize,
        free_vars: Vec<FreeVar>,
        scope: Rc<Scope>,
    ) -> Self {
        CompiledFunction {
            name,
            params,
            instructions,
            constants,
            names,
            local_count,
            free_vars,
            scope,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Rc<str>] {
        &self.params
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn instructions(&self) -> &[u8] {
        &self.instructions
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn names(&self) -> &[Rc<str>] {
        &self.names
    }

    pub fn local_count(&self) -> usize {
        self.local_count
    }

    pub fn free_vars(&self) -> &[FreeVar] {
        &self.free_vars
    }

    pub fn scope(&self) -> &Rc<Scope> {
        &self.scope
    }

    /// Compiled functions stored in the constant pool.
    pub fn nested_functions(&self) -> impl Iterator<Item = &Rc<CompiledFunction>> {
        self.constants.iter().filter_map(|c| match c {
            Value::Function(f) => Some(f),
            _ => None,
        })
    }
}
