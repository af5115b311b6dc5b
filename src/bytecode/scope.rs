//! Compile-time lexical scopes.
//!
//! Module scopes (the session's top level) bind names dynamically through the
//! global namespace; function scopes bind locals to frame slots and reach
//! enclosing-function variables through closure cells. A scope never mixes
//! the two mechanisms.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use crate::bytecode::ir::FreeVar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
}

/// Storage class an identifier resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Symbol {
    /// Slot in the active frame's locals.
    Local(u16),
    /// Index into the active closure's cells.
    Free(u16),
    /// Session-global binding referenced from function code.
    Global(Rc<str>),
    /// Top-level binding referenced from module code.
    Name(Rc<str>),
}

/// How a closure obtains a captured cell from the frame that creates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// A local slot of the creating frame.
    Local(u16),
    /// A cell the creating frame itself captured.
    Free(u16),
}

#[derive(Debug)]
pub struct Scope {
    name: Rc<str>,
    kind: ScopeKind,
    parent: Option<Rc<Scope>>,
    locals: RefCell<IndexMap<Rc<str>, u16>>,
    names: RefCell<IndexSet<Rc<str>>>,
    free: RefCell<Vec<FreeVar>>,
}

#[derive(Debug, thiserror::Error)]
#[error("too many local variables in '{0}'")]
pub struct TooManyLocals(pub Rc<str>);

impl Scope {
    pub fn new_module(name: &str) -> Rc<Scope> {
        Rc::new(Scope {
            name: Rc::from(name),
            kind: ScopeKind::Module,
            parent: None,
            locals: RefCell::new(IndexMap::new()),
            names: RefCell::new(IndexSet::new()),
            free: RefCell::new(Vec::new()),
        })
    }

    pub fn new_function(name: &str, parent: Rc<Scope>) -> Rc<Scope> {
        Rc::new(Scope {
            name: Rc::from(name),
            kind: ScopeKind::Function,
            parent: Some(parent),
            locals: RefCell::new(IndexMap::new()),
            names: RefCell::new(IndexSet::new()),
            free: RefCell::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn parent(&self) -> Option<&Rc<Scope>> {
        self.parent.as_ref()
    }

    pub fn local_count(&self) -> usize {
        self.locals.borrow().len()
    }

    /// Name bound to a local slot; slots are assigned in declaration order.
    pub fn local_name(&self, slot: usize) -> Option<Rc<str>> {
        self.locals.borrow().get_index(slot).map(|(name, _)| name.clone())
    }

    pub fn free_vars(&self) -> Vec<FreeVar> {
        self.free.borrow().clone()
    }

    /// Number of names declared at module level (used to roll back a failed chunk).
    pub fn declared_count(&self) -> usize {
        self.names.borrow().len()
    }

    pub fn truncate_declared(&self, len: usize) {
        self.names.borrow_mut().truncate(len);
    }

    pub fn is_declared(&self, name: &str) -> bool {
        match self.kind {
            ScopeKind::Module => self.names.borrow().contains(name),
            ScopeKind::Function => self.locals.borrow().contains_key(name),
        }
    }

    /// Declare `name` in this scope, reusing an existing binding.
    pub fn declare(&self, name: &str) -> Result<Symbol, TooManyLocals> {
        match self.kind {
            ScopeKind::Module => {
                let name: Rc<str> = Rc::from(name);
                self.names.borrow_mut().insert(name.clone());
                Ok(Symbol::Name(name))
            }
            ScopeKind::Function => {
                let mut locals = self.locals.borrow_mut();
                if let Some(slot) = locals.get(name) {
                    return Ok(Symbol::Local(*slot));
                }
                let slot = u16::try_from(locals.len()).map_err(|_| TooManyLocals(self.name.clone()))?;
                locals.insert(Rc::from(name), slot);
                Ok(Symbol::Local(slot))
            }
        }
    }

    /// Resolve `name` to a storage class, registering free variables on the
    /// way out of nested functions.
    pub fn resolve(&self, name: &str) -> Symbol {
        match self.kind {
            ScopeKind::Module => Symbol::Name(Rc::from(name)),
            ScopeKind::Function => {
                if let Some(slot) = self.locals.borrow().get(name) {
                    return Symbol::Local(*slot);
                }
                if let Some(idx) = self.free.borrow().iter().position(|f| &*f.name == name) {
                    return Symbol::Free(idx as u16);
                }
                let parent = match &self.parent {
                    Some(p) if p.kind == ScopeKind::Function => p,
                    _ => return Symbol::Global(Rc::from(name)),
                };
                let capture = match parent.resolve(name) {
                    Symbol::Local(slot) => Capture::Local(slot),
                    Symbol::Free(idx) => Capture::Free(idx),
                    Symbol::Global(_) | Symbol::Name(_) => return Symbol::Global(Rc::from(name)),
                };
                let mut free = self.free.borrow_mut();
                free.push(FreeVar {
                    name: Rc::from(name),
                    capture,
                });
                Symbol::Free((free.len() - 1) as u16)
            }
        }
    }

    /// Names from this scope outwards, for diagnostics.
    pub fn path(&self) -> String {
        match &self.parent {
            Some(p) => format!("{}.{}", p.path(), self.name),
            None => self.name.to_string(),
        }
    }
}
