use std::rc::Rc;

use smallvec::SmallVec;

use crate::bytecode::ir::CompiledFunction;
use crate::bytecode::scope::Scope;
use crate::lang::value::{Cell, Closure, Value};

/// Local-variable slots stored inline before spilling to the heap.
pub const DEFAULT_FRAME_LOCALS: usize = 4;

type Locals = SmallVec<[Value; DEFAULT_FRAME_LOCALS]>;

/// Activation record of one function invocation.
#[derive(Debug)]
pub struct Frame {
    function: Rc<CompiledFunction>,
    closure: Option<Rc<Closure>>,
    /// Caller's instruction pointer to resume at after `RETURN_VALUE`.
    pub resume: usize,
    /// Value-stack height when the frame was entered.
    pub base: usize,
    locals: Locals,
}

impl Frame {
    pub fn new(function: Rc<CompiledFunction>, resume: usize, local_count: usize) -> Self {
        let mut frame = Frame {
            function: function.clone(),
            closure: None,
            resume: 0,
            base: 0,
            locals: Locals::new(),
        };
        frame.init(function, resume, local_count);
        frame
    }

    /// Reset the frame for a new invocation; all locals start as nil.
    pub fn init(&mut self, function: Rc<CompiledFunction>, resume: usize, local_count: usize) {
        self.function = function;
        self.closure = None;
        self.resume = resume;
        self.base = 0;
        if local_count <= DEFAULT_FRAME_LOCALS && self.locals.spilled() {
            self.locals = Locals::new();
        } else {
            self.locals.clear();
        }
        self.locals.resize(local_count, Value::Nil);
    }

    /// Reset the frame and copy `initial` into the first slots.
    pub fn init_with_locals(&mut self, function: Rc<CompiledFunction>, resume: usize, initial: &[Value]) {
        let local_count = function.local_count().max(initial.len());
        self.init(function, resume, local_count);
        for (slot, value) in self.locals.iter_mut().zip(initial) {
            *slot = value.clone();
        }
    }

    pub fn with_closure(&mut self, closure: Rc<Closure>) {
        self.closure = Some(closure);
    }

    pub fn locals(&self) -> &[Value] {
        &self.locals
    }

    pub fn locals_mut(&mut self) -> &mut [Value] {
        &mut self.locals
    }

    pub fn function(&self) -> &Rc<CompiledFunction> {
        &self.function
    }

    pub fn scope(&self) -> &Rc<Scope> {
        self.function.scope()
    }

    /// Cells the running closure captured; empty for plain functions.
    pub fn cells(&self) -> &[Cell] {
        match &self.closure {
            Some(c) => &c.cells,
            None => &[],
        }
    }

    pub fn is_inline(&self) -> bool {
        !self.locals.spilled()
    }

    /// Drop references held by a released frame so pooled frames keep nothing alive.
    ///
    /// A local function that calls itself lives in a cell its own closure
    /// captured. When nothing else holds that closure the cell is emptied
    /// so the pair is freed. Cycles through more than one cell stay alive.
    pub fn release(&mut self) {
        self.closure = None;
        for local in &self.locals {
            if let Value::Cell(cell) = local {
                cell.clear_if_self_cycle();
            }
        }
        self.locals.clear();
    }
}
