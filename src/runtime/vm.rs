use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::bytecode::ir::CompiledFunction;
use crate::bytecode::op::{BinaryOpType, CompareOpType, Instruction, Opcode, decode};
use crate::lang::value::{Cell, Closure, HashKey, Value};
use crate::runtime::context::{CallContext, CancelToken};
use crate::runtime::frame::Frame;
use crate::runtime::globals::Globals;
use crate::runtime::ops;
use crate::runtime::runtime_error::{ErrorKind, RuntimeError, stack_underflow, undefined_variable};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_steps: Option<usize>,
    pub max_stack_size: usize,
    /// Check each chunk's bytecode before running it.
    pub verify: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 1000,
            max_steps: None,
            max_stack_size: 10_000,
            verify: true,
        }
    }
}

/// Stack-based bytecode interpreter for one chunk of a session.
///
/// The VM borrows the session globals for the duration of the run; the value
/// stack and frame stack are its own and are dropped with it.
pub struct Vm<'g> {
    function: Rc<CompiledFunction>,
    ip: usize,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    pool: Vec<Frame>,
    globals: &'g mut Globals,
    config: VmConfig,
    cancel: CancelToken,
    steps: usize,
}

impl<'g> Vm<'g> {
    /// Start executing `main` at byte `offset`.
    pub fn new_at(main: Rc<CompiledFunction>, offset: usize, globals: &'g mut Globals) -> Self {
        let frame = Frame::new(main.clone(), 0, main.local_count());
        Vm {
            function: main,
            ip: offset,
            stack: Vec::new(),
            frames: vec![frame],
            pool: Vec::new(),
            globals,
            config: VmConfig::default(),
            cancel: CancelToken::new(),
            steps: 0,
        }
    }

    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn top_of_stack(&self) -> Option<&Value> {
        self.stack.last()
    }

    /// Instructions dispatched so far, `HALT` included.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Run until `HALT`. Errors carry the names of the active frames.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        match self.dispatch() {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(frame) = self.frames.last() {
                    debug!(scope = %frame.scope().path(), ip = self.ip, error = %e.message, "run failed");
                }
                let names: Vec<String> = self
                    .frames
                    .iter()
                    .rev()
                    .map(|f| f.function().name().to_string())
                    .collect();
                Err(names.iter().fold(e, |e, name| e.with_context(name)))
            }
        }
    }

    fn check_limits(&mut self) -> Result<(), RuntimeError> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                warn!(max, "step limit exceeded");
                return Err(RuntimeError::runtime(format!(
                    "execution step limit exceeded ({})",
                    max
                )));
            }
        }

        if self.stack.len() > self.config.max_stack_size {
            warn!(max = self.config.max_stack_size, "stack limit exceeded");
            return Err(RuntimeError::runtime(format!(
                "stack size limit exceeded ({})",
                self.config.max_stack_size
            )));
        }

        Ok(())
    }

    fn dispatch(&mut self) -> Result<(), RuntimeError> {
        loop {
            self.check_limits()?;

            let at = self.ip;
            let ins = decode(self.function.instructions(), at)?;
            trace!(ip = at, op = ins.op.info().name, operands = ?ins.operands.as_slice(), "dispatch");
            self.ip += ins.len;

            match ins.op {
                Opcode::Nop => {}
                Opcode::Halt => return Ok(()),
                Opcode::PopTop => {
                    self.pop()?;
                }
                Opcode::Print => {
                    let value = self.pop()?;
                    println!("{}", value);
                }

                // Literals
                Opcode::Nil => self.push(Value::Nil),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::LoadConst => {
                    let value = self.constant(ins.operand(0))?;
                    self.push(value);
                }

                // Variables
                Opcode::LoadFast => {
                    let value = match self.local(ins.operand(0))? {
                        Value::Cell(cell) => cell.get(),
                        other => other.clone(),
                    };
                    self.push(value);
                }
                Opcode::StoreFast => {
                    let value = self.pop()?;
                    let slot = ins.operand(0);
                    let local = self.local_mut(slot)?;
                    match local {
                        Value::Cell(cell) => cell.set(value),
                        _ => *local = value,
                    }
                }
                Opcode::LoadGlobal | Opcode::LoadName => {
                    let name = self.name(ins.operand(0))?;
                    let value = self
                        .globals
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| undefined_variable(&name))?;
                    self.push(value);
                }
                Opcode::StoreGlobal | Opcode::StoreName => {
                    let name = self.name(ins.operand(0))?;
                    let value = self.pop()?;
                    self.globals.set(name, value);
                }
                Opcode::LoadFree => {
                    let value = self.free_cell(ins.operand(0))?.get();
                    self.push(value);
                }
                Opcode::StoreFree => {
                    let value = self.pop()?;
                    self.free_cell(ins.operand(0))?.set(value);
                }
                Opcode::MakeCell => {
                    let cell = self.make_cell(ins.operand(0), ins.operand(1))?;
                    self.push(Value::Cell(cell));
                }
                Opcode::LoadClosure => {
                    let closure = self.load_closure(ins.operand(0), ins.operand(1))?;
                    self.push(closure);
                }

                // Containers
                Opcode::BuildList => {
                    let items = self.pop_n(ins.operand(0))?;
                    self.push(Value::list(items));
                }
                Opcode::BuildMap => {
                    let flat = self.pop_n(ins.operand(0) * 2)?;
                    let mut entries = IndexMap::with_capacity(ins.operand(0));
                    for pair in flat.chunks_exact(2) {
                        let key = HashKey::try_from(&pair[0]).map_err(RuntimeError::type_error)?;
                        entries.insert(key, pair[1].clone());
                    }
                    self.push(Value::map(entries));
                }
                Opcode::BuildSet => {
                    let items = self.pop_n(ins.operand(0))?;
                    let set = items
                        .iter()
                        .map(HashKey::try_from)
                        .collect::<Result<IndexSet<_>, _>>()
                        .map_err(RuntimeError::type_error)?;
                    self.push(Value::set(set));
                }
                Opcode::BinarySubscr => {
                    let key = self.pop()?;
                    let container = self.pop()?;
                    self.push(ops::get_subscript(&container, &key)?);
                }
                Opcode::StoreSubscr => {
                    let key = self.pop()?;
                    let container = self.pop()?;
                    let value = self.pop()?;
                    ops::set_subscript(&container, &key, value)?;
                }
                Opcode::DeleteSubscr => {
                    let key = self.pop()?;
                    let container = self.pop()?;
                    ops::delete_subscript(&container, &key)?;
                }
                Opcode::LoadAttr => {
                    let name = self.name(ins.operand(0))?;
                    let object = self.pop()?;
                    self.push(ops::get_attr(&object, &name)?);
                }
                Opcode::StoreAttr => {
                    let name = self.name(ins.operand(0))?;
                    let object = self.pop()?;
                    let value = self.pop()?;
                    ops::set_attr(&object, &name, value)?;
                }

                // Operators
                Opcode::BinaryOp => {
                    let op = BinaryOpType::from_byte(ins.operand(0) as u8).ok_or_else(|| invalid_operator(&ins, at))?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(ops::binary_op(op, &a, &b)?);
                }
                Opcode::CompareOp => {
                    let op = CompareOpType::from_byte(ins.operand(0) as u8).ok_or_else(|| invalid_operator(&ins, at))?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(ops::compare_op(op, &a, &b)?);
                }
                Opcode::UnaryNegative => {
                    let v = self.pop()?;
                    self.push(ops::unary_negative(&v)?);
                }
                Opcode::UnaryPositive => {
                    let v = self.pop()?;
                    self.push(ops::unary_positive(&v)?);
                }
                Opcode::UnaryInvert => {
                    let v = self.pop()?;
                    self.push(ops::unary_invert(&v)?);
                }
                Opcode::UnaryNot => {
                    let v = self.pop()?;
                    self.push(Value::Bool(!v.is_truthy()));
                }

                // Jumps
                Opcode::JumpForward | Opcode::JumpBackward => {
                    self.ip = jump_target(&ins, at)?;
                }
                Opcode::PopJumpForwardIfTrue
                | Opcode::PopJumpBackwardIfTrue
                | Opcode::PopJumpForwardIfFalse
                | Opcode::PopJumpBackwardIfFalse => {
                    let cond = self.pop()?.is_truthy();
                    let on_true = matches!(ins.op, Opcode::PopJumpForwardIfTrue | Opcode::PopJumpBackwardIfTrue);
                    if cond == on_true {
                        self.ip = jump_target(&ins, at)?;
                    }
                }

                // Calls
                Opcode::Call => self.call(ins.operand(0))?,
                Opcode::ReturnValue => {
                    let value = if ins.operand(0) == 1 { self.pop()? } else { Value::Nil };
                    self.return_value(value)?;
                }
            }
        }
    }

    // Calls

    fn call(&mut self, argc: usize) -> Result<(), RuntimeError> {
        if self.stack.len() < argc + 1 {
            return Err(stack_underflow(argc + 1, self.stack.len()));
        }
        let args = self.stack.split_off(self.stack.len() - argc);
        let callee = self.pop()?;

        match callee {
            Value::Function(function) => self.enter(function, None, &args),
            Value::Closure(closure) => self.enter(closure.function.clone(), Some(closure), &args),
            Value::Builtin(builtin) => {
                let mut ctx = CallContext::new(&self.cancel);
                match builtin.call(&mut ctx, &args) {
                    Value::Error(e) => Err(RuntimeError::new(e.kind, e.message.clone())),
                    result => {
                        self.push(result);
                        Ok(())
                    }
                }
            }
            other => Err(RuntimeError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn enter(
        &mut self,
        function: Rc<CompiledFunction>,
        closure: Option<Rc<Closure>>,
        args: &[Value],
    ) -> Result<(), RuntimeError> {
        if args.len() != function.arity() {
            return Err(RuntimeError::arity(format!(
                "{}() takes {} arguments ({} given)",
                function.name(),
                function.arity(),
                args.len()
            )));
        }

        if self.frames.len() >= self.config.max_call_depth {
            warn!(max = self.config.max_call_depth, function = function.name(), "call depth exceeded");
            return Err(RuntimeError::runtime(format!(
                "call depth limit exceeded ({}) - possible infinite recursion in '{}'",
                self.config.max_call_depth,
                function.name()
            )));
        }

        let mut frame = match self.pool.pop() {
            Some(frame) => frame,
            None => Frame::new(function.clone(), 0, 0),
        };
        frame.init_with_locals(function.clone(), self.ip, args);
        frame.base = self.stack.len();
        if let Some(closure) = closure {
            frame.with_closure(closure);
        }
        self.frames.push(frame);
        self.function = function;
        self.ip = 0;
        Ok(())
    }

    fn return_value(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.frames.len() <= 1 {
            return Err(RuntimeError::runtime("return outside of a function"));
        }
        let mut frame = self
            .frames
            .pop()
            .ok_or_else(|| RuntimeError::runtime("no active frame"))?;
        self.stack.truncate(frame.base);
        self.ip = frame.resume;
        self.function = self.frame()?.function().clone();
        frame.release();
        self.pool.push(frame);
        self.push(value);
        Ok(())
    }

    // Closures

    fn make_cell(&mut self, index: usize, source: usize) -> Result<Cell, RuntimeError> {
        match source {
            0 => {
                let local = self.local_mut(index)?;
                match local {
                    Value::Cell(cell) => Ok(cell.clone()),
                    _ => {
                        let cell = Cell::new(std::mem::replace(local, Value::Nil));
                        *local = Value::Cell(cell.clone());
                        Ok(cell)
                    }
                }
            }
            1 => self.free_cell(index).cloned(),
            other => Err(RuntimeError::new(
                ErrorKind::Decode,
                format!("invalid cell source {} for MAKE_CELL", other),
            )),
        }
    }

    fn load_closure(&mut self, const_index: usize, count: usize) -> Result<Value, RuntimeError> {
        let function = match self.constant(const_index)? {
            Value::Function(f) => f,
            other => {
                return Err(RuntimeError::type_error(format!(
                    "LOAD_CLOSURE expects a function constant, got {}",
                    other.type_name()
                )));
            }
        };
        let cells = self
            .pop_n(count)?
            .into_iter()
            .map(|v| match v {
                Value::Cell(cell) => Ok(cell),
                other => Err(RuntimeError::type_error(format!(
                    "LOAD_CLOSURE expects cells, got {}",
                    other.type_name()
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Closure(Rc::new(Closure { function, cells })))
    }

    // Frame access

    fn frame(&self) -> Result<&Frame, RuntimeError> {
        self.frames.last().ok_or_else(|| RuntimeError::runtime("no active frame"))
    }

    fn frame_mut(&mut self) -> Result<&mut Frame, RuntimeError> {
        self.frames
            .last_mut()
            .ok_or_else(|| RuntimeError::runtime("no active frame"))
    }

    fn local(&self, slot: usize) -> Result<&Value, RuntimeError> {
        let frame = self.frame()?;
        let len = frame.locals().len();
        frame.locals().get(slot).ok_or_else(|| {
            RuntimeError::new(ErrorKind::Decode, format!("local slot {} out of range ({} locals)", slot, len))
        })
    }

    fn local_mut(&mut self, slot: usize) -> Result<&mut Value, RuntimeError> {
        let frame = self.frame_mut()?;
        let len = frame.locals().len();
        frame.locals_mut().get_mut(slot).ok_or_else(|| {
            RuntimeError::new(ErrorKind::Decode, format!("local slot {} out of range ({} locals)", slot, len))
        })
    }

    fn free_cell(&self, index: usize) -> Result<&Cell, RuntimeError> {
        let frame = self.frame()?;
        frame.cells().get(index).ok_or_else(|| {
            RuntimeError::new(
                ErrorKind::Decode,
                format!("free variable {} out of range in '{}'", index, frame.function().name()),
            )
        })
    }

    fn constant(&self, index: usize) -> Result<Value, RuntimeError> {
        self.function.constants().get(index).cloned().ok_or_else(|| {
            RuntimeError::new(ErrorKind::Decode, format!("constant index {} out of range", index))
        })
    }

    fn name(&self, index: usize) -> Result<Rc<str>, RuntimeError> {
        self.function.names().get(index).cloned().ok_or_else(|| {
            RuntimeError::new(ErrorKind::Decode, format!("name index {} out of range", index))
        })
    }

    // Stack operations

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(|| stack_underflow(1, 0))
    }

    /// Pop `n` values, returned in push order.
    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeError> {
        if self.stack.len() < n {
            return Err(stack_underflow(n, self.stack.len()));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }
}

fn jump_target(ins: &Instruction, at: usize) -> Result<usize, RuntimeError> {
    ins.jump_target(at).ok_or_else(|| {
        RuntimeError::new(
            ErrorKind::Decode,
            format!("jump at offset {} lands before the start of the code", at),
        )
    })
}

fn invalid_operator(ins: &Instruction, at: usize) -> RuntimeError {
    RuntimeError::new(
        ErrorKind::Decode,
        format!("invalid operator {} for {} at offset {}", ins.operand(0), ins.op.info().name, at),
    )
}
