use std::cell::RefCell;
use std::collections::HashSet;
use std::ops::Range;
use std::rc::Rc;

use indexmap::IndexSet;
use tracing::debug;

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::ir::CompiledFunction;
use crate::bytecode::op::{BinaryOpType, CompareOpType, Opcode, make};
use crate::bytecode::scope::{Capture, Scope, ScopeKind, Symbol};
use crate::frontend::lexer::Span;
use crate::lang::ast::{BinaryOp, Expr, ExprKind, LogicalOp, Program, Stmt, StmtKind, UnaryOp};
use crate::lang::value::Value;

const MAX_U8: usize = u8::MAX as usize;
const MAX_U16: usize = u16::MAX as usize;

pub struct CompilerOptions {
    /// Names of the session's builtin layer; top-level code may not assign them.
    pub builtins: Vec<Rc<str>>,
    /// Name of the main unit.
    pub name: String,
    /// Module scope to continue from; a fresh one is created when `None`.
    pub scope: Option<Rc<Scope>>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            builtins: Vec::new(),
            name: "main".to_string(),
            scope: None,
        }
    }
}

#[derive(Default)]
struct LoopContext {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

/// Code being generated for one function (or for the session's main stream).
struct Unit {
    name: Rc<str>,
    params: Vec<Rc<str>>,
    scope: Rc<Scope>,
    instructions: Vec<u8>,
    constants: Vec<Value>,
    names: IndexSet<Rc<str>>,
    loops: Vec<LoopContext>,
}

/// Lengths of the main unit before a chunk; restored when the chunk fails.
struct Checkpoint {
    instructions: usize,
    constants: usize,
    names: usize,
    declared: usize,
}

impl Unit {
    fn new(name: &str, params: Vec<Rc<str>>, scope: Rc<Scope>) -> Self {
        Unit {
            name: Rc::from(name),
            params,
            scope,
            instructions: Vec::new(),
            constants: Vec::new(),
            names: IndexSet::new(),
            loops: Vec::new(),
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            instructions: self.instructions.len(),
            constants: self.constants.len(),
            names: self.names.len(),
            declared: self.scope.declared_count(),
        }
    }

    fn rollback(&mut self, checkpoint: Checkpoint) {
        self.instructions.truncate(checkpoint.instructions);
        self.constants.truncate(checkpoint.constants);
        self.names.truncate(checkpoint.names);
        self.scope.truncate_declared(checkpoint.declared);
        self.loops.clear();
    }

    fn into_function(self) -> CompiledFunction {
        let local_count = self.scope.local_count();
        let free_vars = self.scope.free_vars();
        CompiledFunction::new(
            self.name,
            self.params,
            self.instructions,
            self.constants,
            self.names.into_iter().collect(),
            local_count,
            free_vars,
            self.scope,
        )
    }
}

/// Compiles parsed chunks into one growing main instruction stream.
///
/// Each call to [`Compiler::compile`] appends a chunk ending in `HALT` and
/// returns its byte range. Function bodies compile into their own
/// [`CompiledFunction`]s stored in the constant pool of the enclosing unit.
pub struct Compiler {
    main: Unit,
    /// Function units being compiled, innermost last.
    units: Vec<Unit>,
    builtins: HashSet<Rc<str>>,
    /// Last snapshot of `main`, dropped whenever a chunk is compiled.
    snapshot: RefCell<Option<Rc<CompiledFunction>>>,
}

impl Compiler {
    pub fn new(options: CompilerOptions) -> Self {
        let scope = options
            .scope
            .unwrap_or_else(|| Scope::new_module(&options.name));
        Compiler {
            main: Unit::new(&options.name, Vec::new(), scope),
            units: Vec::new(),
            builtins: options.builtins.into_iter().collect(),
            snapshot: RefCell::new(None),
        }
    }

    /// The main instruction stream accumulated so far.
    pub fn instructions(&self) -> &[u8] {
        &self.main.instructions
    }

    pub fn scope(&self) -> &Rc<Scope> {
        &self.main.scope
    }

    /// Immutable snapshot of the main unit, used to start a VM. Repeated
    /// calls between two `compile`s share one snapshot.
    pub fn main_function(&self) -> Rc<CompiledFunction> {
        if let Some(snapshot) = self.snapshot.borrow().as_ref() {
            return snapshot.clone();
        }
        let snapshot = Rc::new(CompiledFunction::new(
            self.main.name.clone(),
            Vec::new(),
            self.main.instructions.clone(),
            self.main.constants.clone(),
            self.main.names.iter().cloned().collect(),
            0,
            Vec::new(),
            self.main.scope.clone(),
        ));
        *self.snapshot.borrow_mut() = Some(snapshot.clone());
        snapshot
    }

    /// Append `program` to the main stream. On failure the main unit is
    /// restored to its state before the call.
    pub fn compile(&mut self, program: &Program) -> Result<Range<usize>, CompileError> {
        self.snapshot.get_mut().take();
        let checkpoint = self.main.checkpoint();
        let start = checkpoint.instructions;

        match self.compile_chunk(program) {
            Ok(()) => {
                let end = self.main.instructions.len();
                debug!(start, end, constants = self.main.constants.len(), "chunk compiled");
                Ok(start..end)
            }
            Err(e) => {
                self.units.clear();
                self.main.rollback(checkpoint);
                debug!(error = %e, "chunk rolled back");
                Err(e)
            }
        }
    }

    fn compile_chunk(&mut self, program: &Program) -> Result<(), CompileError> {
        let count = program.statements.len();
        for (i, stmt) in program.statements.iter().enumerate() {
            match &stmt.kind {
                // The chunk's last expression stays on the stack as its result.
                StmtKind::Expr(expr) if i + 1 == count => self.compile_expr(expr)?,
                _ => self.compile_stmt(stmt)?,
            }
        }
        self.emit(Opcode::Halt, &[], Span::default())?;
        Ok(())
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn unit(&mut self) -> &mut Unit {
        match self.units.last_mut() {
            Some(unit) => unit,
            None => &mut self.main,
        }
    }

    fn current_scope(&self) -> Rc<Scope> {
        match self.units.last() {
            Some(unit) => unit.scope.clone(),
            None => self.main.scope.clone(),
        }
    }

    fn emit(&mut self, op: Opcode, operands: &[usize], span: Span) -> Result<usize, CompileError> {
        for (value, width) in operands.iter().zip(op.info().operand_widths) {
            let limit = if *width == 1 { MAX_U8 } else { MAX_U16 };
            if *value > limit {
                return Err(CompileError::new(
                    format!("operand {} of {} does not fit in {} byte(s)", value, op.info().name, width),
                    span,
                ));
            }
        }
        let unit = self.unit();
        let pos = unit.instructions.len();
        unit.instructions.extend(make(op, operands));
        Ok(pos)
    }

    /// Emit a forward jump with a placeholder offset; returns its position.
    fn emit_jump(&mut self, op: Opcode, span: Span) -> Result<usize, CompileError> {
        self.emit(op, &[0], span)
    }

    /// Point the forward jump at `pos` to the current end of code.
    fn patch_jump(&mut self, pos: usize, span: Span) -> Result<(), CompileError> {
        let code = &mut self.unit().instructions;
        let offset = code.len() - (pos + 3);
        let offset = u16::try_from(offset).map_err(|_| CompileError::new("jump too large", span))?;
        code[pos + 1..pos + 3].copy_from_slice(&offset.to_be_bytes());
        Ok(())
    }

    fn emit_backward_jump(&mut self, op: Opcode, target: usize, span: Span) -> Result<(), CompileError> {
        let end = self.unit().instructions.len() + 3;
        self.emit(op, &[end - target], span)?;
        Ok(())
    }

    fn add_constant(&mut self, value: Value, span: Span) -> Result<usize, CompileError> {
        let unit = self.unit();
        let scalar = matches!(value, Value::Int(_) | Value::Float(_) | Value::Str(_));
        if scalar {
            if let Some(idx) = unit
                .constants
                .iter()
                .position(|c| c.type_name() == value.type_name() && *c == value)
            {
                return Ok(idx);
            }
        }
        if unit.constants.len() > MAX_U16 {
            return Err(CompileError::too_many("constants", MAX_U16 + 1, span));
        }
        unit.constants.push(value);
        Ok(unit.constants.len() - 1)
    }

    fn add_name(&mut self, name: &Rc<str>, span: Span) -> Result<usize, CompileError> {
        let unit = self.unit();
        let (idx, _) = unit.names.insert_full(name.clone());
        if idx > MAX_U16 {
            unit.names.truncate(idx);
            return Err(CompileError::too_many("names", MAX_U16 + 1, span));
        }
        Ok(idx)
    }

    fn emit_load(&mut self, symbol: Symbol, span: Span) -> Result<(), CompileError> {
        match symbol {
            Symbol::Local(slot) => self.emit(Opcode::LoadFast, &[slot as usize], span)?,
            Symbol::Free(idx) => self.emit(Opcode::LoadFree, &[idx as usize], span)?,
            Symbol::Global(name) => {
                let idx = self.add_name(&name, span)?;
                self.emit(Opcode::LoadGlobal, &[idx], span)?
            }
            Symbol::Name(name) => {
                let idx = self.add_name(&name, span)?;
                self.emit(Opcode::LoadName, &[idx], span)?
            }
        };
        Ok(())
    }

    fn emit_store(&mut self, symbol: Symbol, span: Span) -> Result<(), CompileError> {
        match symbol {
            Symbol::Local(slot) => self.emit(Opcode::StoreFast, &[slot as usize], span)?,
            Symbol::Free(idx) => self.emit(Opcode::StoreFree, &[idx as usize], span)?,
            Symbol::Global(name) => {
                let idx = self.add_name(&name, span)?;
                self.emit(Opcode::StoreGlobal, &[idx], span)?
            }
            Symbol::Name(name) => {
                let idx = self.add_name(&name, span)?;
                self.emit(Opcode::StoreName, &[idx], span)?
            }
        };
        Ok(())
    }

    // =========================================================================
    // Declarations
    // =========================================================================

    fn declare(&mut self, name: &str, span: Span) -> Result<Symbol, CompileError> {
        let scope = self.current_scope();
        if scope.kind() == ScopeKind::Module && self.builtins.contains(name) {
            return Err(CompileError::assign_to_builtin(name, span));
        }
        scope
            .declare(name)
            .map_err(|_| CompileError::too_many("local variables", MAX_U16 + 1, span))
    }

    /// Binding written by `name = value`.
    fn assignment_target(&mut self, name: &str, span: Span) -> Result<Symbol, CompileError> {
        let scope = self.current_scope();
        if scope.kind() == ScopeKind::Module {
            return self.declare(name, span);
        }
        match scope.resolve(name) {
            Symbol::Global(global) => {
                if self.builtins.contains(name) && !self.main.scope.is_declared(name) {
                    return Err(CompileError::assign_to_builtin(name, span));
                }
                if !self.main.scope.is_declared(name) {
                    return Err(CompileError::undeclared_assignment(name, span));
                }
                Ok(Symbol::Global(global))
            }
            symbol => Ok(symbol),
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn compile_block(&mut self, statements: &[Stmt]) -> Result<(), CompileError> {
        for stmt in statements {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Var { name, value } => {
                // a function literal may refer to the name it is bound to
                if matches!(value.kind, ExprKind::Func { .. }) {
                    let symbol = self.declare(name, span)?;
                    self.compile_function(name, value)?;
                    self.emit_store(symbol, span)?;
                } else {
                    self.compile_expr(value)?;
                    let symbol = self.declare(name, span)?;
                    self.emit_store(symbol, span)?;
                }
            }

            StmtKind::Assign { target, value } => self.compile_assign(target, value, span)?,

            StmtKind::FuncDef { name, params, body } => {
                let symbol = self.declare(name, span)?;
                let literal = Expr::new(
                    ExprKind::Func {
                        params: params.clone(),
                        body: body.clone(),
                    },
                    span,
                );
                self.compile_function(name, &literal)?;
                self.emit_store(symbol, span)?;
            }

            StmtKind::Return(value) => {
                if self.units.is_empty() {
                    return Err(CompileError::return_outside_function(span));
                }
                match value {
                    Some(expr) => {
                        self.compile_expr(expr)?;
                        self.emit(Opcode::ReturnValue, &[1], span)?;
                    }
                    None => {
                        self.emit(Opcode::ReturnValue, &[0], span)?;
                    }
                }
            }

            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                self.compile_expr(cond)?;
                let to_else = self.emit_jump(Opcode::PopJumpForwardIfFalse, span)?;
                self.compile_block(then_body)?;
                match else_body {
                    Some(else_body) => {
                        let to_end = self.emit_jump(Opcode::JumpForward, span)?;
                        self.patch_jump(to_else, span)?;
                        self.compile_block(else_body)?;
                        self.patch_jump(to_end, span)?;
                    }
                    None => self.patch_jump(to_else, span)?,
                }
            }

            StmtKind::While { cond, body } => {
                // rotated: the condition sits after the body
                let to_cond = self.emit_jump(Opcode::JumpForward, span)?;
                let body_start = self.unit().instructions.len();
                self.unit().loops.push(LoopContext::default());
                self.compile_block(body)?;
                let ctx = self.unit().loops.pop().unwrap_or_default();

                self.patch_jump(to_cond, span)?;
                for pos in ctx.continues {
                    self.patch_jump(pos, span)?;
                }
                self.compile_expr(cond)?;
                self.emit_backward_jump(Opcode::PopJumpBackwardIfTrue, body_start, span)?;
                for pos in ctx.breaks {
                    self.patch_jump(pos, span)?;
                }
            }

            StmtKind::Break | StmtKind::Continue => {
                let is_break = matches!(stmt.kind, StmtKind::Break);
                if self.unit().loops.is_empty() {
                    let keyword = if is_break { "break" } else { "continue" };
                    return Err(CompileError::outside_loop(keyword, span));
                }
                let pos = self.emit_jump(Opcode::JumpForward, span)?;
                if let Some(ctx) = self.unit().loops.last_mut() {
                    if is_break {
                        ctx.breaks.push(pos);
                    } else {
                        ctx.continues.push(pos);
                    }
                }
            }

            StmtKind::Print(expr) => {
                self.compile_expr(expr)?;
                self.emit(Opcode::Print, &[], span)?;
            }

            StmtKind::Del { object, key } => {
                self.compile_expr(object)?;
                self.compile_expr(key)?;
                self.emit(Opcode::DeleteSubscr, &[], span)?;
            }

            StmtKind::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Opcode::PopTop, &[], span)?;
            }
        }
        Ok(())
    }

    fn compile_assign(&mut self, target: &Expr, value: &Expr, span: Span) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Ident(name) => {
                let symbol = self.assignment_target(name, target.span)?;
                if matches!(value.kind, ExprKind::Func { .. }) {
                    self.compile_function(name, value)?;
                } else {
                    self.compile_expr(value)?;
                }
                self.emit_store(symbol, span)
            }
            ExprKind::Index { object, index } => {
                self.compile_expr(value)?;
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit(Opcode::StoreSubscr, &[], span)?;
                Ok(())
            }
            ExprKind::Attr { object, name } => {
                self.compile_expr(value)?;
                self.compile_expr(object)?;
                let idx = self.add_name(&Rc::from(name.as_str()), span)?;
                self.emit(Opcode::StoreAttr, &[idx], span)?;
                Ok(())
            }
            _ => Err(CompileError::invalid_target(target.span)),
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Int(n) => {
                let idx = self.add_constant(Value::Int(*n), span)?;
                self.emit(Opcode::LoadConst, &[idx], span)?;
            }
            ExprKind::Float(n) => {
                let idx = self.add_constant(Value::Float(*n), span)?;
                self.emit(Opcode::LoadConst, &[idx], span)?;
            }
            ExprKind::Str(s) => {
                let idx = self.add_constant(Value::str(s), span)?;
                self.emit(Opcode::LoadConst, &[idx], span)?;
            }
            ExprKind::Bool(true) => {
                self.emit(Opcode::True, &[], span)?;
            }
            ExprKind::Bool(false) => {
                self.emit(Opcode::False, &[], span)?;
            }
            ExprKind::Nil => {
                self.emit(Opcode::Nil, &[], span)?;
            }

            ExprKind::Ident(name) => {
                let symbol = self.current_scope().resolve(name);
                self.emit_load(symbol, span)?;
            }

            ExprKind::List(items) => {
                self.check_count(items.len(), "list elements", span)?;
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit(Opcode::BuildList, &[items.len()], span)?;
            }
            ExprKind::Set(items) => {
                self.check_count(items.len(), "set elements", span)?;
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit(Opcode::BuildSet, &[items.len()], span)?;
            }
            ExprKind::Map(entries) => {
                self.check_count(entries.len(), "map entries", span)?;
                for (key, value) in entries {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.emit(Opcode::BuildMap, &[entries.len()], span)?;
            }

            ExprKind::Unary { op, operand } => {
                self.compile_expr(operand)?;
                let opcode = match op {
                    UnaryOp::Neg => Opcode::UnaryNegative,
                    UnaryOp::Plus => Opcode::UnaryPositive,
                    UnaryOp::Not => Opcode::UnaryNot,
                    UnaryOp::Invert => Opcode::UnaryInvert,
                };
                self.emit(opcode, &[], span)?;
            }

            ExprKind::Binary { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                match binary_opcode(*op) {
                    Operator::Binary(kind) => self.emit(Opcode::BinaryOp, &[kind as usize], span)?,
                    Operator::Compare(kind) => self.emit(Opcode::CompareOp, &[kind as usize], span)?,
                };
            }

            ExprKind::Logical { op, left, right } => {
                // Both operands jump to a shared exit that pushes the
                // short-circuit result; falling through pushes the other one.
                let (jump, exit_value, fall_value) = match op {
                    LogicalOp::And => (Opcode::PopJumpForwardIfFalse, Opcode::False, Opcode::True),
                    LogicalOp::Or => (Opcode::PopJumpForwardIfTrue, Opcode::True, Opcode::False),
                };
                self.compile_expr(left)?;
                let first = self.emit_jump(jump, span)?;
                self.compile_expr(right)?;
                let second = self.emit_jump(jump, span)?;
                self.emit(fall_value, &[], span)?;
                let to_end = self.emit_jump(Opcode::JumpForward, span)?;
                self.patch_jump(first, span)?;
                self.patch_jump(second, span)?;
                self.emit(exit_value, &[], span)?;
                self.patch_jump(to_end, span)?;
            }

            ExprKind::Call { callee, args } => {
                if args.len() > MAX_U8 {
                    return Err(CompileError::too_many("arguments", MAX_U8, span));
                }
                self.compile_expr(callee)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(Opcode::Call, &[args.len()], span)?;
            }

            ExprKind::Index { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit(Opcode::BinarySubscr, &[], span)?;
            }

            ExprKind::Attr { object, name } => {
                self.compile_expr(object)?;
                let idx = self.add_name(&Rc::from(name.as_str()), span)?;
                self.emit(Opcode::LoadAttr, &[idx], span)?;
            }

            ExprKind::Func { .. } => self.compile_function("<anonymous>", expr)?,
        }
        Ok(())
    }

    fn check_count(&self, count: usize, what: &str, span: Span) -> Result<(), CompileError> {
        if count > MAX_U16 {
            return Err(CompileError::too_many(what, MAX_U16, span));
        }
        Ok(())
    }

    /// Compile a function literal into a constant and emit the code that
    /// pushes it (as a closure when it captures anything).
    fn compile_function(&mut self, name: &str, literal: &Expr) -> Result<(), CompileError> {
        let span = literal.span;
        let ExprKind::Func { params, body } = &literal.kind else {
            return Err(CompileError::new("expected a function literal", span));
        };
        if params.len() > MAX_U8 {
            return Err(CompileError::too_many("parameters", MAX_U8, span));
        }

        let scope = Scope::new_function(name, self.current_scope());
        for param in params {
            scope
                .declare(param)
                .map_err(|_| CompileError::too_many("local variables", MAX_U16 + 1, span))?;
        }
        let params: Vec<Rc<str>> = params.iter().map(|p| Rc::from(p.as_str())).collect();

        self.units.push(Unit::new(name, params, scope));
        let result = self
            .compile_block(body)
            .and_then(|()| self.emit(Opcode::ReturnValue, &[0], span).map(|_| ()));
        let unit = match self.units.pop() {
            Some(unit) => unit,
            None => return Err(CompileError::new("function unit stack is empty", span)),
        };
        result?;

        if unit.scope.local_count() > MAX_U16 + 1 {
            return Err(CompileError::too_many("local variables", MAX_U16 + 1, span));
        }
        let function = Rc::new(unit.into_function());
        debug!(
            function = function.name(),
            bytes = function.instructions().len(),
            locals = function.local_count(),
            free = function.free_vars().len(),
            "function compiled"
        );

        let free_vars = function.free_vars().to_vec();
        let idx = self.add_constant(Value::Function(function), span)?;
        if free_vars.is_empty() {
            self.emit(Opcode::LoadConst, &[idx], span)?;
            return Ok(());
        }
        for free in &free_vars {
            match free.capture {
                Capture::Local(slot) => self.emit(Opcode::MakeCell, &[slot as usize, 0], span)?,
                Capture::Free(index) => self.emit(Opcode::MakeCell, &[index as usize, 1], span)?,
            };
        }
        self.emit(Opcode::LoadClosure, &[idx, free_vars.len()], span)?;
        Ok(())
    }
}

enum Operator {
    Binary(BinaryOpType),
    Compare(CompareOpType),
}

fn binary_opcode(op: BinaryOp) -> Operator {
    use Operator::*;
    match op {
        BinaryOp::Add => Binary(BinaryOpType::Add),
        BinaryOp::Sub => Binary(BinaryOpType::Subtract),
        BinaryOp::Mul => Binary(BinaryOpType::Multiply),
        BinaryOp::Div => Binary(BinaryOpType::Divide),
        BinaryOp::Mod => Binary(BinaryOpType::Modulo),
        BinaryOp::Pow => Binary(BinaryOpType::Power),
        BinaryOp::BitAnd => Binary(BinaryOpType::And),
        BinaryOp::BitOr => Binary(BinaryOpType::Or),
        BinaryOp::BitXor => Binary(BinaryOpType::Xor),
        BinaryOp::Shl => Binary(BinaryOpType::LShift),
        BinaryOp::Shr => Binary(BinaryOpType::RShift),
        BinaryOp::Eq => Compare(CompareOpType::Equal),
        BinaryOp::NotEq => Compare(CompareOpType::NotEqual),
        BinaryOp::Lt => Compare(CompareOpType::LessThan),
        BinaryOp::LtEq => Compare(CompareOpType::LessThanOrEqual),
        BinaryOp::Gt => Compare(CompareOpType::GreaterThan),
        BinaryOp::GtEq => Compare(CompareOpType::GreaterThanOrEqual),
    }
}
