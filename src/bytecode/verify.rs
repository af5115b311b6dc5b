use std::collections::HashMap;
use std::ops::Range;
use std::rc::Rc;

use thiserror::Error;

use crate::bytecode::ir::CompiledFunction;
use crate::bytecode::op::{Instruction, Opcode, decode};
use crate::bytecode::scope::ScopeKind;
use crate::lang::value::Value;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("verify error in {function} at {offset:04}: {message}")]
pub struct VerifyError {
    pub function: String,
    pub offset: usize,
    pub message: String,
}

impl VerifyError {
    fn new(function: &CompiledFunction, offset: usize, message: impl Into<String>) -> Self {
        VerifyError {
            function: function.name().to_string(),
            offset,
            message: message.into(),
        }
    }
}

/// Returns (pops, pushes) for an instruction.
fn effect(ins: &Instruction) -> (usize, usize) {
    use Opcode::*;
    let n = ins.operand(0);
    match ins.op {
        Nop | Halt => (0, 0),
        PopTop | Print => (1, 0),
        Nil | True | False | LoadConst | LoadFast | LoadGlobal | LoadName | LoadFree | MakeCell => (0, 1),
        StoreFast | StoreGlobal | StoreName | StoreFree => (1, 0),
        LoadClosure => (ins.operand(1), 1),
        BuildList | BuildSet => (n, 1),
        BuildMap => (2 * n, 1),
        BinarySubscr => (2, 1),
        StoreSubscr => (3, 0),
        DeleteSubscr => (2, 0),
        LoadAttr => (1, 1),
        StoreAttr => (2, 0),
        BinaryOp | CompareOp => (2, 1),
        UnaryNegative | UnaryNot | UnaryInvert | UnaryPositive => (1, 1),
        JumpForward | JumpBackward => (0, 0),
        PopJumpForwardIfTrue | PopJumpForwardIfFalse | PopJumpBackwardIfTrue | PopJumpBackwardIfFalse => (1, 0),
        Call => (n + 1, 1),
        ReturnValue => (n, 0),
    }
}

/// Verify the main-stream chunk at `range` and every function it loads.
///
/// Checks that each instruction decodes, that operand indices fit the
/// function's tables, that jumps land on instruction boundaries inside the
/// code being checked, and that every path reaches each offset with the same
/// stack height without underflowing.
pub fn verify_chunk(main: &CompiledFunction, range: Range<usize>) -> Result<(), VerifyError> {
    if range.end > main.instructions().len() || range.start >= range.end {
        return Err(VerifyError::new(main, range.start, "chunk range is outside the code"));
    }
    if main.instructions()[range.end - 1] != Opcode::Halt as u8 {
        return Err(VerifyError::new(main, range.end - 1, "chunk does not end with HALT"));
    }
    let mut verified = Vec::new();
    check_code(main, range, &mut verified)
}

fn check_code(
    function: &CompiledFunction,
    range: Range<usize>,
    verified: &mut Vec<Rc<CompiledFunction>>,
) -> Result<(), VerifyError> {
    let code = function.instructions();
    let mut heights: HashMap<usize, usize> = HashMap::new();
    let mut pending = vec![(range.start, 0usize)];
    let mut nested: Vec<Rc<CompiledFunction>> = Vec::new();

    while let Some((mut pos, mut height)) = pending.pop() {
        loop {
            match heights.get(&pos) {
                Some(&seen) if seen == height => break,
                Some(&seen) => {
                    return Err(VerifyError::new(
                        function,
                        pos,
                        format!("stack height {} does not match {} from another path", height, seen),
                    ));
                }
                None => {
                    heights.insert(pos, height);
                }
            }

            let ins = decode(code, pos).map_err(|e| VerifyError::new(function, pos, e.to_string()))?;
            if pos + ins.len > range.end {
                return Err(VerifyError::new(function, pos, "instruction runs past the end of the code"));
            }
            check_operands(function, &ins, pos, &mut nested)?;

            let (pops, pushes) = effect(&ins);
            if height < pops {
                return Err(VerifyError::new(
                    function,
                    pos,
                    format!("stack underflow: {} needs {} values, {} available", ins.op.info().name, pops, height),
                ));
            }
            height = height - pops + pushes;

            match ins.op {
                Opcode::Halt | Opcode::ReturnValue => break,
                Opcode::JumpForward | Opcode::JumpBackward => {
                    pos = jump_target(function, &ins, pos, &range)?;
                }
                op if op.is_jump() => {
                    pending.push((jump_target(function, &ins, pos, &range)?, height));
                    pos += ins.len;
                }
                _ => pos += ins.len,
            }
            if pos >= range.end {
                return Err(VerifyError::new(function, pos, "execution falls off the end of the code"));
            }
        }
    }

    check_boundaries(function, &range, &heights)?;

    for f in nested {
        if verified.iter().any(|v| Rc::ptr_eq(v, &f)) {
            continue;
        }
        verified.push(f.clone());
        check_code(&f, 0..f.instructions().len(), verified)?;
    }
    Ok(())
}

/// Reached offsets must coincide with offsets of a linear decode.
fn check_boundaries(
    function: &CompiledFunction,
    range: &Range<usize>,
    heights: &HashMap<usize, usize>,
) -> Result<(), VerifyError> {
    let code = function.instructions();
    let mut starts = Vec::new();
    let mut pos = range.start;
    while pos < range.end {
        starts.push(pos);
        match decode(code, pos) {
            Ok(ins) => pos += ins.len,
            Err(_) => break,
        }
    }
    for pos in heights.keys() {
        if starts.binary_search(pos).is_err() {
            return Err(VerifyError::new(function, *pos, "jump into the middle of an instruction"));
        }
    }
    Ok(())
}

fn jump_target(
    function: &CompiledFunction,
    ins: &Instruction,
    pos: usize,
    range: &Range<usize>,
) -> Result<usize, VerifyError> {
    match ins.jump_target(pos) {
        Some(target) if range.contains(&target) => Ok(target),
        _ => Err(VerifyError::new(function, pos, "jump target outside the code")),
    }
}

fn check_operands(
    function: &CompiledFunction,
    ins: &Instruction,
    pos: usize,
    nested: &mut Vec<Rc<CompiledFunction>>,
) -> Result<(), VerifyError> {
    use Opcode::*;
    let module = function.scope().kind() == ScopeKind::Module;
    let operand = ins.operand(0);
    let fail = |message: String| Err(VerifyError::new(function, pos, message));

    match ins.op {
        LoadConst | LoadClosure => match function.constants().get(operand) {
            None => return fail(format!("constant index {} out of range", operand)),
            Some(Value::Function(f)) => {
                if ins.op == LoadClosure && ins.operand(1) != f.free_vars().len() {
                    return fail(format!(
                        "closure over '{}' gets {} cells, needs {}",
                        f.name(),
                        ins.operand(1),
                        f.free_vars().len()
                    ));
                }
                nested.push(f.clone());
            }
            Some(_) if ins.op == LoadClosure => return fail("LOAD_CLOSURE of a non-function constant".to_string()),
            Some(_) => {}
        },
        LoadName | StoreName | LoadGlobal | StoreGlobal | LoadAttr | StoreAttr if operand >= function.names().len() => {
            return fail(format!("name index {} out of range", operand));
        }
        LoadFast | StoreFast if operand >= function.local_count() => {
            return fail(format!("local slot {} out of range", operand));
        }
        LoadFree | StoreFree if operand >= function.free_vars().len() => {
            return fail(format!("free variable {} out of range", operand));
        }
        MakeCell => {
            let limit = match ins.operand(1) {
                0 => function.local_count(),
                1 => function.free_vars().len(),
                source => return fail(format!("invalid cell source {}", source)),
            };
            if operand >= limit {
                return fail(format!("cell index {} out of range", operand));
            }
        }
        ReturnValue if operand > 1 => return fail(format!("invalid return flag {}", operand)),
        _ => {}
    }

    let function_only = matches!(
        ins.op,
        LoadFast | StoreFast | LoadFree | StoreFree | LoadGlobal | StoreGlobal | MakeCell | ReturnValue
    );
    let module_only = matches!(ins.op, LoadName | StoreName | Halt);
    if module && function_only {
        return fail(format!("{} in module code", ins.op.info().name));
    }
    if !module && module_only {
        return fail(format!("{} in function code", ins.op.info().name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::{Compiler, CompilerOptions};
    use crate::bytecode::op::make;
    use crate::bytecode::scope::Scope;
    use crate::frontend::lexer::Lexer;
    use crate::frontend::parser::Parser;

    fn compile(source: &str) -> (Rc<CompiledFunction>, Range<usize>) {
        let tokens = Lexer::new(source).tokenize().unwrap();
        let program = Parser::new(tokens).parse().unwrap();
        let mut compiler = Compiler::new(CompilerOptions::default());
        let range = compiler.compile(&program).unwrap();
        (compiler.main_function(), range)
    }

    fn main_with(code: Vec<Vec<u8>>, constants: Vec<Value>) -> CompiledFunction {
        CompiledFunction::new(
            Rc::from("main"),
            Vec::new(),
            code.concat(),
            constants,
            vec![Rc::from("x")],
            0,
            Vec::new(),
            Scope::new_module("main"),
        )
    }

    fn verify_all(f: &CompiledFunction) -> Result<(), VerifyError> {
        verify_chunk(f, 0..f.instructions().len())
    }

    #[test]
    fn test_compiled_programs_verify() {
        for source in [
            "x := 1\nprint x + 2",
            "a := true\nb := false\na && b || !a",
            "i := 0\nwhile i < 10 { if i == 5 { break }; i = i + 1; continue }",
            "func fib(n) { if n < 2 { return n }; return fib(n - 1) + fib(n - 2) }\nfib(10)",
            "func make() { var n = 0; return func() { n = n + 1; return n } }\nc := make()\nc()",
            "m := {\"a\": 1}\nm.b = 2\ndel m[\"a\"]\n[1, 2][0]",
        ] {
            let (main, range) = compile(source);
            verify_chunk(&main, range).unwrap_or_else(|e| panic!("{}: {}", source, e));
        }
    }

    #[test]
    fn test_underflow() {
        let f = main_with(vec![make(Opcode::PopTop, &[]), make(Opcode::Halt, &[])], vec![]);
        let err = verify_all(&f).unwrap_err();
        assert!(err.message.contains("underflow"));
        assert_eq!(err.offset, 0);
    }

    #[test]
    fn test_missing_halt() {
        let f = main_with(vec![make(Opcode::Nil, &[])], vec![]);
        assert!(verify_all(&f).unwrap_err().message.contains("HALT"));
    }

    #[test]
    fn test_constant_out_of_range() {
        let f = main_with(vec![make(Opcode::LoadConst, &[3]), make(Opcode::Halt, &[])], vec![]);
        assert!(verify_all(&f).unwrap_err().message.contains("constant index 3"));
    }

    #[test]
    fn test_jump_outside_code() {
        let f = main_with(vec![make(Opcode::JumpForward, &[40]), make(Opcode::Halt, &[])], vec![]);
        assert!(verify_all(&f).unwrap_err().message.contains("jump target"));
    }

    #[test]
    fn test_jump_into_instruction() {
        // JUMP_FORWARD 1 lands on the second byte of LOAD_CONST
        let f = main_with(
            vec![
                make(Opcode::JumpForward, &[1]),
                make(Opcode::LoadConst, &[0]),
                make(Opcode::Halt, &[]),
            ],
            vec![Value::Int(1)],
        );
        assert!(verify_all(&f).is_err());
    }

    #[test]
    fn test_mismatched_heights_at_join() {
        // one branch pushes a value, the other does not
        let f = main_with(
            vec![
                make(Opcode::True, &[]),
                make(Opcode::PopJumpForwardIfFalse, &[1]),
                make(Opcode::Nil, &[]),
                make(Opcode::Halt, &[]),
            ],
            vec![],
        );
        assert!(verify_all(&f).unwrap_err().message.contains("does not match"));
    }

    #[test]
    fn test_fast_access_in_module_code() {
        let f = main_with(vec![make(Opcode::LoadFast, &[0]), make(Opcode::Halt, &[])], vec![]);
        assert!(verify_all(&f).is_err());
    }

    #[test]
    fn test_verifies_only_the_given_chunk() {
        let f = main_with(
            vec![
                make(Opcode::PopTop, &[]),
                make(Opcode::Halt, &[]),
                make(Opcode::LoadName, &[0]),
                make(Opcode::Halt, &[]),
            ],
            vec![],
        );
        assert!(verify_chunk(&f, 2..f.instructions().len()).is_ok());
        assert!(verify_chunk(&f, 0..2).is_err());
    }

    fn verify_body(function: &CompiledFunction) -> Result<(), VerifyError> {
        check_code(function, 0..function.instructions().len(), &mut Vec::new())
    }

    #[test]
    fn test_function_code_rejects_halt() {
        let (main, _) = compile("func f(a) { return a }");
        let f = main.nested_functions().next().cloned().unwrap();
        assert!(verify_body(&f).is_ok());

        let broken = CompiledFunction::new(
            Rc::from("f"),
            vec![Rc::from("a")],
            [make(Opcode::LoadFast, &[0]), make(Opcode::Halt, &[])].concat(),
            Vec::new(),
            Vec::new(),
            1,
            Vec::new(),
            f.scope().clone(),
        );
        assert!(verify_body(&broken).unwrap_err().message.contains("HALT in function code"));
    }
}
