use std::collections::BTreeSet;
use std::fmt::Write;
use std::ops::Range;
use std::rc::Rc;

use crate::bytecode::ir::CompiledFunction;
use crate::bytecode::op::{BinaryOpType, CompareOpType, DecodeError, Instruction, Opcode, instructions};
use crate::lang::value::Value;

const RULE: &str = "════════════════════════════════════════";

/// Print the disassembly of a function and every function nested in it.
pub fn print_function(function: &CompiledFunction) {
    match disassemble(function) {
        Ok(text) => print!("{}", text),
        Err(e) => eprintln!("disassembly failed: {}", e),
    }
}

/// Disassemble a whole function, followed by the functions in its constant pool.
pub fn disassemble(function: &CompiledFunction) -> Result<String, DecodeError> {
    disassemble_range(function, 0..function.instructions().len())
}

/// Disassemble `range` of a function's code, followed by the functions that
/// range loads. The interpreter uses this to show one chunk of the main stream.
pub fn disassemble_range(function: &CompiledFunction, range: Range<usize>) -> Result<String, DecodeError> {
    let mut out = String::new();
    write_header(&mut out, function, 0);
    let loaded = write_code(&mut out, function, range, 0)?;
    out.push('\n');

    for idx in loaded {
        if let Some(Value::Function(nested)) = function.constants().get(idx) {
            write_nested(&mut out, nested, 1)?;
        }
    }
    Ok(out)
}

fn write_nested(out: &mut String, function: &Rc<CompiledFunction>, indent: usize) -> Result<(), DecodeError> {
    write_header(out, function, indent);
    write_code(out, function, 0..function.instructions().len(), indent)?;
    out.push('\n');
    for nested in function.nested_functions() {
        write_nested(out, nested, indent + 1)?;
    }
    Ok(())
}

fn write_header(out: &mut String, function: &CompiledFunction, indent: usize) {
    let prefix = "  ".repeat(indent);
    let params: Vec<&str> = function.params().iter().map(|p| p.as_ref()).collect();
    let _ = writeln!(out, "{}{}", prefix, RULE);
    let _ = writeln!(out, "{} {}({})", prefix, function.scope().path(), params.join(", "));
    let _ = writeln!(
        out,
        "{} {} bytes, {} constants, {} names, {} locals, {} free",
        prefix,
        function.instructions().len(),
        function.constants().len(),
        function.names().len(),
        function.local_count(),
        function.free_vars().len()
    );
    let _ = writeln!(out, "{}{}", prefix, RULE);
}

/// Write one line per instruction; returns the constant indices of the
/// functions the code loads.
fn write_code(
    out: &mut String,
    function: &CompiledFunction,
    range: Range<usize>,
    indent: usize,
) -> Result<Vec<usize>, DecodeError> {
    let code = &function.instructions()[range.clone()];
    let decoded = instructions(code).collect::<Result<Vec<_>, _>>()?;
    let targets = jump_targets(&decoded, range.start);
    let prefix = "  ".repeat(indent);
    let mut loaded = Vec::new();

    for (rel, ins) in &decoded {
        let offset = range.start + rel;
        let marked = targets.contains(&offset);
        if marked {
            let _ = writeln!(out, "{}      ┌──────────────────────────────────", prefix);
        }
        let _ = writeln!(
            out,
            "{}{:04} {}{}",
            prefix,
            offset,
            if marked { "► " } else { "  " },
            format_instruction(function, ins, offset)
        );
        if let Some(idx) = function_constant(function, ins) {
            if !loaded.contains(&idx) {
                loaded.push(idx);
            }
        }
    }
    Ok(loaded)
}

fn function_constant(function: &CompiledFunction, ins: &Instruction) -> Option<usize> {
    match ins.op {
        Opcode::LoadConst | Opcode::LoadClosure => {
            let idx = ins.operand(0);
            matches!(function.constants().get(idx), Some(Value::Function(_))).then_some(idx)
        }
        _ => None,
    }
}

fn jump_targets(decoded: &[(usize, Instruction)], base: usize) -> BTreeSet<usize> {
    decoded
        .iter()
        .filter_map(|(rel, ins)| ins.jump_target(base + rel))
        .collect()
}

/// Render one instruction as `NAME operands ; annotation`.
pub fn format_instruction(function: &CompiledFunction, ins: &Instruction, offset: usize) -> String {
    let name = ins.op.info().name;
    let operands: Vec<String> = ins.operands.iter().map(|o| o.to_string()).collect();
    let head = format!("{:<26} {}", name, operands.join(" "));
    match annotate(function, ins, offset) {
        Some(note) => format!("{:<34} ; {}", head.trim_end(), note),
        None => head.trim_end().to_string(),
    }
}

fn annotate(function: &CompiledFunction, ins: &Instruction, offset: usize) -> Option<String> {
    let operand = ins.operand(0);
    match ins.op {
        Opcode::LoadConst => function.constants().get(operand).map(format_constant),
        Opcode::LoadGlobal
        | Opcode::StoreGlobal
        | Opcode::LoadName
        | Opcode::StoreName
        | Opcode::LoadAttr
        | Opcode::StoreAttr => function.names().get(operand).map(|n| n.to_string()),
        Opcode::LoadFast | Opcode::StoreFast => function.scope().local_name(operand).map(|n| n.to_string()),
        Opcode::LoadFree | Opcode::StoreFree => function.free_vars().get(operand).map(|f| f.name.to_string()),
        Opcode::MakeCell => Some(if ins.operand(1) == 0 {
            match function.scope().local_name(operand) {
                Some(name) => format!("local {}", name),
                None => "local".to_string(),
            }
        } else {
            match function.free_vars().get(operand) {
                Some(free) => format!("free {}", free.name),
                None => "free".to_string(),
            }
        }),
        Opcode::LoadClosure => function
            .constants()
            .get(operand)
            .map(|c| format!("{} with {} cell(s)", format_constant(c), ins.operand(1))),
        Opcode::BinaryOp => BinaryOpType::from_byte(operand as u8).map(|b| b.symbol().to_string()),
        Opcode::CompareOp => CompareOpType::from_byte(operand as u8).map(|c| c.symbol().to_string()),
        Opcode::ReturnValue => Some(if operand == 1 { "value" } else { "nil" }.to_string()),
        op if op.is_jump() => ins.jump_target(offset).map(|t| {
            let direction = if op.is_backward_jump() { "↑" } else { "↓" };
            format!("{} to {:04}", direction, t)
        }),
        _ => None,
    }
}

fn format_constant(value: &Value) -> String {
    match value {
        Value::Str(s) => format!("{:?}", s),
        other => other.to_string(),
    }
}
