use std::ops::Range;
use std::rc::Rc;

use tracing::{debug, instrument};

use crate::bytecode::compile::{Compiler, CompilerOptions};
use crate::bytecode::disasm;
use crate::bytecode::ir::CompiledFunction;
use crate::bytecode::op::DecodeError;
use crate::bytecode::verify::verify_chunk;
use crate::error::Error;
use crate::frontend::lexer::Lexer;
use crate::frontend::parser::Parser;
use crate::lang::ast::Program;
use crate::lang::value::{Builtin, Value};
use crate::modules;
use crate::runtime::context::CancelToken;
use crate::runtime::globals::Globals;
use crate::runtime::vm::{Vm, VmConfig};

/// A REPL session: one growing main stream and one global namespace.
///
/// Each `evaluate` compiles its source as a new chunk appended to the main
/// stream and runs only that chunk. Names defined by earlier chunks stay
/// visible to later ones.
pub struct Interpreter {
    compiler: Compiler,
    globals: Globals,
    config: VmConfig,
    cancel: CancelToken,
}

impl Interpreter {
    pub fn new(extra_builtins: Vec<Builtin>) -> Self {
        Self::with_config(VmConfig::default(), extra_builtins)
    }

    /// Host builtins are registered last and shadow catalog entries of the
    /// same name.
    pub fn with_config(config: VmConfig, extra_builtins: Vec<Builtin>) -> Self {
        let globals = modules::globals(extra_builtins);
        let compiler = Compiler::new(CompilerOptions {
            builtins: globals.builtin_names().cloned().collect(),
            ..CompilerOptions::default()
        });
        Interpreter {
            compiler,
            globals,
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Handle for interrupting blocking builtins from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    /// The session's main stream as a function value.
    pub fn main_function(&self) -> Rc<CompiledFunction> {
        self.compiler.main_function()
    }

    #[instrument(skip(self, source), fields(len = source.len()))]
    pub fn evaluate(&mut self, source: &str) -> Result<Value, Error> {
        let program = parse(source)?;
        let chunk = self.compile(&program)?;
        let value = self.execute(chunk)?;
        debug!(value = %value, "chunk evaluated");
        Ok(value)
    }

    /// Append `program` to the main stream and return its byte range.
    ///
    /// A compile error leaves the stream untouched. A verify error leaves the
    /// compiled chunk in place but it is never executed.
    pub fn compile(&mut self, program: &Program) -> Result<Range<usize>, Error> {
        let chunk = self.compiler.compile(program)?;
        debug!(start = chunk.start, end = chunk.end, "chunk compiled");
        if self.config.verify {
            verify_chunk(&self.compiler.main_function(), chunk.clone())?;
        }
        Ok(chunk)
    }

    /// Run a chunk previously returned by `compile`; yields the value it
    /// left on the stack, or nil.
    pub fn execute(&mut self, chunk: Range<usize>) -> Result<Value, Error> {
        self.cancel.reset();
        let main = self.compiler.main_function();
        let mut vm = Vm::new_at(main, chunk.start, &mut self.globals)
            .with_config(self.config.clone())
            .with_cancel_token(self.cancel.clone());
        vm.run()?;
        debug!(steps = vm.steps(), "chunk executed");
        Ok(vm.top_of_stack().cloned().unwrap_or(Value::Nil))
    }

    /// Disassembly of one chunk of the main stream and of the functions it
    /// defines.
    pub fn disassemble(&self, chunk: Range<usize>) -> Result<String, DecodeError> {
        disasm::disassemble_range(&self.compiler.main_function(), chunk)
    }
}

pub fn parse(source: &str) -> Result<Program, Error> {
    let tokens = Lexer::new(source).tokenize()?;
    Ok(Parser::new(tokens).parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::value::Outcome;
    use crate::runtime::runtime_error::ErrorKind;

    fn eval(interp: &mut Interpreter, source: &str) -> Value {
        match interp.evaluate(source) {
            Ok(v) => v,
            Err(e) => panic!("evaluate({:?}) failed: {}", source, e),
        }
    }

    fn run_code(source: &str) -> Value {
        eval(&mut Interpreter::new(vec![]), source)
    }

    fn assert_error(interp: &mut Interpreter, source: &str, fragment: &str) -> Error {
        match interp.evaluate(source) {
            Ok(v) => panic!("expected an error containing {:?}, got {}", fragment, v),
            Err(e) => {
                assert!(e.to_string().contains(fragment), "{:?} not in {}", fragment, e);
                e
            }
        }
    }

    #[test]
    fn test_arithmetic_value() {
        assert_eq!(run_code("1 + 2 * 3"), Value::Int(7));
        assert_eq!(run_code("x := 5"), Value::Nil);
    }

    #[test]
    fn test_session_persistence() {
        let mut interp = Interpreter::new(vec![]);
        assert_eq!(eval(&mut interp, "x := 41"), Value::Nil);
        assert_eq!(eval(&mut interp, "x + 1"), Value::Int(42));
        eval(&mut interp, "func double(n) { return n * 2 }");
        assert_eq!(eval(&mut interp, "double(x)"), Value::Int(82));
    }

    #[test]
    fn test_assignment_declares_at_module_scope() {
        let mut interp = Interpreter::new(vec![]);
        assert_eq!(eval(&mut interp, "x = 1"), Value::Nil);
        assert_eq!(eval(&mut interp, "x + 1"), Value::Int(2));
    }

    #[test]
    fn test_closure_sees_later_store_to_captured_local() {
        let source = "func outer() {\n  var n = 1\n  get := func() { return n }\n  n = 5\n  return get()\n}\nouter()";
        assert_eq!(run_code(source), Value::Int(5));
    }

    #[test]
    fn test_closure_counter() {
        let mut interp = Interpreter::new(vec![]);
        eval(
            &mut interp,
            "func make() {\n  var n = 0\n  return func() {\n    n = n + 1\n    return n\n  }\n}",
        );
        eval(&mut interp, "a := make()\nb := make()");
        eval(&mut interp, "a()");
        assert_eq!(eval(&mut interp, "a()"), Value::Int(2));
        assert_eq!(eval(&mut interp, "b()"), Value::Int(1));
    }

    #[test]
    fn test_top_level_recursion() {
        let source = "func fib(n) {\n  if n < 2 { return n }\n  return fib(n - 1) + fib(n - 2)\n}\nfib(20)";
        assert_eq!(run_code(source), Value::Int(6765));
    }

    #[test]
    fn test_local_recursion() {
        let source = "func outer(n) {\n  func fact(k) {\n    if k <= 1 { return 1 }\n    return k * fact(k - 1)\n  }\n  return fact(n)\n}\nouter(5)";
        assert_eq!(run_code(source), Value::Int(120));
    }

    #[test]
    fn test_returned_local_recursive_function_still_works() {
        let source = "func outer() {\n  func fact(k) {\n    if k <= 1 { return 1 }\n    return k * fact(k - 1)\n  }\n  return fact\n}\nf := outer()\nf(5)";
        assert_eq!(run_code(source), Value::Int(120));
    }

    #[test]
    fn test_loops_with_break_and_continue() {
        let source = "total := 0\ni := 0\nwhile true {\n  i = i + 1\n  if i > 10 { break }\n  if i % 2 == 1 { continue }\n  total = total + i\n}\ntotal";
        assert_eq!(run_code(source), Value::Int(30));
    }

    #[test]
    fn test_logical_operators_yield_bools() {
        assert_eq!(run_code("true && false"), Value::Bool(false));
        assert_eq!(run_code("nil || 3"), Value::Bool(true));
        assert_eq!(run_code("0 && missing()"), Value::Bool(false));
    }

    #[test]
    fn test_collections_and_attributes() {
        let source = "m := {\"a\": 1}\nm.b = 2\nxs := [m.a, m.b]\nappend(xs, 3)\nlen(xs) + xs[2]";
        assert_eq!(run_code(source), Value::Int(6));
    }

    #[test]
    fn test_modules_are_reachable() {
        assert_eq!(run_code("math.sqrt(16)"), Value::Float(4.0));
        assert_eq!(run_code("strings.to_upper(\"ab\")"), Value::str("AB"));
        assert_eq!(run_code("unwrap(strconv.atoi(\"12\")) + 1"), Value::Int(13));
    }

    #[test]
    fn test_compile_error_rolls_back() {
        let mut interp = Interpreter::new(vec![]);
        eval(&mut interp, "x := 1");
        let before = interp.main_function().instructions().len();
        let err = assert_error(&mut interp, "y := 2\nbreak", "break");
        assert!(matches!(err, Error::Compile(_)));
        assert_eq!(interp.main_function().instructions().len(), before);
        assert_error(&mut interp, "y", "undefined");
        assert_eq!(eval(&mut interp, "x"), Value::Int(1));
    }

    #[test]
    fn test_runtime_error_keeps_committed_effects() {
        let mut interp = Interpreter::new(vec![]);
        let err = assert_error(&mut interp, "z := 7\nz + \"s\"", "type error");
        assert!(matches!(err, Error::Runtime(ref e) if e.kind == ErrorKind::Type));
        assert_eq!(eval(&mut interp, "z"), Value::Int(7));
    }

    #[test]
    fn test_assign_to_builtin_is_compile_error() {
        let mut interp = Interpreter::new(vec![]);
        let err = assert_error(&mut interp, "len = 1", "len");
        assert!(matches!(err, Error::Compile(_)));
    }

    #[test]
    fn test_lex_and_parse_errors() {
        let mut interp = Interpreter::new(vec![]);
        assert!(matches!(interp.evaluate("x := \"open"), Err(Error::Lex(_))));
        assert!(matches!(interp.evaluate("1 +"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_call_depth_limit() {
        let config = VmConfig {
            max_call_depth: 50,
            ..VmConfig::default()
        };
        let mut interp = Interpreter::with_config(config, vec![]);
        let err = assert_error(&mut interp, "func down(n) { return down(n + 1) }\ndown(0)", "call depth limit");
        let Error::Runtime(e) = err else { panic!("expected runtime error") };
        assert_eq!(e.call_stack.first().map(String::as_str), Some("down"));
        assert_eq!(e.call_stack.last().map(String::as_str), Some("main"));
    }

    #[test]
    fn test_step_limit() {
        let config = VmConfig {
            max_steps: Some(1_000),
            ..VmConfig::default()
        };
        let mut interp = Interpreter::with_config(config, vec![]);
        assert_error(&mut interp, "while true { }", "step limit");
        // Each chunk gets a fresh budget.
        assert_eq!(eval(&mut interp, "1"), Value::Int(1));
    }

    #[test]
    fn test_builtin_error_aborts_chunk() {
        let mut interp = Interpreter::new(vec![]);
        let err = assert_error(&mut interp, "pgx.connect()", "type error: pgx.connect() takes exactly one argument (0 given)");
        assert!(matches!(err, Error::Runtime(_)));
    }

    #[test]
    fn test_extra_builtins_shadow_catalog() {
        let answer = Builtin::new("len", |_, _| Value::Int(42));
        let mut interp = Interpreter::new(vec![answer]);
        assert_eq!(eval(&mut interp, "len([1])"), Value::Int(42));
    }

    #[test]
    fn test_cancelled_sleep_is_err_result() {
        let mut interp = Interpreter::new(vec![]);
        let cancel = interp.cancel_token();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            cancel.cancel();
        });
        let out = eval(&mut interp, "time.sleep(10000)");
        handle.join().unwrap();
        assert!(matches!(out, Value::Result(r) if matches!(r.as_ref(), Outcome::Err(_))));
    }

    #[test]
    fn test_huge_counts_fail_cleanly() {
        let mut interp = Interpreter::new(vec![]);
        assert_error(&mut interp, "\"ab\" * 9223372036854775807", "repeat count too large");
        assert_error(&mut interp, "strings.repeat(\"ab\", 9223372036854775807)", "repeat count too large");
        assert_error(&mut interp, "range(9223372036854775807)", "too large");
        assert_eq!(eval(&mut interp, "len([] * 9223372036854775807)"), Value::Int(0));
        let out = eval(&mut interp, "time.sleep(9223372036854775807)");
        assert!(matches!(out, Value::Result(r) if matches!(r.as_ref(), Outcome::Err(_))));
    }

    #[test]
    fn test_self_containing_list() {
        let mut interp = Interpreter::new(vec![]);
        eval(&mut interp, "a := []\nappend(a, a)");
        assert_eq!(eval(&mut interp, "str(a)"), Value::str("[[...]]"));
        assert_eq!(eval(&mut interp, "a == a"), Value::Bool(true));
        assert_error(&mut interp, "json.marshal(a)", "cyclic");
    }

    #[test]
    fn test_most_negative_integer() {
        assert_eq!(run_code("-9223372036854775808"), Value::Int(i64::MIN));
        assert_eq!(run_code("-9223372036854775807 - 1 == -9223372036854775808"), Value::Bool(true));
    }

    #[test]
    fn test_disassemble_chunk() {
        let mut interp = Interpreter::new(vec![]);
        let program = parse("a := 1\nprint a").unwrap();
        let chunk = interp.compile(&program).unwrap();
        let text = interp.disassemble(chunk).unwrap();
        assert!(text.contains("STORE_NAME"));
        assert!(text.contains("PRINT"));
    }
}
