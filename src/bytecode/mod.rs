pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod op;
pub mod scope;
pub mod verify;

pub use compile::{Compiler, CompilerOptions};
pub use compile_error::CompileError;
pub use ir::CompiledFunction;
pub use op::{Opcode, describe};
