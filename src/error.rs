use thiserror::Error;

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::verify::VerifyError;
use crate::frontend::lexer::LexerError;
use crate::frontend::parser_error::ParserError;
use crate::runtime::runtime_error::RuntimeError;

/// Everything `Interpreter::evaluate` can fail with.
#[derive(Debug, Error)]
pub enum Error {
    #[error("lexer error: {0}")]
    Lex(#[from] LexerError),

    #[error("parse error: {0}")]
    Parse(#[from] ParserError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
