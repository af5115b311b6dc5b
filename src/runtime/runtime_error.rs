use thiserror::Error;

use crate::bytecode::op::DecodeError;

/// Category of a failure raised while executing bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed bytecode; never produced by a correct compiler.
    Decode,
    /// Wrong kind of value for an opcode or builtin.
    Type,
    /// Wrong number of arguments.
    Arity,
    /// Everything else: bad index, missing attribute, limits, ...
    Runtime,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Decode => "decode error",
            ErrorKind::Type => "type error",
            ErrorKind::Arity => "arity error",
            ErrorKind::Runtime => "runtime error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}{}", format_call_stack(.call_stack))]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    /// Function names from the innermost frame outwards.
    pub call_stack: Vec<String>,
}

fn format_call_stack(call_stack: &[String]) -> String {
    if call_stack.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n  call stack:");
    for (i, frame) in call_stack.iter().enumerate() {
        out.push_str(&format!("\n    {}: {}", i, frame));
    }
    out
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            message: message.into(),
            call_stack: Vec::new(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn arity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Arity, message)
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.call_stack.push(context.to_string());
        self
    }
}

impl From<DecodeError> for RuntimeError {
    fn from(e: DecodeError) -> Self {
        RuntimeError::new(ErrorKind::Decode, e.to_string())
    }
}

pub fn stack_underflow(needed: usize, available: usize) -> RuntimeError {
    RuntimeError::runtime(format!(
        "stack underflow: needed {} values, {} available",
        needed, available
    ))
}

pub fn division_by_zero() -> RuntimeError {
    RuntimeError::runtime("division by zero")
}

pub fn index_out_of_bounds(index: i64, len: usize) -> RuntimeError {
    RuntimeError::runtime(format!(
        "index {} out of bounds for length {}",
        index, len
    ))
}

pub fn undefined_variable(name: &str) -> RuntimeError {
    RuntimeError::runtime(format!("undefined variable '{}'", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_kind() {
        let err = RuntimeError::type_error("cannot add int and str");
        assert_eq!(err.to_string(), "type error: cannot add int and str");
    }

    #[test]
    fn test_display_call_stack() {
        let err = RuntimeError::runtime("boom")
            .with_context("inner")
            .with_context("outer");
        let msg = err.to_string();
        assert!(msg.starts_with("runtime error: boom"));
        assert!(msg.contains("0: inner"));
        assert!(msg.contains("1: outer"));
    }

    #[test]
    fn test_decode_error_conversion() {
        let err: RuntimeError = DecodeError::UnknownOpcode { offset: 3, byte: 0xff }.into();
        assert_eq!(err.kind, ErrorKind::Decode);
        assert!(err.message.contains("0xff"));
    }

    #[test]
    fn test_helpers() {
        assert!(division_by_zero().message.contains("division by zero"));
        assert!(index_out_of_bounds(5, 2).message.contains("index 5"));
        assert!(undefined_variable("x").message.contains("'x'"));
        assert_eq!(stack_underflow(1, 0).kind, ErrorKind::Runtime);
    }
}
