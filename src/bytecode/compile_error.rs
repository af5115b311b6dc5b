use thiserror::Error;

use crate::frontend::lexer::Span;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{line}:{col}: compile error: {message}{}", format_hint(.hint))]
pub struct CompileError {
    pub message: String,
    pub line: usize,
    pub col: usize,
    pub hint: Option<String>,
}

fn format_hint(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!("\n  hint: {}", h),
        None => String::new(),
    }
}

impl CompileError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        CompileError {
            message: message.into(),
            line: span.line,
            col: span.col,
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn return_outside_function(span: Span) -> Self {
        CompileError::new("'return' outside of a function", span)
            .with_hint("top-level chunks produce the value of their last expression instead")
    }

    pub fn outside_loop(keyword: &str, span: Span) -> Self {
        CompileError::new(format!("'{}' outside of a loop", keyword), span)
    }

    /// An operand does not fit its encoded width.
    pub fn too_many(what: &str, limit: usize, span: Span) -> Self {
        CompileError::new(format!("too many {} (limit is {})", what, limit), span)
    }

    pub fn invalid_target(span: Span) -> Self {
        CompileError::new("invalid assignment target", span)
    }

    pub fn undeclared_assignment(name: &str, span: Span) -> Self {
        CompileError::new(format!("assignment to undeclared variable '{}'", name), span)
            .with_hint(format!("declare it first with 'var {} = ...' or '{} := ...'", name, name))
    }

    pub fn assign_to_builtin(name: &str, span: Span) -> Self {
        CompileError::new(format!("cannot assign to builtin '{}'", name), span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_position() {
        let err = CompileError::outside_loop("break", Span { line: 3, col: 5 });
        assert_eq!(err.to_string(), "3:5: compile error: 'break' outside of a loop");
    }

    #[test]
    fn test_display_with_hint() {
        let err = CompileError::undeclared_assignment("x", Span { line: 1, col: 1 });
        let msg = err.to_string();
        assert!(msg.contains("undeclared variable 'x'"));
        assert!(msg.contains("\n  hint: declare it first"));
    }
}
