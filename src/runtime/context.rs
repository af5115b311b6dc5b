use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Thread-safe cancellation flag shared between a session and its host.
///
/// The dispatch loop never polls it; blocking builtins (`time.sleep`) do.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a builtin may see of the running VM.
pub struct CallContext<'a> {
    cancel: &'a CancelToken,
}

impl<'a> CallContext<'a> {
    pub fn new(cancel: &'a CancelToken) -> Self {
        CallContext { cancel }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
        other.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_context_sees_token() {
        let token = CancelToken::new();
        let ctx = CallContext::new(&token);
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
