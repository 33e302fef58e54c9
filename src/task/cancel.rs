//! Cooperative cancellation.
//!
//! Cancellation is only checked at combinator boundaries (`then`, `iterate`).
//! It never interrupts running handler code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owner side of a cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationSource {
    flag: Arc<AtomicBool>,
}

impl CancellationSource {
    /// A source that has not been canceled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observing this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            flag: Some(self.flag.clone()),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns true once [`CancellationSource::cancel`] was called.
    pub fn is_cancellation_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Read side of a cancellation flag.
///
/// The default token can never be canceled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Option<Arc<AtomicBool>>,
}

impl CancellationToken {
    /// A token that is never signaled.
    pub fn none() -> Self {
        Self::default()
    }

    /// A token that is already signaled.
    pub fn canceled() -> Self {
        Self {
            flag: Some(Arc::new(AtomicBool::new(true))),
        }
    }

    /// Returns true once the owning source was canceled.
    pub fn is_cancellation_requested(&self) -> bool {
        self.flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Returns false for tokens created with [`CancellationToken::none`].
    pub fn can_be_canceled(&self) -> bool {
        self.flag.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_observes_source() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(!token.is_cancellation_requested());

        source.cancel();
        assert!(token.is_cancellation_requested());
        assert!(source.is_cancellation_requested());
    }

    #[test]
    fn test_none_token_never_cancels() {
        let token = CancellationToken::none();
        assert!(!token.can_be_canceled());
        assert!(!token.is_cancellation_requested());
    }

    #[test]
    fn test_canceled_token() {
        let token = CancellationToken::canceled();
        assert!(token.can_be_canceled());
        assert!(token.is_cancellation_requested());
    }
}
