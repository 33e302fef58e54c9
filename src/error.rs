//! Error types for the dispatch runtime.

use crate::task::Fault;

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors raised by the dispatch runtime itself.
///
/// Handler and filter code may fault with any error type; those travel as
/// [`Fault`] and keep their original type. The variants here are the faults
/// the runtime produces on its own.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler registered for {message_type}")]
    HandlerNotFound { message_type: &'static str },

    #[error("{count} handlers registered for {message_type}, expected exactly one")]
    AmbiguousHandler {
        message_type: &'static str,
        count: usize,
    },

    #[error("failed to activate handler {handler}: {cause}")]
    Activation {
        handler: &'static str,
        cause: Fault,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid cast: expected {expected}")]
    InvalidCast { expected: &'static str },

    #[error("task sequence yielded a missing task")]
    NullTask,

    #[error("dispatch aborted: {0}")]
    Aborted(String),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue error: {0}")]
    Queue(String),
}

impl DispatchError {
    /// Returns true for faults raised before any filter ran because no
    /// single handler could be selected.
    pub fn is_selection_error(&self) -> bool {
        matches!(
            self,
            DispatchError::HandlerNotFound { .. } | DispatchError::AmbiguousHandler { .. }
        )
    }

    /// Returns true for a forced abort signal.
    pub fn is_abort(&self) -> bool {
        matches!(self, DispatchError::Aborted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_not_found_display() {
        let err = DispatchError::HandlerNotFound {
            message_type: "PlaceOrder",
        };
        assert_eq!(err.to_string(), "no handler registered for PlaceOrder");
        assert!(err.is_selection_error());
    }

    #[test]
    fn test_ambiguous_handler_display() {
        let err = DispatchError::AmbiguousHandler {
            message_type: "PlaceOrder",
            count: 2,
        };
        assert_eq!(
            err.to_string(),
            "2 handlers registered for PlaceOrder, expected exactly one"
        );
        assert!(err.is_selection_error());
    }

    #[test]
    fn test_activation_wraps_cause() {
        let cause = Fault::new(DispatchError::Config("missing connection".to_string()));
        let err = DispatchError::Activation {
            handler: "OrderHandler",
            cause,
        };
        assert_eq!(
            err.to_string(),
            "failed to activate handler OrderHandler: configuration error: missing connection"
        );
        assert!(!err.is_selection_error());
    }

    #[test]
    fn test_abort_detection() {
        assert!(DispatchError::Aborted("shutdown".to_string()).is_abort());
        assert!(!DispatchError::NullTask.is_abort());
    }
}
