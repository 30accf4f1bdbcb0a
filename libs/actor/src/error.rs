//! Dispatcher and receiver error types.

use courier_executor::ExecutorError;
use thiserror::Error;

/// Errors surfaced to callers of a dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A receiver is already registered under this key (possibly one whose
    /// stop signal has not been delivered yet).
    #[error("duplicate registration for key {0}")]
    DuplicateRegistration(String),

    /// The dispatcher is closing or closed.
    #[error("dispatcher is closed")]
    DispatcherClosed,

    /// Concurrent draining was requested from a strategy that forbids it.
    #[error("concurrent receivers are not supported by this dispatcher")]
    ConcurrentNotSupported,

    /// The underlying executor failed.
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Errors returned by receiver code.
///
/// These are logged and counted by the dispatcher; they never stop delivery
/// of later messages.
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// The receiver rejected or failed to handle the message.
    #[error("receiver failed: {0}")]
    Failed(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ReceiverError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_error_converts() {
        let err: DispatchError = ExecutorError::Shutdown.into();
        assert!(matches!(err, DispatchError::Executor(ExecutorError::Shutdown)));
    }

    #[test]
    fn test_receiver_error_from_anyhow() {
        let err: ReceiverError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.to_string(), "internal error: disk full");
    }
}
