//! Error types for worker-bridge.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The worker process could not be created.
    #[error("Failed to spawn worker `{program}`: {reason}")]
    Spawn {
        /// Program the supervisor tried to launch.
        program: String,
        /// OS-level reason.
        reason: String,
    },

    /// The worker exited (or was stopped) while the request was pending.
    #[error("Worker process terminated: {0}")]
    ProcessTerminated(String),

    /// No response arrived before the request deadline.
    #[error("Command '{command}' timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// Command name.
        command: String,
        /// Configured deadline.
        timeout: Duration,
    },

    /// A response frame could not be parsed.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Caller params cannot be encoded as a request line.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The restart budget is spent; only `start(true)` recovers.
    #[error("Restart budget exhausted after {max_restarts} restarts")]
    RestartBudgetExhausted {
        /// Configured budget.
        max_restarts: u32,
    },

    /// Response for an id that is no longer tracked. Logged, never returned to callers.
    #[error("Orphan response for request id {0}")]
    OrphanResponse(String),

    /// The worker answered with an explicit error payload.
    #[error("Worker error: {0}")]
    Worker(String),

    /// A write was attempted while no worker process is running.
    #[error("Worker process is not running")]
    NotRunning,

    /// I/O error on one of the worker pipes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether this error came from the request deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }

    /// Whether this error came from the worker going away.
    pub fn is_terminated(&self) -> bool {
        matches!(self, BridgeError::ProcessTerminated(_))
    }
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = BridgeError::Timeout {
            command: "extract_colors".to_string(),
            timeout: Duration::from_millis(50),
        };
        assert_eq!(
            err.to_string(),
            "Command 'extract_colors' timed out after 50ms"
        );
        assert!(err.is_timeout());
        assert!(!err.is_terminated());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: BridgeError = io.into();
        assert!(matches!(err, BridgeError::Io(_)));
        assert!(err.to_string().contains("pipe closed"));
    }
}
