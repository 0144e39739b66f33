//! Error Module - Runtime Error Types
//!
//! Defines the error type used across the runtime core. Failures that user
//! code can observe (thrown exceptions, error sentinels) are *values*, not
//! `RuntimeError`s; this type covers host-level failures: configuration,
//! memory exhaustion, module loading, OS resources.

use thiserror::Error;

/// Main error type for all runtime operations
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Out of memory: requested {requested} bytes, {allocated_regions} regions allocated")]
    OutOfMemory {
        requested: usize,
        allocated_regions: usize,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Fiber stack allocation failed: {0}")]
    StackAllocation(String),

    #[error("Module validation failed: {0}")]
    ModuleValidation(String),

    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Scheduler is shutting down")]
    SchedulerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Check if this error is recoverable by the caller
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RuntimeError::OutOfMemory { .. } | RuntimeError::SchedulerShutdown
        )
    }

    /// Check if this error indicates a bug in the runtime
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            RuntimeError::InvalidState { .. } | RuntimeError::Internal(_)
        )
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::StackAllocation(err.to_string())
    }
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let oom = RuntimeError::OutOfMemory {
            requested: 64,
            allocated_regions: 1024,
        };
        assert!(oom.is_recoverable());
        assert!(!oom.is_bug());

        let internal = RuntimeError::Internal("bad".into());
        assert!(internal.is_bug());
        assert!(!internal.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = RuntimeError::Configuration("worker_count must be > 0".into());
        assert!(err.to_string().contains("worker_count"));
    }
}
