//! Error types shared by the engine, the HIL coordinator and the scheduler

use thiserror::Error;

/// Errors surfaced by flowpilot core operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    /// Bad definition, trigger config or input. Never retryable.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// The entity exists but is not in a state that allows the operation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A step handler failed and its retry budget (if any) is exhausted
    #[error("Step '{step_id}' failed ({kind}): {message}")]
    Handler {
        step_id: String,
        kind: String,
        message: String,
        retryable: bool,
    },

    #[error("Iteration limit of {0} steps exceeded")]
    IterationLimitExceeded(u32),

    /// The durability boundary could not be written
    #[error("Checkpoint write failed: {0}")]
    CheckpointWrite(String),

    #[error("Schedule trigger failed: {0}")]
    Trigger(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl FlowError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        FlowError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the caller may retry the failed operation as-is
    pub fn is_retryable(&self) -> bool {
        match self {
            FlowError::Handler { retryable, .. } => *retryable,
            FlowError::CheckpointWrite(_) | FlowError::Storage(_) | FlowError::Trigger(_) => true,
            FlowError::Validation(_)
            | FlowError::NotFound { .. }
            | FlowError::Conflict(_)
            | FlowError::IterationLimitExceeded(_) => false,
        }
    }

    /// Short machine-readable kind, stored on execution records
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Validation(_) => "validation",
            FlowError::NotFound { .. } => "not_found",
            FlowError::Conflict(_) => "conflict",
            FlowError::Handler { .. } => "handler",
            FlowError::IterationLimitExceeded(_) => "iteration_limit_exceeded",
            FlowError::CheckpointWrite(_) => "system",
            FlowError::Trigger(_) => "trigger",
            FlowError::Storage(_) => "storage",
        }
    }
}

pub type FlowResult<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!FlowError::Validation("bad cron".into()).is_retryable());
        assert!(!FlowError::IterationLimitExceeded(25).is_retryable());
        assert!(FlowError::CheckpointWrite("disk full".into()).is_retryable());

        let handler = FlowError::Handler {
            step_id: "crm".into(),
            kind: "external".into(),
            message: "rate limited".into(),
            retryable: true,
        };
        assert!(handler.is_retryable());
    }

    #[test]
    fn test_checkpoint_failure_is_a_system_error() {
        let err = FlowError::CheckpointWrite("io".into());
        assert_eq!(err.kind(), "system");
        assert_ne!(err.kind(), "handler");
    }
}
