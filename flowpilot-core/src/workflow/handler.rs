//! Step handler trait and registration table

use crate::models::hil::InputRequest;
use crate::models::workflow::{ExecutionState, StepUpdate};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Outcome of one handler invocation
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step finished; the engine applies the update and routes
    Completed(StepUpdate),
    /// Step needs a human decision; the engine checkpoints and returns control
    Suspended(InputRequest),
}

/// Category of a handler failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandlerErrorKind {
    /// Handler exceeded its timeout
    #[error("timeout")]
    Timeout,
    /// A downstream call (LLM, tool, SaaS API) failed
    #[error("external")]
    External,
    /// Missing or malformed parameters or state
    #[error("invalid_input")]
    InvalidInput,
    #[error("internal")]
    Internal,
}

/// Error raised by a step handler
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} error: {message}")]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    pub fn retryable(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }
}

/// Trait implemented by every step (agent) of a workflow
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute one unit of work
    ///
    /// # Arguments
    /// * `state` - Snapshot of the execution state; handlers never mutate it directly
    /// * `params` - Static parameters from the step definition
    ///
    /// # Returns
    /// The state delta, a suspension request, or an error
    async fn execute(&self, state: &ExecutionState, params: &Value)
        -> Result<StepOutcome, HandlerError>;
}

/// Explicit table from handler name to implementation
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in handlers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::workflow::builtin::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_display() {
        let err = HandlerError::retryable(HandlerErrorKind::External, "CRM returned 503");
        assert_eq!(err.to_string(), "external error: CRM returned 503");
        assert!(err.retryable);

        let err = HandlerError::fatal(HandlerErrorKind::InvalidInput, "no email");
        assert_eq!(err.kind.to_string(), "invalid_input");
        assert!(!err.retryable);
        assert_eq!(HandlerErrorKind::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_registry_lists_names_sorted() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["approval".to_string(), "echo".to_string()]);
    }
}
