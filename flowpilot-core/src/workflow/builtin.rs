//! Built-in step handlers usable from YAML definitions

use crate::models::hil::{InputRequest, Priority};
use crate::models::workflow::{ExecutionState, MessageRole, StepUpdate};
use crate::workflow::handler::{
    HandlerError, HandlerErrorKind, HandlerRegistry, StepHandler, StepOutcome,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Context key under which the engine injects a HIL resolution
pub const HIL_RESPONSE_KEY: &str = "hil_response";

pub fn register_builtins(registry: &mut HandlerRegistry) {
    registry.register("echo", Arc::new(EchoHandler));
    registry.register("approval", Arc::new(ApprovalHandler));
}

/// Appends `params.message` (or the latest message) as an assistant message
pub struct EchoHandler;

#[async_trait]
impl StepHandler for EchoHandler {
    async fn execute(
        &self,
        state: &ExecutionState,
        params: &Value,
    ) -> Result<StepOutcome, HandlerError> {
        let content = params
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| state.last_message().map(|m| m.content.clone()))
            .unwrap_or_default();

        Ok(StepOutcome::Completed(
            StepUpdate::new()
                .with_result(json!({ "message": content }))
                .with_message(MessageRole::Assistant, content),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ApprovalParams {
    #[serde(default = "default_title")]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    timeout_minutes: Option<u32>,
    #[serde(default)]
    options: Option<Vec<String>>,
}

fn default_title() -> String {
    "Approval required".to_string()
}

/// Suspends for a human decision, then continues on approval and
/// escalates on rejection or timeout
pub struct ApprovalHandler;

impl ApprovalHandler {
    fn decide(response: &Value) -> Result<StepUpdate, HandlerError> {
        let status = response
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                HandlerError::fatal(HandlerErrorKind::InvalidInput, "HIL response has no status")
            })?;
        let responder = response
            .get("responded_by")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        let update = StepUpdate::new().with_context(HIL_RESPONSE_KEY, Value::Null);
        let update = match status {
            "approved" => update
                .with_result(json!({ "decision": "approved" }))
                .with_message(MessageRole::System, format!("Approved by {}", responder)),
            "modified" => {
                let data = response.get("response_data").cloned().unwrap_or(Value::Null);
                update
                    .with_result(json!({ "decision": "modified", "data": data }))
                    .with_context("approved_action", data)
                    .with_message(MessageRole::System, format!("Modified by {}", responder))
            }
            "rejected" | "timeout" => update
                .with_result(json!({ "decision": status }))
                .with_message(
                    MessageRole::System,
                    format!("Approval {} ({}), escalating", status, responder),
                )
                .escalate(),
            other => {
                return Err(HandlerError::fatal(
                    HandlerErrorKind::InvalidInput,
                    format!("Unexpected HIL status '{}'", other),
                ))
            }
        };
        Ok(update)
    }
}

#[async_trait]
impl StepHandler for ApprovalHandler {
    async fn execute(
        &self,
        state: &ExecutionState,
        params: &Value,
    ) -> Result<StepOutcome, HandlerError> {
        let response = state
            .context
            .get(HIL_RESPONSE_KEY)
            .filter(|r| r.get("step_id").and_then(Value::as_str) == Some(state.current_step.as_str()));
        if let Some(response) = response {
            return Self::decide(response).map(StepOutcome::Completed);
        }

        let params: ApprovalParams = if params.is_null() {
            serde_json::from_value(json!({}))
        } else {
            serde_json::from_value(params.clone())
        }
        .map_err(|e| {
            HandlerError::fatal(
                HandlerErrorKind::InvalidInput,
                format!("Invalid approval params: {}", e),
            )
        })?;

        let mut request = InputRequest::new(params.title, params.description)
            .with_priority(params.priority)
            .with_context(state.last_result.clone().unwrap_or(Value::Null));
        if let Some(minutes) = params.timeout_minutes {
            request = request.with_timeout_minutes(minutes);
        }
        if let Some(options) = params.options {
            request = request.with_options(options);
        }
        Ok(StepOutcome::Suspended(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::workflow::{StepDefinition, WorkflowDefinition};
    use serde_json::Map;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn state() -> ExecutionState {
        let workflow = WorkflowDefinition {
            id: "wf".into(),
            version: 1,
            description: None,
            entry_step: "review".into(),
            steps: vec![StepDefinition::new("review", "approval")],
            escalation_step: None,
            category_routes: BTreeMap::new(),
            input_schema: None,
        };
        ExecutionState::new(Uuid::new_v4(), &workflow, &json!("draft"), Map::new())
    }

    #[tokio::test]
    async fn test_echo_repeats_last_message() {
        let outcome = EchoHandler.execute(&state(), &Value::Null).await.unwrap();
        match outcome {
            StepOutcome::Completed(update) => {
                assert_eq!(update.messages[0].content, "draft");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_approval_suspends_without_response() {
        let params = json!({"title": "Send offer?", "priority": "high", "timeout_minutes": 5});
        let outcome = ApprovalHandler.execute(&state(), &params).await.unwrap();
        match outcome {
            StepOutcome::Suspended(request) => {
                assert_eq!(request.title, "Send offer?");
                assert_eq!(request.priority, Priority::High);
                assert_eq!(request.timeout_minutes, Some(5));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_approval_escalates_on_timeout() {
        let mut state = state();
        state.context.insert(
            HIL_RESPONSE_KEY.into(),
            json!({"step_id": "review", "status": "timeout", "responded_by": "system"}),
        );
        let outcome = ApprovalHandler.execute(&state, &Value::Null).await.unwrap();
        match outcome {
            StepOutcome::Completed(update) => {
                assert!(update.escalate);
                assert_eq!(update.context[HIL_RESPONSE_KEY], Value::Null);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
