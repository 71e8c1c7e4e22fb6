//! Human-in-the-loop request and response models

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Request priority. Declaration order is the sort order (low < urgent).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// HIL request status. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HilStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
    Timeout,
}

impl HilStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, HilStatus::Pending)
    }
}

/// What a handler asks a human for when it suspends
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_action: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Priority,
    /// Wall-clock minutes before the sweeper resolves the request as timed out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,
}

impl InputRequest {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            context: Value::Null,
            proposed_action: None,
            options: None,
            priority: Priority::default(),
            timeout_minutes: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u32) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_proposed_action(mut self, action: Value) -> Self {
        self.proposed_action = Some(action);
        self
    }
}

/// A request for a human decision tied to a suspended execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HilRequest {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workflow_id: String,
    /// Step that asked for input
    pub step_id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_action: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,
    pub status: HilStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Monotonic creation order, breaks ties between equal timestamps
    #[serde(default)]
    pub sequence: u64,
}

impl HilRequest {
    pub fn new(
        id: Uuid,
        execution_id: Uuid,
        workflow_id: String,
        step_id: String,
        request: InputRequest,
    ) -> Self {
        Self {
            id,
            execution_id,
            workflow_id,
            step_id,
            title: request.title,
            description: request.description,
            context: request.context,
            proposed_action: request.proposed_action,
            options: request.options,
            priority: request.priority,
            timeout_minutes: request.timeout_minutes,
            status: HilStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            sequence: 0,
        }
    }

    /// Deadline after which the sweeper resolves the request.
    /// Requests without a timeout expire after the system default TTL.
    pub fn expires_at(&self, default_ttl_minutes: u32) -> DateTime<Utc> {
        let minutes = self.timeout_minutes.unwrap_or(default_ttl_minutes);
        self.created_at + Duration::minutes(minutes as i64)
    }
}

/// Resolution of a HIL request. Created exactly once per request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HilResponse {
    pub request_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub status: HilStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    pub responded_by: String,
    pub responded_at: DateTime<Utc>,
}

/// Body of a create-request call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateHilRequest {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub step_id: String,
    #[serde(flatten)]
    pub request: InputRequest,
}

/// A human (or system) decision on a pending request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HilResolution {
    pub status: HilStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_by: Option<String>,
}

impl HilResolution {
    pub fn new(status: HilStatus) -> Self {
        Self {
            status,
            response_data: None,
            comments: None,
            responded_by: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.response_data = Some(data);
        self
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    pub fn by(mut self, responder: impl Into<String>) -> Self {
        self.responded_by = Some(responder.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(serde_json::to_string(&Priority::Urgent).unwrap(), "\"urgent\"");
    }

    #[test]
    fn test_expiry_uses_default_ttl_without_timeout() {
        let request = HilRequest::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "wf".into(),
            "review".into(),
            InputRequest::new("Review", "Check the draft"),
        );
        assert_eq!(
            request.expires_at(60),
            request.created_at + Duration::minutes(60)
        );

        let timed = HilRequest {
            timeout_minutes: Some(1),
            ..request
        };
        assert_eq!(timed.expires_at(60), timed.created_at + Duration::minutes(1));
    }
}
