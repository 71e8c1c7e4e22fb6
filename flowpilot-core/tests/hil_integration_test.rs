//! Integration tests for the human-in-the-loop coordinator

use chrono::Duration;
use flowpilot_core::models::configuration::HilConfig;
use flowpilot_core::models::hil::{HilResolution, HilStatus, InputRequest, Priority};
use flowpilot_core::workflow::hil::HilCoordinator;
use flowpilot_core::FlowError;
use serde_json::json;
use uuid::Uuid;

fn coordinator() -> (
    HilCoordinator,
    tokio::sync::mpsc::UnboundedReceiver<flowpilot_core::workflow::hil::ResumeSignal>,
) {
    HilCoordinator::new(HilConfig {
        sweep_interval_seconds: 1,
        default_ttl_minutes: 10,
    })
}

#[tokio::test]
async fn test_pending_ordered_by_priority_then_age() {
    let (hil, _rx) = coordinator();
    let medium = hil
        .create(
            Uuid::new_v4(),
            "crm",
            "review",
            InputRequest::new("Medium", "").with_priority(Priority::Medium),
        )
        .unwrap();
    let urgent = hil
        .create(
            Uuid::new_v4(),
            "crm",
            "review",
            InputRequest::new("Urgent", "").with_priority(Priority::Urgent),
        )
        .unwrap();
    let low = hil
        .create(
            Uuid::new_v4(),
            "crm",
            "review",
            InputRequest::new("Low", "").with_priority(Priority::Low),
        )
        .unwrap();
    let second_medium = hil
        .create(Uuid::new_v4(), "hr", "review", InputRequest::new("Medium 2", ""))
        .unwrap();

    let ids: Vec<Uuid> = hil.list_pending(None).iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![urgent.id, medium.id, second_medium.id, low.id]);

    let hr: Vec<Uuid> = hil.list_pending(Some("hr")).iter().map(|r| r.id).collect();
    assert_eq!(hr, vec![second_medium.id]);
}

#[tokio::test]
async fn test_respond_resolves_once_and_signals_resume() {
    let (hil, mut rx) = coordinator();
    let execution_id = Uuid::new_v4();
    let request = hil
        .create(execution_id, "crm", "review", InputRequest::new("Send?", ""))
        .unwrap();

    let response = hil
        .respond(
            request.id,
            HilResolution::new(HilStatus::Modified)
                .with_data(json!({"amount": 90}))
                .by("carol"),
        )
        .unwrap();
    assert_eq!(response.status, HilStatus::Modified);
    assert_eq!(response.responded_by, "carol");
    assert_eq!(response.step_id, "review");

    let signal = rx.try_recv().expect("resume signal");
    assert_eq!(signal.execution_id, execution_id);
    assert_eq!(signal.response.request_id, request.id);

    let stored = hil.get(request.id).unwrap();
    assert_eq!(stored.status, HilStatus::Modified);
    assert!(stored.resolved_at.is_some());
    assert_eq!(hil.get_response(request.id), Some(response));
    assert!(hil.list_pending(None).is_empty());

    let err = hil
        .respond(request.id, HilResolution::new(HilStatus::Approved))
        .unwrap_err();
    assert!(matches!(err, FlowError::Conflict(_)));
    assert!(rx.try_recv().is_err());

    // A new request may be opened once the previous one is resolved
    assert!(hil
        .create(execution_id, "crm", "send", InputRequest::new("Really send?", ""))
        .is_ok());
}

#[tokio::test]
async fn test_respond_validation() {
    let (hil, _rx) = coordinator();
    let request = hil
        .create(Uuid::new_v4(), "crm", "review", InputRequest::new("Send?", ""))
        .unwrap();

    for status in [HilStatus::Pending, HilStatus::Timeout] {
        let err = hil.respond(request.id, HilResolution::new(status)).unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
    }
    let err = hil
        .respond(Uuid::new_v4(), HilResolution::new(HilStatus::Approved))
        .unwrap_err();
    assert!(matches!(err, FlowError::NotFound { .. }));

    let anonymous = hil
        .respond(request.id, HilResolution::new(HilStatus::Approved))
        .unwrap();
    assert_eq!(anonymous.responded_by, "anonymous");

    let err = hil
        .create(
            Uuid::new_v4(),
            "crm",
            "review",
            InputRequest::new("Zero", "").with_timeout_minutes(0),
        )
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));
}

#[tokio::test]
async fn test_timeout_sweep_resolves_exactly_once() {
    let (hil, mut rx) = coordinator();
    let request = hil
        .create(
            Uuid::new_v4(),
            "crm",
            "review",
            InputRequest::new("Quick decision", "").with_timeout_minutes(1),
        )
        .unwrap();

    assert!(hil
        .sweep_timeouts_at(request.created_at + Duration::seconds(30))
        .is_empty());

    let later = request.created_at + Duration::seconds(61);
    let resolved = hil.sweep_timeouts_at(later);
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].status, HilStatus::Timeout);
    assert_eq!(resolved[0].responded_by, "system");
    assert_eq!(rx.try_recv().unwrap().response.status, HilStatus::Timeout);

    assert!(hil.sweep_timeouts_at(later + Duration::seconds(60)).is_empty());
    assert!(rx.try_recv().is_err());

    let err = hil
        .respond(request.id, HilResolution::new(HilStatus::Approved))
        .unwrap_err();
    assert!(matches!(err, FlowError::Conflict(_)));
}

#[tokio::test]
async fn test_requests_without_timeout_use_default_ttl() {
    let (hil, _rx) = coordinator();
    let request = hil
        .create(Uuid::new_v4(), "crm", "review", InputRequest::new("No deadline", ""))
        .unwrap();

    assert!(hil
        .sweep_timeouts_at(request.created_at + Duration::minutes(5))
        .is_empty());
    assert_eq!(
        hil.sweep_timeouts_at(request.created_at + Duration::minutes(10))
            .len(),
        1
    );
}

#[tokio::test]
async fn test_cancel_rejects_without_resume() {
    let (hil, mut rx) = coordinator();
    let execution_id = Uuid::new_v4();
    let request = hil
        .create(execution_id, "crm", "review", InputRequest::new("Send?", ""))
        .unwrap();

    let response = hil.cancel_for_execution(execution_id).expect("response");
    assert_eq!(response.status, HilStatus::Rejected);
    assert_eq!(response.responded_by, "system");
    assert_eq!(hil.get(request.id).unwrap().status, HilStatus::Rejected);
    assert!(rx.try_recv().is_err());

    assert!(hil.cancel_for_execution(execution_id).is_none());
    assert!(hil.pending_for_execution(execution_id).is_none());
}
