//! Human-in-the-loop request coordination

use crate::error::{FlowError, FlowResult};
use crate::models::configuration::HilConfig;
use crate::models::hil::{HilRequest, HilResolution, HilResponse, HilStatus, InputRequest};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Responder recorded on timeouts and cancellations
pub const SYSTEM_RESPONDER: &str = "system";

/// Emitted when a resolved request should re-enter the engine
#[derive(Debug, Clone)]
pub struct ResumeSignal {
    pub execution_id: Uuid,
    pub response: HilResponse,
}

/// Owns pending HIL requests until they are resolved
pub struct HilCoordinator {
    config: HilConfig,
    requests: DashMap<Uuid, HilRequest>,
    responses: DashMap<Uuid, HilResponse>,
    /// execution id -> its single unresolved request
    unresolved: DashMap<Uuid, Uuid>,
    sequence: AtomicU64,
    resume_tx: mpsc::UnboundedSender<ResumeSignal>,
}

impl HilCoordinator {
    /// Create a coordinator and the receiving end of its resume signals
    pub fn new(config: HilConfig) -> (Self, mpsc::UnboundedReceiver<ResumeSignal>) {
        let (resume_tx, resume_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            config,
            requests: DashMap::new(),
            responses: DashMap::new(),
            unresolved: DashMap::new(),
            sequence: AtomicU64::new(0),
            resume_tx,
        };
        (coordinator, resume_rx)
    }

    /// Open a new request for an execution.
    /// Fails with `Conflict` if the execution already has an unresolved request.
    pub fn create(
        &self,
        execution_id: Uuid,
        workflow_id: &str,
        step_id: &str,
        request: InputRequest,
    ) -> FlowResult<HilRequest> {
        self.open(HilRequest::new(
            Uuid::new_v4(),
            execution_id,
            workflow_id.to_string(),
            step_id.to_string(),
            request,
        ))
    }

    /// Register a fully built request, keeping its id and creation time
    pub fn open(&self, mut request: HilRequest) -> FlowResult<HilRequest> {
        if request.timeout_minutes == Some(0) {
            return Err(FlowError::Validation(
                "timeout_minutes must be at least 1".to_string(),
            ));
        }

        match self.unresolved.entry(request.execution_id) {
            Entry::Occupied(existing) => Err(FlowError::Conflict(format!(
                "Execution {} already has pending request {}",
                request.execution_id,
                existing.get()
            ))),
            Entry::Vacant(slot) => {
                request.status = HilStatus::Pending;
                request.resolved_at = None;
                request.sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
                self.requests.insert(request.id, request.clone());
                slot.insert(request.id);

                tracing::info!(
                    "HIL request {} opened for execution {} at step '{}' ({:?})",
                    request.id,
                    request.execution_id,
                    request.step_id,
                    request.priority
                );
                Ok(request)
            }
        }
    }

    /// Resolve a request with a human decision and resume its execution
    pub fn respond(&self, request_id: Uuid, resolution: HilResolution) -> FlowResult<HilResponse> {
        if !matches!(
            resolution.status,
            HilStatus::Approved | HilStatus::Rejected | HilStatus::Modified
        ) {
            return Err(FlowError::Validation(format!(
                "Cannot respond with status {:?}",
                resolution.status
            )));
        }
        let responder = resolution
            .responded_by
            .clone()
            .unwrap_or_else(|| "anonymous".to_string());
        self.resolve(request_id, resolution, responder, true)
    }

    pub fn get(&self, request_id: Uuid) -> FlowResult<HilRequest> {
        self.requests
            .get(&request_id)
            .map(|r| r.clone())
            .ok_or_else(|| FlowError::not_found("HIL request", request_id))
    }

    pub fn get_response(&self, request_id: Uuid) -> Option<HilResponse> {
        self.responses.get(&request_id).map(|r| r.clone())
    }

    /// Pending requests by priority (urgent first), then oldest first
    pub fn list_pending(&self, workflow_id: Option<&str>) -> Vec<HilRequest> {
        let mut pending: Vec<HilRequest> = self
            .requests
            .iter()
            .filter(|r| r.status == HilStatus::Pending)
            .filter(|r| workflow_id.map_or(true, |id| r.workflow_id == id))
            .map(|r| r.clone())
            .collect();
        pending.sort_by_key(|r| (Reverse(r.priority), r.created_at, r.sequence));
        pending
    }

    pub fn pending_for_execution(&self, execution_id: Uuid) -> Option<HilRequest> {
        let request_id = *self.unresolved.get(&execution_id)?;
        self.requests.get(&request_id).map(|r| r.clone())
    }

    /// Reject the open request of a cancelled execution without resuming it
    pub fn cancel_for_execution(&self, execution_id: Uuid) -> Option<HilResponse> {
        let request_id = *self.unresolved.get(&execution_id)?;
        let resolution = HilResolution::new(HilStatus::Rejected)
            .with_comments("Execution cancelled")
            .by(SYSTEM_RESPONDER);
        self.resolve(request_id, resolution, SYSTEM_RESPONDER.to_string(), false)
            .ok()
    }

    pub fn sweep_timeouts(&self) -> Vec<HilResponse> {
        self.sweep_timeouts_at(Utc::now())
    }

    /// Resolve every pending request whose deadline is at or before `now`
    pub fn sweep_timeouts_at(&self, now: DateTime<Utc>) -> Vec<HilResponse> {
        let expired: Vec<Uuid> = self
            .requests
            .iter()
            .filter(|r| {
                r.status == HilStatus::Pending
                    && r.expires_at(self.config.default_ttl_minutes) <= now
            })
            .map(|r| r.id)
            .collect();

        expired
            .into_iter()
            .filter_map(|request_id| {
                let resolution = HilResolution::new(HilStatus::Timeout)
                    .with_comments("No response before the request timed out");
                match self.resolve(request_id, resolution, SYSTEM_RESPONDER.to_string(), true) {
                    Ok(response) => {
                        tracing::warn!("HIL request {} timed out", request_id);
                        Some(response)
                    }
                    // Answered between the scan and the resolution
                    Err(_) => None,
                }
            })
            .collect()
    }

    /// Periodic timeout sweep until `shutdown` fires
    pub async fn run_sweeper(&self, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_seconds.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let resolved = self.sweep_timeouts();
                    if !resolved.is_empty() {
                        tracing::info!("Timeout sweep resolved {} HIL request(s)", resolved.len());
                    }
                }
            }
        }
        tracing::debug!("HIL sweeper stopped");
    }

    /// Transition a pending request exactly once
    fn resolve(
        &self,
        request_id: Uuid,
        resolution: HilResolution,
        responder: String,
        resume: bool,
    ) -> FlowResult<HilResponse> {
        let response = {
            let mut request = self
                .requests
                .get_mut(&request_id)
                .ok_or_else(|| FlowError::not_found("HIL request", request_id))?;
            if request.status.is_resolved() {
                return Err(FlowError::Conflict(format!(
                    "HIL request {} already resolved as {:?}",
                    request_id, request.status
                )));
            }

            let now = Utc::now();
            request.status = resolution.status;
            request.resolved_at = Some(now);

            HilResponse {
                request_id,
                execution_id: request.execution_id,
                step_id: request.step_id.clone(),
                status: resolution.status,
                response_data: resolution.response_data,
                comments: resolution.comments,
                responded_by: responder,
                responded_at: now,
            }
        };

        self.responses.insert(request_id, response.clone());
        self.unresolved
            .remove_if(&response.execution_id, |_, pending| *pending == request_id);

        tracing::info!(
            "HIL request {} resolved as {:?} by {}",
            request_id,
            response.status,
            response.responded_by
        );

        if resume {
            let signal = ResumeSignal {
                execution_id: response.execution_id,
                response: response.clone(),
            };
            if self.resume_tx.send(signal).is_err() {
                tracing::warn!(
                    "Resume dispatcher is gone; execution {} stays suspended",
                    response.execution_id
                );
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::hil::Priority;

    fn coordinator() -> (HilCoordinator, mpsc::UnboundedReceiver<ResumeSignal>) {
        HilCoordinator::new(HilConfig::default())
    }

    #[test]
    fn test_single_unresolved_request_per_execution() {
        let (hil, _rx) = coordinator();
        let execution = Uuid::new_v4();
        hil.create(execution, "wf", "review", InputRequest::new("Review", ""))
            .unwrap();

        let err = hil
            .create(execution, "wf", "review", InputRequest::new("Again", ""))
            .unwrap_err();
        assert!(matches!(err, FlowError::Conflict(_)));
        assert!(hil.pending_for_execution(execution).is_some());
    }

    #[test]
    fn test_respond_resolves_once_and_signals() {
        let (hil, mut rx) = coordinator();
        let execution = Uuid::new_v4();
        let request = hil
            .create(execution, "wf", "review", InputRequest::new("Review", ""))
            .unwrap();

        let response = hil
            .respond(
                request.id,
                HilResolution::new(HilStatus::Approved).by("alice"),
            )
            .unwrap();
        assert_eq!(response.responded_by, "alice");
        assert_eq!(hil.get(request.id).unwrap().status, HilStatus::Approved);
        assert!(hil.pending_for_execution(execution).is_none());

        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.execution_id, execution);
        assert_eq!(signal.response.request_id, request.id);

        let again = hil.respond(request.id, HilResolution::new(HilStatus::Rejected));
        assert!(matches!(again, Err(FlowError::Conflict(_))));
        assert_eq!(hil.get_response(request.id).unwrap().status, HilStatus::Approved);
    }

    #[test]
    fn test_respond_rejects_non_decision_status() {
        let (hil, _rx) = coordinator();
        let request = hil
            .create(Uuid::new_v4(), "wf", "s", InputRequest::new("t", ""))
            .unwrap();
        let err = hil
            .respond(request.id, HilResolution::new(HilStatus::Timeout))
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
        assert_eq!(hil.get(request.id).unwrap().status, HilStatus::Pending);
    }

    #[test]
    fn test_list_pending_filters_by_workflow() {
        let (hil, _rx) = coordinator();
        hil.create(Uuid::new_v4(), "a", "s", InputRequest::new("a", ""))
            .unwrap();
        hil.create(
            Uuid::new_v4(),
            "b",
            "s",
            InputRequest::new("b", "").with_priority(Priority::Urgent),
        )
        .unwrap();

        assert_eq!(hil.list_pending(None).len(), 2);
        assert_eq!(hil.list_pending(None)[0].workflow_id, "b");
        let only_a = hil.list_pending(Some("a"));
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].workflow_id, "a");
    }

    #[test]
    fn test_cancel_does_not_resume() {
        let (hil, mut rx) = coordinator();
        let execution = Uuid::new_v4();
        let request = hil
            .create(execution, "wf", "s", InputRequest::new("t", ""))
            .unwrap();

        let response = hil.cancel_for_execution(execution).unwrap();
        assert_eq!(response.status, HilStatus::Rejected);
        assert_eq!(response.responded_by, SYSTEM_RESPONDER);
        assert_eq!(hil.get(request.id).unwrap().status, HilStatus::Rejected);
        assert!(rx.try_recv().is_err());
    }
}
