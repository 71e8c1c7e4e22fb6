//! HTTP API for workflows, executions, HIL requests and schedules

use crate::error::{FlowError, FlowResult};
use crate::models::hil::{CreateHilRequest, HilResolution};
use crate::models::schedule::{CreateScheduleRequest, UpdateScheduleRequest};
use crate::models::workflow::WorkflowDefinition;
use crate::runtime::FlowRuntime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::{Json, WithStatus};
use warp::Filter;

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub workflows: usize,
    pub pending_requests: usize,
    pub schedules: usize,
}

/// Body of POST /api/v1/workflows/:id/run
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// Body of POST /api/v1/executions/:id/resume
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResumeRequest {
    #[serde(default)]
    pub human_input: Option<Value>,
}

/// Body of POST /api/v1/schedules/:id/trigger
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManualTriggerRequest {
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StateQuery {
    thread_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct PendingQuery {
    workflow_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TriggerQuery {
    /// Seconds to wait for the run to finish
    wait: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    schedule_id: Option<Uuid>,
    limit: Option<usize>,
}

type Reply = WithStatus<Json>;

/// Create HTTP API routes
pub fn create_api_routes(
    runtime: Arc<FlowRuntime>,
) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
    let rt = warp::any().map(move || Arc::clone(&runtime));

    // GET /api/v1/health
    let health = warp::path!("api" / "v1" / "health")
        .and(warp::get())
        .and(rt.clone())
        .and_then(handle_health);

    // POST /api/v1/workflows
    let create_workflow = warp::path!("api" / "v1" / "workflows")
        .and(warp::post())
        .and(json_body())
        .and(rt.clone())
        .and_then(handle_create_workflow);

    // GET /api/v1/workflows
    let list_workflows = warp::path!("api" / "v1" / "workflows")
        .and(warp::get())
        .and(rt.clone())
        .and_then(handle_list_workflows);

    // POST /api/v1/workflows/:id/run
    let run_workflow = warp::path!("api" / "v1" / "workflows" / String / "run")
        .and(warp::post())
        .and(optional_body())
        .and(rt.clone())
        .and_then(handle_run_workflow);

    // GET /api/v1/workflows/:id/state?thread_id=
    let workflow_state = warp::path!("api" / "v1" / "workflows" / String / "state")
        .and(warp::get())
        .and(warp::query::<StateQuery>())
        .and(rt.clone())
        .and_then(handle_workflow_state);

    let workflows = create_workflow
        .or(list_workflows)
        .or(run_workflow)
        .or(workflow_state)
        .boxed();

    // GET /api/v1/executions/:id
    let get_execution = warp::path!("api" / "v1" / "executions" / Uuid)
        .and(warp::get())
        .and(rt.clone())
        .and_then(handle_get_execution);

    // POST /api/v1/executions/:id/pause
    let pause = warp::path!("api" / "v1" / "executions" / Uuid / "pause")
        .and(warp::post())
        .and(rt.clone())
        .and_then(handle_pause);

    // POST /api/v1/executions/:id/resume
    let resume = warp::path!("api" / "v1" / "executions" / Uuid / "resume")
        .and(warp::post())
        .and(optional_body())
        .and(rt.clone())
        .and_then(handle_resume);

    // POST /api/v1/executions/:id/cancel
    let cancel = warp::path!("api" / "v1" / "executions" / Uuid / "cancel")
        .and(warp::post())
        .and(rt.clone())
        .and_then(handle_cancel);

    let executions = get_execution.or(pause).or(resume).or(cancel).boxed();

    // POST /api/v1/hil/requests
    let create_request = warp::path!("api" / "v1" / "hil" / "requests")
        .and(warp::post())
        .and(json_body())
        .and(rt.clone())
        .and_then(handle_create_request);

    // GET /api/v1/hil/requests?workflow_id=
    let list_pending = warp::path!("api" / "v1" / "hil" / "requests")
        .and(warp::get())
        .and(warp::query::<PendingQuery>())
        .and(rt.clone())
        .and_then(handle_list_pending);

    // GET /api/v1/hil/requests/:id
    let get_request = warp::path!("api" / "v1" / "hil" / "requests" / Uuid)
        .and(warp::get())
        .and(rt.clone())
        .and_then(handle_get_request);

    // POST /api/v1/hil/requests/:id/respond
    let respond = warp::path!("api" / "v1" / "hil" / "requests" / Uuid / "respond")
        .and(warp::post())
        .and(json_body())
        .and(rt.clone())
        .and_then(handle_respond);

    let hil = create_request
        .or(list_pending)
        .or(get_request)
        .or(respond)
        .boxed();

    // POST /api/v1/schedules
    let create_schedule = warp::path!("api" / "v1" / "schedules")
        .and(warp::post())
        .and(json_body())
        .and(rt.clone())
        .and_then(handle_create_schedule);

    // GET /api/v1/schedules
    let list_schedules = warp::path!("api" / "v1" / "schedules")
        .and(warp::get())
        .and(rt.clone())
        .and_then(handle_list_schedules);

    // GET /api/v1/schedules/executions?schedule_id=&limit=
    let history = warp::path!("api" / "v1" / "schedules" / "executions")
        .and(warp::get())
        .and(warp::query::<HistoryQuery>())
        .and(rt.clone())
        .and_then(handle_history);

    // GET /api/v1/schedules/:id
    let get_schedule = warp::path!("api" / "v1" / "schedules" / Uuid)
        .and(warp::get())
        .and(rt.clone())
        .and_then(handle_get_schedule);

    // PUT /api/v1/schedules/:id
    let update_schedule = warp::path!("api" / "v1" / "schedules" / Uuid)
        .and(warp::put())
        .and(json_body())
        .and(rt.clone())
        .and_then(handle_update_schedule);

    // DELETE /api/v1/schedules/:id
    let delete_schedule = warp::path!("api" / "v1" / "schedules" / Uuid)
        .and(warp::delete())
        .and(rt.clone())
        .and_then(handle_delete_schedule);

    // POST /api/v1/schedules/:id/trigger?wait=
    let manual_trigger = warp::path!("api" / "v1" / "schedules" / Uuid / "trigger")
        .and(warp::post())
        .and(warp::query::<TriggerQuery>())
        .and(optional_body())
        .and(rt.clone())
        .and_then(handle_manual_trigger);

    let schedules = create_schedule
        .or(list_schedules)
        .or(history)
        .or(get_schedule)
        .or(update_schedule)
        .or(delete_schedule)
        .or(manual_trigger)
        .boxed();

    // POST /webhook/:webhook_id
    let webhook = warp::path!("webhook" / String)
        .and(warp::post())
        .and(optional_body())
        .and(rt.clone())
        .and_then(handle_webhook);

    // POST /event/:event_type
    let event = warp::path!("event" / String)
        .and(warp::post())
        .and(optional_body())
        .and(rt)
        .and_then(handle_event);

    health
        .or(workflows)
        .or(executions)
        .or(hil)
        .or(schedules)
        .or(webhook)
        .or(event)
        .recover(handle_rejection)
}

/// Largest request body accepted by any route
pub const MAX_BODY_BYTES: u64 = 1024 * 1024;

#[derive(Debug)]
struct BodyTooLarge;

impl warp::reject::Reject for BodyTooLarge {}

#[derive(Debug)]
struct LengthRequired;

impl warp::reject::Reject for LengthRequired {}

/// JSON body of a route that requires one
fn json_body<T: DeserializeOwned + Send>(
) -> impl Filter<Extract = (T,), Error = warp::Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

/// Raw body that may be empty; parsed by the handler. A request without
/// `content-length` must not carry a body at all.
fn optional_body() -> impl Filter<Extract = (Bytes,), Error = warp::Rejection> + Clone {
    warp::header::optional::<u64>("content-length")
        .and(warp::header::optional::<String>("transfer-encoding"))
        .and_then(|length: Option<u64>, encoding: Option<String>| async move {
            match (length, encoding) {
                (Some(length), _) if length > MAX_BODY_BYTES => {
                    Err(warp::reject::custom(BodyTooLarge))
                }
                (None, Some(_)) => Err(warp::reject::custom(LengthRequired)),
                _ => Ok(()),
            }
        })
        .untuple_one()
        .and(warp::body::bytes())
}

fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> FlowResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| FlowError::Validation(format!("Invalid JSON: {}", e)))
}

fn parse_payload(body: &Bytes) -> FlowResult<Value> {
    parse_body::<Value>(body)
}

/// Map a core error to its HTTP status
pub fn status_for(err: &FlowError) -> StatusCode {
    match err {
        FlowError::Validation(_) => StatusCode::BAD_REQUEST,
        FlowError::NotFound { .. } => StatusCode::NOT_FOUND,
        FlowError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(err: &FlowError) -> Reply {
    let status = status_for(err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        crate::services::log_error(&err.to_string(), Some("api"));
    }
    warp::reply::with_status(
        warp::reply::json(&json!({
            "error": err.to_string(),
            "retryable": err.is_retryable(),
        })),
        status,
    )
}

fn reply<T: Serialize>(result: FlowResult<T>, status: StatusCode) -> Result<Reply, Infallible> {
    Ok(match result {
        Ok(body) => warp::reply::with_status(warp::reply::json(&body), status),
        Err(err) => error_reply(&err),
    })
}

async fn handle_rejection(rejection: warp::Rejection) -> Result<Reply, Infallible> {
    let (status, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "Route not found".to_string())
    } else if let Some(err) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid body: {}", err))
    } else if let Some(err) = rejection.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, format!("Invalid query: {}", err))
    } else if rejection.find::<BodyTooLarge>().is_some()
        || rejection.find::<warp::reject::PayloadTooLarge>().is_some()
    {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("Body exceeds {} bytes", MAX_BODY_BYTES),
        )
    } else if rejection.find::<LengthRequired>().is_some()
        || rejection.find::<warp::reject::LengthRequired>().is_some()
    {
        (StatusCode::LENGTH_REQUIRED, "Content-Length required".to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{:?}", rejection))
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "error": message, "retryable": false })),
        status,
    ))
}

async fn handle_health(rt: Arc<FlowRuntime>) -> Result<Reply, Infallible> {
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        workflows: rt.registry().list_workflows().len(),
        pending_requests: rt.hil().list_pending(None).len(),
        schedules: rt.scheduler().list_schedules().len(),
    };
    reply(Ok(response), StatusCode::OK)
}

async fn handle_create_workflow(
    definition: WorkflowDefinition,
    rt: Arc<FlowRuntime>,
) -> Result<Reply, Infallible> {
    let result = rt
        .register_workflow(definition)
        .map(|compiled| compiled.definition.clone());
    reply(result, StatusCode::CREATED)
}

async fn handle_list_workflows(rt: Arc<FlowRuntime>) -> Result<Reply, Infallible> {
    reply(Ok(rt.registry().list_workflows()), StatusCode::OK)
}

async fn handle_run_workflow(
    workflow_id: String,
    body: Bytes,
    rt: Arc<FlowRuntime>,
) -> Result<Reply, Infallible> {
    let request: RunRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return Ok(error_reply(&err)),
    };
    let result = rt
        .engine()
        .start(&workflow_id, request.input, request.context)
        .await
        .and_then(|execution_id| {
            rt.registry()
                .get_execution(execution_id)
                .ok_or_else(|| FlowError::not_found("Execution", execution_id))
        })
        .map(|record| {
            json!({
                "execution_id": record.execution_id,
                "thread_id": record.execution_id,
                "workflow_id": record.workflow_id,
                "workflow_version": record.workflow_version,
                "status": record.status,
            })
        });
    reply(result, StatusCode::ACCEPTED)
}

async fn handle_workflow_state(
    workflow_id: String,
    query: StateQuery,
    rt: Arc<FlowRuntime>,
) -> Result<Reply, Infallible> {
    reply(
        rt.engine().get_workflow_state(&workflow_id, query.thread_id),
        StatusCode::OK,
    )
}

async fn handle_get_execution(
    execution_id: Uuid,
    rt: Arc<FlowRuntime>,
) -> Result<Reply, Infallible> {
    let result = rt
        .registry()
        .get_execution(execution_id)
        .ok_or_else(|| FlowError::not_found("Execution", execution_id));
    reply(result, StatusCode::OK)
}

async fn handle_pause(execution_id: Uuid, rt: Arc<FlowRuntime>) -> Result<Reply, Infallible> {
    reply(rt.engine().pause(execution_id), StatusCode::ACCEPTED)
}

async fn handle_resume(
    execution_id: Uuid,
    body: Bytes,
    rt: Arc<FlowRuntime>,
) -> Result<Reply, Infallible> {
    let result = parse_body::<ResumeRequest>(&body).and_then(|request| {
        rt.engine()
            .resume_with_input(execution_id, request.human_input)
    });
    let result = result.map(|response| {
        json!({
            "execution_id": execution_id,
            "resumed": response.is_some(),
            "response": response,
        })
    });
    reply(result, StatusCode::ACCEPTED)
}

async fn handle_cancel(execution_id: Uuid, rt: Arc<FlowRuntime>) -> Result<Reply, Infallible> {
    reply(rt.engine().cancel(execution_id), StatusCode::OK)
}

async fn handle_create_request(
    body: CreateHilRequest,
    rt: Arc<FlowRuntime>,
) -> Result<Reply, Infallible> {
    reply(
        rt.hil()
            .create(body.execution_id, &body.workflow_id, &body.step_id, body.request),
        StatusCode::CREATED,
    )
}

async fn handle_list_pending(
    query: PendingQuery,
    rt: Arc<FlowRuntime>,
) -> Result<Reply, Infallible> {
    reply(
        Ok(rt.hil().list_pending(query.workflow_id.as_deref())),
        StatusCode::OK,
    )
}

async fn handle_get_request(request_id: Uuid, rt: Arc<FlowRuntime>) -> Result<Reply, Infallible> {
    let result = rt.hil().get(request_id).map(|request| {
        json!({
            "request": request,
            "response": rt.hil().get_response(request_id),
        })
    });
    reply(result, StatusCode::OK)
}

async fn handle_respond(
    request_id: Uuid,
    resolution: HilResolution,
    rt: Arc<FlowRuntime>,
) -> Result<Reply, Infallible> {
    reply(rt.hil().respond(request_id, resolution), StatusCode::OK)
}

async fn handle_create_schedule(
    request: CreateScheduleRequest,
    rt: Arc<FlowRuntime>,
) -> Result<Reply, Infallible> {
    reply(rt.scheduler().create_schedule(request), StatusCode::CREATED)
}

async fn handle_list_schedules(rt: Arc<FlowRuntime>) -> Result<Reply, Infallible> {
    reply(Ok(rt.scheduler().list_schedules()), StatusCode::OK)
}

async fn handle_history(query: HistoryQuery, rt: Arc<FlowRuntime>) -> Result<Reply, Infallible> {
    let limit = query.limit.unwrap_or(50).min(1000);
    reply(
        Ok(rt.scheduler().history(query.schedule_id, limit)),
        StatusCode::OK,
    )
}

async fn handle_get_schedule(schedule_id: Uuid, rt: Arc<FlowRuntime>) -> Result<Reply, Infallible> {
    reply(rt.scheduler().get_schedule(schedule_id), StatusCode::OK)
}

async fn handle_update_schedule(
    schedule_id: Uuid,
    update: UpdateScheduleRequest,
    rt: Arc<FlowRuntime>,
) -> Result<Reply, Infallible> {
    reply(
        rt.scheduler().update_schedule(schedule_id, update),
        StatusCode::OK,
    )
}

async fn handle_delete_schedule(
    schedule_id: Uuid,
    rt: Arc<FlowRuntime>,
) -> Result<Reply, Infallible> {
    reply(rt.scheduler().delete_schedule(schedule_id), StatusCode::OK)
}

async fn handle_manual_trigger(
    schedule_id: Uuid,
    query: TriggerQuery,
    body: Bytes,
    rt: Arc<FlowRuntime>,
) -> Result<Reply, Infallible> {
    let request: ManualTriggerRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return Ok(error_reply(&err)),
    };
    let scheduler = rt.scheduler();
    let fired = match scheduler.manual_trigger(schedule_id, request.input).await {
        Ok(fired) => fired,
        Err(err) => return Ok(error_reply(&err)),
    };

    let record = match query.wait {
        Some(seconds) if seconds > 0 && !fired.status.is_terminal() => scheduler
            .wait_for(fired.id, Duration::from_secs(seconds))
            .await
            .unwrap_or(fired),
        _ => fired,
    };
    let status = if record.status.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    reply(Ok(record), status)
}

async fn handle_webhook(
    webhook_id: String,
    body: Bytes,
    rt: Arc<FlowRuntime>,
) -> Result<Reply, Infallible> {
    let result = match parse_payload(&body) {
        Ok(payload) => rt.scheduler().trigger_webhook(&webhook_id, payload).await,
        Err(err) => Err(err),
    };
    reply(result, StatusCode::ACCEPTED)
}

async fn handle_event(
    event_type: String,
    body: Bytes,
    rt: Arc<FlowRuntime>,
) -> Result<Reply, Infallible> {
    let result = match parse_payload(&body) {
        Ok(payload) => rt.scheduler().trigger_event(&event_type, payload).await,
        Err(err) => Err(err),
    };
    reply(result, StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&FlowError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&FlowError::not_found("Schedule", "1")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&FlowError::Conflict("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&FlowError::CheckpointWrite("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_parse_body_accepts_empty() {
        let request: ResumeRequest = parse_body(&Bytes::from_static(b"  ")).unwrap();
        assert!(request.human_input.is_none());
        assert_eq!(parse_payload(&Bytes::new()).unwrap(), Value::Null);
        assert!(parse_payload(&Bytes::from_static(b"{oops")).is_err());
    }
}
