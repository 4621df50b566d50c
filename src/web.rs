//! HTTP 表层：JSON over HTTP 的薄壳，全部转发到 task::Service
//!
//! 约定：绑定/校验失败 400，实体缺失 404，其余 500；错误响应体为 {"error": "..."}。

use std::sync::Arc;

use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::task::{
    ActionType, ExecuteRequest, PhaseStatus, PlanRequest, Service, TaskError, ToolCall,
};

/// API 错误：状态码 + {"error": ...} 响应体
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        let status = match &e {
            TaskError::NotFound { .. } => StatusCode::NOT_FOUND,
            TaskError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %e, "请求处理失败");
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

/// JSON 请求体提取器：任何绑定失败都映射为 400
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::bad_request(rejection.body_text())),
        }
    }
}

#[derive(Clone)]
struct AppState {
    service: Arc<Service>,
}

/// 构建 API 路由
pub fn router(service: Arc<Service>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/api/v1/task", post(create_task))
        .route(
            "/api/v1/task/:task_id",
            get(get_task).delete(delete_task),
        )
        .route("/api/v1/tasks", get(list_tasks))
        .route("/api/v1/task/execute", post(execute_task))
        .route("/api/v1/task/:task_id/context", get(get_task_context))
        .route("/api/v1/task/:task_id/summary", get(get_task_summary))
        .route(
            "/api/v1/task/:task_id/optimized-context",
            post(get_optimized_context),
        )
        .route("/api/v1/task/:task_id/phase", put(update_phase))
        .route("/api/v1/task/:task_id/step", put(complete_step))
        .route("/api/v1/task/:task_id/finding", post(add_finding))
        .route("/api/v1/task/:task_id/decision", post(add_decision))
        .route("/api/v1/task/:task_id/error", post(record_error))
        .route("/api/v1/task/:task_id/completion", get(check_completion))
        .route("/api/v1/task/:task_id/view-action", post(record_view_action))
        .route("/api/v1/session", post(start_session))
        .route("/api/v1/session/:session_id/execute", post(execute_session))
        .route("/api/v1/session/:session_id/stop", get(check_session_stop))
        .route("/api/v1/health", get(|| async { "OK" }))
        .with_state(state)
}

fn require(field: &str, value: &str) -> Result<(), ApiError> {
    if value.is_empty() {
        return Err(ApiError::bad_request(format!("{} is required", field)));
    }
    Ok(())
}

async fn create_task(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<PlanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require("user_id", &req.user_id)?;
    require("session_id", &req.session_id)?;
    require("goal", &req.goal)?;

    let resp = state
        .service
        .create_task(&req, &CancellationToken::new())
        .await?;
    Ok(Json(resp))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.service.get_task(&task_id)? {
        Some(task) => Ok(Json(task)),
        None => Err(ApiError::not_found("task not found")),
    }
}

async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.delete_task(&task_id)?;
    Ok(Json(serde_json::json!({ "message": "task deleted" })))
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    session_id: String,
}

#[derive(Debug, Serialize)]
struct ListTasksResponse {
    tasks: Vec<crate::task::Task>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(q): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = state.service.list_tasks(&q.user_id, &q.session_id)?;
    Ok(Json(ListTasksResponse { tasks }))
}

async fn execute_task(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ExecuteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require("task_id", &req.task_id)?;
    let resp = state
        .service
        .execute_task(&req, &CancellationToken::new())
        .await?;
    Ok(Json(resp))
}

async fn get_task_context(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.service.get_task_context(&task_id)? {
        Some(ctx) => Ok(Json(ctx)),
        None => Err(ApiError::not_found("task not found")),
    }
}

async fn get_task_summary(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state.service.get_task_summary(&task_id)?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
struct OptimizedContextBody {
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

async fn get_optimized_context(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    ApiJson(body): ApiJson<OptimizedContextBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = state
        .service
        .get_optimized_context(&task_id, &body.tool_calls, &CancellationToken::new())
        .await?;
    Ok(Json(ctx))
}

#[derive(Debug, Deserialize)]
struct UpdatePhaseBody {
    phase_id: String,
    status: String,
}

async fn update_phase(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    ApiJson(body): ApiJson<UpdatePhaseBody>,
) -> Result<impl IntoResponse, ApiError> {
    require("phase_id", &body.phase_id)?;
    let status = PhaseStatus::parse(&body.status)
        .ok_or_else(|| ApiError::bad_request(format!("invalid phase status: {}", body.status)))?;

    state.service.update_phase(&task_id, &body.phase_id, status)?;
    Ok(Json(serde_json::json!({ "message": "phase updated" })))
}

#[derive(Debug, Deserialize)]
struct CompleteStepBody {
    phase_id: String,
    step_id: String,
    #[serde(default)]
    result: String,
}

async fn complete_step(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    ApiJson(body): ApiJson<CompleteStepBody>,
) -> Result<impl IntoResponse, ApiError> {
    require("phase_id", &body.phase_id)?;
    require("step_id", &body.step_id)?;

    state
        .service
        .complete_step(&task_id, &body.phase_id, &body.step_id, &body.result)?;
    Ok(Json(serde_json::json!({ "message": "step completed" })))
}

#[derive(Debug, Deserialize)]
struct AddFindingBody {
    category: String,
    content: String,
    #[serde(default)]
    source: String,
}

async fn add_finding(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    ApiJson(body): ApiJson<AddFindingBody>,
) -> Result<impl IntoResponse, ApiError> {
    require("category", &body.category)?;
    require("content", &body.content)?;

    state
        .service
        .add_finding(&task_id, &body.category, &body.content, &body.source)?;
    Ok(Json(serde_json::json!({ "message": "finding added" })))
}

#[derive(Debug, Deserialize)]
struct AddDecisionBody {
    decision: String,
    #[serde(default)]
    rationale: String,
}

async fn add_decision(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    ApiJson(body): ApiJson<AddDecisionBody>,
) -> Result<impl IntoResponse, ApiError> {
    require("decision", &body.decision)?;

    state
        .service
        .add_decision(&task_id, &body.decision, &body.rationale)?;
    Ok(Json(serde_json::json!({ "message": "decision added" })))
}

#[derive(Debug, Deserialize)]
struct RecordErrorBody {
    error: String,
    #[serde(default = "default_attempt")]
    attempt: u32,
    #[serde(default)]
    resolution: String,
}

fn default_attempt() -> u32 {
    1
}

async fn record_error(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    ApiJson(body): ApiJson<RecordErrorBody>,
) -> Result<impl IntoResponse, ApiError> {
    require("error", &body.error)?;

    state
        .service
        .record_error(&task_id, &body.error, body.attempt, &body.resolution)?;
    Ok(Json(serde_json::json!({ "message": "error recorded" })))
}

async fn check_completion(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.service.check_completion(&task_id)?;
    Ok(Json(status))
}

#[derive(Debug, Deserialize)]
struct ViewActionBody {
    action_type: String,
}

async fn record_view_action(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    ApiJson(body): ApiJson<ViewActionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let action_type = ActionType::parse(&body.action_type).ok_or_else(|| {
        ApiError::bad_request(format!("invalid action type: {}", body.action_type))
    })?;

    let needs_save = state.service.record_view_action(&task_id, action_type)?;
    Ok(Json(serde_json::json!({
        "message": "view action recorded",
        "needs_save": needs_save,
        "action_rule": "2-action rule",
    })))
}

async fn start_session(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<PlanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require("user_id", &req.user_id)?;
    require("session_id", &req.session_id)?;
    require("goal", &req.goal)?;

    let info = state.service.start_session(&req)?;
    Ok(Json(info))
}

async fn execute_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let resp = state
        .service
        .execute_session(&session_id, &CancellationToken::new())
        .await?;
    Ok(Json(resp))
}

async fn check_session_stop(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.service.check_session_stop(&session_id)?;
    Ok(Json(status))
}
