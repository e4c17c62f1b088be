use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::engine::WorkflowEngine;
use crate::metrics::gather_metrics;
use crate::model::{
    ExecutionContext, ScheduleDefinition, Workflow, WorkflowDefinition, WorkflowExecution, WorkflowSchedule,
};
use crate::store::ExecutionFilter;
use crate::Error;

type ApiResult<T> = std::result::Result<T, Error>;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::WorkflowNotFound(_) | Error::ExecutionNotFound(_) | Error::ScheduleNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Error::WorkflowInactive(_) | Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::WorkflowNoSteps
            | Error::WorkflowValidation(_)
            | Error::Condition(_)
            | Error::Template(_)
            | Error::MissingRecipient(_)
            | Error::MissingTemplate
            | Error::UnsupportedStepType(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            Error::Provider(_) | Error::Rejected(_) | Error::Timeout(_) => StatusCode::BAD_GATEWAY,
            _ => {
                error!(error = %self, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn metrics() -> ApiResult<String> {
    gather_metrics()
}

pub async fn create_workflow(
    State(engine): State<Arc<WorkflowEngine>>,
    Path(tenant): Path<String>,
    Json(definition): Json<WorkflowDefinition>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    let workflow = engine.save_workflow(&tenant, definition).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

pub async fn list_workflows(
    State(engine): State<Arc<WorkflowEngine>>,
    Path(tenant): Path<String>,
) -> ApiResult<Json<Vec<Workflow>>> {
    Ok(Json(engine.list_workflows(&tenant).await?))
}

pub async fn get_workflow(
    State(engine): State<Arc<WorkflowEngine>>,
    Path((tenant, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(engine.get_workflow(&tenant, id).await?))
}

pub async fn activate_workflow(
    State(engine): State<Arc<WorkflowEngine>>,
    Path((tenant, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(engine.activate_workflow(&tenant, id).await?))
}

pub async fn pause_workflow(
    State(engine): State<Arc<WorkflowEngine>>,
    Path((tenant, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(engine.pause_workflow(&tenant, id).await?))
}

pub async fn archive_workflow(
    State(engine): State<Arc<WorkflowEngine>>,
    Path((tenant, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(engine.archive_workflow(&tenant, id).await?))
}

pub async fn update_workflow(
    State(engine): State<Arc<WorkflowEngine>>,
    Path((tenant, id)): Path<(String, Uuid)>,
    Json(definition): Json<WorkflowDefinition>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(engine.update_workflow(&tenant, id, definition).await?))
}

pub async fn delete_workflow(
    State(engine): State<Arc<WorkflowEngine>>,
    Path((tenant, id)): Path<(String, Uuid)>,
) -> ApiResult<StatusCode> {
    engine.delete_workflow(&tenant, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_schedule(
    State(engine): State<Arc<WorkflowEngine>>,
    Path((tenant, id)): Path<(String, Uuid)>,
    Json(definition): Json<ScheduleDefinition>,
) -> ApiResult<(StatusCode, Json<WorkflowSchedule>)> {
    let schedule = engine.create_schedule(&tenant, id, definition).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn list_schedules(
    State(engine): State<Arc<WorkflowEngine>>,
    Path((tenant, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Vec<WorkflowSchedule>>> {
    Ok(Json(engine.list_schedules(&tenant, id).await?))
}

pub async fn delete_schedule(
    State(engine): State<Arc<WorkflowEngine>>,
    Path((tenant, id)): Path<(String, Uuid)>,
) -> ApiResult<StatusCode> {
    engine.delete_schedule(&tenant, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Body of a trigger request. Both fields are optional.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub context: ExecutionContext,
}

pub async fn trigger(
    State(engine): State<Arc<WorkflowEngine>>,
    Path((tenant, identifier)): Path<(String, String)>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<(StatusCode, Json<WorkflowExecution>)> {
    info!(tenant_id = %tenant, trigger = %identifier, "Received trigger");
    let execution = engine
        .trigger_by_identifier(&tenant, &identifier, request.payload, request.context)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(execution)))
}

pub async fn list_executions(
    State(engine): State<Arc<WorkflowEngine>>,
    Path(tenant): Path<String>,
    Query(filter): Query<ExecutionFilter>,
) -> ApiResult<Json<Vec<WorkflowExecution>>> {
    Ok(Json(engine.list_executions(&tenant, &filter).await?))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

pub async fn failed_executions(
    State(engine): State<Arc<WorkflowEngine>>,
    Path(tenant): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<WorkflowExecution>>> {
    let limit = query.limit.unwrap_or(100);
    Ok(Json(engine.failed_executions(&tenant, limit).await?))
}

pub async fn get_execution(
    State(engine): State<Arc<WorkflowEngine>>,
    Path((tenant, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<WorkflowExecution>> {
    Ok(Json(engine.get_execution(&tenant, id).await?))
}

pub async fn cancel_execution(
    State(engine): State<Arc<WorkflowEngine>>,
    Path((tenant, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<WorkflowExecution>> {
    Ok(Json(engine.cancel_execution(&tenant, id).await?))
}

pub async fn retry_execution(
    State(engine): State<Arc<WorkflowEngine>>,
    Path((tenant, id)): Path<(String, Uuid)>,
) -> ApiResult<(StatusCode, Json<WorkflowExecution>)> {
    let execution = engine.retry_execution(&tenant, id).await?;
    Ok((StatusCode::ACCEPTED, Json(execution)))
}
