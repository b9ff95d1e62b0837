//! HTTP request handlers

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use openapi_server::models::{
    BuildLogsResponse, CleanupRequest, CleanupResponse, DeleteDeploymentQuery,
    DeleteDeploymentResponse, DeploymentListResponse, ErrorResponse, ExecuteRequestBody,
    ExecuteResponse, FieldErrorBody, HealthResponse, InvokeRequestBody,
    StartDeploymentResponse, VersionResponse,
};
use tracing::{error, warn};

use crate::deploy::manager::DeploymentRequest;
use crate::errors::BackendError;
use crate::invoke::response::error_stream;
use crate::invoke::{FrameStream, InvokeRequest, InvokeResponse, InvokeTarget};
use crate::models::deployment::TargetType;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// A `BackendError` rendered as an HTTP response
pub struct ApiError(pub BackendError);

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        Self(err)
    }
}

pub fn status_code(err: &BackendError) -> StatusCode {
    match err {
        BackendError::ValidationError(_) | BackendError::BadRequest(_) => StatusCode::BAD_REQUEST,
        BackendError::NotFound(_) => StatusCode::NOT_FOUND,
        BackendError::ToolingError(_) => StatusCode::SERVICE_UNAVAILABLE,
        BackendError::InvocationError { .. } => StatusCode::BAD_GATEWAY,
        BackendError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let fields = match &self.0 {
            BackendError::ValidationError(errors) => errors
                .iter()
                .map(|e| FieldErrorBody {
                    field: e.field.clone(),
                    message: e.message.clone(),
                })
                .collect(),
            _ => Vec::new(),
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
            fields,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn sse(frames: FrameStream) -> Response {
    let events = frames.map(|frame| {
        Ok::<_, Infallible>(Event::default().event(frame.kind.as_str()).data(frame.data))
    });
    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "strands-backend".to_string(),
        version: version_info().version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Tooling probe handler
pub async fn tooling_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.builder.check_tooling_available(&state.python_bin).await)
}

pub async fn start_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<DeploymentRequest>,
) -> ApiResult<impl IntoResponse> {
    let started = state.manager.start(request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartDeploymentResponse {
            status_url: format!("/deployments/{}", started.deployment_id),
            deployment_id: started.deployment_id,
        }),
    ))
}

pub async fn list_deployments_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<impl IntoResponse> {
    let deployments = state
        .manager
        .list_statuses()
        .into_values()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(BackendError::from)?;
    Ok(Json(DeploymentListResponse {
        total: deployments.len(),
        deployments,
    }))
}

pub async fn get_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.manager.get_status(&id)?))
}

pub async fn delete_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<DeleteDeploymentQuery>,
) -> ApiResult<impl IntoResponse> {
    let report = state.manager.delete(&id, query.resources).await?;
    if !report.record_deleted && report.resources.is_none() {
        return Err(BackendError::NotFound(format!("deployment {}", id)).into());
    }
    let resources = report
        .resources
        .map(|outcome| serde_json::to_value(outcome).map_err(BackendError::from))
        .transpose()?
        .and_then(|v| v.as_str().map(str::to_string));
    Ok(Json(DeleteDeploymentResponse {
        deployment_id: id,
        record_deleted: report.record_deleted,
        resources,
    }))
}

pub async fn cleanup_handler(
    State(state): State<Arc<ServerState>>,
    Query(request): Query<CleanupRequest>,
) -> impl IntoResponse {
    let max_age = request
        .max_age_secs
        .map(Duration::from_secs)
        .unwrap_or(state.status_max_age);
    let removed = state.manager.cleanup(max_age);
    Json(CleanupResponse {
        removed,
        remaining: state.manager.statuses().len(),
    })
}

pub async fn build_logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(build_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let lines = state
        .builder
        .logs()
        .lines(&build_id)
        .ok_or_else(|| BackendError::NotFound(format!("build {}", build_id)))?;
    Ok(Json(BuildLogsResponse { build_id, lines }))
}

/// Endpoint described by an invoke body, or by the deployment it names
fn resolve_target(
    state: &ServerState,
    target: TargetType,
    body: &InvokeRequestBody,
) -> Result<InvokeTarget, BackendError> {
    if let Some(id) = &body.deployment_id {
        let status = state.manager.get_status(id)?;
        if status.target != target {
            return Err(BackendError::BadRequest(format!(
                "deployment {} targets {}, not {}",
                id, status.target, target
            )));
        }
        return InvokeTarget::from_status(&status);
    }

    let require = |value: &Option<String>, field: &str| {
        value
            .clone()
            .ok_or_else(|| BackendError::invalid(field, "required without deployment_id"))
    };
    let region = body
        .region
        .clone()
        .unwrap_or_else(|| state.default_region.clone());
    Ok(match target {
        TargetType::Lambda => InvokeTarget::Lambda {
            sync_url: require(&body.sync_url, "sync_url")?,
            stream_url: body.stream_url.clone(),
            region,
        },
        TargetType::AgentCore => InvokeTarget::AgentCore {
            runtime_arn: require(&body.runtime_arn, "runtime_arn")?,
            region,
        },
        TargetType::Ecs => InvokeTarget::Ecs {
            endpoint: require(&body.endpoint, "endpoint")?,
        },
    })
}

pub async fn invoke_handler(
    State(state): State<Arc<ServerState>>,
    Path(target): Path<TargetType>,
    Json(body): Json<InvokeRequestBody>,
) -> ApiResult<Response> {
    if body.prompt.trim().is_empty() {
        return Err(BackendError::invalid("prompt", "must not be empty").into());
    }
    let invoke_target = resolve_target(&state, target, &body)?;
    let request = InvokeRequest {
        prompt: body.prompt,
        stream: body.stream,
        session_id: body.session_id,
    };

    match state.invoker.invoke(&invoke_target, &request).await {
        Ok(InvokeResponse::Json(value)) => Ok(Json(value).into_response()),
        Ok(InvokeResponse::Stream(frames)) => Ok(sse(frames)),
        Err(e) if request.stream && !e.is_pre_flight() => {
            warn!("Streaming invocation failed: {}", e);
            Ok(sse(error_stream(&e.to_string())))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn execute_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ExecuteRequestBody>,
) -> ApiResult<Response> {
    if body.code.trim().is_empty() {
        return Err(BackendError::invalid("code", "must not be empty").into());
    }
    if body.stream {
        let frames = state.executor.stream(&body.code, &body.input).await?;
        return Ok(sse(frames));
    }
    let result = state.executor.execute(&body.code, &body.input).await?;
    Ok(Json(ExecuteResponse {
        success: result.success,
        output: result.output,
        error: result.error,
        strategy: result.strategy.as_str().to_string(),
    })
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FieldError;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            status_code(&BackendError::ValidationError(vec![FieldError::new("a", "b")])),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_code(&BackendError::NotFound("x".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_code(&BackendError::ToolingError("docker".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_code(&BackendError::InvocationError {
                endpoint: "e".to_string(),
                status: 500,
                body: String::new(),
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_code(&BackendError::Internal("x".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
