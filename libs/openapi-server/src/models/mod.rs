//! Backend API models

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Error body returned with every non-2xx status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldErrorBody {
    pub field: String,
    pub message: String,
}

/// Deployment start response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDeploymentResponse {
    pub deployment_id: String,
    pub status_url: String,
}

/// Deployment list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentListResponse {
    pub deployments: Vec<Value>,
    pub total: usize,
}

/// Query of `DELETE /deployments/{id}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteDeploymentQuery {
    /// Also tear down the cloud resources
    #[serde(default)]
    pub resources: bool,
}

/// Deployment delete response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteDeploymentResponse {
    pub deployment_id: String,
    pub record_deleted: bool,
    #[serde(default)]
    pub resources: Option<String>,
}

/// Cleanup request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupRequest {
    /// Defaults to the configured retention
    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

/// Cleanup response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub removed: usize,
    pub remaining: usize,
}

/// Build log response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLogsResponse {
    pub build_id: String,
    pub lines: Vec<String>,
}

/// Body of `POST /invoke/{target}`.
///
/// Either `deployment_id` names a completed deployment, or the endpoint
/// fields for the target are given directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokeRequestBody {
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Lambda sync Function URL
    #[serde(default)]
    pub sync_url: Option<String>,
    /// Lambda streaming Function URL
    #[serde(default)]
    pub stream_url: Option<String>,
    /// AgentCore runtime ARN
    #[serde(default)]
    pub runtime_arn: Option<String>,
    /// ECS service base URL
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Body of `POST /execute`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequestBody {
    pub code: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub stream: bool,
}

/// Non-streaming local execution response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    pub strategy: String,
}
