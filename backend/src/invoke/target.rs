//! Where and how each deployed runtime is called

use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::deploy::agentcore::invocation_url;
use crate::errors::BackendError;
use crate::models::deployment::{DeploymentStatus, TargetType};

pub const SESSION_HEADER: &str = "X-Amzn-Bedrock-AgentCore-Runtime-Session-Id";

/// AgentCore rejects shorter session ids
pub const MIN_SESSION_ID_LEN: usize = 33;

/// A deployed runtime to invoke
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum InvokeTarget {
    Lambda {
        sync_url: String,
        #[serde(default)]
        stream_url: Option<String>,
        region: String,
    },
    #[serde(rename = "agentcore")]
    AgentCore {
        runtime_arn: String,
        region: String,
    },
    Ecs {
        endpoint: String,
    },
}

impl InvokeTarget {
    /// Resolve from a completed deployment
    pub fn from_status(status: &DeploymentStatus) -> Result<Self, BackendError> {
        let missing = |what: &str| {
            BackendError::BadRequest(format!(
                "deployment {} has no {}",
                status.deployment_id, what
            ))
        };
        let region = || status.region.clone().ok_or_else(|| missing("region"));
        match status.target {
            TargetType::Lambda => Ok(InvokeTarget::Lambda {
                sync_url: status
                    .outputs
                    .get("sync_function_url")
                    .cloned()
                    .or_else(|| status.endpoint_url.clone())
                    .ok_or_else(|| missing("function URL"))?,
                stream_url: status.outputs.get("stream_function_url").cloned(),
                region: region()?,
            }),
            TargetType::AgentCore => Ok(InvokeTarget::AgentCore {
                runtime_arn: status
                    .agent_runtime_arn
                    .clone()
                    .ok_or_else(|| missing("agent runtime ARN"))?,
                region: region()?,
            }),
            TargetType::Ecs => Ok(InvokeTarget::Ecs {
                endpoint: status
                    .endpoint_url
                    .clone()
                    .ok_or_else(|| missing("service endpoint"))?,
            }),
        }
    }
}

/// A prepared HTTP call
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointCall {
    pub url: Url,
    /// `(service, region)` when the call must be SigV4 signed
    pub signing: Option<(&'static str, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

fn parse_url(raw: &str) -> Result<Url, BackendError> {
    Url::parse(raw).map_err(|e| BackendError::BadRequest(format!("invalid endpoint {}: {}", raw, e)))
}

fn join_path(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

/// Check an AgentCore session id, or mint one
pub fn session_id(requested: Option<&str>) -> Result<String, BackendError> {
    match requested {
        Some(id) if id.len() < MIN_SESSION_ID_LEN => Err(BackendError::invalid(
            "session_id",
            format!("must be at least {} characters", MIN_SESSION_ID_LEN),
        )),
        Some(id) => Ok(id.to_string()),
        None => Ok(format!("session-{}", uuid::Uuid::new_v4())),
    }
}

/// Build the call for `prompt`. Fails before any network traffic when the
/// request cannot be valid.
pub fn endpoint_call(
    target: &InvokeTarget,
    prompt: &str,
    stream: bool,
    session: Option<&str>,
) -> Result<EndpointCall, BackendError> {
    let body = json!({ "prompt": prompt });
    match target {
        InvokeTarget::Lambda {
            sync_url,
            stream_url,
            region,
        } => {
            let url = match (stream, stream_url) {
                (true, Some(stream_url)) => stream_url,
                _ => sync_url,
            };
            Ok(EndpointCall {
                url: parse_url(url)?,
                signing: Some(("lambda", region.clone())),
                headers: Vec::new(),
                body,
            })
        }
        InvokeTarget::AgentCore {
            runtime_arn,
            region,
        } => {
            let session = session_id(session)?;
            Ok(EndpointCall {
                url: parse_url(&invocation_url(region, runtime_arn))?,
                signing: Some(("bedrock-agentcore", region.clone())),
                headers: vec![
                    (SESSION_HEADER.to_string(), session),
                    (
                        "Accept".to_string(),
                        "text/event-stream, application/json".to_string(),
                    ),
                ],
                body,
            })
        }
        InvokeTarget::Ecs { endpoint } => {
            let path = if stream { "invoke-stream" } else { "invoke" };
            Ok(EndpointCall {
                url: parse_url(&join_path(endpoint, path))?,
                signing: None,
                headers: Vec::new(),
                body,
            })
        }
    }
}
