//! Deployment models

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};

/// Supported hosting platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetType {
    #[serde(rename = "lambda")]
    Lambda,
    #[serde(rename = "agentcore")]
    AgentCore,
    #[serde(rename = "ecs")]
    Ecs,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Lambda => "lambda",
            TargetType::AgentCore => "agentcore",
            TargetType::Ecs => "ecs",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lambda" => Ok(TargetType::Lambda),
            "agentcore" | "agent_core" | "bedrock-agentcore" => Ok(TargetType::AgentCore),
            "ecs" | "fargate" => Ok(TargetType::Ecs),
            _ => Err(format!("Unknown deployment target: {}", s)),
        }
    }
}

/// Endpoints and identifiers recovered after provisioning
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentOutputs {
    pub endpoint_url: Option<String>,
    pub function_arn: Option<String>,
    pub agent_runtime_arn: Option<String>,
    pub service_arn: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// Status record of one deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub deployment_id: String,
    pub target: TargetType,
    pub state: DeploymentState,
    pub message: String,

    /// Function, agent or service name
    #[serde(default)]
    pub resource_name: Option<String>,
    #[serde(default)]
    pub region: Option<String>,

    pub function_arn: Option<String>,
    pub agent_runtime_arn: Option<String>,
    pub service_arn: Option<String>,
    pub endpoint_url: Option<String>,

    #[serde(default)]
    pub logs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Seconds from creation to the terminal state
    pub deployment_time: Option<f64>,

    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub streaming_capable: bool,
}

impl DeploymentStatus {
    pub fn new(deployment_id: String, target: TargetType) -> Self {
        Self {
            deployment_id,
            target,
            state: DeploymentState::Pending,
            message: "Deployment queued".to_string(),
            resource_name: None,
            region: None,
            function_arn: None,
            agent_runtime_arn: None,
            service_arn: None,
            endpoint_url: None,
            logs: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
            deployment_time: None,
            outputs: BTreeMap::new(),
            streaming_capable: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a lifecycle event; terminal events stamp the completion time
    pub fn apply(&mut self, event: DeploymentEvent) -> Result<(), String> {
        let mut fsm = DeploymentFsm::at(self.state);
        fsm.process(event)?;
        self.state = fsm.state();
        if let Some(error) = fsm.error() {
            self.message = error.to_string();
        }
        if self.state.is_terminal() {
            let now = Utc::now();
            self.completed_at = Some(now);
            self.deployment_time =
                Some((now - self.created_at).num_milliseconds() as f64 / 1000.0);
        }
        Ok(())
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }

    /// Merge provisioning outputs into the record
    pub fn merge_outputs(&mut self, outputs: DeploymentOutputs) {
        if outputs.endpoint_url.is_some() {
            self.endpoint_url = outputs.endpoint_url;
        }
        if outputs.function_arn.is_some() {
            self.function_arn = outputs.function_arn;
        }
        if outputs.agent_runtime_arn.is_some() {
            self.agent_runtime_arn = outputs.agent_runtime_arn;
        }
        if outputs.service_arn.is_some() {
            self.service_arn = outputs.service_arn;
        }
        self.outputs.extend(outputs.values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_stamps_completion() {
        let mut status = DeploymentStatus::new("d-1".to_string(), TargetType::Ecs);
        status.apply(DeploymentEvent::Validate).unwrap();
        status
            .apply(DeploymentEvent::Fail("memory: invalid".to_string()))
            .unwrap();
        assert_eq!(status.state, DeploymentState::Failed);
        assert_eq!(status.message, "memory: invalid");
        assert!(status.completed_at.is_some());
        assert!(status.deployment_time.unwrap() >= 0.0);
        assert!(status.apply(DeploymentEvent::Build).is_err());
    }

    #[test]
    fn test_target_type_parse() {
        assert_eq!("AgentCore".parse::<TargetType>().unwrap(), TargetType::AgentCore);
        assert_eq!("fargate".parse::<TargetType>().unwrap(), TargetType::Ecs);
        assert!("k8s".parse::<TargetType>().is_err());
        assert_eq!(serde_json::to_string(&TargetType::AgentCore).unwrap(), "\"agentcore\"");
    }
}
