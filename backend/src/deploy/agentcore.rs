//! Bedrock AgentCore runtime
//!
//! The bundle carries a `.bedrock_agentcore.yaml` descriptor rendered from a
//! template, so no interactive configure step runs. After `agentcore launch`
//! the runtime identifiers are written back into the descriptor, and a copy is
//! kept in artifact storage where later deletes and invocations look them up.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_yaml::Value as Yaml;
use tracing::{debug, info, warn};

use crate::code::template::render_params;
use crate::code::{adapt, analyze, CodeShape};
use crate::deploy::config::{runtime_environment, AgentCoreConfig};
use crate::deploy::package::{self, render_handler, requirements, DEFAULT_PYTHON_VERSION};
use crate::deploy::target::{
    ensure_tools, output_tail, Completion, DeploymentContext, DeploymentTarget, PreparedPackage,
    ProvisionResult, ResourceRef,
};
use crate::errors::{BackendError, FieldError};
use crate::models::deployment::{DeploymentOutputs, TargetType};
use crate::storage::artifacts::ArtifactStore;
use crate::tooling::aws::{AwsCli, CloudError};
use crate::tooling::poll::{poll_until, PollStatus};
use crate::tooling::stack::{DeleteOutcome, StackChange};

pub const DESCRIPTOR_FILE: &str = ".bedrock_agentcore.yaml";

const CONTROL_SERVICE: &str = "bedrock-agentcore-control";

static LABELED_ARN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)agent\s*(?:runtime\s*)?arn\s*[:=]\s*(arn:aws:bedrock-agentcore:[a-z0-9-]+:\d{12}:runtime/[A-Za-z0-9_-]+)").unwrap()
});

static RUNTIME_ARN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"arn:aws:bedrock-agentcore:[a-z0-9-]+:\d{12}:runtime/[A-Za-z0-9_-]+").unwrap()
});

static LABELED_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)agent\s*(?:runtime\s*)?id\s*[:=]\s*([A-Za-z][A-Za-z0-9_]*-[A-Za-z0-9]+)").unwrap());

/// Runtime identifiers recorded for an agent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeIds {
    pub agent_arn: Option<String>,
    pub agent_id: Option<String>,
}

/// Runtime id is the last segment of `...:runtime/<id>`
pub fn runtime_id_from_arn(arn: &str) -> Option<&str> {
    arn.rsplit_once("runtime/").map(|(_, id)| id).filter(|id| !id.is_empty())
}

/// Invocation URL of a runtime
pub fn invocation_url(region: &str, arn: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(arn.as_bytes()).collect();
    format!(
        "https://bedrock-agentcore.{}.amazonaws.com/runtimes/{}/invocations?qualifier=DEFAULT",
        region, encoded
    )
}

fn descriptor_key(agent_name: &str) -> String {
    format!("{}/{}", agent_name, DESCRIPTOR_FILE)
}

fn agentcore_section<'a>(doc: &'a mut Yaml, agent_name: &str) -> Option<&'a mut Yaml> {
    doc.get_mut("agents")?
        .get_mut(agent_name)?
        .get_mut("bedrock_agentcore")
}

/// Identifiers stored in a descriptor
pub fn read_identifiers(descriptor: &str, agent_name: &str) -> RuntimeIds {
    let Ok(mut doc) = serde_yaml::from_str::<Yaml>(descriptor) else {
        return RuntimeIds::default();
    };
    let Some(section) = agentcore_section(&mut doc, agent_name) else {
        return RuntimeIds::default();
    };
    let field = |name: &str| {
        section
            .get(name)
            .and_then(Yaml::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    RuntimeIds {
        agent_arn: field("agent_arn"),
        agent_id: field("agent_id"),
    }
}

/// AWS account the descriptor was rendered for
pub fn descriptor_account(descriptor: &str, agent_name: &str) -> String {
    serde_yaml::from_str::<Yaml>(descriptor)
        .ok()
        .and_then(|doc| {
            doc.get("agents")?
                .get(agent_name)?
                .get("aws")?
                .get("account")?
                .as_str()
                .map(str::to_string)
        })
        .unwrap_or_default()
}

/// Write identifiers into a descriptor, leaving unknown ones untouched
pub fn write_identifiers(
    descriptor: &str,
    agent_name: &str,
    ids: &RuntimeIds,
) -> Result<String, BackendError> {
    let mut doc: Yaml = serde_yaml::from_str(descriptor)?;
    let section = agentcore_section(&mut doc, agent_name).ok_or_else(|| {
        BackendError::TemplateError(format!("descriptor has no entry for agent {}", agent_name))
    })?;
    if let Some(arn) = &ids.agent_arn {
        section["agent_arn"] = Yaml::String(arn.clone());
    }
    if let Some(id) = &ids.agent_id {
        section["agent_id"] = Yaml::String(id.clone());
    }
    Ok(serde_yaml::to_string(&doc)?)
}

/// Reset both identifiers so the next launch creates a fresh runtime
pub fn clear_identifiers(descriptor: &str, agent_name: &str) -> Result<String, BackendError> {
    let mut doc: Yaml = serde_yaml::from_str(descriptor)?;
    if let Some(section) = agentcore_section(&mut doc, agent_name) {
        section["agent_arn"] = Yaml::Null;
        section["agent_id"] = Yaml::Null;
    }
    Ok(serde_yaml::to_string(&doc)?)
}

/// Recover an ARN from launch output, most specific pattern first
pub fn scrape_runtime_arn(output: &str, region: &str, account_id: &str) -> Option<String> {
    if let Some(c) = LABELED_ARN.captures(output) {
        debug!("ARN matched labeled pattern");
        return Some(c[1].to_string());
    }
    if let Some(m) = RUNTIME_ARN.find(output) {
        warn!("ARN matched bare pattern in launch output");
        return Some(m.as_str().to_string());
    }
    if let Some(c) = LABELED_ID.captures(output) {
        warn!("Only a runtime id found in launch output, constructing the ARN");
        return Some(format!(
            "arn:aws:bedrock-agentcore:{}:{}:runtime/{}",
            region, account_id, &c[1]
        ));
    }
    None
}

#[derive(Serialize)]
struct DescriptorParams<'a> {
    agent_name: &'a str,
    execution_role: Option<&'a str>,
    account_id: &'a str,
    region: &'a str,
}

pub struct AgentCoreTarget {
    aws: AwsCli,
    store: ArtifactStore,
}

impl AgentCoreTarget {
    pub fn new(aws: AwsCli, store: ArtifactStore) -> Self {
        Self { aws, store }
    }

    /// Identifiers from the stored descriptor of `agent_name`
    pub async fn stored_identifiers(&self, agent_name: &str) -> RuntimeIds {
        match self.store.load("agentcore", &descriptor_key(agent_name)).await {
            Ok(descriptor) => read_identifiers(&descriptor, agent_name),
            Err(_) => RuntimeIds::default(),
        }
    }

    async fn stored_descriptor(&self, agent_name: &str) -> Option<String> {
        self.store
            .load("agentcore", &descriptor_key(agent_name))
            .await
            .ok()
    }

    async fn runtime_id(&self, resource: &ResourceRef) -> Option<String> {
        if let Some(id) = resource.arn.as_deref().and_then(runtime_id_from_arn) {
            return Some(id.to_string());
        }
        let ids = self.stored_identifiers(&resource.name).await;
        ids.agent_id.or_else(|| {
            ids.agent_arn
                .as_deref()
                .and_then(runtime_id_from_arn)
                .map(str::to_string)
        })
    }

    /// Drop the stored identifiers once `runtime_id` is gone
    async fn forget_runtime(&self, agent_name: &str, runtime_id: &str) -> Result<(), BackendError> {
        let Some(descriptor) = self.stored_descriptor(agent_name).await else {
            return Ok(());
        };
        let ids = read_identifiers(&descriptor, agent_name);
        let stored_id = ids
            .agent_id
            .or_else(|| ids.agent_arn.as_deref().and_then(runtime_id_from_arn).map(str::to_string));
        if stored_id.as_deref() != Some(runtime_id) {
            return Ok(());
        }
        let cleared = clear_identifiers(&descriptor, agent_name)?;
        self.store
            .save("agentcore", &descriptor_key(agent_name), &cleared)
            .await?;
        info!("Cleared stored runtime {} for {}", runtime_id, agent_name);
        Ok(())
    }
}

#[async_trait]
impl DeploymentTarget for AgentCoreTarget {
    type Config = AgentCoreConfig;

    fn target_type(&self) -> TargetType {
        TargetType::AgentCore
    }

    fn validate(&self, config: &mut AgentCoreConfig) -> Vec<FieldError> {
        config.validate()
    }

    async fn preflight(&self, _config: &AgentCoreConfig, _code: &str) -> Result<(), BackendError> {
        ensure_tools(
            self.aws.runner().as_ref(),
            &[("aws", &["--version"]), ("agentcore", &["--help"])],
        )
        .await
    }

    async fn prepare_package(
        &self,
        code: &str,
        config: &AgentCoreConfig,
        ctx: &DeploymentContext,
    ) -> Result<PreparedPackage, BackendError> {
        let analysis = analyze(code);
        let streaming = analysis.streaming;
        let adapted = adapt(code, CodeShape::for_streaming(streaming));
        ctx.log(format!(
            "Preparing AgentCore bundle for {} ({})",
            config.agent_name,
            if streaming { "streaming" } else { "sync" }
        ));

        let account_id = self.aws.account_id(&config.region).await?;
        let mut prepared = PreparedPackage::new("strands-agentcore", streaming)?;
        prepared
            .write_image_file("agent_app.py", &render_handler(package::AGENTCORE_APP, &adapted, streaming))
            .await?;
        prepared
            .write_image_file("requirements.txt", &requirements(&analysis, &["bedrock-agentcore"]))
            .await?;
        let dockerfile = render_params(
            package::AGENTCORE_DOCKERFILE,
            &serde_json::json!({
                "python_version": DEFAULT_PYTHON_VERSION,
                "region": config.region,
            }),
        )?;
        prepared.write_image_file("Dockerfile", &dockerfile).await?;

        let mut descriptor = render_params(
            package::AGENTCORE_DESCRIPTOR,
            &DescriptorParams {
                agent_name: &config.agent_name,
                execution_role: config.execution_role.as_deref(),
                account_id: &account_id,
                region: &config.region,
            },
        )?;
        // Carry identifiers from an earlier launch so this one updates in place
        if let Some(previous) = self.stored_descriptor(&config.agent_name).await {
            let ids = read_identifiers(&previous, &config.agent_name);
            if ids.agent_arn.is_some() {
                ctx.log(format!("Updating existing runtime {}", ids.agent_arn.as_deref().unwrap_or_default()));
                descriptor = write_identifiers(&descriptor, &config.agent_name, &ids)?;
            }
        }
        prepared.write(DESCRIPTOR_FILE, &descriptor).await?;
        Ok(prepared)
    }

    async fn provision(
        &self,
        prepared: &PreparedPackage,
        config: &AgentCoreConfig,
        ctx: &DeploymentContext,
    ) -> Result<ProvisionResult, BackendError> {
        let descriptor_path = prepared.path(DESCRIPTOR_FILE);
        let before = tokio::fs::read_to_string(&descriptor_path).await?;
        let previous = read_identifiers(&before, &config.agent_name);

        let mut launch = self
            .aws
            .tool("agentcore", ["launch"])
            .cwd(prepared.bundle.path())
            .env("AWS_REGION", config.region.as_str())
            .env("AWS_DEFAULT_REGION", config.region.as_str())
            .timeout(ctx.settings.deploy_command_timeout);
        for (key, value) in runtime_environment(&config.environment, &config.api_keys) {
            launch = launch.arg("--env").arg(format!("{}={}", key, value));
        }
        for secret in config.api_keys.values() {
            launch = launch.secret(secret.expose());
        }

        ctx.log(format!("Launching AgentCore runtime {}", config.agent_name));
        let output = self.aws.runner().run(&launch).await?;
        let combined = output.combined();
        if !output.success() {
            let detail = output_tail(&combined, 20).join("\n");
            return Err(match CloudError::classify(&combined) {
                CloudError::Conflict(_) => BackendError::ProvisioningError(format!(
                    "agentcore launch for {} conflicts with an operation in progress: {}",
                    config.agent_name, detail
                )),
                _ => BackendError::ProvisioningError(format!(
                    "agentcore launch for {} failed: {}",
                    config.agent_name, detail
                )),
            });
        }

        // The CLI records what it created in the descriptor; output is the fallback
        let after = tokio::fs::read_to_string(&descriptor_path).await?;
        let mut ids = read_identifiers(&after, &config.agent_name);
        if ids.agent_arn.is_some() && ids.agent_arn != previous.agent_arn {
            ctx.log("Read runtime ARN from the descriptor");
        } else if let Some(arn) = scrape_runtime_arn(
            &combined,
            &config.region,
            &descriptor_account(&after, &config.agent_name),
        ) {
            ctx.log("Recovered runtime ARN from launch output");
            ids.agent_arn = Some(arn);
        } else if ids.agent_arn.is_none() {
            return Err(BackendError::ProvisioningError(format!(
                "agentcore launch for {} reported no runtime ARN",
                config.agent_name
            )));
        }
        if ids.agent_id.is_none() {
            ids.agent_id = ids
                .agent_arn
                .as_deref()
                .and_then(runtime_id_from_arn)
                .map(str::to_string);
        }

        let updated = write_identifiers(&after, &config.agent_name, &ids)?;
        tokio::fs::write(&descriptor_path, &updated).await?;
        self.store
            .save("agentcore", &descriptor_key(&config.agent_name), &updated)
            .await?;
        ctx.artifacts.save_file(DESCRIPTOR_FILE, &updated).await?;

        let arn = ids.agent_arn.clone();
        ctx.update(|s| s.agent_runtime_arn = arn.clone());
        Ok(ProvisionResult {
            resource: ResourceRef {
                target: TargetType::AgentCore,
                name: config.agent_name.clone(),
                region: config.region.clone(),
                arn,
            },
            change: if previous.agent_arn.is_some() {
                StackChange::Updated
            } else {
                StackChange::Created
            },
            streaming: prepared.streaming,
            tool_output: combined,
        })
    }

    async fn await_completion(
        &self,
        provisioned: &ProvisionResult,
        _config: &AgentCoreConfig,
        ctx: &DeploymentContext,
    ) -> Result<Completion, BackendError> {
        let runtime_id = self.runtime_id(&provisioned.resource).await.ok_or_else(|| {
            BackendError::ProvisioningError("no runtime id to poll".to_string())
        })?;
        let region = provisioned.resource.region.as_str();
        let resource = format!("AgentCore runtime {}", runtime_id);
        let aws = &self.aws;
        let id = runtime_id.as_str();

        let status = poll_until(&resource, ctx.wait_options(), || async move {
            let value = aws
                .call(CONTROL_SERVICE, "get-agent-runtime", &["--agent-runtime-id", id], region)
                .await?;
            let status = value["status"].as_str().unwrap_or("UNKNOWN").to_string();
            Ok(if status == "READY" {
                PollStatus::Done(value)
            } else if status.ends_with("_FAILED") {
                let reason = value["failureReason"]
                    .as_str()
                    .or_else(|| value["statusReason"].as_str())
                    .unwrap_or("no reason given");
                PollStatus::Failed(format!("runtime {} is {}: {}", id, status, reason))
            } else {
                PollStatus::Pending(status)
            })
        })
        .await?;
        ctx.log(format!("AgentCore runtime {} is READY", runtime_id));

        let mut completion = Completion::default();
        completion
            .outputs
            .insert("agent_runtime_id".to_string(), runtime_id.clone());
        if let Some(arn) = status["agentRuntimeArn"].as_str() {
            completion
                .outputs
                .insert("agent_runtime_arn".to_string(), arn.to_string());
        }
        Ok(completion)
    }

    async fn extract_outputs(
        &self,
        provisioned: &ProvisionResult,
        completion: &Completion,
        config: &AgentCoreConfig,
        ctx: &DeploymentContext,
    ) -> Result<DeploymentOutputs, BackendError> {
        let arn = completion
            .outputs
            .get("agent_runtime_arn")
            .cloned()
            .or_else(|| provisioned.resource.arn.clone())
            .ok_or_else(|| {
                BackendError::ProvisioningError(format!("no runtime ARN for {}", config.agent_name))
            })?;
        let endpoint = invocation_url(&config.region, &arn);
        ctx.log(format!("Invocation endpoint {}", endpoint));

        let mut values = completion.outputs.clone();
        values.insert("agent_runtime_arn".to_string(), arn.clone());
        Ok(DeploymentOutputs {
            endpoint_url: Some(endpoint),
            agent_runtime_arn: Some(arn),
            values,
            ..Default::default()
        })
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<DeleteOutcome, BackendError> {
        let Some(runtime_id) = self.runtime_id(resource).await else {
            info!("No runtime recorded for {}, nothing to delete", resource.name);
            return Ok(DeleteOutcome::AlreadyGone);
        };
        let outcome = match self
            .aws
            .call(
                CONTROL_SERVICE,
                "delete-agent-runtime",
                &["--agent-runtime-id", runtime_id.as_str()],
                &resource.region,
            )
            .await
        {
            Ok(_) => DeleteOutcome::Deleted,
            Err(CloudError::NotFound(_)) => DeleteOutcome::AlreadyGone,
            Err(CloudError::Conflict(_)) => DeleteOutcome::InProgress,
            Err(e) => return Err(e.into()),
        };
        self.forget_runtime(&resource.name, &runtime_id).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = "default_agent: My_Agent\nagents:\n  My_Agent:\n    name: My_Agent\n    bedrock_agentcore:\n      agent_id: null\n      agent_arn: null\n";

    const ARN: &str = "arn:aws:bedrock-agentcore:us-west-2:123456789012:runtime/My_Agent-AbC123xyz";

    #[test]
    fn test_identifiers_round_trip_through_descriptor() {
        assert_eq!(read_identifiers(DESCRIPTOR, "My_Agent"), RuntimeIds::default());
        let ids = RuntimeIds {
            agent_arn: Some(ARN.to_string()),
            agent_id: Some("My_Agent-AbC123xyz".to_string()),
        };
        let updated = write_identifiers(DESCRIPTOR, "My_Agent", &ids).unwrap();
        assert_eq!(read_identifiers(&updated, "My_Agent"), ids);
        assert!(updated.contains("default_agent: My_Agent"));

        let cleared = clear_identifiers(&updated, "My_Agent").unwrap();
        assert_eq!(read_identifiers(&cleared, "My_Agent"), RuntimeIds::default());
        assert!(cleared.contains("default_agent: My_Agent"));
    }

    #[test]
    fn test_rendered_descriptor_is_valid_yaml() {
        let rendered = render_params(
            package::AGENTCORE_DESCRIPTOR,
            &DescriptorParams {
                agent_name: "My_Agent",
                execution_role: None,
                account_id: "123456789012",
                region: "us-west-2",
            },
        )
        .unwrap();
        assert_eq!(descriptor_account(&rendered, "My_Agent"), "123456789012");
        assert_eq!(read_identifiers(&rendered, "My_Agent"), RuntimeIds::default());
        assert!(rendered.contains("execution_role_auto_create: true"));
    }

    #[test]
    fn test_scrape_tiers() {
        let labeled = format!("Deploying...\nAgent ARN: {}\nDone", ARN);
        assert_eq!(scrape_runtime_arn(&labeled, "us-west-2", "1").as_deref(), Some(ARN));

        let bare = format!("created {} ok", ARN);
        assert_eq!(scrape_runtime_arn(&bare, "us-west-2", "1").as_deref(), Some(ARN));

        let id_only = "Agent ID: My_Agent-AbC123xyz";
        assert_eq!(
            scrape_runtime_arn(id_only, "us-west-2", "123456789012").as_deref(),
            Some(ARN)
        );
        assert_eq!(scrape_runtime_arn("nothing useful", "us-west-2", "1"), None);
    }

    #[test]
    fn test_invocation_url_encodes_arn() {
        let url = invocation_url("us-west-2", ARN);
        assert!(url.starts_with("https://bedrock-agentcore.us-west-2.amazonaws.com/runtimes/arn%3Aaws%3Abedrock-agentcore%3A"));
        assert!(url.contains("runtime%2FMy_Agent-AbC123xyz/invocations?qualifier=DEFAULT"));
        assert_eq!(runtime_id_from_arn(ARN), Some("My_Agent-AbC123xyz"));
    }
}
