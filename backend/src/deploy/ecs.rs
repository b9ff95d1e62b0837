//! ECS Fargate behind an application load balancer
//!
//! The image is built by [`ContainerBuildService`] and the whole service is a
//! single CloudFormation stack.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::build::progress::{BuildProgress, ProgressFn, ProgressStatus};
use crate::build::service::{BuildRequest, ContainerBuildService};
use crate::code::template::render_params;
use crate::code::{adapt, analyze, CodeShape};
use crate::deploy::config::EcsConfig;
use crate::deploy::package::{
    self, quoted_environment, render_handler, requirements, secret_param_values, secret_params,
    SecretParam, DEFAULT_PYTHON_VERSION,
};
use crate::deploy::target::{
    ensure_tools, Completion, DeploymentContext, DeploymentTarget, PreparedPackage,
    ProvisionResult, ResourceRef,
};
use crate::errors::{BackendError, FieldError};
use crate::models::deployment::{DeploymentOutputs, TargetType};
use crate::tooling::aws::AwsCli;
use crate::tooling::probe::{host_architecture, needs_cross_build};
use crate::tooling::stack::{DeleteOutcome, StackClient, StackTemplate};

pub const STACK_TEMPLATE_FILE: &str = "stack.yaml";

const STACK_CAPABILITIES: [&str; 1] = ["CAPABILITY_IAM"];

/// Minimum subnets an application load balancer accepts
const MIN_ALB_SUBNETS: usize = 2;

#[derive(Serialize)]
struct StackParams<'a> {
    service_name: &'a str,
    environment: BTreeMap<String, String>,
    secret_params: Vec<SecretParam>,
}

/// VPC and subnets the service runs in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub vpc_id: String,
    pub subnet_ids: Vec<String>,
}

pub struct EcsTarget {
    aws: AwsCli,
    stacks: StackClient,
    builder: Arc<ContainerBuildService>,
}

impl EcsTarget {
    pub fn new(aws: AwsCli, builder: Arc<ContainerBuildService>) -> Self {
        Self {
            stacks: StackClient::new(aws.clone()),
            aws,
            builder,
        }
    }

    /// Explicit network from the config, else the default VPC
    async fn resolve_network(&self, config: &EcsConfig) -> Result<Network, BackendError> {
        if let Some(vpc_id) = &config.vpc_id {
            return Ok(Network {
                vpc_id: vpc_id.clone(),
                subnet_ids: config.subnet_ids.clone(),
            });
        }

        let vpcs = self
            .aws
            .call(
                "ec2",
                "describe-vpcs",
                &["--filters", "Name=isDefault,Values=true"],
                &config.region,
            )
            .await?;
        let vpc_id = vpcs["Vpcs"][0]["VpcId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                BackendError::invalid(
                    "vpc_id",
                    format!("no default VPC in {}; set vpc_id and subnet_ids", config.region),
                )
            })?;

        let vpc_filter = format!("Name=vpc-id,Values={}", vpc_id);
        let subnets = self
            .aws
            .call(
                "ec2",
                "describe-subnets",
                &["--filters", vpc_filter.as_str(), "Name=default-for-az,Values=true"],
                &config.region,
            )
            .await?;
        let subnet_ids: Vec<String> = subnets["Subnets"]
            .as_array()
            .map(|subnets| {
                subnets
                    .iter()
                    .filter_map(|s| s["SubnetId"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if subnet_ids.len() < MIN_ALB_SUBNETS {
            return Err(BackendError::invalid(
                "subnet_ids",
                format!(
                    "default VPC {} has {} default subnets; a load balancer needs at least {}",
                    vpc_id,
                    subnet_ids.len(),
                    MIN_ALB_SUBNETS
                ),
            ));
        }
        Ok(Network { vpc_id, subnet_ids })
    }

    fn stack_parameters(
        config: &EcsConfig,
        image_uri: &str,
        network: &Network,
    ) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("ServiceName".to_string(), config.service_name.clone());
        params.insert("ImageUri".to_string(), image_uri.to_string());
        params.insert("Cpu".to_string(), config.cpu.to_string());
        params.insert("Memory".to_string(), config.memory.to_string());
        params.insert("DesiredCount".to_string(), config.desired_count.to_string());
        params.insert("ContainerPort".to_string(), config.container_port.to_string());
        params.insert(
            "CpuArchitecture".to_string(),
            config.architecture.ecs_cpu_architecture().to_string(),
        );
        params.insert("VpcId".to_string(), network.vpc_id.clone());
        // Commas inside a CLI parameter value must be escaped
        params.insert("SubnetIds".to_string(), network.subnet_ids.join("\\,"));
        params.insert(
            "AssignPublicIp".to_string(),
            if config.assign_public_ip { "ENABLED" } else { "DISABLED" }.to_string(),
        );
        params.insert("HealthCheckPath".to_string(), config.health_check_path.clone());
        params.extend(secret_param_values(&config.api_keys));
        params
    }
}

#[async_trait]
impl DeploymentTarget for EcsTarget {
    type Config = EcsConfig;

    fn target_type(&self) -> TargetType {
        TargetType::Ecs
    }

    fn validate(&self, config: &mut EcsConfig) -> Vec<FieldError> {
        config.validate()
    }

    async fn preflight(&self, _config: &EcsConfig, _code: &str) -> Result<(), BackendError> {
        ensure_tools(
            self.aws.runner().as_ref(),
            &[("aws", &["--version"]), ("docker", &["info"])],
        )
        .await
    }

    async fn prepare_package(
        &self,
        code: &str,
        config: &EcsConfig,
        ctx: &DeploymentContext,
    ) -> Result<PreparedPackage, BackendError> {
        let analysis = analyze(code);
        let streaming = analysis.streaming;
        let adapted = adapt(code, CodeShape::for_streaming(streaming));
        ctx.log(format!(
            "Preparing ECS bundle for {} ({})",
            config.service_name,
            if streaming { "streaming" } else { "sync" }
        ));

        let mut prepared = PreparedPackage::new("strands-ecs", streaming)?;
        prepared
            .write_image_file("server.py", &render_handler(package::ECS_SERVER, &adapted, streaming))
            .await?;
        prepared
            .write_image_file(
                "requirements.txt",
                &requirements(&analysis, &["fastapi", "uvicorn"]),
            )
            .await?;
        let dockerfile = render_params(
            package::ECS_DOCKERFILE,
            &serde_json::json!({
                "python_version": DEFAULT_PYTHON_VERSION,
                "container_port": config.container_port,
                "health_check_path": config.health_check_path,
            }),
        )?;
        prepared.write_image_file("Dockerfile", &dockerfile).await?;

        let template = render_params(
            package::ECS_STACK,
            &StackParams {
                service_name: &config.service_name,
                environment: quoted_environment(&config.environment),
                secret_params: secret_params(&config.api_keys),
            },
        )?;
        prepared.write(STACK_TEMPLATE_FILE, &template).await?;
        ctx.artifacts.save_file(STACK_TEMPLATE_FILE, &template).await?;
        Ok(prepared)
    }

    async fn provision(
        &self,
        prepared: &PreparedPackage,
        config: &EcsConfig,
        ctx: &DeploymentContext,
    ) -> Result<ProvisionResult, BackendError> {
        let repository_uri = self
            .builder
            .ensure_registry_repo(&config.repository_name(), &config.region)
            .await?;
        ctx.log(format!("Using registry repository {}", repository_uri));

        let cross_build = needs_cross_build(host_architecture(), config.architecture);
        if cross_build {
            if !self.builder.supports_cross_build(config.architecture).await {
                return Err(BackendError::ToolingError(format!(
                    "building for {} on this host needs docker buildx with a {} builder",
                    config.architecture.as_str(),
                    config.architecture.docker_platform()
                )));
            }
            ctx.log(format!(
                "Host architecture differs from {}, cross-building with buildx",
                config.architecture.as_str()
            ));
        }

        let short_id: String = ctx.deployment_id.chars().take(8).collect();
        let request = BuildRequest {
            build_id: ctx.deployment_id.clone(),
            repository_uri,
            tag: format!("{}-{}", config.version, short_id),
            files: prepared.image_files.clone(),
            architecture: config.architecture,
            cross_build,
            region: config.region.clone(),
        };
        let progress_ctx = ctx.clone();
        let progress: ProgressFn = Arc::new(move |update: BuildProgress| {
            if update.status != ProgressStatus::Running {
                progress_ctx.log(format!("[{:?}] {}", update.phase, update.message));
            }
        });
        let image_uri = self.builder.build_and_push(&request, progress).await?;

        let network = self.resolve_network(config).await?;
        ctx.log(format!(
            "Deploying into VPC {} ({} subnets)",
            network.vpc_id,
            network.subnet_ids.len()
        ));

        let stack_name = config.stack_name();
        let parameters = Self::stack_parameters(config, &image_uri, &network);
        let secrets: Vec<String> = config
            .api_keys
            .values()
            .map(|v| v.expose().to_string())
            .collect();
        let template_path = prepared.path(STACK_TEMPLATE_FILE);
        let template = StackTemplate {
            template_path: &template_path,
            parameters: &parameters,
            capabilities: &STACK_CAPABILITIES,
            secrets: &secrets,
        };
        let change = self
            .stacks
            .deploy(&stack_name, &config.region, &template, ctx.wait_options())
            .await?;
        ctx.log(format!("Stack {}: {:?}", stack_name, change));

        let mut values = BTreeMap::new();
        values.insert("image_uri".to_string(), image_uri);
        Ok(ProvisionResult {
            resource: ResourceRef {
                target: TargetType::Ecs,
                name: stack_name,
                region: config.region.clone(),
                arn: None,
            },
            change,
            streaming: prepared.streaming,
            tool_output: serde_json::to_string(&values)?,
        })
    }

    async fn await_completion(
        &self,
        provisioned: &ProvisionResult,
        _config: &EcsConfig,
        ctx: &DeploymentContext,
    ) -> Result<Completion, BackendError> {
        let stack = self
            .stacks
            .wait_for(
                &provisioned.resource.name,
                &provisioned.resource.region,
                provisioned.change,
                ctx.wait_options(),
            )
            .await?;
        ctx.log(format!("Stack {} is {}", stack.name, stack.status));
        Ok(Completion {
            outputs: stack.outputs,
        })
    }

    async fn extract_outputs(
        &self,
        provisioned: &ProvisionResult,
        completion: &Completion,
        config: &EcsConfig,
        ctx: &DeploymentContext,
    ) -> Result<DeploymentOutputs, BackendError> {
        let mut endpoint = completion.outputs.get("ServiceUrl").cloned();
        if endpoint.is_some() {
            ctx.log("Read service URL from stack outputs");
        } else {
            // The template names the load balancer `<stack>-alb`
            let alb_name = format!("{}-alb", provisioned.resource.name);
            warn!("Stack outputs lack ServiceUrl, looking up load balancer {}", alb_name);
            match self
                .aws
                .call(
                    "elbv2",
                    "describe-load-balancers",
                    &["--names", alb_name.as_str()],
                    &config.region,
                )
                .await
            {
                Ok(value) => {
                    endpoint = value["LoadBalancers"][0]["DNSName"]
                        .as_str()
                        .map(|dns| format!("http://{}", dns));
                    if endpoint.is_some() {
                        ctx.log("Resolved service URL from the load balancer");
                    }
                }
                Err(e) => warn!("Load balancer lookup failed: {}", e.message()),
            }
        }
        let endpoint = endpoint.ok_or_else(|| {
            BackendError::ProvisioningError(format!(
                "no service URL could be determined for {}",
                config.service_name
            ))
        })?;

        let mut values = completion.outputs.clone();
        if let Ok(extra) = serde_json::from_str::<BTreeMap<String, String>>(&provisioned.tool_output) {
            values.extend(extra);
        }
        values.insert("stack_name".to_string(), provisioned.resource.name.clone());
        values.insert("invoke_url".to_string(), format!("{}/invoke", endpoint));
        values.insert("stream_url".to_string(), format!("{}/invoke-stream", endpoint));
        info!("ECS service {} available at {}", config.service_name, endpoint);

        Ok(DeploymentOutputs {
            endpoint_url: Some(endpoint),
            service_arn: completion.outputs.get("ServiceArn").cloned(),
            values,
            ..Default::default()
        })
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<DeleteOutcome, BackendError> {
        let outcome = self.stacks.delete(&resource.name, &resource.region).await?;
        info!("Delete of stack {}: {:?}", resource.name, outcome);
        Ok(outcome)
    }
}
