//! AWS Lambda through SAM
//!
//! A buffered zip function is always deployed. Streaming-capable code also
//! gets a container function behind the Lambda Web Adapter with a
//! `RESPONSE_STREAM` Function URL.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::code::{adapt, analyze, detect_streaming, CodeShape};
use crate::code::template::render_params;
use crate::deploy::config::LambdaConfig;
use crate::deploy::package::{
    self, python_version, quoted_environment, render_handler, requirements, secret_param_values,
    secret_params, SecretParam,
};
use crate::deploy::target::{
    ensure_tools, output_tail, Completion, DeploymentContext, DeploymentTarget, PreparedPackage,
    ProvisionResult, ResourceRef,
};
use crate::errors::{BackendError, FieldError};
use crate::models::deployment::{DeploymentOutputs, TargetType};
use crate::tooling::aws::{AwsCli, CloudError};
use crate::tooling::stack::{DeleteOutcome, StackChange, StackClient};

const SAM_CAPABILITIES: [&str; 2] = ["CAPABILITY_IAM", "CAPABILITY_AUTO_EXPAND"];

static LABELED_OUTPUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Key\s+(SyncFunctionUrl|StreamFunctionUrl|FunctionArn|StreamFunctionArn)\s+(?:Description\s+[^\n]*\s+)?Value\s+(\S+)").unwrap()
});

static FUNCTION_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://[a-z0-9]+\.lambda-url\.[a-z0-9-]+\.on\.aws/?").unwrap());

#[derive(Serialize)]
struct SamParams<'a> {
    function_name: &'a str,
    stream_function_name: String,
    runtime: &'a str,
    architecture: &'a str,
    memory_size: u32,
    timeout: u32,
    streaming: bool,
    environment: BTreeMap<String, String>,
    secret_params: Vec<SecretParam>,
}

pub struct LambdaTarget {
    aws: AwsCli,
    stacks: StackClient,
}

impl LambdaTarget {
    pub fn new(aws: AwsCli) -> Self {
        Self {
            stacks: StackClient::new(aws.clone()),
            aws,
        }
    }

    /// `sam deploy` arguments; API keys travel as parameter overrides
    fn deploy_args(&self, config: &LambdaConfig) -> Vec<String> {
        let mut args: Vec<String> = [
            "deploy",
            "--stack-name",
            config.resolved_stack_name().as_str(),
            "--region",
            config.region.as_str(),
            "--capabilities",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(SAM_CAPABILITIES.iter().map(|s| s.to_string()));
        args.extend(
            [
                "--no-confirm-changeset",
                "--no-fail-on-empty-changeset",
                "--resolve-s3",
                "--resolve-image-repos",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        let overrides = secret_param_values(&config.api_keys);
        if !overrides.is_empty() {
            args.push("--parameter-overrides".to_string());
            for (param, value) in overrides {
                args.push(format!("{}={}", param, value));
            }
        }
        args
    }

    async fn function_url_config(
        &self,
        function_name: &str,
        region: &str,
    ) -> Option<(String, Option<String>)> {
        match self
            .aws
            .call(
                "lambda",
                "get-function-url-config",
                &["--function-name", function_name],
                region,
            )
            .await
        {
            Ok(value) => {
                let url = value["FunctionUrl"].as_str()?.to_string();
                let arn = value["FunctionArn"].as_str().map(str::to_string);
                Some((url, arn))
            }
            Err(e) => {
                warn!("get-function-url-config for {} failed: {}", function_name, e.message());
                None
            }
        }
    }
}

/// Outputs scraped from the `sam deploy` outputs table, falling back to bare URLs
fn scrape_outputs(tool_output: &str) -> BTreeMap<String, String> {
    let mut found: BTreeMap<String, String> = LABELED_OUTPUT
        .captures_iter(tool_output)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect();
    if !found.contains_key("SyncFunctionUrl") {
        if let Some(url) = FUNCTION_URL.find(tool_output) {
            found.insert("SyncFunctionUrl".to_string(), url.as_str().to_string());
        }
    }
    found
}

#[async_trait]
impl DeploymentTarget for LambdaTarget {
    type Config = LambdaConfig;

    fn target_type(&self) -> TargetType {
        TargetType::Lambda
    }

    fn validate(&self, config: &mut LambdaConfig) -> Vec<FieldError> {
        config.validate()
    }

    async fn preflight(&self, _config: &LambdaConfig, code: &str) -> Result<(), BackendError> {
        let runner = self.aws.runner();
        ensure_tools(
            runner.as_ref(),
            &[("aws", &["--version"]), ("sam", &["--version"])],
        )
        .await?;
        // The streaming function is an image build
        if detect_streaming(code) {
            ensure_tools(runner.as_ref(), &[("docker", &["info"])]).await?;
        }
        Ok(())
    }

    async fn prepare_package(
        &self,
        code: &str,
        config: &LambdaConfig,
        ctx: &DeploymentContext,
    ) -> Result<PreparedPackage, BackendError> {
        let analysis = analyze(code);
        let streaming = analysis.streaming;
        let adapted = adapt(code, CodeShape::for_streaming(streaming));
        ctx.log(format!(
            "Code is {}; deploying {}",
            if streaming { "streaming-capable" } else { "sync-only" },
            if streaming { "buffered and streaming functions" } else { "a buffered function" }
        ));

        let prepared = PreparedPackage::new("strands-lambda", streaming)?;
        prepared
            .write("sync/handler.py", &render_handler(package::LAMBDA_SYNC_HANDLER, &adapted, false))
            .await?;
        prepared
            .write("sync/requirements.txt", &requirements(&analysis, &[]))
            .await?;

        if streaming {
            prepared
                .write("stream/stream_app.py", &render_handler(package::LAMBDA_STREAM_APP, &adapted, true))
                .await?;
            prepared
                .write(
                    "stream/requirements.txt",
                    &requirements(&analysis, &["fastapi", "uvicorn"]),
                )
                .await?;
            let dockerfile = render_params(
                package::LAMBDA_STREAM_DOCKERFILE,
                &serde_json::json!({ "python_version": python_version(&config.runtime) }),
            )?;
            prepared.write("stream/Dockerfile", &dockerfile).await?;
        }

        let params = SamParams {
            function_name: &config.function_name,
            stream_function_name: config.stream_function_name(),
            runtime: &config.runtime,
            architecture: config.architecture.as_str(),
            memory_size: config.memory_size,
            timeout: config.timeout,
            streaming,
            environment: quoted_environment(&config.environment),
            secret_params: secret_params(&config.api_keys),
        };
        let template = render_params(package::SAM_TEMPLATE, &params)?;
        prepared.write("template.yaml", &template).await?;
        ctx.artifacts.save_file("template.yaml", &template).await?;
        Ok(prepared)
    }

    async fn provision(
        &self,
        prepared: &PreparedPackage,
        config: &LambdaConfig,
        ctx: &DeploymentContext,
    ) -> Result<ProvisionResult, BackendError> {
        let stack_name = config.resolved_stack_name();
        let existing = self
            .stacks
            .prepare_for_deploy(&stack_name, &config.region, ctx.wait_options())
            .await?;
        let runner = self.aws.runner();

        ctx.log("Running sam build");
        let build = self
            .aws
            .tool("sam", ["build", "--template-file", "template.yaml"])
            .cwd(prepared.bundle.path())
            .timeout(ctx.settings.build_timeout);
        let output = runner.run(&build).await?;
        if !output.success() {
            return Err(BackendError::BuildError {
                message: "sam build failed".to_string(),
                log_tail: output_tail(&output.combined(), crate::build::service::BUILD_ERROR_TAIL),
            });
        }

        ctx.log(format!("Running sam deploy for stack {}", stack_name));
        let deploy = config
            .api_keys
            .values()
            .fold(
                self.aws.tool("sam", self.deploy_args(config)),
                |spec, secret| spec.secret(secret.expose()),
            )
            .cwd(prepared.bundle.path())
            .timeout(ctx.settings.deploy_command_timeout);
        let output = runner.run(&deploy).await?;
        let combined = output.combined();

        let change = if output.success() {
            if combined.contains("No changes to deploy") {
                StackChange::NoChanges
            } else if existing.is_some() {
                StackChange::Updated
            } else {
                StackChange::Created
            }
        } else {
            match CloudError::classify(&combined) {
                CloudError::NoChanges(_) => StackChange::NoChanges,
                _ => {
                    return Err(BackendError::ProvisioningError(format!(
                        "sam deploy failed for stack {}: {}",
                        stack_name,
                        output_tail(&combined, 20).join("\n")
                    )))
                }
            }
        };
        if change == StackChange::NoChanges {
            ctx.log(format!("Stack {} is already up to date", stack_name));
        }

        Ok(ProvisionResult {
            resource: ResourceRef {
                target: TargetType::Lambda,
                name: stack_name,
                region: config.region.clone(),
                arn: None,
            },
            change,
            streaming: prepared.streaming,
            tool_output: combined,
        })
    }

    async fn await_completion(
        &self,
        provisioned: &ProvisionResult,
        _config: &LambdaConfig,
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
        config: &LambdaConfig,
        ctx: &DeploymentContext,
    ) -> Result<DeploymentOutputs, BackendError> {
        let mut found = completion.outputs.clone();
        if found.contains_key("SyncFunctionUrl") {
            ctx.log("Read function URLs from stack outputs");
        } else {
            warn!("Stack outputs lack SyncFunctionUrl, scraping sam output");
            let scraped = scrape_outputs(&provisioned.tool_output);
            if scraped.contains_key("SyncFunctionUrl") {
                ctx.log("Recovered function URLs from sam deploy output");
            }
            for (key, value) in scraped {
                found.entry(key).or_insert(value);
            }
        }

        if !found.contains_key("SyncFunctionUrl") {
            warn!("Falling back to get-function-url-config for {}", config.function_name);
            if let Some((url, arn)) = self
                .function_url_config(&config.function_name, &config.region)
                .await
            {
                ctx.log("Looked up function URL with get-function-url-config");
                found.insert("SyncFunctionUrl".to_string(), url);
                if let Some(arn) = arn {
                    found.entry("FunctionArn".to_string()).or_insert(arn);
                }
            }
        }
        if provisioned.streaming && !found.contains_key("StreamFunctionUrl") {
            if let Some((url, arn)) = self
                .function_url_config(&config.stream_function_name(), &config.region)
                .await
            {
                found.insert("StreamFunctionUrl".to_string(), url);
                if let Some(arn) = arn {
                    found.entry("StreamFunctionArn".to_string()).or_insert(arn);
                }
            }
        }

        let sync_url = found.get("SyncFunctionUrl").cloned().ok_or_else(|| {
            BackendError::ProvisioningError(format!(
                "no function URL could be determined for {}",
                config.function_name
            ))
        })?;

        let mut values = BTreeMap::new();
        values.insert("sync_function_url".to_string(), sync_url.clone());
        for (key, name) in [
            ("StreamFunctionUrl", "stream_function_url"),
            ("FunctionArn", "function_arn"),
            ("StreamFunctionArn", "stream_function_arn"),
        ] {
            if let Some(value) = found.get(key) {
                values.insert(name.to_string(), value.clone());
            }
        }
        values.insert("stack_name".to_string(), provisioned.resource.name.clone());
        info!("Lambda {} available at {}", config.function_name, sync_url);

        Ok(DeploymentOutputs {
            endpoint_url: Some(sync_url),
            function_arn: found.get("FunctionArn").cloned(),
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
