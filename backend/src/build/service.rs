//! Container image build and push

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::build::progress::{classify_line, BuildPhase, BuildProgress, LineSignal, ProgressFn, ProgressStatus};
use crate::cache::build_logs::BuildLogStore;
use crate::deploy::config::Architecture;
use crate::errors::BackendError;
use crate::filesys::dir::Dir;
use crate::tooling::aws::{AwsCli, CloudError};
use crate::tooling::probe::{buildx_platforms, check_tooling_available, ToolingReport};
use crate::tooling::runner::{CommandRunner, CommandSpec, OutputLine};

/// Log lines attached to a build failure
pub const BUILD_ERROR_TAIL: usize = 50;

/// A file placed into the build context
#[derive(Debug, Clone)]
pub struct BuildFile {
    pub path: String,
    pub contents: String,
}

impl BuildFile {
    pub fn new(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub build_id: String,
    pub repository_uri: String,
    pub tag: String,
    pub files: Vec<BuildFile>,
    pub architecture: Architecture,
    /// Build through buildx for a foreign architecture
    pub cross_build: bool,
    pub region: String,
}

impl BuildRequest {
    pub fn image_uri(&self) -> String {
        format!("{}:{}", self.repository_uri, self.tag)
    }

    pub fn cache_ref(&self) -> String {
        format!(
            "{}:buildcache-{}",
            self.repository_uri,
            self.architecture.as_str()
        )
    }

    pub fn registry_host(&self) -> &str {
        self.repository_uri
            .split('/')
            .next()
            .unwrap_or(&self.repository_uri)
    }
}

/// Builds images with docker and pushes them to ECR
pub struct ContainerBuildService {
    aws: AwsCli,
    runner: Arc<dyn CommandRunner>,
    logs: Arc<BuildLogStore>,
    build_timeout: Duration,
}

impl ContainerBuildService {
    pub fn new(aws: AwsCli, logs: Arc<BuildLogStore>, build_timeout: Duration) -> Self {
        Self {
            runner: aws.runner(),
            aws,
            logs,
            build_timeout,
        }
    }

    pub fn logs(&self) -> Arc<BuildLogStore> {
        self.logs.clone()
    }

    /// Registry repository URI, creating the repository if needed
    pub async fn ensure_registry_repo(&self, name: &str, region: &str) -> Result<String, BackendError> {
        match self
            .aws
            .call("ecr", "describe-repositories", &["--repository-names", name], region)
            .await
        {
            Ok(value) => return repository_uri(&value["repositories"][0], name),
            Err(CloudError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        info!("Creating ECR repository {}", name);
        match self
            .aws
            .call(
                "ecr",
                "create-repository",
                &[
                    "--repository-name",
                    name,
                    "--image-scanning-configuration",
                    "scanOnPush=true",
                ],
                region,
            )
            .await
        {
            Ok(value) => repository_uri(&value["repository"], name),
            Err(CloudError::Conflict(_)) => {
                let value = self
                    .aws
                    .call("ecr", "describe-repositories", &["--repository-names", name], region)
                    .await?;
                repository_uri(&value["repositories"][0], name)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stage, build and push; returns the pushed image URI
    pub async fn build_and_push(
        &self,
        request: &BuildRequest,
        progress: ProgressFn,
    ) -> Result<String, BackendError> {
        let image = request.image_uri();
        progress(BuildProgress {
            phase: BuildPhase::Staging,
            status: ProgressStatus::Started,
            message: format!("Staging build context for {}", image),
        });

        let (_guard, context) = Dir::scratch("strands-build")?;
        for file in &request.files {
            context.file(&file.path).write_string(&file.contents).await?;
        }
        self.record(&request.build_id, format!("Staged {} files", request.files.len()));

        let context_path = context.path().display().to_string();
        let platform = request.architecture.docker_platform();

        if request.cross_build {
            self.registry_login(request, &progress).await?;
            let cache_ref = request.cache_ref();
            let cache_from = format!("type=registry,ref={}", cache_ref);
            let cache_to = format!("type=registry,ref={},mode=max", cache_ref);
            let spec = CommandSpec::new(
                "docker",
                [
                    "buildx",
                    "build",
                    "--platform",
                    platform,
                    "--provenance=false",
                    "--push",
                    "-t",
                    image.as_str(),
                    "--cache-from",
                    cache_from.as_str(),
                    "--cache-to",
                    cache_to.as_str(),
                    context_path.as_str(),
                ],
            )
            .timeout(self.build_timeout);
            self.run_monitored(&spec, request, BuildPhase::Building, &progress)
                .await?;
        } else {
            let spec = CommandSpec::new(
                "docker",
                [
                    "build",
                    "--platform",
                    platform,
                    "-t",
                    image.as_str(),
                    context_path.as_str(),
                ],
            )
            .timeout(self.build_timeout);
            self.run_monitored(&spec, request, BuildPhase::Building, &progress)
                .await?;

            self.registry_login(request, &progress).await?;

            let spec = CommandSpec::new("docker", ["push", image.as_str()]).timeout(self.build_timeout);
            self.run_monitored(&spec, request, BuildPhase::Pushing, &progress)
                .await?;
        }

        progress(BuildProgress {
            phase: BuildPhase::Complete,
            status: ProgressStatus::Completed,
            message: format!("Pushed {}", image),
        });
        info!("Image {} pushed", image);
        Ok(image)
    }

    async fn registry_login(
        &self,
        request: &BuildRequest,
        progress: &ProgressFn,
    ) -> Result<(), BackendError> {
        progress(BuildProgress {
            phase: BuildPhase::Login,
            status: ProgressStatus::Started,
            message: format!("Logging in to {}", request.registry_host()),
        });

        let token = self
            .aws
            .call::<&str>("ecr", "get-authorization-token", &[], &request.region)
            .await?;
        let encoded = token["authorizationData"][0]["authorizationToken"]
            .as_str()
            .ok_or_else(|| BackendError::ToolingError("ECR returned no authorization token".to_string()))?;
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| BackendError::ToolingError(format!("malformed ECR token: {}", e)))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| BackendError::ToolingError(format!("malformed ECR token: {}", e)))?;
        let password = decoded
            .split_once(':')
            .map(|(_, password)| password.to_string())
            .ok_or_else(|| BackendError::ToolingError("malformed ECR token".to_string()))?;

        let spec = CommandSpec::new(
            "docker",
            [
                "login",
                "--username",
                "AWS",
                "--password-stdin",
                request.registry_host(),
            ],
        )
        .stdin(password.clone())
        .secret(password);
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(BackendError::ToolingError(format!(
                "docker login to {} failed: {}",
                request.registry_host(),
                output.stderr
            )));
        }
        self.record(&request.build_id, format!("Logged in to {}", request.registry_host()));
        progress(BuildProgress {
            phase: BuildPhase::Login,
            status: ProgressStatus::Completed,
            message: "Registry login succeeded".to_string(),
        });
        Ok(())
    }

    /// Run a docker command, feeding its output through the log store and
    /// phase detection
    async fn run_monitored(
        &self,
        spec: &CommandSpec,
        request: &BuildRequest,
        start_phase: BuildPhase,
        progress: &ProgressFn,
    ) -> Result<(), BackendError> {
        debug!("Build {}: {}", request.build_id, spec.display());
        progress(BuildProgress {
            phase: start_phase,
            status: ProgressStatus::Started,
            message: spec.display(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
        let logs = self.logs.clone();
        let build_id = request.build_id.clone();
        let monitor_progress = progress.clone();
        let monitor = tokio::spawn(async move {
            let mut phase = start_phase;
            let mut errors = Vec::new();
            while let Some(line) = rx.recv().await {
                let text = line.text().to_string();
                logs.push(&build_id, text.clone());
                match classify_line(&text) {
                    LineSignal::Phase(next) if next != phase => {
                        phase = next;
                        monitor_progress(BuildProgress {
                            phase,
                            status: ProgressStatus::Running,
                            message: text,
                        });
                    }
                    LineSignal::Warning => warn!("Build {}: {}", build_id, text),
                    LineSignal::Error => errors.push(text),
                    _ => {}
                }
            }
            (phase, errors)
        });

        let result = self.runner.run_streaming(spec, tx).await;
        let (phase, errors) = monitor.await.unwrap_or((start_phase, Vec::new()));

        let failure = match result {
            Ok(output) if output.success() => None,
            Ok(output) => Some(
                errors
                    .last()
                    .cloned()
                    .unwrap_or_else(|| format!("docker exited with {:?}", output.exit_code)),
            ),
            Err(BackendError::Timeout { waited_secs, .. }) => {
                Some(format!("build timed out after {}s", waited_secs))
            }
            Err(e) => return Err(e),
        };

        match failure {
            None => {
                progress(BuildProgress {
                    phase,
                    status: ProgressStatus::Completed,
                    message: format!("{} finished", spec.args.first().cloned().unwrap_or_default()),
                });
                Ok(())
            }
            Some(message) => {
                error!("Build {} failed: {}", request.build_id, message);
                progress(BuildProgress {
                    phase,
                    status: ProgressStatus::Failed,
                    message: message.clone(),
                });
                Err(BackendError::BuildError {
                    message,
                    log_tail: self.logs.tail(&request.build_id, BUILD_ERROR_TAIL),
                })
            }
        }
    }

    fn record(&self, build_id: &str, line: String) {
        self.logs.push(build_id, line);
    }

    /// Whether buildx can produce images for `arch`
    pub async fn supports_cross_build(&self, arch: Architecture) -> bool {
        buildx_platforms(self.runner.as_ref())
            .await
            .iter()
            .any(|p| p == arch.docker_platform())
    }

    pub async fn check_tooling_available(&self, python_bin: &str) -> ToolingReport {
        check_tooling_available(self.runner.as_ref(), python_bin).await
    }
}

fn repository_uri(repository: &serde_json::Value, name: &str) -> Result<String, BackendError> {
    repository["repositoryUri"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| BackendError::ProvisioningError(format!("no URI for repository {}", name)))
}
