//! Deployment target abstraction
//!
//! Each hosting platform implements [`DeploymentTarget`]; the manager drives
//! the phases in order and owns the status record.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::build::service::BuildFile;
use crate::cache::status::DeploymentStatusStore;
use crate::deploy::fsm::{DeploymentEvent, FsmSettings};
use crate::errors::{BackendError, FieldError};
use crate::filesys::dir::Dir;
use crate::models::deployment::{DeploymentOutputs, DeploymentStatus, TargetType};
use crate::storage::artifacts::{ArtifactSet, ArtifactStore};
use crate::tooling::poll::WaitOptions;
use crate::tooling::runner::{CommandRunner, CommandSpec};
use crate::tooling::stack::{DeleteOutcome, StackChange};

enum TranscriptEntry {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Appends log lines to the deployment's `deployment.log` as they happen.
///
/// A single writer task owns the file, so lines land in the order they were
/// logged.
#[derive(Clone)]
pub struct Transcript {
    tx: mpsc::UnboundedSender<TranscriptEntry>,
}

impl Transcript {
    pub fn spawn(artifacts: ArtifactSet) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                match entry {
                    TranscriptEntry::Line(line) => {
                        if let Err(e) = artifacts.append_log(&line).await {
                            warn!("Could not write deployment log: {}", e);
                        }
                    }
                    TranscriptEntry::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    pub fn append(&self, line: &str) {
        if self.tx.send(TranscriptEntry::Line(line.to_string())).is_err() {
            debug!("Transcript writer is gone, dropping line");
        }
    }

    /// Wait until every line appended so far is on disk
    pub async fn flush(&self) {
        let (done, written) = oneshot::channel();
        if self.tx.send(TranscriptEntry::Flush(done)).is_ok() {
            let _ = written.await;
        }
    }
}

/// Handles one workflow needs while it runs
#[derive(Clone)]
pub struct DeploymentContext {
    pub deployment_id: String,
    pub statuses: Arc<DeploymentStatusStore>,
    pub artifacts: ArtifactSet,
    pub transcript: Transcript,
    /// Whole store, for descriptors that outlive a single deployment
    pub store: ArtifactStore,
    pub settings: FsmSettings,
}

impl DeploymentContext {
    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions {
            poll_interval: self.settings.poll_interval,
            timeout: self.settings.completion_timeout,
        }
    }

    /// Append a line to the status log and the on-disk transcript
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        info!(deployment_id = %self.deployment_id, "{}", line);
        self.transcript.append(&line);
        if let Err(e) = self.statuses.update(&self.deployment_id, |s| s.log(line)) {
            debug!("Deployment {}: log line not recorded: {}", self.deployment_id, e);
        }
    }

    pub fn transition(&self, event: DeploymentEvent) -> Result<(), BackendError> {
        self.statuses
            .update(&self.deployment_id, |s| s.apply(event))?
            .map_err(BackendError::Internal)
    }

    pub fn update<F>(&self, mutator: F)
    where
        F: FnOnce(&mut DeploymentStatus),
    {
        if let Err(e) = self.statuses.update(&self.deployment_id, mutator) {
            debug!("Deployment {}: status update dropped: {}", self.deployment_id, e);
        }
    }
}

/// Working directory holding one deployment bundle; removed on drop
pub struct PreparedPackage {
    pub bundle: Dir,
    /// Code shape chosen for this deployment
    pub streaming: bool,
    /// Files that make up the container build context, if any
    pub image_files: Vec<BuildFile>,
    _scratch: TempDir,
}

impl PreparedPackage {
    pub fn new(prefix: &str, streaming: bool) -> Result<Self, BackendError> {
        let (scratch, bundle) = Dir::scratch(prefix)?;
        Ok(Self {
            bundle,
            streaming,
            image_files: Vec::new(),
            _scratch: scratch,
        })
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.bundle.path().join(relative)
    }

    pub async fn write(&self, relative: &str, contents: &str) -> Result<PathBuf, BackendError> {
        let file = self.bundle.file(relative);
        file.write_string(contents).await?;
        Ok(file.path().to_path_buf())
    }

    /// Write a file and add it to the image build context
    pub async fn write_image_file(
        &mut self,
        relative: &str,
        contents: &str,
    ) -> Result<PathBuf, BackendError> {
        let path = self.write(relative, contents).await?;
        self.image_files.push(BuildFile::new(relative, contents));
        Ok(path)
    }
}

/// Cloud resources behind a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRef {
    pub target: TargetType,
    /// Stack name, or the agent name for AgentCore
    pub name: String,
    pub region: String,
    pub arn: Option<String>,
}

impl ResourceRef {
    pub fn from_status(status: &DeploymentStatus) -> Option<Self> {
        Some(Self {
            target: status.target,
            name: status.resource_name.clone()?,
            region: status.region.clone()?,
            arn: status.agent_runtime_arn.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionResult {
    pub resource: ResourceRef,
    pub change: StackChange,
    pub streaming: bool,
    /// Combined output of the provisioning tool, kept for scraping
    pub tool_output: String,
}

/// Final state reported by the provisioning backend
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub outputs: BTreeMap<String, String>,
}

#[async_trait]
pub trait DeploymentTarget: Send + Sync {
    type Config: Serialize + Send + Sync;

    fn target_type(&self) -> TargetType;

    /// Structural checks; may normalize fields in place
    fn validate(&self, config: &mut Self::Config) -> Vec<FieldError>;

    /// Required external tools are present for this config and code
    async fn preflight(&self, config: &Self::Config, code: &str) -> Result<(), BackendError>;

    async fn prepare_package(
        &self,
        code: &str,
        config: &Self::Config,
        ctx: &DeploymentContext,
    ) -> Result<PreparedPackage, BackendError>;

    async fn provision(
        &self,
        package: &PreparedPackage,
        config: &Self::Config,
        ctx: &DeploymentContext,
    ) -> Result<ProvisionResult, BackendError>;

    async fn await_completion(
        &self,
        provisioned: &ProvisionResult,
        config: &Self::Config,
        ctx: &DeploymentContext,
    ) -> Result<Completion, BackendError>;

    async fn extract_outputs(
        &self,
        provisioned: &ProvisionResult,
        completion: &Completion,
        config: &Self::Config,
        ctx: &DeploymentContext,
    ) -> Result<DeploymentOutputs, BackendError>;

    /// Tear down; missing resources and running deletions are success
    async fn delete(&self, resource: &ResourceRef) -> Result<DeleteOutcome, BackendError>;
}

/// Check that each `(program, args)` probe exits successfully
pub async fn ensure_tools(
    runner: &dyn CommandRunner,
    probes: &[(&str, &[&str])],
) -> Result<(), BackendError> {
    for (program, args) in probes {
        let spec = CommandSpec::new(program, args.iter().copied())
            .timeout(crate::tooling::probe::VERSION_CHECK_TIMEOUT);
        let available = match runner.run(&spec).await {
            Ok(output) => output.success(),
            Err(_) => false,
        };
        if !available {
            return Err(BackendError::ToolingError(format!(
                "`{}` is not installed or not working",
                program
            )));
        }
    }
    Ok(())
}

/// Last `n` lines of tool output
pub fn output_tail(output: &str, n: usize) -> Vec<String> {
    let lines: Vec<String> = output.lines().map(str::to_string).collect();
    crate::utils::tail(&lines, n)
}
