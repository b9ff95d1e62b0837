//! Deployment workflow manager
//!
//! Validates a request, creates its status record and runs the phases of the
//! matching target in a background task. Log lines reach the artifact set's
//! transcript as they are written; whatever happens, the record ends in a
//! terminal state and the artifact set gets its `result.json`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::build::service::ContainerBuildService;
use crate::cache::build_logs::BuildLogStore;
use crate::cache::status::DeploymentStatusStore;
use crate::deploy::agentcore::AgentCoreTarget;
use crate::deploy::config::DeploymentConfig;
use crate::deploy::ecs::EcsTarget;
use crate::deploy::fsm::{DeploymentEvent, FsmSettings};
use crate::deploy::lambda::LambdaTarget;
use crate::deploy::target::{DeploymentContext, DeploymentTarget, ResourceRef, Transcript};
use crate::errors::BackendError;
use crate::models::deployment::{DeploymentOutputs, DeploymentStatus, TargetType};
use crate::storage::artifacts::{ArtifactStore, DeploymentResult};
use crate::tooling::aws::AwsCli;
use crate::tooling::stack::DeleteOutcome;

/// A deployment to start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub config: DeploymentConfig,
    /// Generated agent source
    pub code: String,
}

/// A started workflow
#[derive(Debug)]
pub struct StartedDeployment {
    pub deployment_id: String,
    pub handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    /// A status record was removed
    pub record_deleted: bool,
    /// Outcome of tearing down cloud resources, when requested
    pub resources: Option<DeleteOutcome>,
}

#[derive(Clone)]
pub struct DeploymentManager {
    statuses: Arc<DeploymentStatusStore>,
    /// Build output, keyed by deployment id
    build_logs: Arc<BuildLogStore>,
    store: ArtifactStore,
    settings: FsmSettings,
    lambda: Arc<LambdaTarget>,
    agentcore: Arc<AgentCoreTarget>,
    ecs: Arc<EcsTarget>,
}

impl DeploymentManager {
    pub fn new(
        aws: AwsCli,
        builder: Arc<ContainerBuildService>,
        statuses: Arc<DeploymentStatusStore>,
        store: ArtifactStore,
        settings: FsmSettings,
    ) -> Self {
        Self {
            build_logs: builder.logs(),
            lambda: Arc::new(LambdaTarget::new(aws.clone())),
            agentcore: Arc::new(AgentCoreTarget::new(aws.clone(), store.clone())),
            ecs: Arc::new(EcsTarget::new(aws, builder)),
            statuses,
            store,
            settings,
        }
    }

    pub fn statuses(&self) -> Arc<DeploymentStatusStore> {
        self.statuses.clone()
    }

    /// Validate and start a deployment in the background.
    ///
    /// Validation errors are returned before any record exists.
    pub fn start(&self, request: DeploymentRequest) -> Result<StartedDeployment, BackendError> {
        let DeploymentRequest { mut config, code } = request;
        let errors = match &mut config {
            DeploymentConfig::Lambda(c) => self.lambda.validate(c),
            DeploymentConfig::AgentCore(c) => self.agentcore.validate(c),
            DeploymentConfig::Ecs(c) => self.ecs.validate(c),
        };
        if !errors.is_empty() {
            return Err(BackendError::ValidationError(errors));
        }
        if code.trim().is_empty() {
            return Err(BackendError::invalid("code", "must not be empty"));
        }

        let target = config.target();
        let deployment_id = self.statuses.create(target);
        let artifacts = match self.store.deployment_set(
            target,
            config.name(),
            config.version(),
            &deployment_id,
        ) {
            Ok(set) => set,
            Err(e) => {
                self.statuses.delete(&deployment_id);
                return Err(e);
            }
        };
        let resource_name = resource_name(&config);
        let region = config.region().to_string();
        self.statuses.update(&deployment_id, |s| {
            s.resource_name = Some(resource_name);
            s.region = Some(region);
            s.message = "Deployment queued".to_string();
        })?;

        let ctx = DeploymentContext {
            deployment_id: deployment_id.clone(),
            statuses: self.statuses.clone(),
            transcript: Transcript::spawn(artifacts.clone()),
            artifacts,
            store: self.store.clone(),
            settings: self.settings.clone(),
        };
        info!("Starting {} deployment {} of {}", target, deployment_id, config.name());

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let result = manager.execute(config, code, &ctx).await;
            manager.finalize(&ctx, result).await;
        });
        Ok(StartedDeployment {
            deployment_id,
            handle,
        })
    }

    async fn execute(
        &self,
        config: DeploymentConfig,
        code: String,
        ctx: &DeploymentContext,
    ) -> Result<DeploymentOutputs, BackendError> {
        ctx.transition(DeploymentEvent::Validate)?;
        ctx.artifacts.save_code(&code).await?;
        ctx.artifacts.save_config(&config).await?;
        match config {
            DeploymentConfig::Lambda(c) => run_phases(self.lambda.as_ref(), c, &code, ctx).await,
            DeploymentConfig::AgentCore(c) => {
                run_phases(self.agentcore.as_ref(), c, &code, ctx).await
            }
            DeploymentConfig::Ecs(c) => run_phases(self.ecs.as_ref(), c, &code, ctx).await,
        }
    }

    async fn finalize(&self, ctx: &DeploymentContext, result: Result<DeploymentOutputs, BackendError>) {
        let (success, outputs) = match result {
            Ok(outputs) => {
                let merged = outputs.clone();
                ctx.update(|s| {
                    s.merge_outputs(merged);
                    s.message = "Deployment completed".to_string();
                });
                if let Err(e) = ctx.transition(DeploymentEvent::Complete) {
                    error!("Deployment {}: {}", ctx.deployment_id, e);
                }
                (true, outputs)
            }
            Err(e) => {
                error!("Deployment {} failed: {}", ctx.deployment_id, e);
                if let BackendError::BuildError { log_tail, .. } = &e {
                    for line in log_tail {
                        ctx.log(format!("  | {}", line));
                    }
                }
                ctx.log(format!("Deployment failed: {}", e));
                if let Err(err) = ctx.transition(DeploymentEvent::Fail(e.to_string())) {
                    error!("Deployment {}: {}", ctx.deployment_id, err);
                }
                (false, DeploymentOutputs::default())
            }
        };

        ctx.transcript.flush().await;
        let Some(status) = self.statuses.get(&ctx.deployment_id) else {
            warn!("Deployment {} was deleted before it finished", ctx.deployment_id);
            return;
        };
        let record = DeploymentResult {
            deployment_id: status.deployment_id.clone(),
            target: status.target,
            success,
            message: status.message.clone(),
            streaming_capable: status.streaming_capable,
            outputs,
            completed_at: status.completed_at.unwrap_or_else(Utc::now),
            deployment_time: status.deployment_time,
        };
        if let Err(e) = ctx.artifacts.save_result(&record).await {
            warn!("Could not write result for {}: {}", ctx.deployment_id, e);
        }
    }

    pub fn get_status(&self, deployment_id: &str) -> Result<DeploymentStatus, BackendError> {
        self.statuses
            .get(deployment_id)
            .ok_or_else(|| BackendError::NotFound(format!("deployment {}", deployment_id)))
    }

    pub fn list_statuses(&self) -> BTreeMap<String, DeploymentStatus> {
        self.statuses.list()
    }

    /// Remove a record, optionally tearing down its cloud resources first
    pub async fn delete(
        &self,
        deployment_id: &str,
        with_resources: bool,
    ) -> Result<DeleteReport, BackendError> {
        let resources = if with_resources {
            let status = self.get_status(deployment_id)?;
            match ResourceRef::from_status(&status) {
                Some(resource) => Some(self.delete_resources(&resource).await?),
                None => Some(DeleteOutcome::AlreadyGone),
            }
        } else {
            None
        };
        self.build_logs.remove(deployment_id);
        Ok(DeleteReport {
            record_deleted: self.statuses.delete(deployment_id),
            resources,
        })
    }

    pub async fn delete_resources(&self, resource: &ResourceRef) -> Result<DeleteOutcome, BackendError> {
        match resource.target {
            TargetType::Lambda => self.lambda.delete(resource).await,
            TargetType::AgentCore => self.agentcore.delete(resource).await,
            TargetType::Ecs => self.ecs.delete(resource).await,
        }
    }

    /// Drop terminal records older than `max_age` along with their build logs
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let removed = self.statuses.remove_older_than(max_age);
        self.build_logs.remove_all(&removed);
        removed.len()
    }
}

/// Stack or agent name a deployment provisions
fn resource_name(config: &DeploymentConfig) -> String {
    match config {
        DeploymentConfig::Lambda(c) => c.resolved_stack_name(),
        DeploymentConfig::AgentCore(c) => c.agent_name.clone(),
        DeploymentConfig::Ecs(c) => c.stack_name(),
    }
}

/// Run the phases of one target in order
pub async fn run_phases<T: DeploymentTarget>(
    target: &T,
    config: T::Config,
    code: &str,
    ctx: &DeploymentContext,
) -> Result<DeploymentOutputs, BackendError> {
    target.preflight(&config, code).await?;

    ctx.transition(DeploymentEvent::Build)?;
    let prepared = target.prepare_package(code, &config, ctx).await?;
    let streaming = prepared.streaming;
    ctx.update(|s| s.streaming_capable = streaming);

    ctx.transition(DeploymentEvent::Provision)?;
    let provisioned = target.provision(&prepared, &config, ctx).await?;
    let name = provisioned.resource.name.clone();
    ctx.update(|s| s.resource_name = Some(name));

    ctx.transition(DeploymentEvent::AwaitCompletion)?;
    let completion = target.await_completion(&provisioned, &config, ctx).await?;
    let outputs = target
        .extract_outputs(&provisioned, &completion, &config, ctx)
        .await?;
    drop(prepared);
    Ok(outputs)
}
