//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::build::service::ContainerBuildService;
use crate::cache::build_logs::BuildLogStore;
use crate::cache::status::DeploymentStatusStore;
use crate::deploy::manager::DeploymentManager;
use crate::errors::BackendError;
use crate::exec::LocalExecutor;
use crate::invoke::credentials::CredentialSource;
use crate::invoke::Invoker;
use crate::server::state::ServerState;
use crate::storage::artifacts::ArtifactStore;
use crate::tooling::aws::AwsCli;
use crate::tooling::runner::CommandRunner;

/// Main application state
pub struct AppState {
    /// Deployment status records
    pub statuses: Arc<DeploymentStatusStore>,

    /// Artifact sets and AgentCore descriptors
    pub artifacts: ArtifactStore,

    /// Image builds
    pub builder: Arc<ContainerBuildService>,

    /// Deployment workflows
    pub manager: Arc<DeploymentManager>,

    /// Calls into deployed agents
    pub invoker: Arc<Invoker>,

    /// Local runs of generated code
    pub executor: Arc<LocalExecutor>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(
        options: &AppOptions,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, BackendError> {
        info!("Initializing application state...");

        options.layout.setup().await?;

        let aws = AwsCli::new(runner.clone(), options.fsm_settings.command_timeout)
            .with_profile(options.aws.profile.clone())
            .with_account_id(options.aws.account_id.clone());
        let statuses = Arc::new(DeploymentStatusStore::new());
        let artifacts = ArtifactStore::new(options.layout.deployments_dir());
        let builder = Arc::new(ContainerBuildService::new(
            aws.clone(),
            Arc::new(BuildLogStore::new(options.build_log_capacity)),
            options.fsm_settings.build_timeout,
        ));
        let manager = Arc::new(DeploymentManager::new(
            aws.clone(),
            builder.clone(),
            statuses.clone(),
            artifacts.clone(),
            options.fsm_settings.clone(),
        ));
        let invoker = Arc::new(Invoker::new(
            CredentialSource::new(aws),
            options.invoke_timeout,
        )?);
        let executor = Arc::new(LocalExecutor::new(runner, options.executor.clone()));

        Ok(Self {
            statuses,
            artifacts,
            builder,
            manager,
            invoker,
            executor,
        })
    }

    pub fn server_state(&self, options: &AppOptions) -> ServerState {
        ServerState {
            manager: self.manager.clone(),
            invoker: self.invoker.clone(),
            executor: self.executor.clone(),
            builder: self.builder.clone(),
            python_bin: options.executor.python_bin.clone(),
            default_region: options.aws.default_region.clone(),
            status_max_age: options.cleanup_worker.max_age,
        }
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), BackendError> {
        let active = self
            .statuses
            .list()
            .values()
            .filter(|s| !s.is_terminal())
            .count();
        if active > 0 {
            info!("Shutting down with {} deployments still running", active);
        } else {
            info!("Shutting down application state...");
        }
        Ok(())
    }
}
