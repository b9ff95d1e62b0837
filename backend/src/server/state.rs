//! Server state

use std::sync::Arc;
use std::time::Duration;

use crate::build::service::ContainerBuildService;
use crate::deploy::manager::DeploymentManager;
use crate::exec::LocalExecutor;
use crate::invoke::Invoker;

/// Server state shared across handlers
pub struct ServerState {
    pub manager: Arc<DeploymentManager>,
    pub invoker: Arc<Invoker>,
    pub executor: Arc<LocalExecutor>,
    pub builder: Arc<ContainerBuildService>,
    pub python_bin: String,
    /// Region for invocations that name none
    pub default_region: String,
    /// Retention used when a cleanup request names none
    pub status_max_age: Duration,
}
