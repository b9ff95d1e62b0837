//! Periodic removal of finished deployment records

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::cache::build_logs::BuildLogStore;
use crate::cache::status::DeploymentStatusStore;

/// Cleanup worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between sweeps
    pub interval: Duration,

    /// Terminal records older than this are removed, with their build logs
    pub max_age: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Run the cleanup worker
pub async fn run<S, F>(
    options: &Options,
    statuses: Arc<DeploymentStatusStore>,
    build_logs: Arc<BuildLogStore>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Cleanup worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Cleanup worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        let removed = statuses.remove_older_than(options.max_age);
        if !removed.is_empty() {
            let logs = build_logs.remove_all(&removed);
            info!(
                "Removed {} finished deployment records and {} build logs",
                removed.len(),
                logs
            );
        } else {
            debug!("No deployment records to clean up");
        }
    }
}
