//! Bounded polling

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::errors::BackendError;

#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Outcome of one probe
#[derive(Debug)]
pub enum PollStatus<T> {
    /// Still working; carries the observed status for logs
    Pending(String),
    Done(T),
    Failed(String),
}

/// Probe until done, failed, or the wall-clock budget is spent.
///
/// Running out of budget yields [`BackendError::Timeout`], never a
/// provisioning failure.
pub async fn poll_until<T, F, Fut>(
    resource: &str,
    options: WaitOptions,
    mut probe: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, BackendError>>,
{
    let started = Instant::now();
    loop {
        match probe().await? {
            PollStatus::Done(value) => return Ok(value),
            PollStatus::Failed(reason) => return Err(BackendError::ProvisioningError(reason)),
            PollStatus::Pending(status) => {
                debug!("{} still {} after {:?}", resource, status, started.elapsed());
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= options.timeout {
            return Err(BackendError::Timeout {
                resource: resource.to_string(),
                waited_secs: elapsed.as_secs(),
            });
        }
        let remaining = options.timeout - elapsed;
        tokio::time::sleep(options.poll_interval.min(remaining)).await;
    }
}
