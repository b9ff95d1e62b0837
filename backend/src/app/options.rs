//! Application configuration options

use std::time::Duration;

use crate::deploy::fsm::FsmSettings;
use crate::exec::ExecutorOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::cleanup;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Server configuration
    pub server: ServerOptions,

    /// AWS access
    pub aws: AwsOptions,

    /// FSM deployment settings
    pub fsm_settings: FsmSettings,

    /// Local execution
    pub executor: ExecutorOptions,

    /// Capacity of each build log ring buffer
    pub build_log_capacity: usize,

    /// Budget for one invocation, streaming included
    pub invoke_timeout: Duration,

    /// Status cleanup worker options
    pub cleanup_worker: cleanup::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(StorageLayout::default(), &Settings::default())
    }
}

impl AppOptions {
    pub fn from_settings(layout: StorageLayout, settings: &Settings) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            aws: AwsOptions {
                default_region: settings.aws.default_region.clone(),
                account_id: settings.aws.account_id.clone(),
                profile: settings.aws.profile.clone(),
            },
            fsm_settings: FsmSettings::from(&settings.deploy),
            executor: ExecutorOptions {
                python_bin: settings.execution.python_bin.clone(),
                timeout: Duration::from_secs(settings.execution.timeout_secs),
                poll_interval: Duration::from_millis(settings.execution.poll_interval_millis),
            },
            build_log_capacity: settings.deploy.build_log_capacity,
            invoke_timeout: Duration::from_secs(settings.execution.timeout_secs),
            cleanup_worker: cleanup::Options {
                interval: Duration::from_secs(settings.status.cleanup_interval_secs),
                max_age: Duration::from_secs(settings.status.max_age_secs),
            },
        }
    }
}

/// Lifecycle options for the backend
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AwsOptions {
    /// Region for invocations that name none
    pub default_region: String,
    pub account_id: Option<String>,
    /// Named CLI profile
    pub profile: Option<String>,
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_follow_settings() {
        let settings: Settings = serde_json::from_str(
            r#"{"server":{"port":9001},"execution":{"timeout_secs":42},"status":{"max_age_secs":60}}"#,
        )
        .unwrap();
        let options = AppOptions::from_settings(StorageLayout::new("/tmp/x"), &settings);
        assert_eq!(options.server.port, 9001);
        assert_eq!(options.executor.timeout, Duration::from_secs(42));
        assert_eq!(options.cleanup_worker.max_age, Duration::from_secs(60));
        assert_eq!(options.fsm_settings.poll_interval, Duration::from_secs(30));
    }
}
