//! Settings file management

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::BackendError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Backend settings, read from `settings.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON formatted logs on stdout
    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub aws: AwsSettings,

    #[serde(default)]
    pub deploy: DeploySettings,

    #[serde(default)]
    pub execution: ExecutionSettings,

    #[serde(default)]
    pub status: StatusSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            server: ServerSettings::default(),
            aws: AwsSettings::default(),
            deploy: DeploySettings::default(),
            execution: ExecutionSettings::default(),
            status: StatusSettings::default(),
        }
    }
}

impl Settings {
    /// Load from file; a missing file yields defaults
    pub async fn load(file: &File) -> Result<Self, BackendError> {
        if !file.exists().await {
            info!("No settings file at {}, using defaults", file.path().display());
            return Ok(Self::default());
        }
        let settings: Settings = file.read_json().await?;
        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.deploy.poll_interval_secs == 0 {
            return Err(BackendError::ConfigError(
                "deploy.poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.deploy.poll_interval_secs > self.deploy.completion_timeout_secs {
            warn!(
                "deploy.poll_interval_secs ({}) exceeds completion_timeout_secs ({})",
                self.deploy.poll_interval_secs, self.deploy.completion_timeout_secs
            );
        }
        if self.deploy.build_log_capacity == 0 {
            return Err(BackendError::ConfigError(
                "deploy.build_log_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// AWS account settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsSettings {
    #[serde(default = "default_region")]
    pub default_region: String,

    /// Resolved through `sts get-caller-identity` when absent
    #[serde(default)]
    pub account_id: Option<String>,

    /// Named CLI profile passed through as AWS_PROFILE
    #[serde(default)]
    pub profile: Option<String>,
}

pub fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            default_region: default_region(),
            account_id: None,
            profile: None,
        }
    }
}

/// Deployment workflow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_completion_timeout")]
    pub completion_timeout_secs: u64,

    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Timeout for `sam deploy`, `agentcore launch` and similar long commands
    #[serde(default = "default_deploy_command_timeout")]
    pub deploy_command_timeout_secs: u64,

    /// Timeout for short commands (describes, version checks)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_build_log_capacity")]
    pub build_log_capacity: usize,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_completion_timeout() -> u64 {
    30 * 60
}

fn default_build_timeout() -> u64 {
    30 * 60
}

fn default_deploy_command_timeout() -> u64 {
    30 * 60
}

fn default_command_timeout() -> u64 {
    120
}

fn default_build_log_capacity() -> usize {
    1000
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            completion_timeout_secs: default_completion_timeout(),
            build_timeout_secs: default_build_timeout(),
            deploy_command_timeout_secs: default_deploy_command_timeout(),
            command_timeout_secs: default_command_timeout(),
            build_log_capacity: default_build_log_capacity(),
        }
    }
}

/// Local execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default = "default_python_bin")]
    pub python_bin: String,

    #[serde(default = "default_execution_timeout")]
    pub timeout_secs: u64,

    /// Consumer poll interval while waiting for output
    #[serde(default = "default_poll_millis")]
    pub poll_interval_millis: u64,
}

fn default_python_bin() -> String {
    "python3".to_string()
}

fn default_execution_timeout() -> u64 {
    300
}

fn default_poll_millis() -> u64 {
    100
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            python_bin: default_python_bin(),
            timeout_secs: default_execution_timeout(),
            poll_interval_millis: default_poll_millis(),
        }
    }
}

/// Status store retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSettings {
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_max_age() -> u64 {
    24 * 60 * 60
}

fn default_cleanup_interval() -> u64 {
    60 * 60
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"log_level":"debug","deploy":{"poll_interval_secs":5}}"#)
                .unwrap();
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.deploy.poll_interval_secs, 5);
        assert_eq!(settings.deploy.completion_timeout_secs, 1800);
        assert_eq!(settings.deploy.build_log_capacity, 1000);
        assert_eq!(settings.aws.default_region, "us-east-1");
        assert_eq!(settings.server.port, 8000);
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&File::new(dir.path().join("settings.json")))
            .await
            .unwrap();
        assert_eq!(settings.execution.python_bin, "python3");
    }

    #[tokio::test]
    async fn test_zero_poll_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join("settings.json"));
        file.write_string(r#"{"deploy":{"poll_interval_secs":0}}"#)
            .await
            .unwrap();
        assert!(matches!(
            Settings::load(&file).await,
            Err(BackendError::ConfigError(_))
        ));
    }
}
