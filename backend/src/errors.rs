//! Error types for the deployment backend

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// A single offending configuration field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Main error type for the backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Validation failed: {}", join_fields(.0))]
    ValidationError(Vec<FieldError>),

    #[error("Missing prerequisite: {0}")]
    ToolingError(String),

    #[error("Build failed: {message}")]
    BuildError {
        message: String,
        log_tail: Vec<String>,
    },

    #[error("Provisioning failed: {0}")]
    ProvisioningError(String),

    #[error("Timed out after {waited_secs}s waiting for {resource}; the resource may still complete later")]
    Timeout { resource: String, waited_secs: u64 },

    #[error("Invocation of {endpoint} failed with status {status}: {body}")]
    InvocationError {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackendError {
    /// Shorthand for a single-field validation failure
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError::ValidationError(vec![FieldError::new(field, message)])
    }

    /// Whether this error was raised before any external side effect
    pub fn is_pre_flight(&self) -> bool {
        matches!(
            self,
            BackendError::ValidationError(_) | BackendError::ToolingError(_)
        )
    }
}

impl From<anyhow::Error> for BackendError {
    fn from(err: anyhow::Error) -> Self {
        BackendError::Internal(err.to_string())
    }
}

impl From<handlebars::RenderError> for BackendError {
    fn from(err: handlebars::RenderError) -> Self {
        BackendError::TemplateError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_names_fields() {
        let err = BackendError::ValidationError(vec![
            FieldError::new("memory", "invalid for cpu 1024"),
            FieldError::new("region", "must not be empty"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("memory: invalid for cpu 1024"));
        assert!(msg.contains("region: must not be empty"));
        assert!(err.is_pre_flight());
    }

    #[test]
    fn test_timeout_message_mentions_later_completion() {
        let err = BackendError::Timeout {
            resource: "stack demo".to_string(),
            waited_secs: 1800,
        };
        assert!(err.to_string().contains("may still complete"));
        assert!(!err.is_pre_flight());
    }
}
