//! Credentials for signed invocations

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::errors::BackendError;
use crate::invoke::sigv4::Credentials;
use crate::tooling::aws::AwsCli;

/// `aws configure export-credentials --format process` output
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExportedCredentials {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    session_token: Option<String>,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
}

impl From<ExportedCredentials> for Credentials {
    fn from(exported: ExportedCredentials) -> Self {
        let mut credentials = Credentials::new(exported.access_key_id, exported.secret_access_key);
        if let Some(token) = exported.session_token {
            credentials = credentials.with_session_token(token);
        }
        credentials.expires_at = exported.expiration;
        credentials
    }
}

/// Resolves credentials from the environment, then the CLI credential chain
pub struct CredentialSource {
    aws: Option<AwsCli>,
    cached: Mutex<Option<Credentials>>,
}

impl CredentialSource {
    pub fn new(aws: AwsCli) -> Self {
        Self {
            aws: Some(aws),
            cached: Mutex::new(None),
        }
    }

    /// Fixed credentials
    pub fn fixed(credentials: Credentials) -> Self {
        Self {
            aws: None,
            cached: Mutex::new(Some(credentials)),
        }
    }

    pub async fn resolve(&self, region: &str) -> Result<Credentials, BackendError> {
        if let Some(credentials) = self.cached() {
            return Ok(credentials);
        }
        if let Some(credentials) = from_env() {
            return Ok(credentials);
        }
        let Some(aws) = &self.aws else {
            return Err(BackendError::ToolingError("no AWS credentials available".to_string()));
        };

        debug!("Exporting credentials through the AWS CLI");
        let value = aws
            .call("configure", "export-credentials", &["--format", "process"], region)
            .await
            .map_err(|e| {
                BackendError::ToolingError(format!("could not resolve AWS credentials: {}", e.message()))
            })?;
        let exported: ExportedCredentials = serde_json::from_value(value)?;
        let credentials = Credentials::from(exported);
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some(credentials.clone());
        }
        Ok(credentials)
    }

    fn cached(&self) -> Option<Credentials> {
        let cached = self.cached.lock().ok()?;
        cached
            .as_ref()
            .filter(|c| !c.is_stale(Utc::now()))
            .cloned()
    }
}

fn from_env() -> Option<Credentials> {
    let key = std::env::var("AWS_ACCESS_KEY_ID").ok().filter(|v| !v.is_empty())?;
    let secret = std::env::var("AWS_SECRET_ACCESS_KEY").ok().filter(|v| !v.is_empty())?;
    let credentials = Credentials::new(key, secret);
    Some(match std::env::var("AWS_SESSION_TOKEN") {
        Ok(token) if !token.is_empty() => credentials.with_session_token(token),
        _ => credentials,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exported_credentials() {
        let exported: ExportedCredentials = serde_json::from_str(
            r#"{"Version":1,"AccessKeyId":"AKID","SecretAccessKey":"s","SessionToken":"t","Expiration":"2030-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let credentials = Credentials::from(exported);
        assert_eq!(credentials.access_key_id, "AKID");
        assert!(credentials.session_token.is_some());
        assert!(credentials.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_fixed_credentials() {
        let source = CredentialSource::fixed(Credentials::new("AKID", "secret"));
        let credentials = source.resolve("us-east-1").await.unwrap();
        assert_eq!(credentials.access_key_id, "AKID");
    }
}
