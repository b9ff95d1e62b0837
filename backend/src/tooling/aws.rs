//! AWS CLI boundary
//!
//! Every AWS call goes through `aws <service> <operation> ... --output json`.
//! Failures are classified once here from stderr so callers branch on
//! [`CloudError`] variants instead of matching messages.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::errors::BackendError;
use crate::tooling::runner::{CommandRunner, CommandSpec};

/// Classified failure of a cloud call
#[derive(Debug)]
pub enum CloudError {
    NotFound(String),
    /// Already exists, or an operation is already in progress
    Conflict(String),
    NoChanges(String),
    Other(String),
    /// The tool itself could not run
    Unavailable(BackendError),
}

impl CloudError {
    pub fn classify(stderr: &str) -> Self {
        let message = stderr.trim().to_string();
        let lower = message.to_lowercase();

        if lower.contains("no updates are to be performed") || lower.contains("no changes to deploy")
        {
            CloudError::NoChanges(message)
        } else if lower.contains("does not exist")
            || lower.contains("not found")
            || lower.contains("notfoundexception")
            || lower.contains("nosuchentity")
        {
            CloudError::NotFound(message)
        } else if lower.contains("already exists")
            || lower.contains("alreadyexists")
            || lower.contains("in progress")
            || lower.contains("_in_progress state")
            || lower.contains("conflictexception")
            || lower.contains("resourceinuse")
        {
            CloudError::Conflict(message)
        } else {
            CloudError::Other(message)
        }
    }

    pub fn message(&self) -> String {
        match self {
            CloudError::NotFound(m)
            | CloudError::Conflict(m)
            | CloudError::NoChanges(m)
            | CloudError::Other(m) => m.clone(),
            CloudError::Unavailable(e) => e.to_string(),
        }
    }
}

impl From<CloudError> for BackendError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::Unavailable(e) => e,
            CloudError::NotFound(m) => BackendError::NotFound(m),
            other => BackendError::ProvisioningError(other.message()),
        }
    }
}

/// Thin wrapper over the `aws` executable
#[derive(Clone)]
pub struct AwsCli {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    profile: Option<String>,
    account_id: Option<String>,
}

impl AwsCli {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            profile: None,
            account_id: None,
        }
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    /// Skip the identity lookup when the account is configured
    pub fn with_account_id(mut self, account_id: Option<String>) -> Self {
        self.account_id = account_id.filter(|a| !a.is_empty());
        self
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    /// Command for another AWS tool (`sam`, `agentcore`) using the same profile
    pub fn tool<I, S>(&self, program: &str, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::new(program, args).timeout(self.timeout);
        match &self.profile {
            Some(profile) => spec.env("AWS_PROFILE", profile),
            None => spec,
        }
    }

    /// Build the command for `aws <service> <operation> <args>`
    pub fn command<S: AsRef<str>>(
        &self,
        service: &str,
        operation: &str,
        args: &[S],
        region: &str,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new("aws", [service, operation])
            .timeout(self.timeout);
        for arg in args {
            spec = spec.arg(arg.as_ref());
        }
        spec = spec.arg("--region").arg(region).arg("--output").arg("json");
        if let Some(profile) = &self.profile {
            spec = spec.env("AWS_PROFILE", profile);
        }
        spec
    }

    /// Run a prepared command and parse its JSON output
    pub async fn run(&self, spec: &CommandSpec) -> Result<Value, CloudError> {
        let output = self
            .runner
            .run(spec)
            .await
            .map_err(CloudError::Unavailable)?;
        if !output.success() {
            let err = CloudError::classify(&output.combined());
            debug!("{} failed: {:?}", spec.display(), err);
            return Err(err);
        }
        if output.stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&output.stdout)
            .map_err(|e| CloudError::Other(format!("unparseable output from {}: {}", spec.program, e)))
    }

    pub async fn call<S: AsRef<str>>(
        &self,
        service: &str,
        operation: &str,
        args: &[S],
        region: &str,
    ) -> Result<Value, CloudError> {
        let spec = self.command(service, operation, args, region);
        self.run(&spec).await
    }

    /// Account id of the active credentials
    pub async fn account_id(&self, region: &str) -> Result<String, BackendError> {
        if let Some(account_id) = &self.account_id {
            return Ok(account_id.clone());
        }
        let identity = self
            .call::<&str>("sts", "get-caller-identity", &[], region)
            .await?;
        identity["Account"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BackendError::ToolingError("no AWS account in caller identity; check credentials".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(matches!(
            CloudError::classify("An error occurred (ValidationError) when calling the UpdateStack operation: No updates are to be performed."),
            CloudError::NoChanges(_)
        ));
        assert!(matches!(
            CloudError::classify("An error occurred (ValidationError) when calling the DescribeStacks operation: Stack with id demo does not exist"),
            CloudError::NotFound(_)
        ));
        assert!(matches!(
            CloudError::classify("An error occurred (RepositoryAlreadyExistsException): The repository with name 'x' already exists"),
            CloudError::Conflict(_)
        ));
        assert!(matches!(
            CloudError::classify("Stack:arn is in DELETE_IN_PROGRESS state and can not be updated."),
            CloudError::Conflict(_)
        ));
        assert!(matches!(
            CloudError::classify("AccessDenied"),
            CloudError::Other(_)
        ));
    }

    #[test]
    fn test_not_found_maps_to_backend_not_found() {
        let err: BackendError = CloudError::NotFound("gone".to_string()).into();
        assert!(matches!(err, BackendError::NotFound(_)));
    }
}
