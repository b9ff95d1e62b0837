//! CloudFormation stacks through the AWS CLI

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::BackendError;
use crate::tooling::aws::{AwsCli, CloudError};
use crate::tooling::poll::{poll_until, PollStatus, WaitOptions};
use crate::tooling::runner::CommandSpec;

/// Coarse classification of a stack status string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackPhase {
    InProgress,
    Complete,
    Failed,
}

pub fn classify_stack_status(status: &str) -> StackPhase {
    if status.ends_with("_IN_PROGRESS") {
        StackPhase::InProgress
    } else if status.ends_with("_FAILED") || status.contains("ROLLBACK") {
        StackPhase::Failed
    } else if status.ends_with("_COMPLETE") {
        StackPhase::Complete
    } else {
        StackPhase::InProgress
    }
}

/// States from which an update is impossible and the stack must be recreated
fn needs_recreate(status: &str) -> bool {
    matches!(
        status,
        "ROLLBACK_COMPLETE" | "ROLLBACK_FAILED" | "CREATE_FAILED" | "DELETE_FAILED"
    )
}

/// Settled states that accept further updates
fn is_updatable(status: &str) -> bool {
    classify_stack_status(status) == StackPhase::Complete || status == "UPDATE_ROLLBACK_COMPLETE"
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDescription {
    pub name: String,
    pub stack_id: String,
    pub status: String,
    pub status_reason: Option<String>,
    pub outputs: BTreeMap<String, String>,
}

impl StackDescription {
    fn from_json(stack: &Value) -> Self {
        let outputs = stack["Outputs"]
            .as_array()
            .map(|outputs| {
                outputs
                    .iter()
                    .filter_map(|o| {
                        Some((
                            o["OutputKey"].as_str()?.to_string(),
                            o["OutputValue"].as_str()?.to_string(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            name: stack["StackName"].as_str().unwrap_or_default().to_string(),
            stack_id: stack["StackId"].as_str().unwrap_or_default().to_string(),
            status: stack["StackStatus"].as_str().unwrap_or_default().to_string(),
            status_reason: stack["StackStatusReason"].as_str().map(str::to_string),
            outputs,
        }
    }
}

/// What `deploy` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackChange {
    Created,
    Updated,
    NoChanges,
}

/// What `delete` found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
    InProgress,
}

/// Template and parameters for a stack
#[derive(Debug, Clone)]
pub struct StackTemplate<'a> {
    pub template_path: &'a Path,
    pub parameters: &'a BTreeMap<String, String>,
    pub capabilities: &'a [&'a str],
    /// Parameter values masked in command logs
    pub secrets: &'a [String],
}

#[derive(Clone)]
pub struct StackClient {
    aws: AwsCli,
}

impl StackClient {
    pub fn new(aws: AwsCli) -> Self {
        Self { aws }
    }

    /// Describe a stack; `None` when it does not exist
    pub async fn describe(
        &self,
        name: &str,
        region: &str,
    ) -> Result<Option<StackDescription>, BackendError> {
        match self
            .aws
            .call("cloudformation", "describe-stacks", &["--stack-name", name], region)
            .await
        {
            Ok(value) => Ok(value["Stacks"]
                .as_array()
                .and_then(|stacks| stacks.first())
                .map(StackDescription::from_json)),
            Err(CloudError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create or update. A stack stuck in a failed state is deleted and recreated.
    pub async fn deploy(
        &self,
        name: &str,
        region: &str,
        template: &StackTemplate<'_>,
        wait: WaitOptions,
    ) -> Result<StackChange, BackendError> {
        let existing = self.prepare_for_deploy(name, region, wait).await?;

        let mut args = vec![
            "--stack-name".to_string(),
            name.to_string(),
            "--template-body".to_string(),
            format!("file://{}", template.template_path.display()),
        ];
        if !template.parameters.is_empty() {
            args.push("--parameters".to_string());
            for (key, value) in template.parameters {
                args.push(format!("ParameterKey={},ParameterValue={}", key, value));
            }
        }
        if !template.capabilities.is_empty() {
            args.push("--capabilities".to_string());
            args.extend(template.capabilities.iter().map(|c| c.to_string()));
        }

        match existing {
            None => {
                info!("Creating stack {}", name);
                let spec = self.masked("create-stack", &args, region, template.secrets);
                match self.aws.run(&spec).await {
                    Ok(_) => Ok(StackChange::Created),
                    // Created concurrently by a retry; treat as an update
                    Err(CloudError::Conflict(_)) => {
                        self.update(name, region, &args, template.secrets).await
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Some(_) => self.update(name, region, &args, template.secrets).await,
        }
    }

    /// Bring an existing stack into a deployable state. Running operations
    /// are waited out and stacks stuck in a failed state are deleted; returns
    /// the stack that remains, if any.
    pub async fn prepare_for_deploy(
        &self,
        name: &str,
        region: &str,
        wait: WaitOptions,
    ) -> Result<Option<StackDescription>, BackendError> {
        let mut existing = self.describe(name, region).await?;
        if let Some(stack) = &existing {
            if classify_stack_status(&stack.status) == StackPhase::InProgress {
                info!("Stack {} is {}, waiting for it to settle", name, stack.status);
                existing = self.wait_settled(name, region, wait).await?;
            }
        }
        if let Some(stack) = &existing {
            if needs_recreate(&stack.status) {
                warn!(
                    "Stack {} is in {}, deleting before recreating",
                    name, stack.status
                );
                self.delete(name, region).await?;
                self.wait_deleted(name, region, wait).await?;
                existing = None;
            }
        }
        Ok(existing)
    }

    fn masked(
        &self,
        operation: &str,
        args: &[String],
        region: &str,
        secrets: &[String],
    ) -> CommandSpec {
        secrets.iter().fold(
            self.aws.command("cloudformation", operation, args, region),
            |spec, secret| spec.secret(secret.as_str()),
        )
    }

    async fn update(
        &self,
        name: &str,
        region: &str,
        args: &[String],
        secrets: &[String],
    ) -> Result<StackChange, BackendError> {
        info!("Updating stack {}", name);
        let spec = self.masked("update-stack", args, region, secrets);
        match self.aws.run(&spec).await {
            Ok(_) => Ok(StackChange::Updated),
            Err(CloudError::NoChanges(_)) => {
                info!("Stack {} is already up to date", name);
                Ok(StackChange::NoChanges)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Request deletion; missing stacks and running deletions count as success
    pub async fn delete(&self, name: &str, region: &str) -> Result<DeleteOutcome, BackendError> {
        let stack = match self.describe(name, region).await? {
            None => return Ok(DeleteOutcome::AlreadyGone),
            Some(stack) if stack.status == "DELETE_COMPLETE" => {
                return Ok(DeleteOutcome::AlreadyGone)
            }
            Some(stack) if stack.status == "DELETE_IN_PROGRESS" => {
                return Ok(DeleteOutcome::InProgress)
            }
            Some(stack) => stack,
        };

        match self
            .aws
            .call(
                "cloudformation",
                "delete-stack",
                &["--stack-name", stack.name.as_str()],
                region,
            )
            .await
        {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(CloudError::NotFound(_)) => Ok(DeleteOutcome::AlreadyGone),
            Err(CloudError::Conflict(_)) => Ok(DeleteOutcome::InProgress),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for a terminal state; failures carry every failed resource event
    pub async fn wait(
        &self,
        name: &str,
        region: &str,
        options: WaitOptions,
    ) -> Result<StackDescription, BackendError> {
        let resource = format!("stack {}", name);
        poll_until(&resource, options, || async move {
            let stack = self.describe(name, region).await?.ok_or_else(|| {
                BackendError::ProvisioningError(format!("stack {} no longer exists", name))
            })?;
            Ok(match classify_stack_status(&stack.status) {
                StackPhase::Complete => PollStatus::Done(stack),
                StackPhase::InProgress => PollStatus::Pending(stack.status),
                StackPhase::Failed => {
                    let events = self.failure_events(name, region).await.unwrap_or_else(|e| {
                        warn!("Could not read stack events for {}: {}", name, e);
                        Vec::new()
                    });
                    PollStatus::Failed(failure_message(&stack, &events))
                }
            })
        })
        .await
    }

    /// Wait according to what the deploy did. An unchanged stack only has to
    /// exist in a stable, updatable state; `UPDATE_ROLLBACK_COMPLETE` qualifies.
    pub async fn wait_for(
        &self,
        name: &str,
        region: &str,
        change: StackChange,
        options: WaitOptions,
    ) -> Result<StackDescription, BackendError> {
        if change != StackChange::NoChanges {
            return self.wait(name, region, options).await;
        }
        match self.wait_settled(name, region, options).await? {
            None => Err(BackendError::ProvisioningError(format!(
                "stack {} no longer exists",
                name
            ))),
            Some(stack) if is_updatable(&stack.status) => Ok(stack),
            Some(stack) => Err(BackendError::ProvisioningError(failure_message(&stack, &[]))),
        }
    }

    async fn wait_settled(
        &self,
        name: &str,
        region: &str,
        options: WaitOptions,
    ) -> Result<Option<StackDescription>, BackendError> {
        let resource = format!("stack {} to settle", name);
        poll_until(&resource, options, || async move {
            Ok(match self.describe(name, region).await? {
                None => PollStatus::Done(None),
                Some(stack) if classify_stack_status(&stack.status) == StackPhase::InProgress => {
                    PollStatus::Pending(stack.status)
                }
                Some(stack) => PollStatus::Done(Some(stack)),
            })
        })
        .await
    }

    pub async fn wait_deleted(
        &self,
        name: &str,
        region: &str,
        options: WaitOptions,
    ) -> Result<(), BackendError> {
        let resource = format!("deletion of stack {}", name);
        poll_until(&resource, options, || async move {
            Ok(match self.describe(name, region).await? {
                None => PollStatus::Done(()),
                Some(stack) if stack.status == "DELETE_COMPLETE" => PollStatus::Done(()),
                Some(stack) if stack.status == "DELETE_FAILED" => PollStatus::Failed(format!(
                    "stack {} could not be deleted: {}",
                    name,
                    stack.status_reason.unwrap_or_default()
                )),
                Some(stack) => PollStatus::Pending(stack.status),
            })
        })
        .await
    }

    /// All failed or cancelled resource events, oldest first
    pub async fn failure_events(
        &self,
        name: &str,
        region: &str,
    ) -> Result<Vec<String>, BackendError> {
        let value = self
            .aws
            .call(
                "cloudformation",
                "describe-stack-events",
                &["--stack-name", name],
                region,
            )
            .await?;
        let mut events: Vec<String> = value["StackEvents"]
            .as_array()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| {
                        let status = e["ResourceStatus"].as_str().unwrap_or_default();
                        status.ends_with("_FAILED")
                            || e["ResourceStatusReason"]
                                .as_str()
                                .map(|r| r.contains("cancelled"))
                                .unwrap_or(false)
                    })
                    .map(|e| {
                        format!(
                            "{} ({}): {} - {}",
                            e["LogicalResourceId"].as_str().unwrap_or("?"),
                            e["ResourceType"].as_str().unwrap_or("?"),
                            e["ResourceStatus"].as_str().unwrap_or("?"),
                            e["ResourceStatusReason"].as_str().unwrap_or("no reason given"),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        // describe-stack-events lists newest first
        events.reverse();
        Ok(events)
    }
}

fn failure_message(stack: &StackDescription, events: &[String]) -> String {
    let mut message = format!("stack {} ended in {}", stack.name, stack.status);
    if let Some(reason) = &stack.status_reason {
        message.push_str(&format!(" ({})", reason));
    }
    if !events.is_empty() {
        message.push_str("; failed resources: ");
        message.push_str(&events.join("; "));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_stack_status("CREATE_IN_PROGRESS"), StackPhase::InProgress);
        assert_eq!(classify_stack_status("UPDATE_COMPLETE_CLEANUP_IN_PROGRESS"), StackPhase::InProgress);
        assert_eq!(classify_stack_status("CREATE_COMPLETE"), StackPhase::Complete);
        assert_eq!(classify_stack_status("UPDATE_COMPLETE"), StackPhase::Complete);
        assert_eq!(classify_stack_status("ROLLBACK_COMPLETE"), StackPhase::Failed);
        assert_eq!(classify_stack_status("UPDATE_ROLLBACK_COMPLETE"), StackPhase::Failed);
        assert_eq!(classify_stack_status("CREATE_FAILED"), StackPhase::Failed);
        assert_eq!(classify_stack_status("ROLLBACK_IN_PROGRESS"), StackPhase::InProgress);
    }

    #[test]
    fn test_updatable_states() {
        assert!(is_updatable("UPDATE_COMPLETE"));
        assert!(is_updatable("UPDATE_ROLLBACK_COMPLETE"));
        assert!(!is_updatable("ROLLBACK_COMPLETE"));
        assert!(!is_updatable("UPDATE_ROLLBACK_FAILED"));
    }

    #[test]
    fn test_outputs_parsed() {
        let json = serde_json::json!({
            "StackName": "s",
            "StackId": "arn:aws:cloudformation:us-east-1:1:stack/s/1",
            "StackStatus": "CREATE_COMPLETE",
            "Outputs": [{"OutputKey": "ServiceUrl", "OutputValue": "http://alb"}]
        });
        let stack = StackDescription::from_json(&json);
        assert_eq!(stack.outputs["ServiceUrl"], "http://alb");
        assert!(stack.status_reason.is_none());
    }

    #[test]
    fn test_failure_message_lists_all_events() {
        let stack = StackDescription {
            name: "s".to_string(),
            stack_id: String::new(),
            status: "ROLLBACK_COMPLETE".to_string(),
            status_reason: None,
            outputs: BTreeMap::new(),
        };
        let msg = failure_message(&stack, &["A: x".to_string(), "B: y".to_string()]);
        assert!(msg.contains("ROLLBACK_COMPLETE"));
        assert!(msg.contains("A: x; B: y"));
    }
}
