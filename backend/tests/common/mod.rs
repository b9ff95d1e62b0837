//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use strands_backend::build::service::ContainerBuildService;
use strands_backend::cache::build_logs::BuildLogStore;
use strands_backend::cache::status::DeploymentStatusStore;
use strands_backend::deploy::fsm::FsmSettings;
use strands_backend::deploy::manager::DeploymentManager;
use strands_backend::errors::BackendError;
use strands_backend::filesys::dir::Dir;
use strands_backend::storage::artifacts::ArtifactStore;
use strands_backend::tooling::aws::AwsCli;
use strands_backend::tooling::runner::{CommandOutput, CommandRunner, CommandSpec};

pub const SYNC_URL: &str = "https://abc123.lambda-url.us-east-1.on.aws/";

pub const SYNC_AGENT: &str = r#"from strands import Agent

agent = Agent(system_prompt="You are helpful.")

def main(user_input):
    return agent(user_input)
"#;

struct Rule {
    program: String,
    needles: Vec<String>,
    outputs: VecDeque<CommandOutput>,
}

/// Command runner answering from scripted rules.
///
/// The first rule whose program matches and whose needles all appear in the
/// command line answers; its last output repeats once the queue is drained.
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, program: &str, needles: &[&str], outputs: Vec<CommandOutput>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            program: program.to_string(),
            needles: needles.iter().map(|n| n.to_string()).collect(),
            outputs: outputs.into(),
        });
        self
    }

    /// Logged command lines, secrets masked
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, BackendError> {
        let line = spec.display();
        let full = std::iter::once(spec.program.as_str())
            .chain(spec.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(line);

        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .find(|r| r.program == spec.program && r.needles.iter().all(|n| full.contains(n)));
        Ok(match rule {
            Some(rule) if rule.outputs.len() > 1 => rule.outputs.pop_front().unwrap_or_default(),
            Some(rule) => rule.outputs.front().cloned().unwrap_or_else(ok_empty),
            None => ok_empty(),
        })
    }
}

pub fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

pub fn ok_empty() -> CommandOutput {
    ok("")
}

pub fn fail(stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: Some(255),
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

pub fn exited(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

pub fn stack_missing(name: &str) -> CommandOutput {
    fail(format!(
        "An error occurred (ValidationError) when calling the DescribeStacks operation: Stack with id {} does not exist",
        name
    ))
}

pub fn stack(name: &str, status: &str, outputs: &[(&str, &str)]) -> CommandOutput {
    let outputs: Vec<_> = outputs
        .iter()
        .map(|(k, v)| json!({"OutputKey": k, "OutputValue": v}))
        .collect();
    ok(json!({
        "Stacks": [{
            "StackName": name,
            "StackId": format!("arn:aws:cloudformation:us-east-1:123456789012:stack/{}/1", name),
            "StackStatus": status,
            "Outputs": outputs,
        }]
    })
    .to_string())
}

pub fn fast_settings() -> FsmSettings {
    FsmSettings {
        poll_interval: Duration::from_millis(10),
        completion_timeout: Duration::from_millis(200),
        build_timeout: Duration::from_secs(5),
        deploy_command_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_secs(5),
    }
}

pub struct Harness {
    pub runner: Arc<ScriptedRunner>,
    pub statuses: Arc<DeploymentStatusStore>,
    pub store: ArtifactStore,
    pub manager: DeploymentManager,
    pub builder: Arc<ContainerBuildService>,
    _root: TempDir,
}

impl Harness {
    pub fn new(runner: Arc<ScriptedRunner>, settings: FsmSettings) -> Self {
        let root = tempfile::tempdir().unwrap();
        let aws = AwsCli::new(runner.clone(), settings.command_timeout)
            .with_account_id(Some("123456789012".to_string()));
        let statuses = Arc::new(DeploymentStatusStore::new());
        let store = ArtifactStore::new(Dir::new(root.path()));
        let builder = Arc::new(ContainerBuildService::new(
            aws.clone(),
            Arc::new(BuildLogStore::new(100)),
            settings.build_timeout,
        ));
        let manager = DeploymentManager::new(
            aws,
            builder.clone(),
            statuses.clone(),
            store.clone(),
            settings,
        );
        Self {
            runner,
            statuses,
            store,
            manager,
            builder,
            _root: root,
        }
    }
}
