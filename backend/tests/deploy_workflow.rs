//! End-to-end deployment workflows against a scripted command runner

mod common;

use std::time::Duration;

use common::*;
use tokio_test::assert_ok;
use strands_backend::deploy::config::{
    AgentCoreConfig, DeploymentConfig, LambdaConfig, SecretValue,
};
use strands_backend::deploy::fsm::DeploymentState;
use strands_backend::deploy::manager::DeploymentRequest;
use strands_backend::deploy::target::ResourceRef;
use strands_backend::errors::BackendError;
use strands_backend::models::deployment::TargetType;
use strands_backend::tooling::runner::CommandOutput;
use strands_backend::tooling::stack::DeleteOutcome;

const STACK: &str = "strands-hello-agent";

fn lambda_request() -> DeploymentRequest {
    DeploymentRequest {
        config: DeploymentConfig::Lambda(LambdaConfig::new("hello_agent")),
        code: SYNC_AGENT.to_string(),
    }
}

#[tokio::test]
async fn test_lambda_deploys_and_records_outputs() {
    let runner = ScriptedRunner::new();
    runner.on(
        "aws",
        &["describe-stacks"],
        vec![
            stack_missing(STACK),
            stack(
                STACK,
                "CREATE_COMPLETE",
                &[
                    ("SyncFunctionUrl", SYNC_URL),
                    ("FunctionArn", "arn:aws:lambda:us-east-1:123456789012:function:hello_agent"),
                ],
            ),
        ],
    );
    runner.on("sam", &["deploy"], vec![ok("Successfully created/updated stack")]);
    let harness = Harness::new(runner.clone(), fast_settings());

    let started = harness.manager.start(lambda_request()).unwrap();
    assert_ok!(started.handle.await);

    let status = harness.manager.get_status(&started.deployment_id).unwrap();
    assert_eq!(status.state, DeploymentState::Completed, "{:?}", status.logs);
    assert_eq!(status.endpoint_url.as_deref(), Some(SYNC_URL));
    assert_eq!(status.outputs["sync_function_url"], SYNC_URL);
    assert_eq!(status.resource_name.as_deref(), Some(STACK));
    assert!(!status.streaming_capable);
    assert!(status.deployment_time.is_some());

    assert_eq!(runner.count("sam build"), 1);
    assert_eq!(runner.count("sam deploy"), 1);

    let result = harness
        .store
        .load(
            "lambda",
            &format!("hello_agent/v1/{}/result.json", started.deployment_id),
        )
        .await
        .unwrap();
    assert!(result.contains("\"success\": true"));
}

#[tokio::test]
async fn test_redeploy_without_changes_completes() {
    let runner = ScriptedRunner::new();
    runner.on(
        "aws",
        &["describe-stacks"],
        vec![stack(STACK, "UPDATE_COMPLETE", &[("SyncFunctionUrl", SYNC_URL)])],
    );
    runner.on(
        "sam",
        &["deploy"],
        vec![ok("Error: No changes to deploy. Stack strands-hello-agent is up to date")],
    );
    let harness = Harness::new(runner.clone(), fast_settings());

    let started = harness.manager.start(lambda_request()).unwrap();
    assert_ok!(started.handle.await);

    let status = harness.manager.get_status(&started.deployment_id).unwrap();
    assert_eq!(status.state, DeploymentState::Completed);
    assert!(status.logs.iter().any(|l| l.contains("already up to date")));
    assert_eq!(runner.count("delete-stack"), 0);
}

#[tokio::test]
async fn test_redeploy_without_changes_after_update_rollback_completes() {
    let runner = ScriptedRunner::new();
    runner.on(
        "aws",
        &["describe-stacks"],
        vec![stack(STACK, "UPDATE_ROLLBACK_COMPLETE", &[("SyncFunctionUrl", SYNC_URL)])],
    );
    runner.on(
        "sam",
        &["deploy"],
        vec![ok("Error: No changes to deploy. Stack strands-hello-agent is up to date")],
    );
    let harness = Harness::new(runner.clone(), fast_settings());

    let started = harness.manager.start(lambda_request()).unwrap();
    assert_ok!(started.handle.await);

    let status = harness.manager.get_status(&started.deployment_id).unwrap();
    assert_eq!(status.state, DeploymentState::Completed, "{:?}", status.logs);
    assert_eq!(status.endpoint_url.as_deref(), Some(SYNC_URL));
    assert_eq!(runner.count("delete-stack"), 0);
}

#[tokio::test]
async fn test_rolled_back_stack_is_recreated() {
    let runner = ScriptedRunner::new();
    runner.on(
        "aws",
        &["describe-stacks"],
        vec![
            stack(STACK, "ROLLBACK_COMPLETE", &[]),
            stack(STACK, "ROLLBACK_COMPLETE", &[]),
            stack_missing(STACK),
            stack(STACK, "CREATE_COMPLETE", &[("SyncFunctionUrl", SYNC_URL)]),
        ],
    );
    let harness = Harness::new(runner.clone(), fast_settings());

    let started = harness.manager.start(lambda_request()).unwrap();
    assert_ok!(started.handle.await);

    let status = harness.manager.get_status(&started.deployment_id).unwrap();
    assert_eq!(status.state, DeploymentState::Completed, "{:?}", status.logs);
    assert_eq!(runner.count("delete-stack"), 1);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_any_record() {
    let runner = ScriptedRunner::new();
    let harness = Harness::new(runner.clone(), fast_settings());

    let mut config = LambdaConfig::new("hello agent!");
    config.memory_size = 64;
    let err = harness
        .manager
        .start(DeploymentRequest {
            config: DeploymentConfig::Lambda(config),
            code: SYNC_AGENT.to_string(),
        })
        .unwrap_err();

    match err {
        BackendError::ValidationError(fields) => {
            let names: Vec<_> = fields.iter().map(|f| f.field.as_str()).collect();
            assert!(names.contains(&"function_name"));
            assert!(names.contains(&"memory_size"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(harness.statuses.is_empty());
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_missing_tool_fails_the_deployment() {
    let runner = ScriptedRunner::new();
    runner.on("sam", &["--version"], vec![fail("sam: command not found")]);
    let harness = Harness::new(runner.clone(), fast_settings());

    let started = harness.manager.start(lambda_request()).unwrap();
    assert_ok!(started.handle.await);

    let status = harness.manager.get_status(&started.deployment_id).unwrap();
    assert_eq!(status.state, DeploymentState::Failed);
    assert!(status.message.contains("sam"));
    assert_eq!(runner.count("sam deploy"), 0);
}

#[tokio::test]
async fn test_streaming_code_requires_docker_before_building() {
    let runner = ScriptedRunner::new();
    runner.on("docker", &["info"], vec![fail("Cannot connect to the Docker daemon")]);
    let harness = Harness::new(runner.clone(), fast_settings());

    let code = r#"from strands import Agent

agent = Agent()

async def main(user_input):
    async for event in agent.stream_async(user_input):
        if "data" in event:
            yield event["data"]
"#;
    let started = harness
        .manager
        .start(DeploymentRequest {
            config: DeploymentConfig::Lambda(LambdaConfig::new("hello_agent")),
            code: code.to_string(),
        })
        .unwrap();
    assert_ok!(started.handle.await);

    let status = harness.manager.get_status(&started.deployment_id).unwrap();
    assert_eq!(status.state, DeploymentState::Failed);
    assert!(status.message.contains("docker"), "{}", status.message);
    assert_eq!(runner.count("sam build"), 0);
    assert_eq!(runner.count("describe-stacks"), 0);
}

#[tokio::test]
async fn test_build_failure_keeps_log_tail() {
    let runner = ScriptedRunner::new();
    runner.on("aws", &["describe-stacks"], vec![stack_missing(STACK)]);
    runner.on(
        "sam",
        &["build"],
        vec![fail("Building codeuri\nError: PythonPipBuilder:ResolveDependencies - no matching distribution")],
    );
    let harness = Harness::new(runner.clone(), fast_settings());

    let started = harness.manager.start(lambda_request()).unwrap();
    assert_ok!(started.handle.await);

    let status = harness.manager.get_status(&started.deployment_id).unwrap();
    assert_eq!(status.state, DeploymentState::Failed);
    assert!(status.message.contains("sam build failed"));
    assert!(status
        .logs
        .iter()
        .any(|l| l.contains("no matching distribution")));
    assert_eq!(runner.count("sam deploy"), 0);
}

#[tokio::test]
async fn test_stack_that_never_settles_times_out() {
    let runner = ScriptedRunner::new();
    runner.on(
        "aws",
        &["describe-stacks"],
        vec![stack_missing(STACK), stack(STACK, "CREATE_IN_PROGRESS", &[])],
    );
    let harness = Harness::new(runner.clone(), fast_settings());

    let started = harness.manager.start(lambda_request()).unwrap();
    assert_ok!(started.handle.await);

    let status = harness.manager.get_status(&started.deployment_id).unwrap();
    assert_eq!(status.state, DeploymentState::Failed);
    assert!(status.message.contains("Timed out"), "{}", status.message);
    assert!(status.message.contains("may still complete"));
}

#[tokio::test]
async fn test_log_transcript_is_written_while_running() {
    let runner = ScriptedRunner::new();
    runner.on(
        "aws",
        &["describe-stacks"],
        vec![stack_missing(STACK), stack(STACK, "CREATE_IN_PROGRESS", &[])],
    );
    let mut settings = fast_settings();
    settings.completion_timeout = Duration::from_secs(2);
    let harness = Harness::new(runner, settings);

    let started = harness.manager.start(lambda_request()).unwrap();
    let key = format!("hello_agent/v1/{}/deployment.log", started.deployment_id);

    let mut transcript = String::new();
    for _ in 0..100 {
        transcript = harness.store.load("lambda", &key).await.unwrap_or_default();
        if transcript.contains("Running sam deploy") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(transcript.contains("Running sam build"), "{}", transcript);
    assert!(transcript.contains("Running sam deploy"));
    let status = harness.manager.get_status(&started.deployment_id).unwrap();
    assert!(!status.is_terminal(), "{:?}", status.state);

    assert_ok!(started.handle.await);
    let transcript = harness.store.load("lambda", &key).await.unwrap();
    assert!(transcript.contains("Deployment failed"));
}

#[tokio::test]
async fn test_rollback_is_a_failure_not_a_timeout() {
    let runner = ScriptedRunner::new();
    runner.on(
        "aws",
        &["describe-stacks"],
        vec![stack_missing(STACK), stack(STACK, "ROLLBACK_COMPLETE", &[])],
    );
    let harness = Harness::new(runner.clone(), fast_settings());

    let started = harness.manager.start(lambda_request()).unwrap();
    assert_ok!(started.handle.await);

    let status = harness.manager.get_status(&started.deployment_id).unwrap();
    assert_eq!(status.state, DeploymentState::Failed);
    assert!(status.message.starts_with("Provisioning failed"));
}

#[tokio::test]
async fn test_api_keys_never_reach_logs() {
    let runner = ScriptedRunner::new();
    runner.on(
        "aws",
        &["describe-stacks"],
        vec![
            stack_missing(STACK),
            stack(STACK, "CREATE_COMPLETE", &[("SyncFunctionUrl", SYNC_URL)]),
        ],
    );
    let harness = Harness::new(runner.clone(), fast_settings());

    let mut config = LambdaConfig::new("hello_agent");
    config
        .api_keys
        .insert("OPENAI_API_KEY".to_string(), SecretValue::new("sk-live-secret"));
    let started = harness
        .manager
        .start(DeploymentRequest {
            config: DeploymentConfig::Lambda(config),
            code: SYNC_AGENT.to_string(),
        })
        .unwrap();
    assert_ok!(started.handle.await);

    let status = harness.manager.get_status(&started.deployment_id).unwrap();
    assert_eq!(status.state, DeploymentState::Completed);
    assert!(runner.calls().iter().all(|c| !c.contains("sk-live-secret")));
    assert!(status.logs.iter().all(|l| !l.contains("sk-live-secret")));

    let saved = harness
        .store
        .load(
            "lambda",
            &format!("hello_agent/v1/{}/config.json", started.deployment_id),
        )
        .await
        .unwrap();
    assert!(!saved.contains("sk-live-secret"));
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let runner = ScriptedRunner::new();
    runner.on(
        "aws",
        &["describe-stacks"],
        vec![stack(STACK, "CREATE_COMPLETE", &[]), stack_missing(STACK)],
    );
    let harness = Harness::new(runner.clone(), fast_settings());
    let resource = ResourceRef {
        target: TargetType::Lambda,
        name: STACK.to_string(),
        region: "us-east-1".to_string(),
        arn: None,
    };

    let first = harness.manager.delete_resources(&resource).await.unwrap();
    assert_eq!(first, DeleteOutcome::Deleted);
    let second = harness.manager.delete_resources(&resource).await.unwrap();
    assert_eq!(second, DeleteOutcome::AlreadyGone);
    assert_eq!(runner.count("delete-stack"), 1);
}

#[tokio::test]
async fn test_cleanup_after_completion() {
    let runner = ScriptedRunner::new();
    runner.on(
        "aws",
        &["describe-stacks"],
        vec![
            stack_missing(STACK),
            stack(STACK, "CREATE_COMPLETE", &[("SyncFunctionUrl", SYNC_URL)]),
        ],
    );
    let harness = Harness::new(runner, fast_settings());

    let started = harness.manager.start(lambda_request()).unwrap();
    assert_ok!(started.handle.await);

    let logs = harness.builder.logs();
    logs.push(&started.deployment_id, "Step 1/6 : FROM python:3.12-slim");

    assert_eq!(harness.manager.cleanup(Duration::from_secs(3600)), 0);
    assert!(logs.lines(&started.deployment_id).is_some());
    assert_eq!(harness.manager.cleanup(Duration::ZERO), 1);
    assert!(harness.manager.get_status(&started.deployment_id).is_err());
    assert!(logs.lines(&started.deployment_id).is_none());
}

#[tokio::test]
async fn test_deleting_a_record_drops_its_build_logs() {
    let runner = ScriptedRunner::new();
    let harness = Harness::new(runner, fast_settings());
    let id = harness.statuses.create(TargetType::Ecs);
    let logs = harness.builder.logs();
    logs.push(&id, "pushing layer");

    let report = harness.manager.delete(&id, false).await.unwrap();
    assert!(report.record_deleted);
    assert!(logs.is_empty());
}

const OLD_RUNTIME: &str = "arn:aws:bedrock-agentcore:us-east-1:123456789012:runtime/hello_agent-Old111";
const NEW_RUNTIME: &str = "arn:aws:bedrock-agentcore:us-east-1:123456789012:runtime/hello_agent-New222";

fn agentcore_request() -> DeploymentRequest {
    DeploymentRequest {
        config: DeploymentConfig::AgentCore(AgentCoreConfig::new("hello_agent")),
        code: SYNC_AGENT.to_string(),
    }
}

fn runtime_ready(arn: &str) -> CommandOutput {
    ok(serde_json::json!({"status": "READY", "agentRuntimeArn": arn}).to_string())
}

#[tokio::test]
async fn test_agentcore_redeploy_after_delete_launches_a_new_runtime() {
    let runner = ScriptedRunner::new();
    runner.on(
        "agentcore",
        &["launch"],
        vec![
            ok(format!("Agent ARN: {}", OLD_RUNTIME)),
            ok(format!("Agent ARN: {}", NEW_RUNTIME)),
        ],
    );
    runner.on(
        "aws",
        &["get-agent-runtime"],
        vec![runtime_ready(OLD_RUNTIME), runtime_ready(NEW_RUNTIME)],
    );
    let harness = Harness::new(runner.clone(), fast_settings());

    let first = harness.manager.start(agentcore_request()).unwrap();
    assert_ok!(first.handle.await);
    let status = harness.manager.get_status(&first.deployment_id).unwrap();
    assert_eq!(status.state, DeploymentState::Completed, "{:?}", status.logs);
    assert_eq!(status.agent_runtime_arn.as_deref(), Some(OLD_RUNTIME));

    let report = harness.manager.delete(&first.deployment_id, true).await.unwrap();
    assert_eq!(report.resources, Some(DeleteOutcome::Deleted));
    assert_eq!(runner.count("delete-agent-runtime"), 1);
    let descriptor = harness
        .store
        .load("agentcore", "hello_agent/.bedrock_agentcore.yaml")
        .await
        .unwrap();
    assert!(!descriptor.contains("Old111"), "{}", descriptor);

    let second = harness.manager.start(agentcore_request()).unwrap();
    assert_ok!(second.handle.await);
    let status = harness.manager.get_status(&second.deployment_id).unwrap();
    assert_eq!(status.state, DeploymentState::Completed, "{:?}", status.logs);
    assert!(status.logs.iter().all(|l| !l.contains("Updating existing runtime")));
    assert_eq!(status.agent_runtime_arn.as_deref(), Some(NEW_RUNTIME));
}
