//! FSM unit tests

use strands_backend::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};
use strands_backend::models::deployment::{DeploymentOutputs, DeploymentStatus, TargetType};

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.state(), DeploymentState::Pending);
    assert!(fsm.error().is_none());
}

#[test]
fn test_fsm_failure_from_every_phase() {
    let phases = [
        DeploymentEvent::Validate,
        DeploymentEvent::Build,
        DeploymentEvent::Provision,
        DeploymentEvent::AwaitCompletion,
    ];
    for depth in 0..=phases.len() {
        let mut fsm = DeploymentFsm::new();
        for event in phases.iter().take(depth) {
            fsm.process(event.clone()).unwrap();
        }
        fsm.process(DeploymentEvent::Fail(format!("failed at {depth}")))
            .unwrap();
        assert_eq!(fsm.state(), DeploymentState::Failed);
        assert_eq!(fsm.error(), Some(format!("failed at {depth}").as_str()));
    }
}

#[test]
fn test_fsm_completed_is_final() {
    let mut fsm = DeploymentFsm::at(DeploymentState::AwaitingCompletion);
    fsm.process(DeploymentEvent::Complete).unwrap();
    assert!(fsm.process(DeploymentEvent::Fail("late".to_string())).is_err());
    assert!(fsm.process(DeploymentEvent::Validate).is_err());
    assert_eq!(fsm.state(), DeploymentState::Completed);
}

#[test]
fn test_status_merges_outputs() {
    let mut status = DeploymentStatus::new("d-1".to_string(), TargetType::Lambda);
    status.function_arn = Some("arn:old".to_string());
    status.merge_outputs(DeploymentOutputs {
        endpoint_url: Some("https://abc.lambda-url.us-east-1.on.aws/".to_string()),
        values: [("sync_function_url".to_string(), "https://abc/".to_string())].into(),
        ..Default::default()
    });
    assert_eq!(status.function_arn.as_deref(), Some("arn:old"));
    assert!(status.endpoint_url.is_some());
    assert_eq!(status.outputs["sync_function_url"], "https://abc/");
}
