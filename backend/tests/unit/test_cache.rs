//! Store unit tests

use std::sync::Arc;
use std::time::Duration;

use strands_backend::cache::build_logs::BuildLogStore;
use strands_backend::cache::status::DeploymentStatusStore;
use strands_backend::deploy::fsm::{DeploymentEvent, DeploymentState};
use strands_backend::models::deployment::TargetType;

#[test]
fn test_status_store_lifecycle() {
    let store = DeploymentStatusStore::new();
    assert!(store.is_empty());

    let id = store.create(TargetType::AgentCore);
    let status = store.get(&id).unwrap();
    assert_eq!(status.state, DeploymentState::Pending);
    assert_eq!(status.target, TargetType::AgentCore);

    store
        .update(&id, |s| s.apply(DeploymentEvent::Validate))
        .unwrap()
        .unwrap();
    assert_eq!(store.get(&id).unwrap().state, DeploymentState::Validating);

    assert!(store.delete(&id));
    assert!(!store.delete(&id));
    assert!(store.update(&id, |_| ()).is_err());
}

#[test]
fn test_cleanup_keeps_running_records() {
    let store = DeploymentStatusStore::new();
    let failed = store.create(TargetType::Lambda);
    store
        .update(&failed, |s| s.apply(DeploymentEvent::Fail("x".to_string())))
        .unwrap()
        .unwrap();
    let running = store.create(TargetType::Ecs);

    assert_eq!(store.cleanup_older_than(Duration::from_secs(3600)), 0);
    assert_eq!(store.cleanup_older_than(Duration::ZERO), 1);
    assert!(store.get(&running).is_some());
    assert_eq!(store.len(), 1);
}

#[test]
fn test_status_store_concurrent_writers() {
    let store = Arc::new(DeploymentStatusStore::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            std::thread::spawn(move || {
                let id = store.create(TargetType::Lambda);
                for i in 0..50 {
                    store.update(&id, |s| s.log(format!("line {i}"))).unwrap();
                }
                id
            })
        })
        .collect();
    for handle in handles {
        let id = handle.join().unwrap();
        assert_eq!(store.get(&id).unwrap().logs.len(), 50);
    }
    assert_eq!(store.list().len(), 8);
}

#[test]
fn test_build_log_capacity() {
    let logs = BuildLogStore::new(0);
    assert_eq!(logs.capacity(), 1);
    logs.push("b", "first");
    logs.push("b", "second");
    assert_eq!(logs.lines("b").unwrap(), vec!["second"]);
}
