//! Finite state machine for a deployment workflow

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::settings::DeploySettings;

/// Timings applied to every phase of a workflow
#[derive(Debug, Clone)]
pub struct FsmSettings {
    /// Interval between completion polls
    pub poll_interval: Duration,

    /// Budget for `await_completion`
    pub completion_timeout: Duration,

    /// Image build/push budget
    pub build_timeout: Duration,

    /// Budget for long provisioning commands
    pub deploy_command_timeout: Duration,

    /// Budget for short commands
    pub command_timeout: Duration,
}

impl Default for FsmSettings {
    fn default() -> Self {
        Self::from(&DeploySettings::default())
    }
}

impl From<&DeploySettings> for FsmSettings {
    fn from(settings: &DeploySettings) -> Self {
        Self {
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            completion_timeout: Duration::from_secs(settings.completion_timeout_secs),
            build_timeout: Duration::from_secs(settings.build_timeout_secs),
            deploy_command_timeout: Duration::from_secs(settings.deploy_command_timeout_secs),
            command_timeout: Duration::from_secs(settings.command_timeout_secs),
        }
    }
}

/// Deployment lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Pending,
    Validating,
    Building,
    Provisioning,
    AwaitingCompletion,
    Completed,
    Failed,
}

impl DeploymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentState::Completed | DeploymentState::Failed)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentState::Pending => "pending",
            DeploymentState::Validating => "validating",
            DeploymentState::Building => "building",
            DeploymentState::Provisioning => "provisioning",
            DeploymentState::AwaitingCompletion => "awaiting_completion",
            DeploymentState::Completed => "completed",
            DeploymentState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    Validate,
    Build,
    Provision,
    AwaitCompletion,
    Complete,
    Fail(String),
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentState,
    error: Option<String>,
}

impl DeploymentFsm {
    pub fn new() -> Self {
        Self::at(DeploymentState::Pending)
    }

    /// Resume from a known state
    pub fn at(state: DeploymentState) -> Self {
        Self { state, error: None }
    }

    pub fn state(&self) -> DeploymentState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<(), String> {
        use DeploymentState::*;

        let new_state = match (&self.state, &event) {
            (Pending, DeploymentEvent::Validate) => Validating,
            (Validating, DeploymentEvent::Build) => Building,
            (Building, DeploymentEvent::Provision) => Provisioning,
            (Provisioning, DeploymentEvent::AwaitCompletion) => AwaitingCompletion,
            (AwaitingCompletion, DeploymentEvent::Complete) => Completed,

            // Any phase may fail; a finished deployment never changes again
            (state, DeploymentEvent::Fail(err)) if !state.is_terminal() => {
                self.error = Some(err.clone());
                Failed
            }

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut fsm = DeploymentFsm::new();
        for event in [
            DeploymentEvent::Validate,
            DeploymentEvent::Build,
            DeploymentEvent::Provision,
            DeploymentEvent::AwaitCompletion,
            DeploymentEvent::Complete,
        ] {
            fsm.process(event).unwrap();
        }
        assert_eq!(fsm.state(), DeploymentState::Completed);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut fsm = DeploymentFsm::new();
        fsm.process(DeploymentEvent::Validate).unwrap();
        fsm.process(DeploymentEvent::Fail("bad memory".to_string()))
            .unwrap();
        assert_eq!(fsm.state(), DeploymentState::Failed);
        assert_eq!(fsm.error(), Some("bad memory"));

        assert!(fsm.process(DeploymentEvent::Build).is_err());
        assert!(fsm.process(DeploymentEvent::Fail("again".to_string())).is_err());
        assert_eq!(fsm.error(), Some("bad memory"));
    }

    #[test]
    fn test_phases_cannot_be_skipped() {
        let mut fsm = DeploymentFsm::new();
        assert!(fsm.process(DeploymentEvent::Provision).is_err());
        assert_eq!(fsm.state(), DeploymentState::Pending);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&DeploymentState::AwaitingCompletion).unwrap();
        assert_eq!(json, "\"awaiting_completion\"");
    }
}
