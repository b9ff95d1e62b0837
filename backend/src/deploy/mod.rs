//! Deployment module

pub mod agentcore;
pub mod config;
pub mod ecs;
pub mod fsm;
pub mod lambda;
pub mod manager;
pub mod package;
pub mod target;
