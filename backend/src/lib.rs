//! Strands deployment backend library
//!
//! Adapts generated agent code, deploys it to Lambda, AgentCore or ECS
//! Fargate, and relays invocations and local runs as event streams.

pub mod app;
pub mod build;
pub mod cache;
pub mod code;
pub mod deploy;
pub mod errors;
pub mod exec;
pub mod filesys;
pub mod invoke;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod tooling;
pub mod utils;
pub mod workers;

