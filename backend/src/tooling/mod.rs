//! External tool boundary: subprocesses, AWS CLI, CloudFormation

pub mod aws;
pub mod poll;
pub mod probe;
pub mod runner;
pub mod stack;

pub use aws::{AwsCli, CloudError};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, OutputLine, SystemRunner};
