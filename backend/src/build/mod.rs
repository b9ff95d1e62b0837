//! Container build service

pub mod progress;
pub mod service;

pub use progress::{noop_progress, BuildPhase, BuildProgress, ProgressFn, ProgressStatus};
pub use service::{BuildFile, BuildRequest, ContainerBuildService};
