//! Build progress reporting and output monitoring

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    Staging,
    Building,
    Login,
    Pushing,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildProgress {
    pub phase: BuildPhase,
    pub status: ProgressStatus,
    pub message: String,
}

/// Receives `(phase, status, message)` updates
pub type ProgressFn = Arc<dyn Fn(BuildProgress) + Send + Sync>;

pub fn noop_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Classification of one line of build output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineSignal {
    /// The build moved to a new phase
    Phase(BuildPhase),
    /// Harmless warning, e.g. a registry cache miss
    Warning,
    Error,
    Plain,
}

static CACHE_MISS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(importing cache manifest|failed to configure registry cache|cache.*(not found|no such manifest)|buildcache.*not found)").unwrap()
});

static ERROR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(^error\b|^#\d+ error|\berror:|failed to solve|denied:|no basic auth credentials)").unwrap());

static PUSH_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(pushing layers|exporting to image|pushing manifest|^the push refers to|: pushed$|^[0-9a-f]{12}: (preparing|pushing))").unwrap()
});

static BUILD_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#\d+ \[|Step \d+/\d+ :)").unwrap());

/// Classify a line of docker output
pub fn classify_line(line: &str) -> LineSignal {
    let line = line.trim();
    if CACHE_MISS.is_match(line) {
        LineSignal::Warning
    } else if ERROR_LINE.is_match(line) {
        LineSignal::Error
    } else if PUSH_LINE.is_match(line) {
        LineSignal::Phase(BuildPhase::Pushing)
    } else if BUILD_LINE.is_match(line) {
        LineSignal::Phase(BuildPhase::Building)
    } else {
        LineSignal::Plain
    }
}
