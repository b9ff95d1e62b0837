//! Utility functions

use colored::Colorize;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tooling::probe::check_tooling_available;
use crate::tooling::runner::SystemRunner;

/// Version information for the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Print version and tooling availability to stdout
pub async fn run_diagnostic(python_bin: &str) {
    let version = version_info();
    println!(
        "{} {} ({}, built {})",
        "strandsd".bold(),
        version.version,
        version.git_hash,
        version.build_time
    );

    let report = check_tooling_available(&SystemRunner::new(), python_bin).await;
    println!(
        "host: {} ({}, {} cpus)",
        report.host.hostname, report.host.cpu_arch, report.host.cpu_count
    );
    for tool in &report.tools {
        let mark = if tool.available {
            "ok".green()
        } else {
            "missing".red()
        };
        println!(
            "  {:<10} {:<8} {}",
            tool.name,
            mark,
            tool.version.as_deref().unwrap_or("")
        );
    }
    let platforms = if report.platforms.is_empty() {
        "none".yellow().to_string()
    } else {
        report.platforms.join(", ")
    };
    println!("build platforms: {}", platforms);
}

/// Generate a random UUID v4
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Hex SHA-256 of data
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Short stable suffix for resource names
pub fn short_hash(data: &str, len: usize) -> String {
    let mut digest = sha256_hex(data.as_bytes());
    digest.truncate(len);
    digest
}

/// Keep the last `n` items of a slice
pub fn tail<T: Clone>(items: &[T], n: usize) -> Vec<T> {
    items[items.len().saturating_sub(n)..].to_vec()
}
