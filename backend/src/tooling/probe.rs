//! Host and tooling checks

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::debug;

use crate::deploy::config::Architecture;
use crate::errors::BackendError;
use crate::tooling::runner::{CommandRunner, CommandSpec};

pub const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// One external tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStatus {
    pub name: String,
    pub available: bool,
    pub version: Option<String>,
}

/// Host facts relevant to image builds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub cpu_arch: String,
    pub cpu_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolingReport {
    /// Docker daemon reachable
    pub build_engine_available: bool,
    /// buildx present with more than one platform
    pub multi_arch_available: bool,
    pub platforms: Vec<String>,
    pub host: HostInfo,
    pub tools: Vec<ToolStatus>,
}

impl ToolingReport {
    pub fn tool(&self, name: &str) -> Option<&ToolStatus> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn supports_platform(&self, arch: Architecture) -> bool {
        self.platforms.iter().any(|p| p == arch.docker_platform())
    }
}

pub fn host_info() -> HostInfo {
    let mut sys = System::new();
    sys.refresh_cpu_all();
    HostInfo {
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        cpu_arch: System::cpu_arch(),
        cpu_count: sys.cpus().len(),
    }
}

pub fn host_architecture() -> Option<Architecture> {
    Architecture::from_host(&System::cpu_arch())
}

/// Cross-compilation is needed unless the host already runs the target architecture
pub fn needs_cross_build(host: Option<Architecture>, target: Architecture) -> bool {
    host != Some(target)
}

/// Resolve a tool on PATH
pub fn require_tool(name: &str) -> Result<PathBuf, BackendError> {
    which::which(name).map_err(|e| {
        BackendError::ToolingError(format!("`{}` not found on PATH: {}", name, e))
    })
}

async fn version_of(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> ToolStatus {
    let spec = CommandSpec::new(program, args.iter().copied()).timeout(VERSION_CHECK_TIMEOUT);
    match runner.run(&spec).await {
        Ok(output) if output.success() => ToolStatus {
            name: program.to_string(),
            available: true,
            version: output
                .combined()
                .lines()
                .next()
                .map(|l| l.trim().to_string()),
        },
        Ok(output) => {
            debug!("{} check exited with {:?}", program, output.exit_code);
            ToolStatus {
                name: program.to_string(),
                available: false,
                version: None,
            }
        }
        Err(e) => {
            debug!("{} check failed: {}", program, e);
            ToolStatus {
                name: program.to_string(),
                available: false,
                version: None,
            }
        }
    }
}

/// Platforms listed by `docker buildx ls`
pub fn parse_buildx_platforms(output: &str) -> Vec<String> {
    let mut platforms: Vec<String> = Vec::new();
    for line in output.lines() {
        let Some(start) = line.find("linux/") else {
            continue;
        };
        for platform in line[start..].split(',') {
            let platform = platform.trim().trim_end_matches('*').trim();
            if platform.starts_with("linux/") && !platforms.iter().any(|p| p == platform) {
                platforms.push(platform.to_string());
            }
        }
    }
    platforms
}

/// Platforms the active buildx builders can target; empty without buildx
pub async fn buildx_platforms(runner: &dyn CommandRunner) -> Vec<String> {
    let spec = CommandSpec::new("docker", ["buildx", "ls"]).timeout(VERSION_CHECK_TIMEOUT);
    match runner.run(&spec).await {
        Ok(output) if output.success() => parse_buildx_platforms(&output.stdout),
        _ => Vec::new(),
    }
}

/// Probe the build engine and the provisioning tools
pub async fn check_tooling_available(runner: &dyn CommandRunner, python_bin: &str) -> ToolingReport {
    let docker = version_of(runner, "docker", &["info", "--format", "{{.ServerVersion}}"]).await;
    let buildx = version_of(runner, "docker", &["buildx", "version"]).await;

    let platforms = if buildx.available {
        buildx_platforms(runner).await
    } else {
        Vec::new()
    };

    let mut tools = vec![ToolStatus {
        name: "docker".to_string(),
        ..docker.clone()
    }];
    tools.push(ToolStatus {
        name: "buildx".to_string(),
        ..buildx.clone()
    });
    tools.push(version_of(runner, "aws", &["--version"]).await);
    tools.push(version_of(runner, "sam", &["--version"]).await);
    tools.push(version_of(runner, "agentcore", &["--help"]).await);
    tools.push(version_of(runner, python_bin, &["--version"]).await);

    ToolingReport {
        build_engine_available: docker.available,
        multi_arch_available: buildx.available && platforms.len() > 1,
        platforms,
        host: host_info(),
        tools,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_buildx_platforms() {
        let output = "NAME/NODE       DRIVER/ENDPOINT  STATUS   BUILDKIT PLATFORMS\n\
                      default *       docker\n  \
                      default       default          running  v0.12.5  linux/amd64, linux/amd64/v2, linux/arm64*, linux/386\n";
        let platforms = parse_buildx_platforms(output);
        assert_eq!(
            platforms,
            vec!["linux/amd64", "linux/amd64/v2", "linux/arm64", "linux/386"]
        );
    }

    #[test]
    fn test_cross_build_detection() {
        assert!(!needs_cross_build(Some(Architecture::Arm64), Architecture::Arm64));
        assert!(needs_cross_build(Some(Architecture::X86_64), Architecture::Arm64));
        assert!(needs_cross_build(None, Architecture::X86_64));
    }
}
