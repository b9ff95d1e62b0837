//! Per-target deployment configuration and validation

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::FieldError;
use crate::models::deployment::TargetType;
use crate::storage::settings::default_region;
use crate::utils::short_hash;

pub const REDACTED: &str = "***REDACTED***";

/// Longest ECS stack name; keeps `<stack>-alb` and `<stack>-tg` within 32 chars
pub const ECS_STACK_NAME_MAX: usize = 24;

static LAMBDA_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());
static AGENTCORE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,62}$").unwrap());
static ECS_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]{0,254}$").unwrap());
static REGION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2}(-[a-z]+)+-\d{1,2}$").unwrap());
static ENV_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());
static VERSION_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").unwrap());
static STACK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]{0,127}$").unwrap());
static ROLE_ARN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^arn:aws[a-z-]*:iam::\d{12}:role/.+$").unwrap());

// ================================= SECRETS ====================================== //

/// A secret configuration value. Serializes redacted and never prints.
#[derive(Clone)]
pub struct SecretValue(Arc<SecretString>);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Arc::new(SecretString::from(value.into())))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for SecretValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for SecretValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(SecretValue::new(value))
    }
}

pub type ApiKeys = BTreeMap<String, SecretValue>;

// ================================ ARCHITECTURE ================================== //

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    #[default]
    #[serde(rename = "x86_64", alias = "amd64")]
    X86_64,
    #[serde(rename = "arm64", alias = "aarch64")]
    Arm64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
        }
    }

    /// Container platform string
    pub fn docker_platform(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "linux/amd64",
            Architecture::Arm64 => "linux/arm64",
        }
    }

    /// ECS runtime platform CPU architecture
    pub fn ecs_cpu_architecture(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "X86_64",
            Architecture::Arm64 => "ARM64",
        }
    }

    /// Parse a host CPU architecture string
    pub fn from_host(arch: &str) -> Option<Self> {
        match arch.to_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Some(Architecture::X86_64),
            "aarch64" | "arm64" => Some(Architecture::Arm64),
            _ => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =================================== SHARED ===================================== //

fn default_version() -> String {
    "v1".to_string()
}

fn default_true() -> bool {
    true
}

fn check_common(
    region: &str,
    version: &str,
    environment: &BTreeMap<String, String>,
    api_keys: &ApiKeys,
    errors: &mut Vec<FieldError>,
) {
    if !REGION.is_match(region) {
        errors.push(FieldError::new("region", format!("'{}' is not a valid AWS region", region)));
    }
    if !VERSION_LABEL.is_match(version) {
        errors.push(FieldError::new(
            "version",
            "must be 1-64 characters of letters, digits, '.', '_' or '-'",
        ));
    }
    for key in environment.keys().chain(api_keys.keys()) {
        if !ENV_KEY.is_match(key) {
            errors.push(FieldError::new(
                format!("environment.{}", key),
                "is not a valid environment variable name",
            ));
        }
    }
}

/// Environment for the deployed runtime; API keys are exposed here only
pub fn runtime_environment(
    environment: &BTreeMap<String, String>,
    api_keys: &ApiKeys,
) -> BTreeMap<String, String> {
    let mut env = environment.clone();
    for (key, value) in api_keys {
        env.insert(key.clone(), value.expose().to_string());
    }
    env
}

// =================================== LAMBDA ===================================== //

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LambdaConfig {
    pub function_name: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_lambda_memory")]
    pub memory_size: u32,
    #[serde(default = "default_lambda_timeout")]
    pub timeout: u32,
    #[serde(default)]
    pub architecture: Architecture,
    #[serde(default = "default_lambda_runtime")]
    pub runtime: String,
    #[serde(default)]
    pub stack_name: Option<String>,
    #[serde(default)]
    pub api_keys: ApiKeys,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_lambda_memory() -> u32 {
    512
}

fn default_lambda_timeout() -> u32 {
    300
}

fn default_lambda_runtime() -> String {
    "python3.11".to_string()
}

impl LambdaConfig {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            region: default_region(),
            memory_size: default_lambda_memory(),
            timeout: default_lambda_timeout(),
            architecture: Architecture::default(),
            runtime: default_lambda_runtime(),
            stack_name: None,
            api_keys: ApiKeys::new(),
            environment: BTreeMap::new(),
            version: default_version(),
        }
    }

    pub fn validate(&mut self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        self.function_name = self.function_name.trim().to_string();
        if !LAMBDA_NAME.is_match(&self.function_name) {
            errors.push(FieldError::new(
                "function_name",
                "must be 1-64 characters of letters, digits, '-' or '_'",
            ));
        }
        if !(128..=10240).contains(&self.memory_size) {
            errors.push(FieldError::new("memory_size", "must be between 128 and 10240 MB"));
        }
        if !(1..=900).contains(&self.timeout) {
            errors.push(FieldError::new("timeout", "must be between 1 and 900 seconds"));
        }
        if !self.runtime.starts_with("python3.") {
            errors.push(FieldError::new("runtime", "only python3.x runtimes are supported"));
        }
        if let Some(stack) = &self.stack_name {
            if !STACK_NAME.is_match(stack) {
                errors.push(FieldError::new(
                    "stack_name",
                    "must start with a letter and contain only letters, digits and '-'",
                ));
            }
        }
        check_common(&self.region, &self.version, &self.environment, &self.api_keys, &mut errors);
        errors
    }

    /// Explicit stack name, or one derived from the function name
    pub fn resolved_stack_name(&self) -> String {
        self.stack_name
            .clone()
            .unwrap_or_else(|| format!("strands-{}", self.function_name.replace('_', "-")))
    }

    pub fn stream_function_name(&self) -> String {
        let mut name = format!("{}-stream", self.function_name);
        if name.len() > 64 {
            name = format!("{}-{}", &self.function_name[..50], short_hash(&self.function_name, 6));
            name.push_str("-strm");
        }
        name
    }
}

// ================================= AGENTCORE ==================================== //

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCoreConfig {
    pub agent_name: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_agentcore_arch")]
    pub architecture: Architecture,
    #[serde(default)]
    pub execution_role: Option<String>,
    #[serde(default)]
    pub api_keys: ApiKeys,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_agentcore_arch() -> Architecture {
    Architecture::Arm64
}

impl AgentCoreConfig {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            region: default_region(),
            architecture: default_agentcore_arch(),
            execution_role: None,
            api_keys: ApiKeys::new(),
            environment: BTreeMap::new(),
            version: default_version(),
        }
    }

    /// Validate, normalizing hyphens in the agent name to underscores
    pub fn validate(&mut self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        self.agent_name = normalize_agent_name(&self.agent_name);
        if !AGENTCORE_NAME.is_match(&self.agent_name) {
            errors.push(FieldError::new(
                "agent_name",
                "must start with a letter and contain at most 63 letters, digits or '_'",
            ));
        }
        if self.architecture != Architecture::Arm64 {
            errors.push(FieldError::new("architecture", "AgentCore runtimes require arm64"));
        }
        if let Some(role) = &self.execution_role {
            if !ROLE_ARN.is_match(role) {
                errors.push(FieldError::new("execution_role", "must be an IAM role ARN"));
            }
        }
        check_common(&self.region, &self.version, &self.environment, &self.api_keys, &mut errors);
        errors
    }
}

pub fn normalize_agent_name(name: &str) -> String {
    name.trim().replace('-', "_")
}

// ==================================== ECS ======================================= //

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcsConfig {
    pub service_name: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_ecs_cpu")]
    pub cpu: u32,
    #[serde(default = "default_ecs_memory")]
    pub memory: u32,
    #[serde(default = "default_desired_count")]
    pub desired_count: u32,
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    #[serde(default)]
    pub architecture: Architecture,
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub assign_public_ip: bool,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    #[serde(default)]
    pub api_keys: ApiKeys,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_ecs_cpu() -> u32 {
    512
}

fn default_ecs_memory() -> u32 {
    1024
}

fn default_desired_count() -> u32 {
    1
}

fn default_container_port() -> u16 {
    8000
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

/// Valid Fargate memory sizes (MiB) for a CPU size, if the CPU size exists
pub fn fargate_memory_options(cpu: u32) -> Option<Vec<u32>> {
    let (low, high, step) = match cpu {
        256 => return Some(vec![512, 1024, 2048]),
        512 => (1024, 4096, 1024),
        1024 => (2048, 8192, 1024),
        2048 => (4096, 16384, 1024),
        4096 => (8192, 30720, 1024),
        8192 => (16384, 61440, 4096),
        16384 => (32768, 122880, 8192),
        _ => return None,
    };
    Some((low..=high).step_by(step).collect())
}

impl EcsConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            region: default_region(),
            cpu: default_ecs_cpu(),
            memory: default_ecs_memory(),
            desired_count: default_desired_count(),
            container_port: default_container_port(),
            architecture: Architecture::default(),
            vpc_id: None,
            subnet_ids: Vec::new(),
            assign_public_ip: true,
            health_check_path: default_health_check_path(),
            api_keys: ApiKeys::new(),
            environment: BTreeMap::new(),
            version: default_version(),
        }
    }

    pub fn validate(&mut self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        self.service_name = self.service_name.trim().to_string();
        if !ECS_NAME.is_match(&self.service_name) {
            errors.push(FieldError::new(
                "service_name",
                "must start with a letter and contain at most 255 letters, digits or '-'",
            ));
        }
        match fargate_memory_options(self.cpu) {
            None => errors.push(FieldError::new(
                "cpu",
                "must be one of 256, 512, 1024, 2048, 4096, 8192, 16384",
            )),
            Some(options) if !options.contains(&self.memory) => {
                errors.push(FieldError::new(
                    "memory",
                    format!(
                        "{} MiB is not valid for cpu {}; allowed: {}..={} MiB",
                        self.memory,
                        self.cpu,
                        options.first().copied().unwrap_or_default(),
                        options.last().copied().unwrap_or_default()
                    ),
                ));
            }
            Some(_) => {}
        }
        if !(1..=10).contains(&self.desired_count) {
            errors.push(FieldError::new("desired_count", "must be between 1 and 10"));
        }
        if self.container_port == 0 {
            errors.push(FieldError::new("container_port", "must be between 1 and 65535"));
        }
        match (&self.vpc_id, self.subnet_ids.is_empty()) {
            (Some(_), true) => errors.push(FieldError::new(
                "subnet_ids",
                "required when vpc_id is given",
            )),
            (None, false) => errors.push(FieldError::new(
                "vpc_id",
                "required when subnet_ids are given",
            )),
            _ => {}
        }
        if !self.health_check_path.starts_with('/') {
            errors.push(FieldError::new("health_check_path", "must start with '/'"));
        }
        check_common(&self.region, &self.version, &self.environment, &self.api_keys, &mut errors);
        errors
    }

    /// Stack name short enough for derived ALB and target group names
    pub fn stack_name(&self) -> String {
        let base = format!("strands-{}", self.service_name.to_lowercase());
        if base.len() <= ECS_STACK_NAME_MAX {
            return base;
        }
        let hash = short_hash(&self.service_name, 6);
        let keep = ECS_STACK_NAME_MAX - hash.len() - 1;
        let head = base[..keep].trim_end_matches('-');
        format!("{}-{}", head, hash)
    }

    pub fn repository_name(&self) -> String {
        format!("strands/{}", self.service_name.to_lowercase())
    }
}

// ================================ DISPATCH ====================================== //

/// Configuration for one deployment, tagged by target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "target")]
pub enum DeploymentConfig {
    #[serde(rename = "lambda")]
    Lambda(LambdaConfig),
    #[serde(rename = "agentcore")]
    AgentCore(AgentCoreConfig),
    #[serde(rename = "ecs")]
    Ecs(EcsConfig),
}

impl DeploymentConfig {
    pub fn target(&self) -> TargetType {
        match self {
            DeploymentConfig::Lambda(_) => TargetType::Lambda,
            DeploymentConfig::AgentCore(_) => TargetType::AgentCore,
            DeploymentConfig::Ecs(_) => TargetType::Ecs,
        }
    }

    pub fn validate(&mut self) -> Vec<FieldError> {
        match self {
            DeploymentConfig::Lambda(c) => c.validate(),
            DeploymentConfig::AgentCore(c) => c.validate(),
            DeploymentConfig::Ecs(c) => c.validate(),
        }
    }

    /// Function, agent or service name
    pub fn name(&self) -> &str {
        match self {
            DeploymentConfig::Lambda(c) => &c.function_name,
            DeploymentConfig::AgentCore(c) => &c.agent_name,
            DeploymentConfig::Ecs(c) => &c.service_name,
        }
    }

    pub fn region(&self) -> &str {
        match self {
            DeploymentConfig::Lambda(c) => &c.region,
            DeploymentConfig::AgentCore(c) => &c.region,
            DeploymentConfig::Ecs(c) => &c.region,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            DeploymentConfig::Lambda(c) => &c.version,
            DeploymentConfig::AgentCore(c) => &c.version,
            DeploymentConfig::Ecs(c) => &c.version,
        }
    }

    pub fn secret_values(&self) -> Vec<String> {
        let keys = match self {
            DeploymentConfig::Lambda(c) => &c.api_keys,
            DeploymentConfig::AgentCore(c) => &c.api_keys,
            DeploymentConfig::Ecs(c) => &c.api_keys,
        };
        keys.values().map(|v| v.expose().to_string()).collect()
    }
}
