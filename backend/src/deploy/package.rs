//! Runtime templates and bundle helpers shared by the deployment targets

use std::collections::BTreeMap;

use serde::Serialize;

use crate::code::adapter::AdaptedCode;
use crate::code::template::{inject, TemplateDocument};
use crate::code::CodeAnalysis;
use crate::deploy::config::ApiKeys;

pub const LAMBDA_SYNC_HANDLER: &str = include_str!("../../templates/lambda_sync_handler.py");
pub const LAMBDA_STREAM_APP: &str = include_str!("../../templates/lambda_stream_app.py");
pub const LAMBDA_STREAM_DOCKERFILE: &str = include_str!("../../templates/lambda_stream.Dockerfile");
pub const SAM_TEMPLATE: &str = include_str!("../../templates/sam_template.yaml");

pub const AGENTCORE_APP: &str = include_str!("../../templates/agentcore_app.py");
pub const AGENTCORE_DOCKERFILE: &str = include_str!("../../templates/agentcore.Dockerfile");
pub const AGENTCORE_DESCRIPTOR: &str = include_str!("../../templates/agentcore_descriptor.yaml");

pub const ECS_SERVER: &str = include_str!("../../templates/ecs_server.py");
pub const ECS_DOCKERFILE: &str = include_str!("../../templates/ecs.Dockerfile");
pub const ECS_STACK: &str = include_str!("../../templates/ecs_stack.yaml");

pub const DEFAULT_PYTHON_VERSION: &str = "3.11";

const BASE_REQUIREMENTS: &[&str] = &["strands-agents", "strands-agents-tools"];

/// `python3.12` -> `3.12`
pub fn python_version(runtime: &str) -> String {
    runtime
        .strip_prefix("python")
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_PYTHON_VERSION)
        .to_string()
}

/// Fill every slot of `template` that the adapted code provides
pub fn render_handler(template: &str, adapted: &AdaptedCode, streaming: bool) -> String {
    let mut out = template.to_string();
    let mut fill = |slot: &str, code: &str| {
        if TemplateDocument::parse(&out).has_slot(slot) {
            out = inject(&out, code, slot);
        }
    };
    if !adapted.imports.trim().is_empty() {
        fill("imports", &adapted.imports);
    }
    if let Some(code) = &adapted.sync_code {
        fill("run_agent", code);
    }
    if let Some(code) = &adapted.streaming_code {
        fill("stream_agent", code);
    }
    if streaming {
        fill("mode", "STREAMING = True");
    }
    out
}

/// `requirements.txt` for a bundle
pub fn requirements(analysis: &CodeAnalysis, extras: &[&str]) -> String {
    let mut lines: Vec<&str> = BASE_REQUIREMENTS.to_vec();
    if analysis.uses_mcp {
        lines.push("mcp");
    }
    lines.extend_from_slice(extras);
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// An API key passed to a stack as a `NoEcho` parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretParam {
    /// Environment variable name inside the runtime
    pub name: String,
    /// Stack parameter name
    pub param: String,
}

/// `OPENAI_API_KEY` -> `SecretOpenaiApiKey`
pub fn secret_param_name(key: &str) -> String {
    let mut out = String::from("Secret");
    for part in key.split(|c: char| !c.is_ascii_alphanumeric()) {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars.map(|c| c.to_ascii_lowercase()));
        }
    }
    out
}

pub fn secret_params(api_keys: &ApiKeys) -> Vec<SecretParam> {
    api_keys
        .keys()
        .map(|key| SecretParam {
            name: key.clone(),
            param: secret_param_name(key),
        })
        .collect()
}

/// Stack parameter values for the API keys, keyed by parameter name
pub fn secret_param_values(api_keys: &ApiKeys) -> BTreeMap<String, String> {
    api_keys
        .iter()
        .map(|(key, value)| (secret_param_name(key), value.expose().to_string()))
        .collect()
}

/// Environment values rendered as YAML-safe double-quoted scalars
pub fn quoted_environment(environment: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    environment
        .iter()
        .map(|(k, v)| {
            let quoted = serde_json::to_string(v).unwrap_or_else(|_| "\"\"".to_string());
            (k.clone(), quoted)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{adapt, analyze, CodeShape};
    use crate::deploy::config::SecretValue;

    const STREAMING_SOURCE: &str = "from strands import Agent\n\nagent = Agent(model=\"m\")\n\nasync def main():\n    prompt = input(\"> \")\n    async for chunk in agent.stream_async(prompt):\n        yield chunk\n";

    #[test]
    fn test_python_version() {
        assert_eq!(python_version("python3.12"), "3.12");
        assert_eq!(python_version("nodejs"), "3.11");
    }

    #[test]
    fn test_render_dual_mode_handler() {
        let adapted = adapt(STREAMING_SOURCE, CodeShape::Both);
        let out = render_handler(ECS_SERVER, &adapted, true);
        assert!(out.contains("STREAMING = True"));
        assert!(out.contains("return str(response)"));
        assert!(out.contains("prompt = user_input"));
        assert!(out.contains("async for chunk in agent.stream_async(prompt):"));
        assert!(out.contains("callback_handler=None"));
    }

    #[test]
    fn test_sync_template_ignores_streaming_slot() {
        let adapted = adapt(STREAMING_SOURCE, CodeShape::Both);
        let out = render_handler(LAMBDA_SYNC_HANDLER, &adapted, true);
        assert!(out.contains("def lambda_handler(event, context):"));
        assert!(!out.contains("STREAMING"));
        assert!(!out.contains("yield"));
    }

    #[test]
    fn test_requirements_follow_capabilities() {
        let plain = requirements(&analyze("agent = Agent()"), &[]);
        assert_eq!(plain, "strands-agents\nstrands-agents-tools\n");
        let mcp = requirements(&analyze("from mcp import stdio_client\n"), &["fastapi"]);
        assert!(mcp.contains("\nmcp\nfastapi\n"));
    }

    #[test]
    fn test_secret_parameters() {
        assert_eq!(secret_param_name("OPENAI_API_KEY"), "SecretOpenaiApiKey");
        let mut keys = ApiKeys::new();
        keys.insert("TAVILY_KEY".to_string(), SecretValue::new("tv-1"));
        assert_eq!(secret_params(&keys)[0].param, "SecretTavilyKey");
        assert_eq!(secret_param_values(&keys)["SecretTavilyKey"], "tv-1");
    }

    #[test]
    fn test_environment_is_quoted() {
        let env = BTreeMap::from([("MODE".to_string(), "a \"b\"".to_string())]);
        assert_eq!(quoted_environment(&env)["MODE"], r#""a \"b\"""#);
    }
}
