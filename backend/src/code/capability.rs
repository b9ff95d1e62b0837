//! Code capability detection
//!
//! Textual heuristics over generated agent source. These intentionally do not
//! parse Python: a false positive only means the richer dual-mode deployment
//! gets built.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static STREAM_ASYNC_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*\.stream_async\(").unwrap());

static ASYNC_FOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\basync\s+for\b").unwrap());

static YIELD_STATEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:.*[=:(]\s*)?yield\b").unwrap());

static MCP_USAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)\bMCPClient\b|\bmcp_client\b|^\s*(?:from\s+mcp\b|import\s+mcp\b)").unwrap()
});

static TOOL_DECORATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*@tool\b").unwrap());

/// Capability flags derived from source text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub streaming: bool,
    pub uses_mcp: bool,
    pub has_custom_tools: bool,
}

/// Whether the source emits output incrementally
pub fn detect_streaming(source: &str) -> bool {
    if STREAM_ASYNC_CALL.is_match(source) {
        return true;
    }
    if ASYNC_FOR.is_match(source) && source.contains("stream_async") {
        return true;
    }
    YIELD_STATEMENT.is_match(source)
}

/// Whether the source constructs or imports an MCP client
pub fn detect_mcp(source: &str) -> bool {
    MCP_USAGE.is_match(source)
}

/// Whether the source declares `@tool` functions
pub fn detect_custom_tools(source: &str) -> bool {
    TOOL_DECORATOR.is_match(source)
}

pub fn detect(source: &str) -> Capabilities {
    Capabilities {
        streaming: detect_streaming(source),
        uses_mcp: detect_mcp(source),
        has_custom_tools: detect_custom_tools(source),
    }
}
