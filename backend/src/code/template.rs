//! Runtime templates with named insertion points
//!
//! A template marks where generated code goes with a pair of comment lines:
//!
//! ```text
//!     # <agent-code:run_agent:start>
//!     ...placeholder body...
//!     # <agent-code:run_agent:end>
//! ```
//!
//! Templates are parsed once into text segments and slots, so injected code is
//! never scanned for markers. Rendered markers carry a nonce derived from the
//! injected content and start/end are paired by name and nonce, which keeps
//! `inject` idempotent on its own output.

use std::collections::HashMap;
use std::sync::LazyLock;

use handlebars::Handlebars;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::code::adapter::dedent;
use crate::errors::BackendError;

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([ \t]*)# <agent-code:([A-Za-z0-9_]+):(start|end)(?::([0-9a-f]+))?>\s*$").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Slot {
        name: String,
        indent: String,
        original: String,
    },
}

/// A parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDocument {
    segments: Vec<Segment>,
}

struct Marker {
    indent: String,
    name: String,
    is_start: bool,
    nonce: Option<String>,
}

fn parse_marker(line: &str) -> Option<Marker> {
    let caps = MARKER.captures(line.trim_end_matches(['\n', '\r']))?;
    Some(Marker {
        indent: caps[1].to_string(),
        name: caps[2].to_string(),
        is_start: &caps[3] == "start",
        nonce: caps.get(4).map(|m| m.as_str().to_string()),
    })
}

impl TemplateDocument {
    pub fn parse(text: &str) -> Self {
        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        let mut segments = Vec::new();
        let mut buffer = String::new();
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];
            let start = parse_marker(line).filter(|m| m.is_start);
            let end_idx = start.as_ref().and_then(|s| {
                lines[i + 1..]
                    .iter()
                    .position(|l| {
                        parse_marker(l)
                            .map(|m| !m.is_start && m.name == s.name && m.nonce == s.nonce)
                            .unwrap_or(false)
                    })
                    .map(|offset| i + 1 + offset)
            });

            match (start, end_idx) {
                (Some(start), Some(end)) => {
                    if !buffer.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut buffer)));
                    }
                    segments.push(Segment::Slot {
                        name: start.name,
                        indent: start.indent,
                        original: lines[i..=end].concat(),
                    });
                    i = end + 1;
                }
                _ => {
                    buffer.push_str(line);
                    i += 1;
                }
            }
        }

        if !buffer.is_empty() {
            segments.push(Segment::Text(buffer));
        }
        Self { segments }
    }

    pub fn has_slot(&self, name: &str) -> bool {
        self.slot_names().any(|n| n == name)
    }

    pub fn slot_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Slot { name, .. } => Some(name.as_str()),
            Segment::Text(_) => None,
        })
    }

    /// Render with the given slot contents; unfilled slots keep their original text
    pub fn render(&self, fills: &HashMap<&str, &str>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Slot {
                    name,
                    indent,
                    original,
                } => match fills.get(name.as_str()) {
                    Some(code) => render_slot(&mut out, name, indent, code),
                    None => out.push_str(original),
                },
            }
        }
        out
    }
}

fn content_nonce(name: &str, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

fn render_slot(out: &mut String, name: &str, indent: &str, code: &str) {
    let nonce = content_nonce(name, code);
    let lines: Vec<String> = code.lines().map(str::to_string).collect();
    out.push_str(&format!("{indent}# <agent-code:{name}:start:{nonce}>\n"));
    for line in dedent(&lines) {
        if line.is_empty() {
            out.push('\n');
        } else {
            out.push_str(&format!("{indent}{line}\n"));
        }
    }
    out.push_str(&format!("{indent}# <agent-code:{name}:end:{nonce}>\n"));
}

/// Inject `adapted_code` into the insertion point named `target_function_name`
pub fn inject(template_text: &str, adapted_code: &str, target_function_name: &str) -> String {
    let document = TemplateDocument::parse(template_text);
    if document.has_slot(target_function_name) {
        let fills = HashMap::from([(target_function_name, adapted_code)]);
        return document.render(&fills);
    }

    let placeholder = format!("{{{{{target_function_name}}}}}");
    if template_text.contains(&placeholder) {
        warn!(
            slot = target_function_name,
            "No marker pair in template, falling back to placeholder substitution"
        );
        return template_text.replacen(&placeholder, adapted_code, 1);
    }

    warn!(
        slot = target_function_name,
        "Template has no insertion point, leaving it unchanged"
    );
    template_text.to_string()
}

/// Substitute `{{param}}` values into a template; unknown params are an error
pub fn render_params<T: Serialize>(template_text: &str, params: &T) -> Result<String, BackendError> {
    let mut registry = Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    registry.set_strict_mode(true);
    Ok(registry.render_template(template_text, params)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "import json\n# <agent-code:imports:start>\nfrom strands import Agent\n# <agent-code:imports:end>\n\nasync def run_agent(user_input):\n    # <agent-code:run_agent:start>\n    return \"placeholder\"\n    # <agent-code:run_agent:end>\n";

    #[test]
    fn test_parse_finds_slots() {
        let doc = TemplateDocument::parse(TEMPLATE);
        let names: Vec<&str> = doc.slot_names().collect();
        assert_eq!(names, vec!["imports", "run_agent"]);
    }

    #[test]
    fn test_inject_reindents_into_slot() {
        let out = inject(TEMPLATE, "agent = Agent()\nreturn str(agent(user_input))", "run_agent");
        assert!(out.contains("\n    agent = Agent()\n    return str(agent(user_input))\n"));
        assert!(!out.contains("placeholder"));
        assert!(out.starts_with("import json\n# <agent-code:imports:start>\n"));
    }

    #[test]
    fn test_inject_is_idempotent() {
        let code = "x = 1\nreturn x";
        let once = inject(TEMPLATE, code, "run_agent");
        let twice = inject(&once, code, "run_agent");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_marker_text_inside_code_is_inert() {
        let code = "s = '''\n# <agent-code:run_agent:end>\n'''\nreturn s";
        let once = inject(TEMPLATE, code, "run_agent");
        let twice = inject(&once, code, "run_agent");
        assert_eq!(once, twice);
        assert_eq!(twice.matches("return s").count(), 1);
        assert!(!twice.contains("placeholder"));
    }

    #[test]
    fn test_placeholder_fallback() {
        let out = inject("def handler():\n{{handler}}\n", "    pass", "handler");
        assert_eq!(out, "def handler():\n    pass\n");
    }

    #[test]
    fn test_missing_slot_leaves_template() {
        let out = inject("print('hi')\n", "x = 1", "run_agent");
        assert_eq!(out, "print('hi')\n");
    }

    #[test]
    fn test_render_params() {
        #[derive(Serialize)]
        struct Params {
            region: String,
        }
        let out = render_params(
            "FROM base\nENV AWS_REGION={{region}}\n",
            &Params {
                region: "eu-west-1".to_string(),
            },
        )
        .unwrap();
        assert_eq!(out, "FROM base\nENV AWS_REGION=eu-west-1\n");
        assert!(render_params("{{missing}}", &serde_json::json!({})).is_err());
    }
}
