//! Code adaptation
//!
//! Turns a flat generated script (imports, inline agent construction and an
//! `async def main()`) into code blocks that fit inside a runtime handler
//! function. Everything here is best effort: unrecognized input degrades to a
//! default agent invocation instead of an error.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::code::capability;

/// Indentation (in spaces) of code injected into a handler body
pub const DEFAULT_INJECT_INDENT: usize = 4;

/// Name of the variable the runtime handlers bind the caller's prompt to
pub const USER_INPUT_VAR: &str = "user_input";

static ASYNC_FOR_STREAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^async\s+for\s+(\w+)\s+in\s+(\w+)\.stream_async\((.*)\)\s*:\s*(.*)$").unwrap()
});

static AGENT_ASSIGN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\w+)\s*=\s*Agent\(").unwrap());

static AGENT_CTOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bAgent\(").unwrap());

static CALL_ASSIGN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)\s*=\s*(?:await\s+)?(\w+)\((.*)\)\s*$").unwrap());

static INPUT_ASSIGN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\w+)\s*=\s*(?:await\s+)?(?:asyncio\.to_thread\(\s*)?input\b").unwrap()
});

/// Runtime shape requested from the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeShape {
    Sync,
    Streaming,
    Both,
}

impl CodeShape {
    /// Shape to build for code with the given streaming verdict
    pub fn for_streaming(streaming: bool) -> Self {
        if streaming {
            CodeShape::Both
        } else {
            CodeShape::Sync
        }
    }

    fn wants_sync(&self) -> bool {
        matches!(self, CodeShape::Sync | CodeShape::Both)
    }

    fn wants_streaming(&self) -> bool {
        matches!(self, CodeShape::Streaming | CodeShape::Both)
    }
}

/// Source segments and capability flags of one script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeAnalysis {
    pub streaming: bool,
    pub uses_mcp: bool,
    pub has_custom_tools: bool,
    pub imports: Vec<String>,
    pub agent_setup: Vec<String>,
    pub tool_definitions: Vec<String>,
    pub main_body: Vec<String>,
}

impl CodeAnalysis {
    /// Variable the script binds its `Agent(...)` to
    pub fn agent_var(&self) -> String {
        let setup = self.agent_setup.join("\n");
        AGENT_ASSIGN
            .captures(&setup)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "agent".to_string())
    }

    /// Whether `main` is itself an async generator
    pub fn main_is_generator(&self) -> bool {
        self.main_body
            .iter()
            .any(|l| l.trim_start().starts_with("yield ") || l.trim() == "yield")
    }
}

/// Output of `adapt`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdaptedCode {
    /// Module-level imports, unindented
    pub imports: String,
    pub sync_code: Option<String>,
    pub streaming_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Import,
    Agent,
    Tool,
    Main,
    Skip,
}

/// Classify each line of `source` into imports, agent setup, tools and main body
pub fn analyze(source: &str) -> CodeAnalysis {
    let caps = capability::detect(source);
    let mut analysis = CodeAnalysis {
        streaming: caps.streaming,
        uses_mcp: caps.uses_mcp,
        has_custom_tools: caps.has_custom_tools,
        ..Default::default()
    };

    let lines: Vec<&str> = source.lines().collect();
    let mut section = Section::None;
    let mut block_indent = 0usize;
    let mut bracket_depth = 0i32;
    let mut in_triple_quote = false;
    let mut awaiting_def = false;

    for (idx, raw) in lines.iter().enumerate() {
        let line = raw.trim_end();
        let trimmed = line.trim();
        let indent = indent_of(line);

        // Inside a multi-line string or bracket: the line belongs to the current section
        if in_triple_quote || bracket_depth > 0 {
            push_line(&mut analysis, section, line);
            in_triple_quote ^= triple_quote_count(line) % 2 == 1;
            bracket_depth = (bracket_depth + bracket_delta(line)).max(0);
            continue;
        }

        if trimmed.is_empty() {
            let continues = next_non_blank_indent(&lines, idx + 1)
                .map(|next| next > block_indent)
                .unwrap_or(false);
            match section {
                Section::Main | Section::Tool | Section::Agent | Section::Skip if continues => {
                    push_line(&mut analysis, section, "");
                }
                _ => section = Section::None,
            }
            continue;
        }

        let continues_block = indent > block_indent
            && matches!(
                section,
                Section::Main | Section::Tool | Section::Agent | Section::Skip
            );
        let decorated_def = section == Section::Tool
            && awaiting_def
            && indent == block_indent
            && (trimmed.starts_with('@') || is_def(trimmed));

        if continues_block || decorated_def {
            if decorated_def && is_def(trimmed) {
                awaiting_def = false;
            }
            push_line(&mut analysis, section, line);
        } else if trimmed.starts_with('#') && indent == 0 {
            continue;
        } else {
            block_indent = indent;
            section = classify_start(trimmed);
            awaiting_def = section == Section::Tool && trimmed.starts_with('@');
            if section != Section::Main {
                push_line(&mut analysis, section, line);
            }
        }

        in_triple_quote ^= triple_quote_count(line) % 2 == 1;
        bracket_depth = (bracket_depth + bracket_delta(line)).max(0);
    }

    trim_trailing_blank(&mut analysis.imports);
    trim_trailing_blank(&mut analysis.agent_setup);
    trim_trailing_blank(&mut analysis.tool_definitions);
    trim_trailing_blank(&mut analysis.main_body);

    debug!(
        imports = analysis.imports.len(),
        agent_setup = analysis.agent_setup.len(),
        tools = analysis.tool_definitions.len(),
        main = analysis.main_body.len(),
        "Analyzed generated code"
    );
    analysis
}

fn classify_start(trimmed: &str) -> Section {
    if trimmed.starts_with("import ") || trimmed.starts_with("from ") {
        Section::Import
    } else if trimmed.starts_with("@") {
        Section::Tool
    } else if trimmed.starts_with("async def main(") {
        Section::Main
    } else if trimmed.starts_with("if __name__") || trimmed.starts_with("asyncio.run(") {
        Section::Skip
    } else if is_def(trimmed) || trimmed.starts_with("class ") {
        Section::Tool
    } else {
        Section::Agent
    }
}

fn is_def(trimmed: &str) -> bool {
    trimmed.starts_with("def ") || trimmed.starts_with("async def ")
}

fn push_line(analysis: &mut CodeAnalysis, section: Section, line: &str) {
    let target = match section {
        Section::Import => &mut analysis.imports,
        Section::Agent => &mut analysis.agent_setup,
        Section::Tool => &mut analysis.tool_definitions,
        Section::Main => &mut analysis.main_body,
        Section::None | Section::Skip => return,
    };
    target.push(line.to_string());
}

fn trim_trailing_blank(lines: &mut Vec<String>) {
    while lines.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
        lines.pop();
    }
}

fn next_non_blank_indent(lines: &[&str], from: usize) -> Option<usize> {
    lines[from.min(lines.len())..]
        .iter()
        .find(|l| !l.trim().is_empty())
        .map(|l| indent_of(l))
}

fn indent_of(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width += 4,
            _ => break,
        }
    }
    width
}

fn triple_quote_count(line: &str) -> usize {
    line.matches("\"\"\"").count() + line.matches("'''").count()
}

/// Net bracket depth change of a line, ignoring brackets inside simple string literals
fn bracket_delta(line: &str) -> i32 {
    let mut depth = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in line.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '#' => break,
            '"' | '\'' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ => {}
        }
    }
    depth
}

/// Strip the common leading indentation of non-blank lines
pub fn dedent(lines: &[String]) -> Vec<String> {
    let min = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| indent_of(l))
        .min()
        .unwrap_or(0);
    lines
        .iter()
        .map(|l| {
            if l.trim().is_empty() {
                String::new()
            } else {
                let expanded = l.replace('\t', "    ");
                expanded.chars().skip(min).collect()
            }
        })
        .collect()
}

/// Dedent `lines` then prefix every non-blank line with `width` spaces
pub fn reindent(lines: &[String], width: usize) -> Vec<String> {
    let pad = " ".repeat(width);
    dedent(lines)
        .into_iter()
        .map(|l| if l.is_empty() { l } else { format!("{pad}{l}") })
        .collect()
}

/// Adapt `source` to the requested runtime shape(s) at the default indentation
pub fn adapt(source: &str, shape: CodeShape) -> AdaptedCode {
    adapt_with_indent(source, shape, DEFAULT_INJECT_INDENT)
}

pub fn adapt_with_indent(source: &str, shape: CodeShape, indent: usize) -> AdaptedCode {
    let analysis = analyze(source);
    let agent_var = analysis.agent_var();

    let mut imports = analysis.imports.clone();
    if !imports.iter().any(|l| l.contains("Agent")) {
        imports.push("from strands import Agent".to_string());
    }

    let setup = if analysis.agent_setup.is_empty() {
        vec![format!("{agent_var} = Agent()")]
    } else {
        dedent(&analysis.agent_setup)
    };
    let tools = dedent(&analysis.tool_definitions);
    let body = bind_user_input(&dedent(&analysis.main_body));

    let sync_code = shape.wants_sync().then(|| {
        let body = if body.is_empty() {
            default_sync_body(&agent_var)
        } else {
            to_sync_body(&body)
        };
        assemble(&tools, &setup, &body, indent)
    });

    let streaming_code = shape.wants_streaming().then(|| {
        let setup = inject_callback_handler(&setup.join("\n"))
            .lines()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let body = if body.is_empty() {
            default_streaming_body(&agent_var)
        } else {
            to_streaming_body(&body, &agent_var)
        };
        assemble(&tools, &setup, &body, indent)
    });

    AdaptedCode {
        imports: imports.join("\n"),
        sync_code,
        streaming_code,
    }
}

fn assemble(tools: &[String], setup: &[String], body: &[String], indent: usize) -> String {
    let mut block = Vec::new();
    for part in [tools, setup, body] {
        if part.is_empty() {
            continue;
        }
        if !block.is_empty() {
            block.push(String::new());
        }
        block.extend(reindent(part, indent));
    }
    block.join("\n")
}

fn default_sync_body(agent_var: &str) -> Vec<String> {
    vec![
        format!("response = {agent_var}({USER_INPUT_VAR})"),
        "return str(response)".to_string(),
    ]
}

fn default_streaming_body(agent_var: &str) -> Vec<String> {
    stream_loop("", agent_var, USER_INPUT_VAR)
}

fn stream_loop(pad: &str, agent_var: &str, arg: &str) -> Vec<String> {
    vec![
        format!("{pad}async for event in {agent_var}.stream_async({arg}):"),
        format!("{pad}    if \"data\" in event:"),
        format!("{pad}        yield event[\"data\"]"),
    ]
}

/// Replace interactive `x = input(...)` prompts with the handler-provided input
fn bind_user_input(body: &[String]) -> Vec<String> {
    body.iter()
        .filter_map(|line| {
            let trimmed = line.trim();
            match INPUT_ASSIGN.captures(trimmed) {
                Some(c) if &c[1] == USER_INPUT_VAR => None,
                Some(c) => {
                    let pad = &line[..line.len() - line.trim_start().len()];
                    Some(format!("{pad}{} = {USER_INPUT_VAR}", &c[1]))
                }
                None => Some(line.clone()),
            }
        })
        .collect()
}

/// Extent of the indented block that starts after `lines[start]`
fn block_end(lines: &[String], start: usize) -> usize {
    let base = indent_of(&lines[start]);
    let mut end = start + 1;
    while end < lines.len() {
        let line = &lines[end];
        if line.trim().is_empty() {
            let deeper = lines[end..]
                .iter()
                .find(|l| !l.trim().is_empty())
                .map(|l| indent_of(l) > base)
                .unwrap_or(false);
            if !deeper {
                break;
            }
        } else if indent_of(line) <= base {
            break;
        }
        end += 1;
    }
    end
}

/// Join a statement that continues over unbalanced brackets, returning the
/// joined text and the index after its last line
fn joined_statement(lines: &[String], start: usize) -> (String, usize) {
    let mut text = lines[start].trim().to_string();
    let mut depth = bracket_delta(&lines[start]);
    let mut idx = start + 1;
    while depth > 0 && idx < lines.len() {
        text.push(' ');
        text.push_str(lines[idx].trim());
        depth += bracket_delta(&lines[idx]);
        idx += 1;
    }
    (text, idx)
}

/// `json.dumps({...})` → `{...}`; anything else is returned as is
fn unwrap_json_dumps(expr: &str) -> String {
    let expr = expr.trim();
    let Some(inner) = expr
        .strip_prefix("json.dumps(")
        .and_then(|rest| rest.strip_suffix(')'))
    else {
        return expr.to_string();
    };
    first_argument(inner).trim().to_string()
}

fn first_argument(args: &str) -> &str {
    let mut depth = 0;
    let mut quote: Option<char> = None;
    for (i, c) in args.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => return &args[..i],
            _ => {}
        }
    }
    args
}

/// Convert a generator-shaped body into one that returns a single result
pub fn to_sync_body(body: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < body.len() {
        let line = &body[i];
        let trimmed = line.trim();
        let pad = &line[..line.len() - line.trim_start().len()];

        if let Some(c) = ASYNC_FOR_STREAM.captures(trimmed) {
            out.push(format!("{pad}response = {}({})", &c[2], &c[3]));
            out.push(format!("{pad}return str(response)"));
            i = block_end(body, i);
            continue;
        }

        if trimmed == "yield" {
            out.push(format!("{pad}return None"));
            i += 1;
            continue;
        }

        if trimmed.starts_with("yield ") {
            let (statement, next) = joined_statement(body, i);
            let expr = statement.trim_start_matches("yield").trim();
            out.push(format!("{pad}return {}", unwrap_json_dumps(expr)));
            i = next;
            continue;
        }

        out.push(line.clone());
        i += 1;
    }
    out
}

/// Convert a single-result body into an async generator body
pub fn to_streaming_body(body: &[String], agent_var: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut response_var: Option<Regex> = None;
    let mut i = 0;
    while i < body.len() {
        let line = &body[i];
        let trimmed = line.trim();
        let pad = &line[..line.len() - line.trim_start().len()];

        if let Some(c) = CALL_ASSIGN.captures(trimmed) {
            if &c[2] == agent_var {
                out.extend(stream_loop(pad, agent_var, &c[3]));
                response_var = Regex::new(&format!(r"\b{}\b", regex::escape(&c[1]))).ok();
                i += 1;
                continue;
            }
        }

        let mentions_response = response_var
            .as_ref()
            .map(|re| re.is_match(trimmed))
            .unwrap_or(false);

        if trimmed.starts_with("return") {
            let (statement, next) = joined_statement(body, i);
            let expr = statement.trim_start_matches("return").trim();
            if !mentions_response && !expr.is_empty() {
                out.push(format!("{pad}yield {expr}"));
            }
            i = next;
            continue;
        }

        if mentions_response && trimmed.starts_with("print(") {
            i += 1;
            continue;
        }

        out.push(line.clone());
        i += 1;
    }
    out
}

/// Add `callback_handler=None` to every `Agent(...)` constructor lacking one
pub fn inject_callback_handler(setup: &str) -> String {
    let mut result = setup.to_string();
    let mut search_from = 0;

    while let Some(m) = AGENT_CTOR.find_at(&result, search_from) {
        let open = m.end() - 1;
        let Some(close) = matching_paren(&result, open) else {
            break;
        };
        let inner = &result[open + 1..close];
        if inner.contains("callback_handler") {
            search_from = close;
            continue;
        }

        let trimmed_len = inner.trim_end().len();
        let insert_at = open + 1 + trimmed_len;
        let addition = if trimmed_len == 0 {
            "callback_handler=None".to_string()
        } else if inner.trim_end().ends_with(',') {
            match inner.rfind('\n') {
                Some(_) => {
                    let arg_pad = inner
                        .lines()
                        .filter(|l| !l.trim().is_empty())
                        .last()
                        .map(|l| " ".repeat(indent_of(l)))
                        .unwrap_or_default();
                    format!("\n{arg_pad}callback_handler=None,")
                }
                None => " callback_handler=None".to_string(),
            }
        } else {
            ", callback_handler=None".to_string()
        };

        let replace_end = if inner.contains('\n') && trimmed_len > 0 {
            insert_at
        } else {
            close
        };
        result.replace_range(insert_at..replace_end, &addition);
        search_from = insert_at + addition.len();
    }
    result
}

fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0;
    let mut quote: Option<char> = None;
    for (i, c) in text[open..].char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}
