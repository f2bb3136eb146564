//! Tool-call content translation.
//!
//! Pure mappings between the subprocess's tool-use / tool-result payloads
//! and the protocol-visible tool-call model. Consulted by the permission
//! negotiator (titles) and by the turn loop (content). Payload shapes are
//! not statically guaranteed, so every branch degrades to a readable
//! placeholder instead of failing.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::acp::{
    ContentBlock, PlanEntry, PlanEntryPriority, PlanEntryStatus, ToolCallContent,
    ToolCallLocation, ToolKind,
};
use crate::protocol::{ToolResultBlock, ToolUseBlock};

/// Namespace prefix of the bridge's own proxied tools
/// (read/write/edit/execute/kill-shell/tail-output).
pub const TOOL_NAME_PREFIX: &str = "mcp__acp__";

/// The designated edit tools auto-approved in `acceptEdits` mode.
pub const EDIT_TOOL_NAMES: [&str; 2] = ["Edit", "Write"];

static SYSTEM_REMINDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<system-reminder>.*?</system-reminder>").expect("valid reminder regex")
});

static FENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^`{3,}").expect("valid fence regex"));

pub fn effective_tool_name(name: &str) -> &str {
    name.strip_prefix(TOOL_NAME_PREFIX).unwrap_or(name)
}

pub fn is_proxied_tool(name: &str) -> bool {
    name.starts_with(TOOL_NAME_PREFIX)
}

pub fn is_edit_tool(name: &str) -> bool {
    let name = effective_tool_name(name);
    EDIT_TOOL_NAMES
        .iter()
        .any(|edit| edit.eq_ignore_ascii_case(name))
}

/// Canonical protocol-visible shape of a tool invocation. Derived, never
/// stored: recomputed from the payload on every event.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInfo {
    pub title: String,
    pub kind: ToolKind,
    pub content: Vec<ToolCallContent>,
    pub locations: Vec<ToolCallLocation>,
}

/// Patch derived from a tool result. Absent fields leave the original
/// tool-call view untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolUpdatePatch {
    pub title: Option<String>,
    pub content: Option<Vec<ToolCallContent>>,
    pub locations: Option<Vec<ToolCallLocation>>,
}

fn input_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str)
}

fn input_u64(input: &Value, key: &str) -> Option<u64> {
    input.get(key).and_then(Value::as_u64)
}

fn first_line(text: &str) -> String {
    match text.split_once('\n') {
        Some((first, _)) => format!("{} …", first.trim_end()),
        None => text.to_string(),
    }
}

/// 1-based inclusive range suffix for read/search titles. `offset` is the
/// 0-based index the subprocess uses.
fn line_range_suffix(offset: Option<u64>, limit: Option<u64>) -> String {
    match (offset, limit) {
        (Some(offset), Some(limit)) => {
            format!(" (lines {}-{})", offset + 1, offset + limit)
        }
        (Some(offset), None) => format!(" (from line {})", offset + 1),
        (None, Some(limit)) => format!(" (lines 1-{limit})"),
        (None, None) => String::new(),
    }
}

fn read_info(input: &Value) -> ToolInfo {
    let path = input_str(input, "file_path")
        .or_else(|| input_str(input, "path"))
        .unwrap_or("");
    let offset = input_u64(input, "offset");
    let title = if path.is_empty() {
        "Read".to_string()
    } else {
        format!(
            "Read {path}{}",
            line_range_suffix(offset, input_u64(input, "limit"))
        )
    };
    let locations = if path.is_empty() {
        Vec::new()
    } else {
        vec![ToolCallLocation {
            path: path.to_string(),
            line: offset.map(|offset| offset + 1),
        }]
    };
    ToolInfo {
        title,
        kind: ToolKind::Read,
        content: Vec::new(),
        locations,
    }
}

fn edit_info(input: &Value) -> ToolInfo {
    let path = input_str(input, "file_path")
        .or_else(|| input_str(input, "path"))
        .unwrap_or("");
    let old_string = input_str(input, "old_string").map(ToOwned::to_owned);
    let new_string = input_str(input, "new_string").unwrap_or("").to_string();
    let content = if path.is_empty() {
        Vec::new()
    } else {
        vec![ToolCallContent::Diff {
            path: path.to_string(),
            old_text: old_string,
            new_text: new_string,
        }]
    };
    let locations = if path.is_empty() {
        Vec::new()
    } else {
        vec![ToolCallLocation {
            path: path.to_string(),
            line: None,
        }]
    };
    ToolInfo {
        title: format!("Edit {path}"),
        kind: ToolKind::Edit,
        content,
        locations,
    }
}

fn write_info(input: &Value) -> ToolInfo {
    let path = input_str(input, "file_path")
        .or_else(|| input_str(input, "path"))
        .unwrap_or("");
    let content_text = input_str(input, "content").unwrap_or("").to_string();
    let content = if path.is_empty() {
        Vec::new()
    } else {
        vec![ToolCallContent::Diff {
            path: path.to_string(),
            old_text: None,
            new_text: content_text,
        }]
    };
    let locations = if path.is_empty() {
        Vec::new()
    } else {
        vec![ToolCallLocation {
            path: path.to_string(),
            line: None,
        }]
    };
    ToolInfo {
        title: format!("Write {path}"),
        kind: ToolKind::Edit,
        content,
        locations,
    }
}

fn execute_info(input: &Value) -> ToolInfo {
    let command = input_str(input, "command").unwrap_or("");
    let title = if command.is_empty() {
        "Shell command".to_string()
    } else {
        first_line(command)
    };
    ToolInfo {
        title,
        kind: ToolKind::Execute,
        content: Vec::new(),
        locations: Vec::new(),
    }
}

/// grep-style title. Flags are collected and joined once so large flag
/// sets stay linear.
fn grep_title(input: &Value) -> String {
    let mut parts = vec!["grep".to_string()];
    if input.get("-i").and_then(Value::as_bool).unwrap_or(false) {
        parts.push("-i".to_string());
    }
    if input.get("-n").and_then(Value::as_bool).unwrap_or(false) {
        parts.push("-n".to_string());
    }
    for flag in ["-A", "-B", "-C"] {
        if let Some(count) = input.get(flag).and_then(Value::as_u64) {
            parts.push(format!("{flag} {count}"));
        }
    }
    if input
        .get("multiline")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        parts.push("-U".to_string());
    }
    if let Some(glob) = input_str(input, "glob") {
        parts.push(format!("--glob {glob}"));
    }
    if let Some(file_type) = input_str(input, "type") {
        parts.push(format!("--type {file_type}"));
    }
    if let Some(pattern) = input_str(input, "pattern") {
        parts.push(pattern.to_string());
    }
    if let Some(path) = input_str(input, "path") {
        parts.push(path.to_string());
    }
    parts.join(" ")
}

fn todo_title(input: &Value) -> String {
    let summaries: Vec<&str> = input
        .get("todos")
        .and_then(Value::as_array)
        .map(|todos| {
            todos
                .iter()
                .filter_map(|todo| todo.get("content").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if summaries.is_empty() {
        "Update todos".to_string()
    } else {
        summaries.join(", ")
    }
}

/// Total mapping from a tool-use payload to the protocol-visible tool call
/// shape. Unrecognized names fall through to a generic entry.
pub fn tool_info_from_tool_use(name: &str, input: &Value) -> ToolInfo {
    match effective_tool_name(name) {
        "Task" => ToolInfo {
            title: input_str(input, "description")
                .unwrap_or("Task")
                .to_string(),
            kind: ToolKind::Think,
            content: Vec::new(),
            locations: Vec::new(),
        },
        "Bash" | "execute" => execute_info(input),
        "KillShell" | "kill-shell" => ToolInfo {
            title: format!(
                "Kill shell {}",
                input_str(input, "shell_id").unwrap_or("?")
            ),
            kind: ToolKind::Execute,
            content: Vec::new(),
            locations: Vec::new(),
        },
        "TailOutput" | "tail-output" => ToolInfo {
            title: format!(
                "Tail output {}",
                input_str(input, "shell_id").unwrap_or("?")
            ),
            kind: ToolKind::Execute,
            content: Vec::new(),
            locations: Vec::new(),
        },
        "Glob" => {
            let pattern = input_str(input, "pattern").unwrap_or("");
            let title = match input_str(input, "path") {
                Some(path) => format!("Find {pattern} in {path}"),
                None => format!("Find {pattern}"),
            };
            ToolInfo {
                title,
                kind: ToolKind::Search,
                content: Vec::new(),
                locations: Vec::new(),
            }
        }
        "Grep" => ToolInfo {
            title: grep_title(input),
            kind: ToolKind::Search,
            content: Vec::new(),
            locations: Vec::new(),
        },
        "Read" | "read" => read_info(input),
        "Edit" | "edit" => edit_info(input),
        "Write" | "write" => write_info(input),
        "NotebookRead" => {
            let path = input_str(input, "notebook_path").unwrap_or("");
            ToolInfo {
                title: format!("Read notebook {path}"),
                kind: ToolKind::Read,
                content: Vec::new(),
                locations: vec![ToolCallLocation {
                    path: path.to_string(),
                    line: None,
                }],
            }
        }
        "NotebookEdit" => {
            let path = input_str(input, "notebook_path").unwrap_or("");
            let new_source = input_str(input, "new_source").unwrap_or("").to_string();
            ToolInfo {
                title: format!("Edit notebook {path}"),
                kind: ToolKind::Edit,
                content: vec![ToolCallContent::Diff {
                    path: path.to_string(),
                    old_text: None,
                    new_text: new_source,
                }],
                locations: vec![ToolCallLocation {
                    path: path.to_string(),
                    line: None,
                }],
            }
        }
        "WebFetch" => ToolInfo {
            title: format!("Fetch {}", input_str(input, "url").unwrap_or("")),
            kind: ToolKind::Fetch,
            content: Vec::new(),
            locations: Vec::new(),
        },
        "WebSearch" => ToolInfo {
            title: format!("Search \"{}\"", input_str(input, "query").unwrap_or("")),
            kind: ToolKind::Fetch,
            content: Vec::new(),
            locations: Vec::new(),
        },
        "TodoWrite" => ToolInfo {
            title: todo_title(input),
            kind: ToolKind::Think,
            content: Vec::new(),
            locations: Vec::new(),
        },
        "ExitPlanMode" => ToolInfo {
            title: "Exit plan mode".to_string(),
            kind: ToolKind::SwitchMode,
            content: Vec::new(),
            locations: Vec::new(),
        },
        _ => ToolInfo {
            title: name.to_string(),
            kind: ToolKind::Other,
            content: Vec::new(),
            locations: Vec::new(),
        },
    }
}

/// Patch for a previously seen tool call, derived from its result payload.
///
/// Error results short-circuit to a fenced error block regardless of the
/// tool. Otherwise dispatch is on the *originating* tool name: edit results
/// are parsed as a unified diff, read results are cleaned for markdown,
/// proxied tools produce no content (their result is already surfaced
/// through the edit/diff path), everything else gets the generic content
/// conversion.
pub fn tool_update_from_tool_result(
    result: &ToolResultBlock,
    tool_use: Option<&ToolUseBlock>,
) -> ToolUpdatePatch {
    if result.is_error.unwrap_or(false) {
        let text = result.content_text();
        if !text.is_empty() {
            return ToolUpdatePatch {
                content: Some(vec![ToolCallContent::text(markdown_escape(&text))]),
                ..Default::default()
            };
        }
    }

    let Some(tool_use) = tool_use else {
        return ToolUpdatePatch {
            content: Some(content_from_result(result)),
            ..Default::default()
        };
    };

    if is_proxied_tool(&tool_use.name) {
        return ToolUpdatePatch {
            content: Some(Vec::new()),
            ..Default::default()
        };
    }

    match tool_use.name.as_str() {
        "Edit" => {
            let fallback_path = input_str(&tool_use.input, "file_path").unwrap_or("");
            let (content, locations) = diff_content_from_result(result, fallback_path);
            if content.is_empty() {
                ToolUpdatePatch {
                    content: Some(content_from_result(result)),
                    ..Default::default()
                }
            } else {
                ToolUpdatePatch {
                    content: Some(content),
                    locations: Some(locations),
                    ..Default::default()
                }
            }
        }
        "Read" => {
            let cleaned = strip_system_reminders(&result.content_text());
            ToolUpdatePatch {
                content: Some(vec![ToolCallContent::text(markdown_escape(
                    cleaned.trim_end(),
                ))]),
                ..Default::default()
            }
        }
        _ => ToolUpdatePatch {
            content: Some(content_from_result(result)),
            ..Default::default()
        },
    }
}

/// Plan entries for a todo-list update, sent alongside the tool-call view.
pub fn plan_entries_from_todo_write(input: &Value) -> Option<Vec<PlanEntry>> {
    let todos = input.get("todos")?.as_array()?;
    let entries: Vec<PlanEntry> = todos
        .iter()
        .filter_map(|todo| {
            let content = todo.get("content")?.as_str()?;
            let status = match todo.get("status").and_then(Value::as_str) {
                Some("in_progress") => PlanEntryStatus::InProgress,
                Some("completed") => PlanEntryStatus::Completed,
                _ => PlanEntryStatus::Pending,
            };
            Some(PlanEntry {
                content: content.to_string(),
                priority: PlanEntryPriority::Medium,
                status,
            })
        })
        .collect();
    if entries.is_empty() {
        None
    } else {
        Some(entries)
    }
}

// ---------------------------------------------------------------------------
// Result content conversion
// ---------------------------------------------------------------------------

/// Generic conversion of a result payload: each content variant maps to a
/// text or image block, errors are fenced.
fn content_from_result(result: &ToolResultBlock) -> Vec<ToolCallContent> {
    match &result.content {
        Some(Value::String(text)) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![ToolCallContent::text(text.clone())]
            }
        }
        Some(Value::Array(blocks)) => blocks.iter().filter_map(content_from_result_block).collect(),
        _ => Vec::new(),
    }
}

fn content_from_result_block(block: &Value) -> Option<ToolCallContent> {
    let block_type = block.get("type").and_then(Value::as_str).unwrap_or("");
    match block_type {
        "text" => {
            let text = block.get("text").and_then(Value::as_str)?;
            Some(ToolCallContent::text(text))
        }
        "image" => {
            let source = block.get("source")?;
            match source.get("type").and_then(Value::as_str) {
                Some("base64") => Some(ToolCallContent::Content {
                    content: ContentBlock::Image {
                        data: source.get("data").and_then(Value::as_str)?.to_string(),
                        mime_type: source
                            .get("media_type")
                            .and_then(Value::as_str)
                            .unwrap_or("image/png")
                            .to_string(),
                        uri: None,
                    },
                }),
                Some("url") => Some(ToolCallContent::Content {
                    content: ContentBlock::Image {
                        data: String::new(),
                        mime_type: String::new(),
                        uri: source
                            .get("url")
                            .and_then(Value::as_str)
                            .map(ToOwned::to_owned),
                    },
                }),
                _ => None,
            }
        }
        "web_search_result" => {
            let title = block.get("title").and_then(Value::as_str).unwrap_or("");
            let url = block.get("url").and_then(Value::as_str).unwrap_or("");
            Some(ToolCallContent::text(format!("{title} ({url})")))
        }
        "web_search_tool_result" => {
            let lines: Vec<String> = block
                .get("content")
                .and_then(Value::as_array)
                .map(|results| {
                    results
                        .iter()
                        .map(|entry| {
                            let title = entry.get("title").and_then(Value::as_str).unwrap_or("");
                            let url = entry.get("url").and_then(Value::as_str).unwrap_or("");
                            format!("{title} ({url})")
                        })
                        .collect()
                })
                .unwrap_or_default();
            if lines.is_empty() {
                // Error-shaped payloads carry an object with an error code.
                let code = block
                    .pointer("/content/error_code")
                    .and_then(Value::as_str)
                    .unwrap_or("web search failed");
                Some(ToolCallContent::text(format!("```\n{code}\n```")))
            } else {
                Some(ToolCallContent::text(lines.join("\n")))
            }
        }
        "code_execution_tool_result" | "bash_code_execution_tool_result" => {
            let stdout = block
                .pointer("/content/stdout")
                .and_then(Value::as_str)
                .unwrap_or("");
            let stderr = block
                .pointer("/content/stderr")
                .and_then(Value::as_str)
                .unwrap_or("");
            let mut combined = String::new();
            if !stdout.is_empty() {
                combined.push_str(stdout);
            }
            if !stderr.is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(stderr);
            }
            if combined.is_empty() {
                None
            } else {
                Some(ToolCallContent::text(markdown_escape(&combined)))
            }
        }
        other if other.ends_with("_error") || block.get("error_code").is_some() => {
            let detail = block
                .get("error_code")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| block.to_string());
            Some(ToolCallContent::text(format!("```\n{detail}\n```")))
        }
        _ => {
            // Unknown variants stringify instead of raising.
            Some(ToolCallContent::text(block.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Unified diff parsing
// ---------------------------------------------------------------------------

fn diff_content_from_result(
    result: &ToolResultBlock,
    fallback_path: &str,
) -> (Vec<ToolCallContent>, Vec<ToolCallLocation>) {
    let hunks = parse_unified_diff(&result.content_text());
    let mut content = Vec::with_capacity(hunks.len());
    let mut locations = Vec::with_capacity(hunks.len());
    for hunk in hunks {
        let path = hunk
            .path
            .unwrap_or_else(|| fallback_path.to_string());
        locations.push(ToolCallLocation {
            path: path.clone(),
            line: hunk.new_start,
        });
        content.push(ToolCallContent::Diff {
            path,
            old_text: if hunk.old_lines.is_empty() {
                None
            } else {
                Some(hunk.old_lines.join("\n"))
            },
            new_text: hunk.new_lines.join("\n"),
        });
    }
    (content, locations)
}

#[derive(Debug, Default)]
struct DiffHunk {
    path: Option<String>,
    new_start: Option<u64>,
    old_lines: Vec<String>,
    new_lines: Vec<String>,
}

/// Hunk-by-hunk unified diff parse. `-`/`+`/context lines separate into the
/// old/new arrays; file headers set the path for subsequent hunks.
fn parse_unified_diff(text: &str) -> Vec<DiffHunk> {
    let mut hunks: Vec<DiffHunk> = Vec::new();
    let mut current_path: Option<String> = None;
    let mut current: Option<DiffHunk> = None;

    for line in text.lines() {
        if let Some(header) = line.strip_prefix("+++ ") {
            if let Some(hunk) = current.take() {
                hunks.push(hunk);
            }
            let path = header.trim();
            let path = path.strip_prefix("b/").unwrap_or(path);
            if path != "/dev/null" {
                current_path = Some(path.to_string());
            }
        } else if line.starts_with("--- ") || line.starts_with("diff ") {
            if let Some(hunk) = current.take() {
                hunks.push(hunk);
            }
        } else if let Some(header) = line.strip_prefix("@@") {
            if let Some(hunk) = current.take() {
                hunks.push(hunk);
            }
            current = Some(DiffHunk {
                path: current_path.clone(),
                new_start: parse_hunk_new_start(header),
                ..Default::default()
            });
        } else if current.is_some() {
            let mut hunk_ended = false;
            if let Some(hunk) = current.as_mut() {
                if let Some(removed) = line.strip_prefix('-') {
                    hunk.old_lines.push(removed.to_string());
                } else if let Some(added) = line.strip_prefix('+') {
                    hunk.new_lines.push(added.to_string());
                } else if let Some(context) = line.strip_prefix(' ') {
                    hunk.old_lines.push(context.to_string());
                    hunk.new_lines.push(context.to_string());
                } else if line.is_empty() {
                    hunk.old_lines.push(String::new());
                    hunk.new_lines.push(String::new());
                } else if line != "\\ No newline at end of file" {
                    // Prose after the hunk body ends the hunk.
                    hunk_ended = true;
                }
            }
            if hunk_ended {
                hunks.push(current.take().expect("hunk present"));
            }
        }
    }
    if let Some(hunk) = current.take() {
        hunks.push(hunk);
    }
    hunks
}

/// `@@ -a,b +c,d @@` → c (1-based new-file start line).
fn parse_hunk_new_start(header: &str) -> Option<u64> {
    let plus = header.split_whitespace().find(|part| part.starts_with('+'))?;
    let start = plus
        .trim_start_matches('+')
        .split(',')
        .next()
        .unwrap_or_default();
    start.parse().ok()
}

// ---------------------------------------------------------------------------
// Markdown helpers
// ---------------------------------------------------------------------------

/// Wrap text in a fenced code block, using one more backtick than any fence
/// already present so literal fences can't break rendering.
pub fn markdown_escape(text: &str) -> String {
    let mut fence = "```".to_string();
    for found in FENCE_REGEX.find_iter(text) {
        while found.as_str().len() >= fence.len() {
            fence.push('`');
        }
    }
    let trailing_newline = if text.ends_with('\n') { "" } else { "\n" };
    format!("{fence}\n{text}{trailing_newline}{fence}")
}

/// Drop internal `<system-reminder>` blocks from read output.
pub fn strip_system_reminders(text: &str) -> String {
    SYSTEM_REMINDER_REGEX.replace_all(text, "").to_string()
}
