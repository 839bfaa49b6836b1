//! Pure parsing of one line of the agent's streaming JSON output into
//! zero or more [`ResponseChunk`]s.
//!
//! Generalises the Claude CLI event dispatcher this crate started from:
//! that code matched on `content_block_start` / `content_block_delta` /
//! `result` to build session events. Here the agent emits whole messages
//! rather than per-token content-block deltas, so the dispatch is over
//! `system` / `assistant` / `user` / `stream_event` / `result` instead,
//! but the shape of the dispatcher — match on a `type` tag, pull fields
//! out by JSON pointer, fall back quietly on anything unrecognised — is
//! carried over directly.

use serde_json::Value;

use crate::error::RunnerError;
use crate::types::{ModelUsage, ResponseChunk, StreamStats, TodoItem, ToolResultSummary};

/// Parse one line of agent stdout into zero or more chunks.
///
/// A line that is not valid JSON, or whose `type` is not recognised,
/// yields no chunks rather than an error — unrecognised agent output is
/// swallowed, not fatal.
#[must_use]
pub fn parse_line(line: &str, has_partial_messages: bool) -> Vec<ResponseChunk> {
    match serde_json::from_str::<Value>(line) {
        Ok(event) => parse_event(&event, has_partial_messages),
        Err(_) => Vec::new(),
    }
}

/// Parse an already-decoded event object. Exposed separately so callers
/// that need the raw `Value` for out-of-band bookkeeping (token deltas,
/// session id capture, subagent flagging) don't have to re-parse the line.
#[must_use]
pub fn parse_event(event: &Value, has_partial_messages: bool) -> Vec<ResponseChunk> {
    match event.get("type").and_then(Value::as_str).unwrap_or("") {
        "assistant" => parse_assistant_message(event, has_partial_messages),
        "user" => parse_user_message(event),
        "result" => parse_result_message(event),
        // "system" (session init) and "stream_event" (token deltas) carry
        // no content chunks of their own; the caller inspects them
        // directly for session-id capture and token accounting.
        _ => Vec::new(),
    }
}

/// Whether this message is part of a subagent's activity rather than the
/// top-level conversation.
#[must_use]
pub fn is_subagent_message(event: &Value) -> bool {
    event
        .get("parent_tool_use_id")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.is_empty())
}

fn parse_assistant_message(event: &Value, has_partial_messages: bool) -> Vec<ResponseChunk> {
    let Some(content) = event.pointer("/message/content").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut chunks = Vec::new();
    for item in content {
        match item.get("type").and_then(Value::as_str).unwrap_or("") {
            "text" => {
                // When partial messages are streamed separately via
                // `stream_event`, the batched text here would duplicate
                // what the consumer already saw incrementally.
                if has_partial_messages {
                    continue;
                }
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    chunks.push(ResponseChunk::Text {
                        content: text.to_string(),
                    });
                }
            }
            "tool_use" => {
                let name = item.get("name").and_then(Value::as_str).unwrap_or("tool");
                let use_id = item.get("id").and_then(Value::as_str).unwrap_or("").to_string();
                let input = item.get("input").unwrap_or(&Value::Null);

                if name == "TodoWrite" {
                    if let Some(items) = parse_todo_items(input) {
                        chunks.push(ResponseChunk::TodoUpdate { items });
                        continue;
                    }
                }

                chunks.push(ResponseChunk::ToolUse {
                    name: name.to_string(),
                    input_description: describe_input(name, input),
                    use_id,
                });
            }
            _ => {}
        }
    }
    chunks
}

fn parse_todo_items(input: &Value) -> Option<Vec<TodoItem>> {
    let raw = input.get("todos").and_then(Value::as_array)?;
    let mut items = Vec::with_capacity(raw.len());
    for entry in raw {
        let content = entry.get("content").and_then(Value::as_str)?.to_string();
        let status = entry.get("status").and_then(Value::as_str)?.to_string();
        items.push(TodoItem { content, status });
    }
    Some(items)
}

/// Best-effort short description of a tool call's input, for display
/// alongside its name. Path-like inputs are shortened to the final
/// path component; everything else falls back to the first non-empty
/// string value, truncated.
fn describe_input(name: &str, input: &Value) -> String {
    if let Some(path) = input.get("file_path").and_then(Value::as_str) {
        return basename(path);
    }
    if let Some(pattern) = input.get("pattern").and_then(Value::as_str) {
        return pattern.to_string();
    }
    if let Some(command) = input.get("command").and_then(Value::as_str) {
        return truncate(command, 40);
    }
    let _ = name;
    first_string_value(input)
        .map(|s| truncate(&s, 40))
        .unwrap_or_default()
}

fn basename(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn first_string_value(input: &Value) -> Option<String> {
    input.as_object()?.values().find_map(|v| {
        v.as_str()
            .filter(|s| !s.is_empty())
            .map(std::string::ToString::to_string)
    })
}

fn parse_user_message(event: &Value) -> Vec<ResponseChunk> {
    let Some(content) = event.pointer("/message/content").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut chunks = Vec::new();
    for item in content {
        let is_tool_result = item.get("type").and_then(Value::as_str) == Some("tool_result");
        let use_id = item
            .get("tool_use_id")
            .or_else(|| item.get("toolUseId"))
            .and_then(Value::as_str);

        // A content item counts as a tool result if it carries a
        // tool-use-id, or if it declares itself one by type even without
        // an id (observed with some malformed agent output).
        if !is_tool_result && use_id.is_none() {
            continue;
        }

        let summary = item
            .get("tool_use_result")
            .or_else(|| item.get("toolUseResult"))
            .and_then(summarize_tool_result);

        chunks.push(ResponseChunk::ToolResult {
            use_id: use_id.unwrap_or_default().to_string(),
            summary,
        });
    }
    chunks
}

/// Best-effort summarisation of a `tool_use_result` sibling value. The
/// field's shape is inferred from observed agent output rather than
/// documented, so anything unrecognised falls back to `Raw` and a
/// missing sibling yields `None` rather than an error.
fn summarize_tool_result(value: &Value) -> Option<ToolResultSummary> {
    if let Some(obj) = value.as_object() {
        if let Some(path) = obj.get("file_path").and_then(Value::as_str) {
            let start_line = obj
                .get("start_line")
                .or_else(|| obj.get("startLine"))
                .and_then(Value::as_u64)
                .unwrap_or(1);
            let end_line = obj
                .get("end_line")
                .or_else(|| obj.get("endLine"))
                .and_then(Value::as_u64)
                .unwrap_or(start_line);
            return Some(ToolResultSummary::ReadRange {
                path: path.to_string(),
                start_line,
                end_line,
            });
        }
        if let Some(count) = obj
            .get("count")
            .or_else(|| obj.get("numFiles"))
            .and_then(Value::as_u64)
        {
            return Some(ToolResultSummary::GlobCount { count });
        }
        if let Some(code) = obj
            .get("exit_code")
            .or_else(|| obj.get("exitCode"))
            .and_then(Value::as_i64)
        {
            return Some(ToolResultSummary::ShellExit { code: code as i32 });
        }
        if obj.get("applied").and_then(Value::as_bool) == Some(true) {
            return Some(ToolResultSummary::Applied);
        }
    }
    if let Some(s) = value.as_str() {
        if s == "applied" {
            return Some(ToolResultSummary::Applied);
        }
        return Some(ToolResultSummary::Raw(s.to_string()));
    }
    None
}

fn parse_result_message(event: &Value) -> Vec<ResponseChunk> {
    let mut chunks = Vec::new();

    let mut stats = StreamStats {
        output_tokens: event
            .pointer("/usage/output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cost_usd: event.get("total_cost_usd").and_then(Value::as_f64),
        cache_read_tokens: event
            .pointer("/usage/cache_read_input_tokens")
            .and_then(Value::as_u64),
        cache_write_tokens: event
            .pointer("/usage/cache_creation_input_tokens")
            .and_then(Value::as_u64),
        duration_ms: event.get("duration_ms").and_then(Value::as_u64),
        duration_api_ms: event.get("duration_api_ms").and_then(Value::as_u64),
        per_model: std::collections::HashMap::new(),
    };

    if let Some(model_usage) = event.get("modelUsage").and_then(Value::as_object) {
        for (model, usage) in model_usage {
            stats.per_model.insert(
                model.clone(),
                ModelUsage {
                    output_tokens: usage
                        .get("outputTokens")
                        .or_else(|| usage.get("output_tokens"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                    cost_usd: usage
                        .get("costUSD")
                        .or_else(|| usage.get("cost_usd"))
                        .and_then(Value::as_f64),
                },
            );
        }
    }

    chunks.push(ResponseChunk::StreamStats(stats));

    let subtype = event.get("subtype").and_then(Value::as_str).unwrap_or("");
    let explicit_error = event
        .get("error")
        .and_then(Value::as_str)
        .map(std::string::ToString::to_string)
        .or_else(|| {
            event
                .get("errors")
                .and_then(Value::as_array)
                .filter(|errs| !errs.is_empty())
                .map(|errs| {
                    errs.iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("; ")
                })
        });

    if let Some(message) = explicit_error {
        chunks.push(ResponseChunk::Error {
            err: RunnerError::AgentLogical { message },
        });
    } else if !subtype.is_empty() && subtype != "success" {
        chunks.push(ResponseChunk::Error {
            err: RunnerError::AgentLogical {
                message: format!("agent result subtype: {subtype}"),
            },
        });
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_text() {
        let chunks = parse_line(
            r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"Hello"}]}}"#,
            false,
        );
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], ResponseChunk::Text { content } if content == "Hello"));
    }

    #[test]
    fn suppresses_assistant_text_when_partial_messages_enabled() {
        let chunks = parse_line(
            r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"Hello"}]}}"#,
            true,
        );
        assert!(chunks.is_empty());
    }

    #[test]
    fn parses_tool_use_with_path_description() {
        let chunks = parse_line(
            r#"{"type":"assistant","message":{"id":"m1","content":[
                {"type":"tool_use","id":"call_1","name":"Read","input":{"file_path":"/a/b/c.go"}}
            ]}}"#,
            false,
        );
        match &chunks[0] {
            ResponseChunk::ToolUse {
                name,
                input_description,
                use_id,
            } => {
                assert_eq!(name, "Read");
                assert_eq!(input_description, "c.go");
                assert_eq!(use_id, "call_1");
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn parses_todo_write_into_todo_update() {
        let chunks = parse_line(
            r#"{"type":"assistant","message":{"id":"m1","content":[
                {"type":"tool_use","id":"call_2","name":"TodoWrite","input":{"todos":[
                    {"content":"write tests","status":"pending"}
                ]}}
            ]}}"#,
            false,
        );
        match &chunks[0] {
            ResponseChunk::TodoUpdate { items } => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].content, "write tests");
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn malformed_todo_write_falls_back_to_tool_use() {
        let chunks = parse_line(
            r#"{"type":"assistant","message":{"id":"m1","content":[
                {"type":"tool_use","id":"call_3","name":"TodoWrite","input":{"not_todos":true}}
            ]}}"#,
            false,
        );
        assert!(matches!(&chunks[0], ResponseChunk::ToolUse { name, .. } if name == "TodoWrite"));
    }

    #[test]
    fn parses_user_tool_result_with_read_summary() {
        let chunks = parse_line(
            r#"{"type":"user","message":{"content":[
                {"type":"tool_result","tool_use_id":"call_1","tool_use_result":{"file_path":"/a/b.go","start_line":1,"end_line":20}}
            ]}}"#,
            false,
        );
        match &chunks[0] {
            ResponseChunk::ToolResult { use_id, summary } => {
                assert_eq!(use_id, "call_1");
                assert!(matches!(summary, Some(ToolResultSummary::ReadRange { .. })));
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn tool_result_typed_item_without_id_still_yields_a_chunk() {
        let chunks = parse_line(
            r#"{"type":"user","message":{"content":[
                {"type":"tool_result","tool_use_result":{"exit_code":0}}
            ]}}"#,
            false,
        );
        match &chunks[0] {
            ResponseChunk::ToolResult { use_id, summary } => {
                assert_eq!(use_id, "");
                assert!(matches!(summary, Some(ToolResultSummary::ShellExit { code: 0 })));
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn untyped_item_without_tool_use_id_is_skipped() {
        let chunks = parse_line(
            r#"{"type":"user","message":{"content":[
                {"type":"text","text":"not a tool result"}
            ]}}"#,
            false,
        );
        assert!(chunks.is_empty());
    }

    #[test]
    fn missing_tool_use_result_yields_no_summary_not_an_error() {
        let chunks = parse_line(
            r#"{"type":"user","message":{"content":[
                {"type":"tool_result","tool_use_id":"call_1"}
            ]}}"#,
            false,
        );
        match &chunks[0] {
            ResponseChunk::ToolResult { summary, .. } => assert!(summary.is_none()),
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn parses_result_message_success() {
        let chunks = parse_line(
            r#"{"type":"result","subtype":"success","usage":{"output_tokens":5},"total_cost_usd":0.001}"#,
            false,
        );
        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            ResponseChunk::StreamStats(stats) => {
                assert_eq!(stats.output_tokens, 5);
                assert_eq!(stats.cost_usd, Some(0.001));
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn parses_result_message_error_subtype() {
        let chunks = parse_line(r#"{"type":"result","subtype":"error_max_turns"}"#, false);
        assert_eq!(chunks.len(), 2);
        assert!(matches!(&chunks[1], ResponseChunk::Error { .. }));
    }

    #[test]
    fn detects_subagent_messages_via_parent_tool_use_id() {
        let value: Value =
            serde_json::from_str(r#"{"type":"assistant","parent_tool_use_id":"call_9"}"#).unwrap();
        assert!(is_subagent_message(&value));
        let value: Value = serde_json::from_str(r#"{"type":"assistant"}"#).unwrap();
        assert!(!is_subagent_message(&value));
    }

    #[test]
    fn invalid_json_yields_no_chunks() {
        assert!(parse_line("not json", false).is_empty());
    }
}
