//! Line parsers for assistant CLI output.
//!
//! Each provider prints one JSON object per line. A parser turns a line
//! into zero or more [`ParsedItem`]s; the stream tracker decides which of
//! those become chunks and events.

use serde_json::Value;

use super::StreamChunk;
use crate::session::TokenUsage;

/// What one output line contributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedItem {
    /// Forward as a chunk.
    Chunk(StreamChunk),
    /// A tool finished (the assistant saw its result).
    ToolResult { id: String },
    /// Token usage report.
    Usage(TokenUsage),
    /// The structured final answer. The last one wins.
    FinalResult { content: String, is_error: bool },
    /// A structured error message, kept for diagnostics.
    ErrorMessage(String),
}

/// Provider-specific line parser.
pub trait OutputParser: Send + Sync {
    fn parse_line(&mut self, line: &str) -> Vec<ParsedItem>;
}

/// Lines that are not JSON are passed through as text.
fn plain_text(line: &str) -> Vec<ParsedItem> {
    if line.trim().is_empty() {
        return Vec::new();
    }
    vec![ParsedItem::Chunk(StreamChunk::TextDelta {
        content: format!("{line}\n"),
    })]
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn usage_from(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
    let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
    Some(TokenUsage {
        input_tokens: input,
        output_tokens: output,
    })
}

/// Parser for `claude -p --output-format stream-json --verbose`.
#[derive(Debug, Default)]
pub struct ClaudeParser;

impl OutputParser for ClaudeParser {
    fn parse_line(&mut self, line: &str) -> Vec<ParsedItem> {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return plain_text(line);
        };

        match str_field(&value, "type") {
            Some("assistant") => {
                let blocks = value
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                blocks.iter().filter_map(claude_block).collect()
            }
            Some("user") => value
                .pointer("/message/content")
                .and_then(Value::as_array)
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| str_field(b, "type") == Some("tool_result"))
                        .filter_map(|b| str_field(b, "tool_use_id"))
                        .map(|id| ParsedItem::ToolResult { id: id.to_string() })
                        .collect()
                })
                .unwrap_or_default(),
            Some("result") => {
                let is_error = value
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                    || str_field(&value, "subtype").is_some_and(|s| s.starts_with("error"));
                let mut items = Vec::new();
                if let Some(usage) = usage_from(&value) {
                    items.push(ParsedItem::Usage(usage));
                }
                let content = str_field(&value, "result").unwrap_or_default().to_string();
                if is_error {
                    let message = if content.is_empty() {
                        str_field(&value, "subtype").unwrap_or("error").to_string()
                    } else {
                        content.clone()
                    };
                    items.push(ParsedItem::ErrorMessage(message));
                }
                items.push(ParsedItem::FinalResult { content, is_error });
                items
            }
            Some("error") => {
                let message = value
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .or_else(|| str_field(&value, "message"))
                    .unwrap_or("unknown error");
                vec![ParsedItem::ErrorMessage(message.to_string())]
            }
            // system/init and anything newer carry nothing we forward
            _ => Vec::new(),
        }
    }
}

fn claude_block(block: &Value) -> Option<ParsedItem> {
    match str_field(block, "type")? {
        "text" => {
            let text = str_field(block, "text")?;
            (!text.is_empty()).then(|| {
                ParsedItem::Chunk(StreamChunk::TextDelta {
                    content: text.to_string(),
                })
            })
        }
        "thinking" => {
            let thinking = str_field(block, "thinking")?;
            Some(ParsedItem::Chunk(StreamChunk::Thinking {
                content: thinking.to_string(),
            }))
        }
        "tool_use" => Some(ParsedItem::Chunk(StreamChunk::ToolUse {
            tool: str_field(block, "name").unwrap_or("unknown").to_string(),
            id: str_field(block, "id").unwrap_or_default().to_string(),
        })),
        _ => None,
    }
}

/// Parser for `codex exec --json`.
#[derive(Debug, Default)]
pub struct CodexParser;

impl OutputParser for CodexParser {
    fn parse_line(&mut self, line: &str) -> Vec<ParsedItem> {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return plain_text(line);
        };
        let item = value.get("item");
        let item_type = item.and_then(|i| str_field(i, "type"));
        let item_id = item
            .and_then(|i| str_field(i, "id"))
            .unwrap_or_default()
            .to_string();

        match (str_field(&value, "type"), item_type) {
            (Some("item.started"), Some(kind)) if is_codex_tool(kind) => {
                vec![ParsedItem::Chunk(StreamChunk::ToolUse {
                    tool: kind.to_string(),
                    id: item_id,
                })]
            }
            (Some("item.completed"), Some("agent_message")) => {
                let text = item
                    .and_then(|i| str_field(i, "text"))
                    .unwrap_or_default()
                    .to_string();
                if text.is_empty() {
                    return Vec::new();
                }
                vec![
                    ParsedItem::Chunk(StreamChunk::TextDelta {
                        content: text.clone(),
                    }),
                    ParsedItem::FinalResult {
                        content: text,
                        is_error: false,
                    },
                ]
            }
            (Some("item.completed"), Some("reasoning")) => {
                let text = item
                    .and_then(|i| str_field(i, "text"))
                    .unwrap_or_default()
                    .to_string();
                vec![ParsedItem::Chunk(StreamChunk::Thinking { content: text })]
            }
            (Some("item.completed"), Some(kind)) if is_codex_tool(kind) => {
                vec![ParsedItem::ToolResult { id: item_id }]
            }
            (Some("turn.completed"), _) => usage_from(&value).map(ParsedItem::Usage).into_iter().collect(),
            (Some("turn.failed"), _) => {
                let message = value
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("turn failed");
                vec![ParsedItem::ErrorMessage(message.to_string())]
            }
            (Some("error"), _) => {
                let message = str_field(&value, "message").unwrap_or("unknown error");
                vec![ParsedItem::ErrorMessage(message.to_string())]
            }
            _ => Vec::new(),
        }
    }
}

fn is_codex_tool(kind: &str) -> bool {
    matches!(
        kind,
        "command_execution" | "file_change" | "mcp_tool_call" | "web_search"
    )
}
