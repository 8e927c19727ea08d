//! Tool-call markup parser.
//!
//! Extracts every `<tool name="…" key="value" …/>` and
//! `<tool name="…" …>inline content</tool>` element from a complete model
//! response, in order of appearance. Element boundaries follow the same rules
//! as the streaming [`TagFilter`](super::tag_filter::TagFilter), so whatever
//! the user did not see is exactly what gets parsed.
//!
//! Malformed elements are skipped, never fatal: a response whose markup is all
//! malformed simply has no tool calls and is treated as plain narration.

use std::collections::BTreeMap;

use super::tag_filter::{match_open, scan_element, OpenMatch};
use super::types::ToolCall;

/// Parse all well-formed tool elements from `text`.
pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut pos = 0;

    while let Some(offset) = text[pos..].find('<') {
        let start = pos + offset;
        let rest = &text[start..];

        if match_open(rest) != OpenMatch::Yes {
            pos = start + 1;
            continue;
        }

        let Some(span) = scan_element(rest) else {
            tracing::debug!(at = start, "unterminated tool element, skipping");
            break;
        };

        let element = &rest[..span.end];
        match parse_element(element, span.open_tag_end, span.self_closing) {
            Ok(call) => calls.push(call),
            Err(reason) => {
                tracing::debug!(
                    at = start,
                    reason = %reason,
                    element = %crate::agent_core::tokens::truncate_utf8(element, 120),
                    "skipping malformed tool element"
                );
            }
        }

        pos = start + span.end;
    }

    calls
}

/// Parse one complete element. `open_tag_end` is one past the opening `>`.
fn parse_element(element: &str, open_tag_end: usize, self_closing: bool) -> Result<ToolCall, String> {
    let tag_body_end = if self_closing {
        open_tag_end - 2
    } else {
        open_tag_end - 1
    };
    let attributes = parse_attributes(&element["<tool".len()..tag_body_end])?;

    let mut parameters = BTreeMap::new();
    let mut name = None;
    for (key, value) in attributes {
        if key == "name" {
            name = Some(value);
        } else {
            parameters.insert(key, value);
        }
    }

    let name = match name {
        Some(n) if !n.trim().is_empty() => n.trim().to_string(),
        _ => return Err("missing name attribute".to_string()),
    };

    let inline_content = if self_closing {
        None
    } else {
        let body = &element[open_tag_end..element.len() - "</tool>".len()];
        Some(strip_leading_newline(body).to_string())
    };

    let mut call = ToolCall::new(name);
    call.parameters = parameters;
    call.inline_content = inline_content;
    Ok(call)
}

/// The newline right after `>` is layout, not payload.
fn strip_leading_newline(body: &str) -> &str {
    body.strip_prefix("\r\n")
        .or_else(|| body.strip_prefix('\n'))
        .unwrap_or(body)
}

/// Parse `key="value" key2='value2'` pairs. Later duplicates win.
fn parse_attributes(input: &str) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    let mut chars = input.char_indices().peekable();

    loop {
        while chars.peek().is_some_and(|(_, c)| c.is_whitespace()) {
            chars.next();
        }
        let Some(&(key_start, first)) = chars.peek() else {
            break;
        };
        if !(first.is_alphanumeric() || first == '_') {
            return Err(format!("unexpected character '{first}' in attributes"));
        }

        let mut key_end = key_start;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':') {
                key_end = i + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let key = &input[key_start..key_end];

        while chars.peek().is_some_and(|(_, c)| c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            Some((_, '=')) => {}
            _ => return Err(format!("attribute '{key}' has no value")),
        }
        while chars.peek().is_some_and(|(_, c)| c.is_whitespace()) {
            chars.next();
        }

        let quote = match chars.next() {
            Some((_, q @ ('"' | '\''))) => q,
            _ => return Err(format!("attribute '{key}' value is not quoted")),
        };
        let mut value_start = None;
        let mut value_end = None;
        for (i, c) in chars.by_ref() {
            if value_start.is_none() {
                value_start = Some(i);
            }
            if c == quote {
                value_end = Some(i);
                break;
            }
        }
        let (Some(start), Some(end)) = (value_start, value_end) else {
            return Err(format!("attribute '{key}' value is unterminated"));
        };

        out.push((key.to_string(), unescape(&input[start..end])));
    }

    Ok(out)
}

/// Decode the five XML entities.
fn unescape(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

// ─── Tests ──────────────────────────────────────────────────────────────────
