//! Converts persisted messages into the provider's message format.
//!
//! Every ToolCallRequest must be answered before the next non-tool message,
//! otherwise OpenAI-compatible providers reject the request. Calls left
//! unanswered by an auth interrupt or an aborted turn get a synthetic result
//! here; the store itself is never altered.

use std::collections::HashSet;

use crate::inference::{ChatMessage, Role, ToolCallResponse};
use crate::inference::types::FunctionCallResponse;
use crate::store::{MessageRole, Part, StoredMessage};

/// Result shown to the model for a call that never ran.
pub const NOT_EXECUTED: &str = "Tool call was not executed.";

/// Convert a chat's full history to provider messages.
pub fn to_provider_messages(messages: &[StoredMessage]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        let msg = &messages[i];
        i += 1;

        match msg.role {
            MessageRole::Human => out.push(ChatMessage::user(&joined_text(&msg.parts))),
            MessageRole::System => out.push(ChatMessage::system(&joined_text(&msg.parts))),
            MessageRole::Tool => push_tool_results(&mut out, &msg.parts, &mut HashSet::new()),
            MessageRole::Assistant => {
                let calls = tool_call_requests(&msg.parts);
                let text = joined_text(&msg.parts);
                out.push(ChatMessage {
                    role: Role::Assistant,
                    content: (!text.is_empty()).then_some(text),
                    tool_call_id: None,
                    tool_calls: (!calls.is_empty()).then(|| calls.clone()),
                });

                if calls.is_empty() {
                    continue;
                }

                // Consume the contiguous tool messages answering this reply.
                let mut answered = HashSet::new();
                while i < messages.len() && messages[i].role == MessageRole::Tool {
                    push_tool_results(&mut out, &messages[i].parts, &mut answered);
                    i += 1;
                }

                for call in calls.iter().filter(|c| !answered.contains(&c.id)) {
                    tracing::debug!(tool_call_id = %call.id, "adding synthetic result for unanswered call");
                    out.push(ChatMessage::tool(&call.id, NOT_EXECUTED.to_string()));
                }
            }
        }
    }

    out
}

/// Render a tool result's content array for the model: text items joined by
/// newlines, anything else as JSON.
pub fn render_tool_content(content: &[serde_json::Value]) -> String {
    content
        .iter()
        .map(|item| match (item.get("type").and_then(|t| t.as_str()), item.get("text")) {
            (Some("text"), Some(serde_json::Value::String(text))) => text.clone(),
            _ => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn push_tool_results(out: &mut Vec<ChatMessage>, parts: &[Part], answered: &mut HashSet<String>) {
    for part in parts {
        if let Part::ToolCallResult {
            tool_call_id,
            content,
            ..
        } = part
        {
            answered.insert(tool_call_id.clone());
            out.push(ChatMessage::tool(tool_call_id, render_stored_content(content)));
        }
    }
}

fn render_stored_content(raw: &str) -> String {
    match serde_json::from_str::<Vec<serde_json::Value>>(raw) {
        Ok(items) => render_tool_content(&items),
        Err(_) => raw.to_string(),
    }
}

fn joined_text(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            Part::Text { content } => Some(content.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn tool_call_requests(parts: &[Part]) -> Vec<ToolCallResponse> {
    let mut requests: Vec<(u32, ToolCallResponse)> = parts
        .iter()
        .filter_map(|p| match p {
            Part::ToolCallRequest {
                id,
                name,
                arguments,
                index,
            } => Some((
                *index,
                ToolCallResponse {
                    id: id.clone(),
                    r#type: "function".to_string(),
                    function: FunctionCallResponse {
                        name: name.clone(),
                        arguments: arguments.clone(),
                    },
                },
            )),
            _ => None,
        })
        .collect();
    requests.sort_by_key(|(index, _)| *index);
    requests.into_iter().map(|(_, r)| r).collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(id: &str, role: MessageRole, parts: Vec<Part>) -> StoredMessage {
        StoredMessage {
            id: id.into(),
            chat_id: "chat".into(),
            role,
            parts,
            auth_request_id: None,
            stop_reason: None,
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    fn request(id: &str, index: u32) -> Part {
        Part::ToolCallRequest {
            id: id.into(),
            name: "inst___search".into(),
            arguments: "{\"q\":\"x\"}".into(),
            index,
        }
    }

    fn result(id: &str, text: &str) -> Part {
        Part::ToolCallResult {
            tool_call_id: id.into(),
            content: json!([{"type": "text", "text": text}]).to_string(),
            is_error: false,
        }
    }

    #[test]
    fn test_text_only_history() {
        let messages = vec![
            stored("1", MessageRole::Human, vec![Part::Text { content: "Hello".into() }]),
            stored("2", MessageRole::Assistant, vec![Part::Text { content: "Hi".into() }]),
        ];
        let out = to_provider_messages(&messages);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, Role::User);
        assert_eq!(out[1].role, Role::Assistant);
        assert_eq!(out[1].content.as_deref(), Some("Hi"));
        assert!(out[1].tool_calls.is_none());
    }

    #[test]
    fn test_tool_calls_keep_ids_names_arguments_and_index_order() {
        let messages = vec![
            stored("1", MessageRole::Human, vec![Part::Text { content: "go".into() }]),
            stored("2", MessageRole::Assistant, vec![request("b", 1), request("a", 0)]),
            stored("3", MessageRole::Tool, vec![result("a", "first")]),
            stored("4", MessageRole::Tool, vec![result("b", "second")]),
        ];
        let out = to_provider_messages(&messages);
        let calls = out[1].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[1].id, "b");
        assert_eq!(calls[0].function.arguments, "{\"q\":\"x\"}");
        assert!(out[1].content.is_none());
        assert_eq!(out[2].tool_call_id.as_deref(), Some("a"));
        assert_eq!(out[2].content.as_deref(), Some("first"));
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_unanswered_calls_get_synthetic_results_before_system_message() {
        let messages = vec![
            stored("1", MessageRole::Human, vec![Part::Text { content: "go".into() }]),
            stored("2", MessageRole::Assistant, vec![request("a", 0), request("b", 1)]),
            stored("3", MessageRole::Tool, vec![result("a", "denied")]),
            stored("4", MessageRole::System, vec![Part::Text { content: "disabled".into() }]),
        ];
        let out = to_provider_messages(&messages);
        assert_eq!(out.len(), 5);
        assert_eq!(out[3].role, Role::Tool);
        assert_eq!(out[3].tool_call_id.as_deref(), Some("b"));
        assert_eq!(out[3].content.as_deref(), Some(NOT_EXECUTED));
        assert_eq!(out[4].role, Role::System);
    }

    #[test]
    fn test_render_tool_content_mixes_text_and_json() {
        let content = vec![
            json!({"type": "text", "text": "line one"}),
            json!({"type": "image", "data": "abc", "mimeType": "image/png"}),
        ];
        let rendered = render_tool_content(&content);
        let mut lines = rendered.lines();
        assert_eq!(lines.next(), Some("line one"));
        assert!(lines.next().unwrap().contains("\"mimeType\":\"image/png\""));
    }

    #[test]
    fn test_unparseable_stored_content_is_passed_through() {
        assert_eq!(render_stored_content("plain text"), "plain text");
    }
}
