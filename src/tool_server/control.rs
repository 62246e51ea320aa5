//! Classification of `tools/call` results into a [`ToolOutcome`].
//!
//! A tool server may prefix its content with a control frame (a text item
//! holding a JSON object with `xtrn_message_type`). The frame decides the
//! outcome and is never passed on to callers.

use super::types::{CallToolResult, ControlFrame, ControlMessageType, ToolOutcome};

/// `error_type` values that mean the user has to re-authenticate.
const AUTH_ERROR_TYPES: &[&str] = &[
    "AUTH_ERROR",
    "AUTH_INVALID_GRANT",
    "AUTH_MISSING_FIELDS",
    "AUTH_UNKNOWN_ERROR",
];

/// Classify a raw `tools/call` result.
///
/// `provider` is the OAuth provider of the instance's image, reported back
/// on `AuthRequired`.
pub fn classify(result: CallToolResult, provider: Option<&str>) -> ToolOutcome {
    let CallToolResult {
        mut content,
        is_error,
    } = result;

    let Some(frame) = content.first().and_then(parse_control_frame) else {
        return if is_error {
            ToolOutcome::ToolError { content }
        } else {
            ToolOutcome::Success { content }
        };
    };
    content.remove(0);

    match frame.xtrn_message_type {
        ControlMessageType::Response => ToolOutcome::Success { content },
        ControlMessageType::LlmErrorResponse => {
            ToolOutcome::ToolError {
                content: with_message(content, frame.message),
            }
        }
        ControlMessageType::Error => {
            let is_auth = frame
                .error_type
                .as_deref()
                .is_some_and(|t| AUTH_ERROR_TYPES.contains(&t));
            if is_auth {
                tracing::info!(
                    error_type = frame.error_type.as_deref().unwrap_or_default(),
                    provider = provider.unwrap_or_default(),
                    "tool server reported expired credentials"
                );
                ToolOutcome::AuthRequired {
                    provider: provider.map(str::to_string),
                }
            } else {
                ToolOutcome::ToolError {
                    content: with_message(content, frame.message),
                }
            }
        }
    }
}

fn parse_control_frame(item: &serde_json::Value) -> Option<ControlFrame> {
    if item.get("type").and_then(|t| t.as_str()) != Some("text") {
        return None;
    }
    let text = item.get("text")?.as_str()?;
    serde_json::from_str(text.trim()).ok()
}

/// Keep the frame's message as the only text when nothing else remains.
fn with_message(
    content: Vec<serde_json::Value>,
    message: Option<String>,
) -> Vec<serde_json::Value> {
    match message {
        Some(message) if content.is_empty() => {
            vec![serde_json::json!({"type": "text", "text": message})]
        }
        _ => content,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
