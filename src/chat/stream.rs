//! Stream encoder.
//!
//! The engine reports progress as [`StreamFrame`]s through a [`FrameSink`];
//! the HTTP layer encodes each frame as one `data: <json>\n\n` event.

use serde::Serialize;
use tokio::sync::mpsc;

/// One client-visible event of a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamFrame {
    #[serde(rename_all = "camelCase")]
    Start { message_id: String },
    TextStart { id: String },
    TextDelta { id: String, delta: String },
    TextEnd { id: String },
    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable {
        tool_call_id: String,
        output: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputError {
        tool_call_id: String,
        error_text: String,
    },
    DataSystemMessage { id: String, data: SystemMessageData },
    DataAuthRequest { id: String, data: AuthRequestData },
    Finish,
    #[serde(rename_all = "camelCase")]
    Error { error_text: String },
    /// Terminal `[DONE]` marker; not a JSON frame.
    #[serde(skip)]
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMessageData {
    pub text: String,
    pub auth_request_id: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthRequestData {
    pub provider: String,
    /// `None` when the provider is not registered.
    pub authorization_url: Option<String>,
}

/// Encode a frame as one server-sent event.
pub fn encode_frame(frame: &StreamFrame) -> String {
    if let StreamFrame::Done = frame {
        return "data: [DONE]\n\n".to_string();
    }
    match serde_json::to_string(frame) {
        Ok(json) => format!("data: {json}\n\n"),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode stream frame");
            format!(
                "data: {}\n\n",
                serde_json::json!({"type": "error", "errorText": "failed to encode frame"})
            )
        }
    }
}

/// Sending half of a turn's frame stream.
///
/// Sends never fail: once the client has gone away frames are dropped and the
/// turn keeps running to completion.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::UnboundedSender<StreamFrame>,
}

impl FrameSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, frame: StreamFrame) {
        if self.tx.send(frame).is_err() {
            tracing::trace!("stream receiver dropped; discarding frame");
        }
    }

    /// Emit the `text-start` / `text-delta` / `text-end` triple.
    pub fn send_text(&self, id: &str, text: &str) {
        self.send(StreamFrame::TextStart { id: id.to_string() });
        self.send(StreamFrame::TextDelta {
            id: id.to_string(),
            delta: text.to_string(),
        });
        self.send(StreamFrame::TextEnd { id: id.to_string() });
    }
}
