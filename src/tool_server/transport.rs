//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with a tool server's container process:
//! - Writing JSON-RPC requests to stdin
//! - Reading JSON-RPC responses from stdout
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! The stream halves are boxed so the same transport runs over a child
//! process or an in-memory duplex.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::errors::ToolServerError;
use super::types::{JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Bi-directional JSON-RPC transport over a process's stdio.
pub struct StdioTransport {
    instance: String,
    /// `None` once the session has been closed.
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<BufReader<BoxedReader>>,
}

impl StdioTransport {
    pub fn new(instance: &str, stdin: BoxedWriter, stdout: BoxedReader) -> Self {
        Self {
            instance: instance.to_string(),
            writer: Mutex::new(Some(stdin)),
            reader: Mutex::new(BufReader::new(stdout)),
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// The reader lock is held for the whole exchange, so concurrent callers
    /// are served one at a time and never consume each other's responses.
    /// Lines that are not a response with the expected id are skipped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, ToolServerError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&req)
            .map_err(|e| self.error(format!("failed to serialize request: {e}")))?;
        json.push('\n');

        let mut reader = self.reader.lock().await;
        self.write_line(&json).await?;

        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.error("server stdout closed (process may have exited)".into()));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == id => return Ok(resp),
                // Stale response from a timed-out request, a notification,
                // or log output on stdout.
                _ => continue,
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ToolServerError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let mut json = serde_json::to_string(&notification)
            .map_err(|e| self.error(format!("failed to serialize notification: {e}")))?;
        json.push('\n');

        self.write_line(&json).await
    }

    /// Close stdin. Further requests fail with a transport error.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), ToolServerError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.error("session is closed".into()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.error(format!("failed to flush stdin: {e}")))
    }

    fn error(&self, reason: String) -> ToolServerError {
        ToolServerError::Transport {
            instance: self.instance.clone(),
            reason,
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `ToolServerError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, ToolServerError> {
    if let Some(err) = response.error {
        return Err(ToolServerError::Rpc {
            code: err.code,
            message: err.message,
        });
    }

    response.result.ok_or(ToolServerError::Rpc {
        code: -32603,
        message: "response missing both result and error".into(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Transport wired to an in-memory peer; returns the peer's halves.
    fn transport_pair() -> (
        StdioTransport,
        BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = split(ours);
        let (their_read, their_write) = split(theirs);
        let transport = StdioTransport::new("test", Box::new(our_write), Box::new(our_read));
        (transport, BufReader::new(their_read), their_write)
    }

    #[tokio::test]
    async fn test_request_skips_noise_and_foreign_ids() {
        let (transport, mut peer_in, mut peer_out) = transport_pair();

        let server = tokio::spawn(async move {
            let mut line = String::new();
            peer_in.read_line(&mut line).await.unwrap();
            let req: serde_json::Value = serde_json::from_str(&line).unwrap();
            let id = req["id"].as_u64().unwrap();
            assert_eq!(req["method"], "tools/list");

            let replies = format!(
                "starting up...\n\n{}\n{}\n",
                serde_json::json!({"jsonrpc": "2.0", "id": id + 1000, "result": {}}),
                serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {"tools": []}}),
            );
            peer_out.write_all(replies.as_bytes()).await.unwrap();
        });

        let resp = transport.request("tools/list", None).await.unwrap();
        assert_eq!(resp.result.unwrap()["tools"], serde_json::json!([]));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_fails_when_stdout_closes() {
        let (transport, peer_in, peer_out) = transport_pair();
        drop(peer_out);
        drop(peer_in);

        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, ToolServerError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_notify_after_close_fails() {
        let (transport, _peer_in, _peer_out) = transport_pair();
        transport.close().await;
        let err = transport.notify("notifications/initialized", None).await.unwrap_err();
        assert!(matches!(err, ToolServerError::Transport { .. }));
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            id: 1,
            result: None,
            error: Some(super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            ToolServerError::Rpc { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected Rpc, got {other:?}"),
        }
    }

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }
}
