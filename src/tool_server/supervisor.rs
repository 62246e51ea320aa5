//! Tool server process supervision.
//!
//! Spawns the container for one instance, attaches a JSON-RPC session to its
//! stdio, drains its stderr in the background and performs the MCP
//! `initialize` handshake. The process is owned by [`ToolServerProcess`]
//! until [`ToolSession::shutdown`] releases it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::errors::ToolServerError;
use super::transport::{extract_result, StdioTransport};
use super::types::{CallToolResult, ListToolsResult, McpTool, MCP_PROTOCOL_VERSION};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for the initialize handshake.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Session Trait ───────────────────────────────────────────────────────────

/// An initialized MCP session with a tool server.
///
/// The facade only talks to this trait, so it can be served over a fake.
#[async_trait]
pub trait ToolSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpTool>, ToolServerError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, ToolServerError>;

    /// Close the session and release the process. Safe to call twice.
    async fn shutdown(&self);
}

// ─── Container Command ───────────────────────────────────────────────────────

/// What to run for one tool server.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container runtime binary, e.g. `docker`.
    pub runtime: String,
    /// Container name; also the client name sent in the handshake.
    pub instance_id: String,
    /// Whether to pass `--name` (throwaway probes run unnamed).
    pub named: bool,
    pub container_ref: String,
    pub env: BTreeMap<String, String>,
    /// File receiving the container's stderr, if any.
    pub log_path: Option<PathBuf>,
    /// Bound on the initialize handshake, normally [`INIT_TIMEOUT`].
    pub init_timeout: Duration,
}

impl ContainerSpec {
    /// Arguments passed to the runtime: `run [--name id] -i --rm -e K=V … ref`.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        if self.named {
            args.push("--name".into());
            args.push(self.instance_id.clone());
        }
        args.push("-i".into());
        args.push("--rm".into());
        for (key, value) in &self.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(self.container_ref.clone());
        args
    }
}

// ─── ToolServerProcess ───────────────────────────────────────────────────────

/// A running tool server container with its session and stderr drain.
pub struct ToolServerProcess {
    instance_id: String,
    child: Mutex<Child>,
    transport: StdioTransport,
    drain: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ToolServerProcess {
    /// Spawn the container and complete the handshake within `spec.init_timeout`.
    ///
    /// On handshake failure or timeout the process is killed; there is no retry.
    pub async fn start(spec: &ContainerSpec) -> Result<Self, ToolServerError> {
        let instance = spec.instance_id.as_str();

        let mut cmd = Command::new(&spec.runtime);
        cmd.args(spec.args());
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ToolServerError::SpawnFailed {
            instance: instance.to_string(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or(ToolServerError::SpawnFailed {
            instance: instance.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(ToolServerError::SpawnFailed {
            instance: instance.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let drain = child.stderr.take().map(|stderr| {
            tokio::spawn(drain_stderr(
                instance.to_string(),
                stderr,
                spec.log_path.clone(),
            ))
        });

        tracing::info!(
            instance_id = instance,
            runtime = %spec.runtime,
            container_ref = %spec.container_ref,
            pid = child.id().unwrap_or_default(),
            "spawned tool server container"
        );

        let transport = StdioTransport::new(instance, Box::new(stdin), Box::new(stdout));

        let handshake =
            tokio::time::timeout(spec.init_timeout, initialize(&transport, instance)).await;
        let failure = match handshake {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e}")),
            Err(_) => Some(format!(
                "initialization timed out after {}ms",
                spec.init_timeout.as_millis()
            )),
        };

        if let Some(reason) = failure {
            tracing::warn!(instance_id = instance, reason = %reason, "tool server handshake failed");
            let _ = child.kill().await;
            if let Some(drain) = drain {
                drain.abort();
            }
            return Err(ToolServerError::HandshakeFailed {
                instance: instance.to_string(),
                reason,
            });
        }

        tracing::info!(instance_id = instance, "tool server initialized");

        Ok(Self {
            instance_id: instance.to_string(),
            child: Mutex::new(child),
            transport,
            drain: std::sync::Mutex::new(drain),
        })
    }
}

#[async_trait]
impl ToolSession for ToolServerProcess {
    async fn list_tools(&self) -> Result<Vec<McpTool>, ToolServerError> {
        list_tools(&self.transport).await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, ToolServerError> {
        call_tool(&self.transport, name, arguments).await
    }

    async fn shutdown(&self) {
        self.transport.close().await;

        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(instance_id = %self.instance_id, %status, "tool server exited");
            }
            _ => {
                tracing::warn!(
                    instance_id = %self.instance_id,
                    "tool server did not exit after stdin closed, killing"
                );
                let _ = child.kill().await;
            }
        }

        let drain = self.drain.lock().ok().and_then(|mut d| d.take());
        if let Some(drain) = drain {
            drain.abort();
        }
    }
}

// ─── Protocol ────────────────────────────────────────────────────────────────

/// Perform the MCP initialization handshake.
pub async fn initialize(transport: &StdioTransport, client_name: &str) -> Result<(), ToolServerError> {
    let params = serde_json::json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": client_name,
            "version": "0",
        },
    });
    let response = transport.request("initialize", Some(params)).await?;
    extract_result(response)?;

    transport.notify("notifications/initialized", None).await
}

pub async fn list_tools(transport: &StdioTransport) -> Result<Vec<McpTool>, ToolServerError> {
    let response = transport.request("tools/list", None).await?;
    let result = extract_result(response)?;
    let parsed: ListToolsResult = serde_json::from_value(result).map_err(|e| ToolServerError::Rpc {
        code: -32603,
        message: format!("failed to parse tools/list result: {e}"),
    })?;
    Ok(parsed.tools)
}

pub async fn call_tool(
    transport: &StdioTransport,
    name: &str,
    arguments: serde_json::Value,
) -> Result<CallToolResult, ToolServerError> {
    let params = serde_json::json!({
        "name": name,
        "arguments": arguments,
    });
    let response = transport.request("tools/call", Some(params)).await?;
    let result = extract_result(response)?;
    serde_json::from_value(result).map_err(|e| ToolServerError::Rpc {
        code: -32603,
        message: format!("failed to parse tools/call result: {e}"),
    })
}

// ─── Stderr Drain ────────────────────────────────────────────────────────────

/// Copy the container's stderr into its log file until the stream ends.
async fn drain_stderr(instance: String, stderr: ChildStderr, log_path: Option<PathBuf>) {
    let mut sink = match log_path {
        Some(path) => match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!(
                    instance_id = %instance,
                    path = %path.display(),
                    error = %e,
                    "cannot open tool server log, stderr goes to tracing only"
                );
                None
            }
        },
        None => None,
    };

    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(instance_id = %instance, line = %line, "tool server stderr");
        if let Some(file) = sink.as_mut() {
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn spec(named: bool) -> ContainerSpec {
        let mut env = BTreeMap::new();
        env.insert("REFRESH_TOKEN".to_string(), "rt".to_string());
        env.insert("API_KEY".to_string(), "k".to_string());
        ContainerSpec {
            runtime: "docker".into(),
            instance_id: "gmail-v1-inst-abc".into(),
            named,
            container_ref: "toolchat/gmail:1".into(),
            env,
            log_path: None,
            init_timeout: INIT_TIMEOUT,
        }
    }

    /// A fake runtime that consumes stdin and never answers, recording its pid.
    fn silent_runtime(dir: &std::path::Path) -> (String, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let pid_file = dir.join("runtime.pid");
        let script = dir.join("silent-runtime");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho $$ > '{}'\nexec cat > /dev/null\n",
                pid_file.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script.display().to_string(), pid_file)
    }

    fn process_alive(pid: &str) -> bool {
        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid)
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_container_args_are_ordered() {
        assert_eq!(
            spec(true).args(),
            vec![
                "run",
                "--name",
                "gmail-v1-inst-abc",
                "-i",
                "--rm",
                "-e",
                "API_KEY=k",
                "-e",
                "REFRESH_TOKEN=rt",
                "toolchat/gmail:1",
            ]
        );
        assert!(!spec(false).args().contains(&"--name".to_string()));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let mut spec = spec(true);
        spec.runtime = "/nonexistent/container-runtime".into();
        let err = ToolServerProcess::start(&spec).await.err().unwrap();
        assert!(matches!(err, ToolServerError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_handshake_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, pid_file) = silent_runtime(dir.path());
        let mut spec = spec(true);
        spec.runtime = runtime;
        spec.init_timeout = Duration::from_millis(500);

        let err = ToolServerProcess::start(&spec).await.err().unwrap();
        match err {
            ToolServerError::HandshakeFailed { instance, reason } => {
                assert_eq!(instance, "gmail-v1-inst-abc");
                assert!(reason.contains("timed out"), "{reason}");
            }
            other => panic!("expected HandshakeFailed, got {other:?}"),
        }

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        assert!(!process_alive(pid.trim()));
    }

    #[tokio::test]
    async fn test_runtime_exiting_before_handshake_fails() {
        let mut spec = spec(true);
        spec.runtime = "false".into();
        spec.init_timeout = Duration::from_secs(2);

        let err = ToolServerProcess::start(&spec).await.err().unwrap();
        assert!(matches!(err, ToolServerError::HandshakeFailed { .. }));
    }

    #[tokio::test]
    async fn test_initialize_sends_identity_then_notification() {
        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = split(ours);
        let (their_read, mut their_write) = split(theirs);
        let transport = StdioTransport::new("inst-1", Box::new(our_write), Box::new(our_read));

        let server = tokio::spawn(async move {
            let mut lines = BufReader::new(their_read).lines();

            let init: serde_json::Value =
                serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(init["method"], "initialize");
            assert_eq!(init["params"]["protocolVersion"], MCP_PROTOCOL_VERSION);
            assert_eq!(init["params"]["clientInfo"]["name"], "inst-1");

            let reply = serde_json::json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "result": {"capabilities": {}},
            });
            their_write
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();

            let note: serde_json::Value =
                serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(note["method"], "notifications/initialized");
            assert!(note.get("id").is_none());
        });

        initialize(&transport, "inst-1").await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_error_response_fails() {
        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = split(ours);
        let (their_read, mut their_write) = split(theirs);
        let transport = StdioTransport::new("inst-1", Box::new(our_write), Box::new(our_read));

        tokio::spawn(async move {
            let mut lines = BufReader::new(their_read).lines();
            let init: serde_json::Value =
                serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            let reply = serde_json::json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "error": {"code": -32600, "message": "unsupported protocol"},
            });
            their_write
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();
        });

        let err = initialize(&transport, "inst-1").await.unwrap_err();
        assert!(matches!(err, ToolServerError::Rpc { code: -32600, .. }));
    }
}
