//! One-shot address handoff between the launcher and an instance host.
//!
//! The launcher binds a Unix socket at `{dir}/{instance_id}.sock` before
//! spawning the host and passes the path as `--callback`. Once the facade
//! listener is bound, the host connects, writes `host:port` and closes.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use super::errors::ToolServerError;

/// Upper bound on the handoff payload.
const MAX_ADDRESS_LEN: u64 = 256;

/// Launcher side of the rendezvous. Removes its socket file on drop.
pub struct RendezvousListener {
    instance_id: String,
    path: PathBuf,
    listener: UnixListener,
}

impl RendezvousListener {
    /// Bind the rendezvous socket for an instance, replacing a stale one.
    pub fn bind(dir: &Path, instance_id: &str) -> Result<Self, ToolServerError> {
        let err = |reason: String| ToolServerError::Rendezvous {
            instance: instance_id.to_string(),
            reason,
        };

        std::fs::create_dir_all(dir)
            .map_err(|e| err(format!("cannot create {}: {e}", dir.display())))?;

        let path = dir.join(format!("{instance_id}.sock"));
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| err(format!("cannot remove stale {}: {e}", path.display())))?;
        }

        let listener = UnixListener::bind(&path)
            .map_err(|e| err(format!("cannot bind {}: {e}", path.display())))?;

        Ok(Self {
            instance_id: instance_id.to_string(),
            path,
            listener,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the single address write. Unbounded; callers add the timeout.
    pub async fn receive(&self) -> Result<String, ToolServerError> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| self.error(format!("accept failed: {e}")))?;

        let mut address = String::new();
        stream
            .take(MAX_ADDRESS_LEN)
            .read_to_string(&mut address)
            .await
            .map_err(|e| self.error(format!("read failed: {e}")))?;

        let address = address.trim();
        if address.is_empty() {
            return Err(self.error("host closed the channel without an address".into()));
        }
        Ok(address.to_string())
    }

    fn error(&self, reason: String) -> ToolServerError {
        ToolServerError::Rendezvous {
            instance: self.instance_id.clone(),
            reason,
        }
    }
}

impl Drop for RendezvousListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Host side: report the bound facade address exactly once.
pub async fn report_address(callback: &Path, address: &str) -> Result<(), ToolServerError> {
    let err = |reason: String| ToolServerError::Rendezvous {
        instance: callback.display().to_string(),
        reason,
    };

    let mut stream = UnixStream::connect(callback)
        .await
        .map_err(|e| err(format!("connect failed: {e}")))?;
    stream
        .write_all(address.as_bytes())
        .await
        .map_err(|e| err(format!("write failed: {e}")))?;
    stream
        .shutdown()
        .await
        .map_err(|e| err(format!("shutdown failed: {e}")))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_address_handoff() {
        let dir = tempfile::tempdir().unwrap();
        let listener = RendezvousListener::bind(dir.path(), "inst-1").unwrap();
        let path = listener.path().to_path_buf();
        assert_eq!(path, dir.path().join("inst-1.sock"));

        let host = tokio::spawn(async move { report_address(&path, "127.0.0.1:4321").await });

        assert_eq!(listener.receive().await.unwrap(), "127.0.0.1:4321");
        host.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_and_drop_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inst-1.sock"), b"stale").unwrap();

        let listener = RendezvousListener::bind(dir.path(), "inst-1").unwrap();
        let path = listener.path().to_path_buf();
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_empty_handoff_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let listener = RendezvousListener::bind(dir.path(), "inst-1").unwrap();
        let path = listener.path().to_path_buf();

        tokio::spawn(async move { report_address(&path, "").await });

        let err = listener.receive().await.unwrap_err();
        assert!(matches!(err, ToolServerError::Rendezvous { .. }));
    }
}
