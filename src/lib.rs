pub mod api;
pub mod chat;
pub mod config;
pub mod inference;
pub mod store;
pub mod tool_server;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use api::AppState;
use chat::ChatEngine;
use config::AppConfig;
use inference::OpenAiClient;
use store::Store;
use tool_server::{FacadeClient, Launcher};

/// Return the platform-standard data directory for toolchat.
///
/// - macOS: `~/Library/Application Support/toolchat/`
/// - Linux: `$XDG_DATA_HOME/toolchat/` (fallback `~/.local/share/toolchat/`)
///
/// Falls back to `~/.toolchat/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolchat");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolchat")
}

/// Initialize the tracing subscriber, writing to `{log_dir}/{file_name}` and stderr.
///
/// On each start:
/// 1. Rotates existing logs (`x.log` → `x.log.1` → `.2` → `.3`, keeps last 3).
/// 2. Opens a fresh log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the log path for discoverability.
///
/// `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(log_dir: &Path, file_name: &str, default_filter: &str) -> anyhow::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::MakeWriterExt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;

    let log_path = log_dir.join(file_name);
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file).and(std::io::stderr))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== toolchat starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `x.log` → `x.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Without explicit flushing, log entries may sit in OS buffers and be lost
/// when a host process is killed.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating graceful shutdown");
        }
    }
}

/// Wire the store, LLM client, launcher and engine together and serve the API
/// until a shutdown signal arrives. Live instances are killed on the way out.
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    if let Some(parent) = Path::new(&config.storage.database_path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::create_dir_all(&config.tool_servers.rendezvous_dir).with_context(|| {
        format!(
            "failed to create {}",
            config.tool_servers.rendezvous_dir.display()
        )
    })?;

    let store = Arc::new(Store::open(&config.storage.database_path)?);
    let llm = Arc::new(OpenAiClient::from_config(config.llm.clone())?);
    let dispatcher = Arc::new(FacadeClient::new()?);
    let engine = Arc::new(ChatEngine::new(
        Arc::clone(&store),
        llm.clone(),
        dispatcher,
        config.engine.clone(),
    ));
    let launcher = Arc::new(Launcher::new(Arc::clone(&store), config.launcher_config())?);

    let app = api::router(Arc::new(AppState {
        engine,
        store: Arc::clone(&store),
        launcher: Arc::clone(&launcher),
    }));

    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address '{}'", config.server.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(
        address = %addr,
        database = %config.storage.database_path,
        model = %llm.model(),
        runtime = %config.tool_servers.container_runtime,
        "toolchat listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    if tokio::time::timeout(grace, launcher.shutdown_all()).await.is_err() {
        tracing::warn!(grace_secs = grace.as_secs(), "instances still shutting down at exit");
    }
    tracing::info!("toolchat stopped");
    Ok(())
}
