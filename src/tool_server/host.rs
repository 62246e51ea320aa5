//! Instance host: runs exactly one tool server and serves its facade.
//!
//! Driven by the `toolchat-instance` binary. The host reads its instance
//! record (and the resolved env in it) from the shared store, so secrets
//! never appear on a command line.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;

use super::errors::ToolServerError;
use super::facade::{self, FacadeState, CALL_TIMEOUT};
use super::rendezvous::report_address;
use super::supervisor::{ContainerSpec, ToolServerProcess, ToolSession, INIT_TIMEOUT};
use crate::store::Store;

/// Everything the host needs from its command line.
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub instance_id: String,
    /// Rendezvous socket to report the facade address to.
    pub callback: PathBuf,
    pub database_path: String,
    pub container_runtime: String,
    pub log_dir: PathBuf,
}

/// Start the container, report the facade address, and serve until killed.
pub async fn run(options: HostOptions) -> Result<(), ToolServerError> {
    let store = Arc::new(Store::open(&options.database_path)?);

    let record = store
        .get_instance(&options.instance_id)?
        .ok_or_else(|| ToolServerError::NotFound {
            entity: "instance",
            id: options.instance_id.clone(),
        })?;
    let image = store
        .get_image(&record.image_id)?
        .ok_or_else(|| ToolServerError::NotFound {
            entity: "image",
            id: record.image_id.clone(),
        })?;

    let spec = ContainerSpec {
        runtime: options.container_runtime.clone(),
        instance_id: record.id.clone(),
        named: true,
        container_ref: image.container_ref.clone(),
        env: record.env,
        log_path: Some(options.log_dir.join(format!("{}.log", record.id))),
        init_timeout: INIT_TIMEOUT,
    };
    let session: Arc<dyn ToolSession> = Arc::new(ToolServerProcess::start(&spec).await?);

    let result = serve(&options, store, session.clone(), image.oauth_provider).await;
    session.shutdown().await;
    result
}

async fn serve(
    options: &HostOptions,
    store: Arc<Store>,
    session: Arc<dyn ToolSession>,
    provider: Option<String>,
) -> Result<(), ToolServerError> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| ToolServerError::Facade {
            reason: format!("cannot bind loopback listener: {e}"),
        })?;
    let address = listener
        .local_addr()
        .map_err(|e| ToolServerError::Facade {
            reason: format!("cannot read listener address: {e}"),
        })?;

    report_address(&options.callback, &address.to_string()).await?;
    tracing::info!(instance_id = %options.instance_id, address = %address, "facade listening");

    let shutdown = Arc::new(Notify::new());
    let state = Arc::new(FacadeState {
        instance_id: options.instance_id.clone(),
        provider,
        session,
        store,
        shutdown: shutdown.clone(),
        call_timeout: CALL_TIMEOUT,
    });
    let app = facade::router(state).layer(TraceLayer::new_for_http());

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::info!("kill received, shutting down");
                }
                _ = crate::shutdown_signal() => {}
            }
        })
        .await
        .map_err(|e| ToolServerError::Facade {
            reason: format!("facade server failed: {e}"),
        })
}
