// Instance host: runs one tool server container and serves its facade.
//
// Spawned by the chat server's launcher, never by hand. Reports the facade
// address once over the callback socket, then serves until killed.

use std::path::PathBuf;

use clap::Parser;
use toolchat::tool_server::host::{self, HostOptions};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Id of the persisted instance record to run
    #[arg(long)]
    instance_id: String,

    /// Rendezvous socket the facade address is reported to
    #[arg(long)]
    callback: PathBuf,

    /// Database holding the instance record and its image
    #[arg(long)]
    database: String,

    /// Container runtime binary
    #[arg(long, default_value = "docker")]
    runtime: String,

    /// Directory for the host log and the container's stderr log
    #[arg(long)]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    toolchat::init_tracing(
        &args.log_dir,
        &format!("{}.host.log", args.instance_id),
        "toolchat=debug,tower_http=info,warn",
    )?;

    let options = HostOptions {
        instance_id: args.instance_id,
        callback: args.callback,
        database_path: args.database,
        container_runtime: args.runtime,
        log_dir: args.log_dir,
    };

    if let Err(e) = host::run(options).await {
        tracing::error!(error = %e, "instance host failed");
        return Err(e.into());
    }
    Ok(())
}
