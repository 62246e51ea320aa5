// Chat server: conversation API plus admin routes for tool server instances.

use std::path::PathBuf;

use clap::Parser;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (falls back to $TOOLCHAT_CONFIG, then ./toolchat.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `server.listen_addr`
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = toolchat::config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    toolchat::init_tracing(
        &config.storage.log_dir,
        "toolchat.log",
        "toolchat=info,tower_http=info,warn",
    )?;

    toolchat::run_server(config).await
}
