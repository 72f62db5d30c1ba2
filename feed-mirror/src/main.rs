use anyhow::Context;
use clap::Parser;
use feed_mirror::shutdown::install_signal_handlers;
use feed_mirror::{Config, HttpSourceFeed, MirrorDaemon};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Mirror X accounts to a Misskey instance
#[derive(Debug, Parser)]
#[command(name = "feed-mirror", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "FEED_MIRROR_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Run a single pass over all accounts and exit
    #[arg(long)]
    once: bool,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting feed-mirror {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&args.config)
        .await
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let cancel = CancellationToken::new();
    install_signal_handlers(cancel.clone()).context("failed to install signal handlers")?;

    let source = HttpSourceFeed::new(config.source.clone()).context("failed to build source client")?;
    let daemon = MirrorDaemon::new(config, Arc::new(source), cancel)
        .await
        .context("failed to initialise storage")?;

    daemon.run(args.once).await?;
    info!("feed-mirror stopped");
    Ok(())
}
