//! groved entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use grove_daemon::Daemon;
use grove_types::paths;

/// groved — background daemon supervising grove instances.
#[derive(Parser, Debug)]
#[command(name = "groved", version, about)]
struct Args {
    /// Data root (default: $GROVE_ROOT or ~/.grove)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Log to stderr instead of <root>/daemon.log
    #[arg(long)]
    foreground: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let root = match args.root {
        Some(r) => std::fs::canonicalize(&r).unwrap_or(r),
        None => paths::data_root(),
    };
    std::fs::create_dir_all(&root)
        .with_context(|| format!("create data root {}", root.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.foreground {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths::daemon_log(&root))
            .with_context(|| "open daemon.log")?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Arc::new(log_file))
            .init();
    }

    let daemon = Daemon::new(root.clone())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        let _ = shutdown_tx.send(true);
    });

    daemon
        .run(&paths::socket_path(&root), shutdown_rx)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}
