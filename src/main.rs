//! Wiretap binary: flag parsing, wiring, signal handling.

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wiretap::config::{Cli, Config};
use wiretap::sink::{AuditSink, JsonlSink};
use wiretap::ProxyServer;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let cfg = match Config::from_cli(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("invalid configuration: {e:#}");
            std::process::exit(2);
        }
    };

    if cli.validate_config {
        println!("configuration validated successfully");
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(cfg).await {
        error!(error = %format!("{e:#}"), "proxy terminated");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let sink: Arc<dyn AuditSink> = Arc::new(JsonlSink::open(&cfg.log_file)?);
    let server = ProxyServer::new(&cfg, Arc::clone(&sink))?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });

    server.serve().await?;
    sink.flush()?;
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
