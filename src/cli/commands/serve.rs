//! Serve command - watcher protocol over stdio.

use anyhow::Context;

use crate::config::Settings;
use crate::rpc;
use crate::watcher::WatcherServer;

/// Serve one frontend connection on stdin/stdout until stdin closes.
pub async fn run(config: &Settings) -> anyhow::Result<()> {
    let (server, task) = WatcherServer::spawn_native(&config.watcher)
        .context("failed to start the native watcher")?;

    let summary = rpc::serve(server.clone(), tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("stdio transport failed")?;

    tracing::info!(
        "[serve] connection closed after {} requests",
        summary.requests
    );

    server.shutdown().await?;
    task.await?;
    Ok(())
}
