//! Skywatch Producer - tails the sensor CSV log and republishes readings
//!
//! - Watches one append-only CSV file (first line = header)
//! - Publishes each new last line as a JSON object on the readings topic
//! - Suppresses re-saves and duplicates, survives broker outages
//!
//! Shutdown order: stop watching, flush the network loop, release the connection.

mod publisher;
mod watcher;

use anyhow::{Context, Result};
use publisher::Publisher;
use skywatch_core::shutdown::shutdown_signal;
use skywatch_core::{BrokerSession, SkywatchConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use watcher::TailWatcher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skywatch_producer=info,skywatch_core=info".into()),
        )
        .init();

    info!("📡 Skywatch producer starting...");

    let cfg = SkywatchConfig::load()
        .await
        .context("invalid configuration, refusing to start")?;

    let watcher = TailWatcher::new(&cfg.watch);
    let topic = cfg.topic.clone();
    let session = BrokerSession::open(&cfg, "producer", Vec::new(), None);

    session
        .scoped(|client| async move {
            let cancel = CancellationToken::new();
            let mut task = tokio::spawn(watcher.run(Publisher::new(client, topic), cancel.clone()));

            tokio::select! {
                _ = shutdown_signal() => {}
                res = &mut task => {
                    // run() only returns on cancel; anything else is a crash
                    if let Err(e) = res {
                        error!("watcher task failed: {e}");
                    }
                    return;
                }
            }

            cancel.cancel();
            if let Err(e) = task.await {
                error!("watcher task failed: {e}");
            }
        })
        .await;

    info!("producer stopped");
    Ok(())
}
