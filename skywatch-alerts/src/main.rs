//! Skywatch Alerts - threshold alerting on live sensor readings
//!
//! - Subscribes to the readings topic (resubscribed on every reconnect)
//! - Evaluates the configured rule profile against each reading
//! - Emits alerts to the console, an append-only alert file and, optionally,
//!   a forward topic for the dashboard / daily mailer

mod engine;
mod sinks;
mod subscriber;

use anyhow::{Context, Result};
use engine::RuleEngine;
use skywatch_core::shutdown::shutdown_signal;
use skywatch_core::{BrokerSession, SkywatchConfig};
use subscriber::Subscriber;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Inbound messages buffered between the network loop and the rule engine.
const INBOUND_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skywatch_alerts=info,skywatch_core=info,skywatch::alert=info".into()),
        )
        .init();

    info!("🚨 Skywatch alerts starting...");

    let cfg = SkywatchConfig::load()
        .await
        .context("invalid configuration, refusing to start")?;
    let engine = RuleEngine::from_config(&cfg.rules).context("invalid alert rules")?;
    info!("rule profile {:?} with {} rules", cfg.rules.profile, engine.rules().len());

    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let session = BrokerSession::open(&cfg, "alerts", vec![cfg.topic.clone()], Some(tx));

    let sink = sinks::build_sinks(&cfg.alerts, session.client());
    let mut worker = tokio::spawn(Subscriber::new(cfg.topic.clone(), engine, sink).run(rx));

    tokio::select! {
        _ = shutdown_signal() => {}
        res = &mut worker => {
            if let Err(e) = res {
                error!("subscriber task failed: {e}");
            }
        }
    }

    // closing the session ends the network loop, which closes the inbound channel
    session.close().await;
    if !worker.is_finished() {
        match worker.await {
            Ok(raised) => info!("{raised} alerts raised this run"),
            Err(e) => error!("subscriber task failed: {e}"),
        }
    }

    info!("alerts service stopped");
    Ok(())
}
