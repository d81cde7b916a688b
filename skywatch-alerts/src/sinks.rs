//! Alert sinks: console (tracing), framed append-only file, bus forwarder
//! for the dashboard / mailer, and a fan-out over all of them.

use chrono::Local;
use parking_lot::Mutex;
use skywatch_core::config::AlertsConf;
use skywatch_core::{AlertEvent, AlertSink, BusClient, Severity, SinkError};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const FRAME: &str = "====================================================================================================";

pub struct ConsoleSink;

impl AlertSink for ConsoleSink {
    fn emit(&self, event: &AlertEvent) -> Result<(), SinkError> {
        match event.severity {
            Severity::Critical | Severity::Warning => warn!(
                target: "skywatch::alert",
                "[{}] {} ({}, {})",
                event.severity, event.message, event.rule_id, event.timestamp
            ),
            Severity::Advisory | Severity::Info => info!(
                target: "skywatch::alert",
                "[{}] {} ({}, {})",
                event.severity, event.message, event.rule_id, event.timestamp
            ),
        }
        Ok(())
    }
}

/// Appends each alert as a framed block with the local wall-clock time.
/// Writes are blocking; the subscriber calls sinks from the blocking pool.
pub struct FileSink {
    path: PathBuf,
    // one writer at a time keeps blocks from interleaving
    lock: Mutex<()>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AlertSink for FileSink {
    fn emit(&self, event: &AlertEvent) -> Result<(), SinkError> {
        let _guard = self.lock.lock();
        let io = |source| SinkError::Io {
            path: self.path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io)?;

        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let block = format!("{FRAME}\n[{stamp}] {}\n{FRAME}\n", event.message);
        file.write_all(block.as_bytes()).map_err(io)
    }
}

/// Republishes alert events as JSON on a side topic.
pub struct ForwardSink {
    client: Arc<dyn BusClient>,
    topic: String,
}

impl ForwardSink {
    pub fn new(client: Arc<dyn BusClient>, topic: impl Into<String>) -> Self {
        Self {
            client,
            topic: topic.into(),
        }
    }
}

impl AlertSink for ForwardSink {
    fn emit(&self, event: &AlertEvent) -> Result<(), SinkError> {
        let forward_err = |reason: String| SinkError::Forward {
            topic: self.topic.clone(),
            reason,
        };
        let payload = serde_json::to_vec(event).map_err(|e| forward_err(e.to_string()))?;
        // non-blocking: this runs on the subscriber path and must not stall it
        self.client
            .try_publish(&self.topic, payload)
            .map_err(|e| forward_err(e.to_string()))
    }
}

/// Delivers to every sink; one failing sink does not starve the others.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn AlertSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl AlertSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AlertSink for FanoutSink {
    fn emit(&self, event: &AlertEvent) -> Result<(), SinkError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Sinks named in config. `client` is only used when forwarding is on.
pub fn build_sinks(conf: &AlertsConf, client: Arc<dyn BusClient>) -> FanoutSink {
    let mut sinks = FanoutSink::new();
    if conf.console {
        sinks = sinks.with(ConsoleSink);
    }
    if let Some(path) = &conf.file {
        info!("alerts will be logged to {}", path.display());
        sinks = sinks.with(FileSink::new(path));
    }
    if let Some(topic) = &conf.forward_topic {
        info!("alerts will be forwarded to '{topic}'");
        sinks = sinks.with(ForwardSink::new(client, topic.clone()));
    }
    if sinks.is_empty() {
        warn!("no alert sinks configured, alerts will only be counted");
    }
    sinks
}
