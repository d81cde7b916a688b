/*!
Test harness for the producer and alert service

- temp directory with a growing CSV file and append / rewrite helpers
- a connected `MockBus`
- `RecordingSink` to assert on emitted alerts
*/

use crate::mqtt_stub::MockBus;
use anyhow::Result;
use parking_lot::Mutex;
use skywatch_core::{AlertEvent, AlertSink, SinkError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Header written by the weather simulator.
pub const WEATHER_HEADER: &str = "timestamp,city,temperature_c,humidity,pressure,wind_speed,weather";

/// Init logging for tests; safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub struct TestHarness {
    pub bus: MockBus,
    dir: TempDir,
    csv_path: PathBuf,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        init_test_logging();
        let dir = tempfile::tempdir()?;
        let csv_path = dir.path().join("readings.csv");
        Ok(Self {
            bus: MockBus::connected(),
            dir,
            csv_path,
        })
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Creates (or empties) the watched file.
    pub fn touch(&self) -> Result<()> {
        std::fs::write(&self.csv_path, "")?;
        Ok(())
    }

    /// Raw append, no newline added: lets tests model partial writes.
    pub fn append_raw(&self, text: &str) -> Result<()> {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_path)?;
        f.write_all(text.as_bytes())?;
        Ok(())
    }

    pub fn append_line(&self, line: &str) -> Result<()> {
        self.append_raw(&format!("{line}\n"))
    }

    pub fn write_header(&self) -> Result<()> {
        self.append_line(WEATHER_HEADER)
    }

    /// Appends a row in [`WEATHER_HEADER`] order.
    pub fn append_reading(&self, ts: &str, city: &str, temp: f64, humidity: f64) -> Result<()> {
        self.append_line(&format!("{ts},{city},{temp},{humidity},1012,2.5,clear sky"))
    }

    /// Rewrites the whole file, as an editor re-save would.
    pub fn rewrite(&self, content: &str) -> Result<()> {
        std::fs::write(&self.csv_path, content)?;
        Ok(())
    }

    pub fn read(&self) -> Result<String> {
        Ok(std::fs::read_to_string(&self.csv_path)?)
    }
}

/// Alert sink that keeps everything it was handed.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<AlertEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().clone()
    }

    pub fn rule_ids(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.rule_id.clone()).collect()
    }
}

impl AlertSink for RecordingSink {
    fn emit(&self, event: &AlertEvent) -> Result<(), SinkError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skywatch_core::Severity;

    #[test]
    fn harness_appends_lines() {
        let harness = TestHarness::new().unwrap();
        harness.write_header().unwrap();
        harness
            .append_reading("2025-01-01T10:00:00Z", "Cairo", 36.0, 15.0)
            .unwrap();
        let content = harness.read().unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], WEATHER_HEADER);
        assert!(lines[1].starts_with("2025-01-01T10:00:00Z,Cairo,36,15"));
    }

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        for id in ["a", "b"] {
            sink.emit(&AlertEvent {
                timestamp: "t".into(),
                city: "Cairo".into(),
                rule_id: id.into(),
                severity: Severity::Info,
                message: "m".into(),
            })
            .unwrap();
        }
        assert_eq!(sink.rule_ids(), vec!["a", "b"]);
    }
}
