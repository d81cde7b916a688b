//! Tail watcher
//!
//! Turns growth of one append-only CSV file into "new reading" events:
//! at most one publish per distinct last line, in file order.
//!
//! Change detection polls the file's (length, mtime) fingerprint. Each change
//! is handled start to finish (read, compare, publish, mark) before the next
//! poll, so the watcher's state never sees interleaved updates. Whole-file
//! reads keep the downstream batch job's view of the file untouched: the
//! watcher only ever opens it read-only.
//!
//! Only the last line is considered on each change, so several appends
//! landing within one poll interval coalesce into a single publish of the
//! newest row. The earlier rows are counted in [`WatcherState::coalesced`]
//! and logged; producers writing faster than `watch.poll_interval_ms`
//! should lower it.

use crate::publisher::Publisher;
use skywatch_core::codec;
use skywatch_core::config::WatchConf;
use skywatch_core::{CodecError, WatchError};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Owned by the watcher task only; never shared with the network loop.
#[derive(Debug, Default)]
pub struct WatcherState {
    /// First non-empty capture wins for the life of the watcher.
    header: Option<Vec<String>>,
    /// Last raw line successfully handed to the publisher.
    last_forwarded: Option<String>,
    /// Last line rejected as malformed, so a re-save doesn't log it twice.
    last_rejected: Option<String>,
    /// Rows appended after the marker that were never published on their own.
    coalesced: u64,
}

impl WatcherState {
    pub fn header(&self) -> Option<&[String]> {
        self.header.as_deref()
    }

    pub fn last_forwarded(&self) -> Option<&str> {
        self.last_forwarded.as_deref()
    }

    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No content yet.
    Empty,
    /// Only the header is present.
    HeaderOnly,
    /// Last line already forwarded (or already rejected).
    Suppressed,
    Published,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

pub struct TailWatcher {
    path: PathBuf,
    delimiter: u8,
    require_trailing_newline: bool,
    poll_interval: Duration,
    state: WatcherState,
}

impl TailWatcher {
    pub fn new(conf: &WatchConf) -> Self {
        Self {
            path: conf.path.clone(),
            delimiter: conf.delimiter_byte(),
            require_trailing_newline: conf.require_trailing_newline,
            poll_interval: conf.poll_interval(),
            state: WatcherState::default(),
        }
    }

    pub fn state(&self) -> &WatcherState {
        &self.state
    }

    fn read_race(&self, reason: impl Into<String>) -> WatchError {
        WatchError::ReadRace {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    /// Handles one modification notification.
    ///
    /// The last-forwarded marker moves only after the publisher accepted the
    /// reading; a failed publish leaves it where it was.
    pub async fn on_modified(&mut self, publisher: &Publisher) -> Result<Outcome, WatchError> {
        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.read_race(e.to_string()))?;

        if content.trim().is_empty() {
            return Ok(Outcome::Empty);
        }
        if self.require_trailing_newline && !content.ends_with('\n') {
            return Err(self.read_race("last line is incomplete (no trailing newline yet)"));
        }

        let lines: Vec<&str> = content.lines().collect();

        if self.state.header.is_none() {
            let header = codec::parse_header(lines[0], self.delimiter)?;
            info!("captured header from {}: {:?}", self.path.display(), header);
            self.state.header = Some(header);
        }

        if lines.len() == 1 {
            return Ok(Outcome::HeaderOnly);
        }

        let last = lines[lines.len() - 1];
        if last.trim().is_empty() {
            return Ok(Outcome::Suppressed);
        }
        if self.state.last_forwarded.as_deref() == Some(last) {
            return Ok(Outcome::Suppressed);
        }

        let header = self.state.header.as_deref().unwrap_or_default();
        let reading = match codec::decode_row(header, last, self.delimiter) {
            Ok(reading) => reading,
            Err(_) if self.state.last_rejected.as_deref() == Some(last) => {
                return Ok(Outcome::Suppressed);
            }
            Err(e) => {
                self.state.last_rejected = Some(last.to_string());
                return Err(WatchError::Malformed(e));
            }
        };

        publisher.publish_reading(&reading).await?;
        self.note_skipped_rows(&lines);
        self.state.last_forwarded = Some(last.to_string());
        Ok(Outcome::Published)
    }

    /// Counts data rows between the previous marker and the row just published.
    fn note_skipped_rows(&mut self, lines: &[&str]) {
        let Some(marker) = self.state.last_forwarded.as_deref() else {
            return;
        };
        let Some(pos) = lines.iter().rposition(|line| *line == marker) else {
            return;
        };
        let skipped = lines[pos + 1..lines.len() - 1]
            .iter()
            .filter(|line| !line.trim().is_empty())
            .count() as u64;
        if skipped > 0 {
            self.state.coalesced += skipped;
            warn!(
                "{} rows appended to {} within one poll were not published on their own",
                skipped,
                self.path.display()
            );
        }
    }

    async fn fingerprint(&self) -> Option<Fingerprint> {
        let meta = fs::metadata(&self.path).await.ok()?;
        Some(Fingerprint {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }

    /// Polls until cancelled. Content present at startup is not replayed.
    pub async fn run(mut self, publisher: Publisher, cancel: CancellationToken) {
        info!(
            "watching {} every {:?}, publishing new lines to '{}'",
            self.path.display(),
            self.poll_interval,
            publisher.topic()
        );

        let mut seen = self.fingerprint().await;
        if seen.is_none() {
            warn!("{} does not exist yet, waiting for it", self.path.display());
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = self.fingerprint().await;
            if current == seen {
                continue;
            }
            if let (Some(before), Some(now)) = (seen, current) {
                if now.len < before.len {
                    warn!(
                        "{} shrank from {} to {} bytes; expected append-only writes",
                        self.path.display(),
                        before.len,
                        now.len
                    );
                }
            }
            seen = current;
            if current.is_none() {
                warn!("{} disappeared", self.path.display());
                continue;
            }

            match self.on_modified(&publisher).await {
                Ok(outcome) => debug!("{}: {:?}", self.path.display(), outcome),
                Err(e @ WatchError::ReadRace { .. }) => {
                    warn!("{e}; skipping, next change will catch up")
                }
                Err(WatchError::Malformed(CodecError::MalformedRow { expected, found, line })) => warn!(
                    "rejected row in {}: expected {expected} fields, found {found}: {line:?}",
                    self.path.display()
                ),
                Err(WatchError::Malformed(e)) => {
                    warn!("rejected row in {}: {e}", self.path.display())
                }
                Err(WatchError::Publish(e)) => warn!("{e}; reading dropped"),
            }
        }

        info!("stopped watching {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skywatch_core::{BusClient, PublishError};
    use skywatch_devkit::{MockBus, TestHarness};
    use std::sync::Arc;

    fn watcher_for(harness: &TestHarness) -> TailWatcher {
        TailWatcher::new(&WatchConf {
            path: harness.csv_path().to_path_buf(),
            poll_interval_ms: 20,
            ..WatchConf::default()
        })
    }

    fn publisher_for(bus: &MockBus) -> Publisher {
        Publisher::new(Arc::new(bus.clone()), "weather/readings")
    }

    #[tokio::test]
    async fn empty_and_header_only_files_publish_nothing() {
        let h = TestHarness::new().unwrap();
        let publisher = publisher_for(&h.bus);
        let mut w = watcher_for(&h);

        h.touch().unwrap();
        assert_eq!(w.on_modified(&publisher).await.unwrap(), Outcome::Empty);
        assert!(w.state().header().is_none());

        h.write_header().unwrap();
        assert_eq!(w.on_modified(&publisher).await.unwrap(), Outcome::HeaderOnly);
        assert_eq!(w.state().header().unwrap().len(), 7);
        assert!(h.bus.published().is_empty());
    }

    #[tokio::test]
    async fn one_publish_per_distinct_last_line() {
        let h = TestHarness::new().unwrap();
        let publisher = publisher_for(&h.bus);
        let mut w = watcher_for(&h);
        h.write_header().unwrap();

        let rows = [
            ("2025-01-01T10:00:00Z", "Cairo", 36.0),
            ("2025-01-01T10:00:05Z", "Cairo", 36.5),
            ("2025-01-01T10:00:10Z", "Oslo", 4.0),
        ];
        let mut expected = 0;
        for (ts, city, temp) in rows {
            h.append_reading(ts, city, temp, 40.0).unwrap();
            expected += 1;
            // the first notification publishes, re-saves are suppressed
            assert_eq!(w.on_modified(&publisher).await.unwrap(), Outcome::Published);
            assert_eq!(w.on_modified(&publisher).await.unwrap(), Outcome::Suppressed);
            assert_eq!(w.on_modified(&publisher).await.unwrap(), Outcome::Suppressed);
            assert_eq!(h.bus.published().len(), expected);
        }

        let last: serde_json::Value = h.bus.last_json("weather/readings").unwrap().unwrap();
        assert_eq!(last["city"], "Oslo");
        assert_eq!(last["timestamp"], "2025-01-01T10:00:10Z");
    }

    #[tokio::test]
    async fn header_is_never_overwritten() {
        let h = TestHarness::new().unwrap();
        let publisher = publisher_for(&h.bus);
        let mut w = watcher_for(&h);

        h.rewrite("city,humidity\nCairo,15\n").unwrap();
        w.on_modified(&publisher).await.unwrap();
        h.rewrite("a,b,c\nCairo,15\nOslo,90\n").unwrap();
        w.on_modified(&publisher).await.unwrap();

        assert_eq!(w.state().header().unwrap(), &["city", "humidity"]);
        assert_eq!(h.bus.published().len(), 2);
    }

    #[tokio::test]
    async fn malformed_row_is_rejected_and_not_forwarded() {
        let h = TestHarness::new().unwrap();
        let publisher = publisher_for(&h.bus);
        let mut w = watcher_for(&h);
        h.write_header().unwrap();
        h.append_line("2025-01-01T10:00:00Z,Cairo,36.0").unwrap();

        let err = w.on_modified(&publisher).await.unwrap_err();
        assert!(matches!(
            err,
            WatchError::Malformed(CodecError::MalformedRow { expected: 7, found: 3, .. })
        ));
        // reported once, then quiet until the file moves on
        assert_eq!(w.on_modified(&publisher).await.unwrap(), Outcome::Suppressed);
        assert!(h.bus.published().is_empty());
        assert!(w.state().last_forwarded().is_none());

        h.append_reading("2025-01-01T10:00:05Z", "Cairo", 36.0, 15.0).unwrap();
        assert_eq!(w.on_modified(&publisher).await.unwrap(), Outcome::Published);
    }

    #[tokio::test]
    async fn partial_line_is_a_read_race_that_heals() {
        let h = TestHarness::new().unwrap();
        let publisher = publisher_for(&h.bus);
        let mut w = watcher_for(&h);
        h.write_header().unwrap();
        h.append_raw("2025-01-01T10:00:00Z,Cai").unwrap();

        let err = w.on_modified(&publisher).await.unwrap_err();
        assert!(matches!(err, WatchError::ReadRace { .. }));

        h.append_raw("ro,36.0,15,1012,2.5,clear sky\n").unwrap();
        assert_eq!(w.on_modified(&publisher).await.unwrap(), Outcome::Published);
        let last: serde_json::Value = h.bus.last_json("weather/readings").unwrap().unwrap();
        assert_eq!(last["city"], "Cairo");
    }

    #[tokio::test]
    async fn missing_file_is_a_read_race() {
        let h = TestHarness::new().unwrap();
        let publisher = publisher_for(&h.bus);
        let mut w = watcher_for(&h);
        assert!(matches!(
            w.on_modified(&publisher).await,
            Err(WatchError::ReadRace { .. })
        ));
    }

    #[tokio::test]
    async fn failed_publish_keeps_marker_and_retries_same_line() {
        let h = TestHarness::new().unwrap();
        let publisher = publisher_for(&h.bus);
        let mut w = watcher_for(&h);
        h.write_header().unwrap();
        h.append_reading("2025-01-01T10:00:00Z", "Cairo", 36.0, 15.0).unwrap();
        assert_eq!(w.on_modified(&publisher).await.unwrap(), Outcome::Published);
        let marker = w.state().last_forwarded().map(str::to_string);

        h.bus.drop_link();
        h.append_reading("2025-01-01T10:00:05Z", "Giza", 37.0, 12.0).unwrap();
        let err = w.on_modified(&publisher).await.unwrap_err();
        assert!(matches!(err, WatchError::Publish(PublishError::NotConnected { .. })));
        assert_eq!(w.state().last_forwarded().map(str::to_string), marker);
        assert_eq!(h.bus.published().len(), 1);

        h.bus.restore_link();
        assert_eq!(w.on_modified(&publisher).await.unwrap(), Outcome::Published);
        assert_eq!(h.bus.published().len(), 2);
        assert!(w.state().last_forwarded().unwrap().contains("Giza"));
    }

    #[tokio::test]
    async fn identical_repeated_reading_is_dropped() {
        let h = TestHarness::new().unwrap();
        let publisher = publisher_for(&h.bus);
        let mut w = watcher_for(&h);
        h.write_header().unwrap();

        h.append_reading("2025-01-01T10:00:00Z", "Cairo", 36.0, 15.0).unwrap();
        w.on_modified(&publisher).await.unwrap();
        h.append_reading("2025-01-01T10:00:00Z", "Cairo", 36.0, 15.0).unwrap();
        assert_eq!(w.on_modified(&publisher).await.unwrap(), Outcome::Suppressed);
        assert_eq!(h.bus.published().len(), 1);
    }

    #[tokio::test]
    async fn run_publishes_appends_but_not_existing_content() {
        let h = TestHarness::new().unwrap();
        h.write_header().unwrap();
        h.append_reading("2025-01-01T09:00:00Z", "Old", 10.0, 50.0).unwrap();

        let w = watcher_for(&h);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(w.run(publisher_for(&h.bus), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        h.append_reading("2025-01-01T10:00:00Z", "Cairo", 36.0, 15.0).unwrap();

        let bus = h.bus.clone();
        let published = tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                if !bus.published().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(published.is_ok(), "append was not published");

        cancel.cancel();
        task.await.unwrap();

        let msgs = h.bus.published();
        assert_eq!(msgs.len(), 1);
        let first: serde_json::Value = serde_json::from_slice(&msgs[0].payload).unwrap();
        assert_eq!(first["city"], "Cairo");
        assert!(h.bus.status().is_connected());
    }

    #[tokio::test]
    async fn dedup_compares_the_exact_line() {
        let h = TestHarness::new().unwrap();
        let publisher = publisher_for(&h.bus);
        let mut w = watcher_for(&h);
        h.write_header().unwrap();

        h.append_line("2025-01-01T10:00:00Z,Cairo,36,15,1012,2.5,clear sky").unwrap();
        assert_eq!(w.on_modified(&publisher).await.unwrap(), Outcome::Published);
        // same values, different text
        h.append_line("2025-01-01T10:00:00Z,Cairo,36,15,1012,2.5,clear sky ").unwrap();
        assert_eq!(w.on_modified(&publisher).await.unwrap(), Outcome::Published);
        assert_eq!(h.bus.published().len(), 2);
        assert!(w.state().last_forwarded().unwrap().ends_with("clear sky "));
    }

    #[tokio::test]
    async fn appends_between_notifications_coalesce_to_the_newest_row() {
        let h = TestHarness::new().unwrap();
        let publisher = publisher_for(&h.bus);
        let mut w = watcher_for(&h);
        h.write_header().unwrap();
        h.append_reading("2025-01-01T10:00:00Z", "Cairo", 36.0, 15.0).unwrap();
        w.on_modified(&publisher).await.unwrap();

        h.append_reading("2025-01-01T10:00:05Z", "Giza", 37.0, 12.0).unwrap();
        h.append_reading("2025-01-01T10:00:10Z", "Luxor", 38.0, 10.0).unwrap();
        h.append_reading("2025-01-01T10:00:15Z", "Aswan", 39.0, 9.0).unwrap();
        assert_eq!(w.on_modified(&publisher).await.unwrap(), Outcome::Published);

        assert_eq!(h.bus.published().len(), 2);
        let last: serde_json::Value = h.bus.last_json("weather/readings").unwrap().unwrap();
        assert_eq!(last["city"], "Aswan");
        assert_eq!(w.state().coalesced(), 2);
    }
}
