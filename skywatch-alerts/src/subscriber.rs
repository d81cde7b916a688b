use crate::engine::RuleEngine;
use skywatch_core::codec;
use skywatch_core::{AlertEvent, AlertSink, InboundMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Longest payload excerpt written to the log for a dropped message.
const EXCERPT_LEN: usize = 200;

/// Decodes inbound readings, runs the rules, forwards alerts to the sink.
pub struct Subscriber<S: AlertSink> {
    topic: String,
    engine: RuleEngine,
    sink: S,
}

impl<S: AlertSink> Subscriber<S> {
    pub fn new(topic: impl Into<String>, engine: RuleEngine, sink: S) -> Self {
        Self {
            topic: topic.into(),
            engine,
            sink,
        }
    }

    /// One message in, the alerts it produced out (already handed to the sink,
    /// in rule order). Bad payloads are logged and yield nothing.
    pub fn handle_message(&self, msg: &InboundMessage) -> Vec<AlertEvent> {
        if msg.topic != self.topic {
            debug!("ignoring message on unexpected topic {}", msg.topic);
            return Vec::new();
        }

        let reading = match codec::decode_payload(&msg.payload) {
            Ok(reading) => reading,
            Err(e) => {
                let text = String::from_utf8_lossy(&msg.payload);
                let excerpt: String = text.chars().take(EXCERPT_LEN).collect();
                warn!("dropping message on {}: {e}; payload: {excerpt:?}", msg.topic);
                return Vec::new();
            }
        };
        debug!("received reading from {}: {:?}", reading.city(), reading);

        let alerts = self.engine.evaluate(&reading);
        for alert in &alerts {
            if let Err(e) = self.sink.emit(alert) {
                warn!("alert {} for {} not delivered: {e}", alert.rule_id, alert.city);
            }
        }
        alerts
    }
}

impl<S: AlertSink + 'static> Subscriber<S> {
    /// Processes messages one at a time until the network loop closes the channel.
    /// Returns how many alerts were raised.
    ///
    /// Sinks do blocking I/O, so each message is handled on the blocking pool;
    /// awaiting it before the next `recv` keeps messages in arrival order.
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundMessage>) -> usize {
        info!(
            "evaluating {} rules against readings on '{}'",
            self.engine.rules().len(),
            self.topic
        );
        let this = Arc::new(self);
        let mut raised = 0;
        while let Some(msg) = inbound.recv().await {
            let worker = Arc::clone(&this);
            match tokio::task::spawn_blocking(move || worker.handle_message(&msg).len()).await {
                Ok(n) => raised += n,
                Err(e) => warn!("alert handling failed: {e}"),
            }
        }
        info!("subscriber stopped after raising {raised} alerts");
        raised
    }
}
