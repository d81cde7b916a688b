/*!
In-memory broker doubles.

`MockBus` stands in for the rumqttc client: it honours the shared
connection state (publishing while not connected fails like the real
client) and records every publish and subscribe for assertions.
`ScriptedEvents` stands in for the rumqttc event loop.
*/

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use skywatch_core::{
    BusClient, BusEvent, BusEvents, ConnectionError, ConnectionEvent, ConnectionHandle,
    InboundMessage, PublishError,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct MockBus {
    status: ConnectionHandle,
    published: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    rejected_subscribes: Arc<Mutex<usize>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus already past its first ConnAck, for tests that don't run a network loop.
    pub fn connected() -> Self {
        let bus = Self::new();
        bus.status.apply(ConnectionEvent::Connect).ok();
        bus.status.apply(ConnectionEvent::Ack).ok();
        bus
    }

    /// Simulates the broker going away: Connected -> Backoff(1).
    pub fn drop_link(&self) {
        self.status.record_error().ok();
    }

    /// Backoff timer fired and the broker answered.
    pub fn restore_link(&self) {
        self.status.apply(ConnectionEvent::TimerElapsed).ok();
        self.status.apply(ConnectionEvent::Ack).ok();
    }

    fn check(&self, topic: &str) -> Result<(), PublishError> {
        if self.status.is_connected() {
            Ok(())
        } else {
            Err(PublishError::NotConnected {
                topic: topic.to_string(),
            })
        }
    }

    fn record(&self, topic: &str, payload: Vec<u8>) {
        tracing::info!("📤 [MOCK] Published to {}: {} bytes", topic, payload.len());
        self.published.lock().push(MockMessage {
            topic: topic.to_string(),
            payload,
        });
    }

    pub fn published(&self) -> Vec<MockMessage> {
        self.published.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parses the last message on a topic as JSON.
    pub fn last_json<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    /// The next `n` subscribe requests fail as if the client's request queue were full.
    pub fn reject_next_subscribes(&self, n: usize) {
        *self.rejected_subscribes.lock() = n;
    }
}

#[async_trait]
impl BusClient for MockBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.check(topic)?;
        self.record(topic, payload);
        Ok(())
    }

    fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.check(topic)?;
        self.record(topic, payload);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        {
            let mut rejected = self.rejected_subscribes.lock();
            if *rejected > 0 {
                *rejected -= 1;
                return Err(ConnectionError::Network("request queue full".into()));
            }
        }
        tracing::info!("📥 [MOCK] Subscribed to {}", topic);
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn status(&self) -> &ConnectionHandle {
        &self.status
    }
}

type Scripted = Result<BusEvent, ConnectionError>;

/// Event source fed from the test through a [`ScriptHandle`].
pub struct ScriptedEvents {
    rx: mpsc::UnboundedReceiver<Scripted>,
    polls: Arc<Mutex<Vec<Instant>>>,
}

#[derive(Clone)]
pub struct ScriptHandle {
    tx: mpsc::UnboundedSender<Scripted>,
    polls: Arc<Mutex<Vec<Instant>>>,
}

impl ScriptedEvents {
    pub fn new() -> (Self, ScriptHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let polls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                rx,
                polls: polls.clone(),
            },
            ScriptHandle { tx, polls },
        )
    }
}

#[async_trait]
impl BusEvents for ScriptedEvents {
    async fn next_event(&mut self) -> Result<BusEvent, ConnectionError> {
        self.polls.lock().push(Instant::now());
        match self.rx.recv().await {
            Some(event) => event,
            // script finished: behave like an idle connection
            None => std::future::pending().await,
        }
    }
}

impl ScriptHandle {
    fn push(&self, event: Scripted) {
        // receiver only goes away with the loop
        let _ = self.tx.send(event);
    }

    pub fn conn_ack(&self) {
        self.push(Ok(BusEvent::ConnAck));
    }

    pub fn message(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.push(Ok(BusEvent::Message(InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
        })));
    }

    pub fn drop_link(&self, reason: &str) {
        self.push(Err(ConnectionError::Network(reason.to_string())));
    }

    pub fn disconnected(&self) {
        self.push(Ok(BusEvent::Disconnected));
    }

    /// Any event the loop has no use for, e.g. a ping response.
    pub fn other(&self) {
        self.push(Ok(BusEvent::Other));
    }

    /// Instants at which the loop polled for the next event.
    pub fn poll_times(&self) -> Vec<Instant> {
        self.polls.lock().clone()
    }
}
