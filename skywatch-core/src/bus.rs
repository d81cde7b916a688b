//! Broker connection: the `BusClient` / `BusEvents` seams, the rumqttc
//! implementation, the network loop and the process-scoped session.
//!
//! The network loop owns the rumqttc `EventLoop`. It tracks connection
//! state, resubscribes after every ConnAck (a clean session forgets
//! subscriptions), backs off on errors, and hands inbound publishes to
//! a channel one at a time. A subscribe request the client could not queue
//! is retried after each later event until it goes through.

use crate::config::SkywatchConfig;
use crate::connection::{Backoff, ConnectionEvent, ConnectionHandle, ConnectionState};
use crate::error::{ConnectionError, PublishError};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long `close()` waits for the disconnect to flush before cancelling the
/// loop, and again for the cancelled loop before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    ConnAck,
    Message(InboundMessage),
    /// Our own disconnect request went out; the loop can stop.
    Disconnected,
    Other,
}

/// Outbound side of the broker connection.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Fire-and-forget publish. Fails fast when not connected.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;

    /// Non-blocking: safe to call from inside the network loop.
    fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;

    /// Non-blocking: queues a subscribe request.
    fn subscribe(&self, topic: &str) -> Result<(), ConnectionError>;

    async fn disconnect(&self) -> Result<(), ConnectionError>;

    fn status(&self) -> &ConnectionHandle;
}

/// Inbound side: something the network loop can poll.
#[async_trait]
pub trait BusEvents: Send {
    async fn next_event(&mut self) -> Result<BusEvent, ConnectionError>;
}

#[async_trait]
impl BusEvents for EventLoop {
    async fn next_event(&mut self) -> Result<BusEvent, ConnectionError> {
        match self.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => Ok(BusEvent::ConnAck),
            Ok(Event::Incoming(Incoming::Publish(p))) => Ok(BusEvent::Message(InboundMessage {
                topic: p.topic,
                payload: p.payload.to_vec(),
            })),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => Ok(BusEvent::Disconnected),
            Ok(_) => Ok(BusEvent::Other),
            Err(e) => Err(ConnectionError::Network(e.to_string())),
        }
    }
}

/// rumqttc-backed client.
pub struct MqttBus {
    client: AsyncClient,
    status: ConnectionHandle,
    publish_timeout: Duration,
}

impl MqttBus {
    pub fn new(client: AsyncClient, status: ConnectionHandle, publish_timeout: Duration) -> Self {
        Self {
            client,
            status,
            publish_timeout,
        }
    }

    fn ensure_connected(&self, topic: &str) -> Result<(), PublishError> {
        if self.status.is_connected() {
            Ok(())
        } else {
            Err(PublishError::NotConnected {
                topic: topic.to_string(),
            })
        }
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.ensure_connected(topic)?;
        let send = self.client.publish(topic, QoS::AtLeastOnce, false, payload);
        match tokio::time::timeout(self.publish_timeout, send).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PublishError::Client {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(PublishError::Timeout {
                topic: topic.to_string(),
                after: self.publish_timeout,
            }),
        }
    }

    fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.ensure_connected(topic)?;
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| PublishError::Client {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn subscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| ConnectionError::Network(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.client
            .disconnect()
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    fn status(&self) -> &ConnectionHandle {
        &self.status
    }
}

fn retry_message(peer: &str, err: &ConnectionError, attempt: u32, delay: Duration) -> String {
    format!("{peer}: {err}; retry #{attempt} in {delay:?}")
}

/// Receive/dispatch loop for one connection.
pub struct NetworkLoop<E: BusEvents> {
    events: E,
    client: Arc<dyn BusClient>,
    backoff: Backoff,
    subscriptions: Vec<String>,
    /// Topics still waiting for a subscribe request since the last ConnAck.
    pending: Vec<String>,
    inbound: Option<mpsc::Sender<InboundMessage>>,
    cancel: CancellationToken,
    /// `host:port`, for log lines.
    peer: String,
}

impl<E: BusEvents> NetworkLoop<E> {
    pub fn new(
        events: E,
        client: Arc<dyn BusClient>,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            events,
            client,
            backoff,
            subscriptions: Vec::new(),
            pending: Vec::new(),
            inbound: None,
            cancel,
            peer: "broker".to_string(),
        }
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    /// Topics to (re)subscribe after every ConnAck, delivered on `inbound`.
    pub fn with_subscriptions(
        mut self,
        topics: Vec<String>,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Self {
        self.subscriptions = topics;
        self.inbound = Some(inbound);
        self
    }

    /// Sends every pending subscribe; keeps the ones the client refused.
    fn flush_subscriptions(&mut self) {
        let client = &self.client;
        self.pending.retain(|topic| match client.subscribe(topic) {
            Ok(()) => {
                info!("subscribed to {topic}");
                false
            }
            Err(e) => {
                warn!("subscribe to {topic} failed: {e}; will retry");
                true
            }
        });
    }

    pub async fn run(mut self) {
        let status = self.client.status().clone();
        if let Err(e) = status.apply(ConnectionEvent::Connect) {
            warn!("network loop not started: {e}");
            return;
        }

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.events.next_event() => event,
            };

            match event {
                Ok(BusEvent::ConnAck) => {
                    if let Err(e) = status.apply(ConnectionEvent::Ack) {
                        debug!("ignoring ConnAck: {e}");
                        continue;
                    }
                    info!("connected to broker {}", self.peer);
                    self.pending = self.subscriptions.clone();
                    self.flush_subscriptions();
                    continue;
                }
                Ok(BusEvent::Message(msg)) => {
                    if let Some(inbound) = &self.inbound {
                        // a stalled subscriber must not keep the loop from seeing cancellation
                        let sent = tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            sent = inbound.send(msg) => sent,
                        };
                        if sent.is_err() {
                            debug!("subscriber gone, stopping network loop");
                            break;
                        }
                    } else {
                        debug!("dropping message on {} (no subscriber)", msg.topic);
                    }
                }
                Ok(BusEvent::Disconnected) => {
                    info!("disconnect sent to broker");
                    break;
                }
                Ok(BusEvent::Other) => {}
                Err(e) => {
                    let attempt = match status.record_error() {
                        Ok(ConnectionState::Backoff(n)) => n,
                        Ok(_) => 1,
                        Err(invalid) => {
                            debug!("{invalid}");
                            break;
                        }
                    };
                    let delay = self.backoff.delay(attempt);
                    warn!("{}", retry_message(&self.peer, &e, attempt, delay));
                    self.pending.clear();

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if let Err(e) = status.apply(ConnectionEvent::TimerElapsed) {
                        debug!("{e}");
                        break;
                    }
                    continue;
                }
            }

            if !self.pending.is_empty() && status.is_connected() {
                self.flush_subscriptions();
            }
        }

        let _ = status.apply(ConnectionEvent::Shutdown);
        debug!("network loop stopped");
    }
}

/// The broker connection for the whole process lifetime.
///
/// `close()` disconnects and waits for the loop; dropping an unclosed session
/// cancels the loop so nothing keeps running in the background.
pub struct BrokerSession {
    client: Arc<dyn BusClient>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl BrokerSession {
    /// Connects with rumqttc. `subscriptions` are resubscribed on every reconnect.
    pub fn open(
        cfg: &SkywatchConfig,
        role: &str,
        subscriptions: Vec<String>,
        inbound: Option<mpsc::Sender<InboundMessage>>,
    ) -> Self {
        let mut opts = MqttOptions::new(
            cfg.broker.client_id_for(role),
            cfg.broker.host.clone(),
            cfg.broker.port,
        );
        opts.set_keep_alive(cfg.broker.keepalive());
        opts.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(opts, cfg.broker.channel_capacity);
        let bus: Arc<dyn BusClient> = Arc::new(MqttBus::new(
            client,
            ConnectionHandle::new(),
            cfg.broker.publish_timeout(),
        ));

        info!(
            "connecting to {}:{} (keepalive {}s) as {role}",
            cfg.broker.host, cfg.broker.port, cfg.broker.keepalive_secs
        );
        let peer = format!("{}:{}", cfg.broker.host, cfg.broker.port);
        let backoff = Backoff::from(&cfg.backoff);
        let network = NetworkLoop::new(eventloop, bus.clone(), backoff, CancellationToken::new())
            .with_peer(peer);
        Self::launch(bus, network, subscriptions, inbound)
    }

    /// Spawns the network loop over any event source.
    pub fn start<E>(
        client: Arc<dyn BusClient>,
        events: E,
        backoff: Backoff,
        subscriptions: Vec<String>,
        inbound: Option<mpsc::Sender<InboundMessage>>,
    ) -> Self
    where
        E: BusEvents + 'static,
    {
        let network = NetworkLoop::new(events, client.clone(), backoff, CancellationToken::new());
        Self::launch(client, network, subscriptions, inbound)
    }

    fn launch<E>(
        client: Arc<dyn BusClient>,
        mut network: NetworkLoop<E>,
        subscriptions: Vec<String>,
        inbound: Option<mpsc::Sender<InboundMessage>>,
    ) -> Self
    where
        E: BusEvents + 'static,
    {
        let cancel = network.cancel.clone();
        if let Some(inbound) = inbound {
            network = network.with_subscriptions(subscriptions, inbound);
        }
        let task = tokio::spawn(network.run());

        Self {
            client,
            cancel,
            task: Some(task),
        }
    }

    pub fn client(&self) -> Arc<dyn BusClient> {
        self.client.clone()
    }

    pub fn status(&self) -> ConnectionHandle {
        self.client.status().clone()
    }

    /// Runs `work` with the client, then closes the session whatever `work` returned.
    pub async fn scoped<F, Fut, T>(self, work: F) -> T
    where
        F: FnOnce(Arc<dyn BusClient>) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let out = work(self.client()).await;
        self.close().await;
        out
    }

    /// Sends a disconnect, lets the loop flush it, then releases the connection.
    pub async fn close(mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };

        if self.client.status().is_connected() {
            // the request queue can be full when the loop is stuck
            match tokio::time::timeout(CLOSE_GRACE, self.client.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("disconnect request not sent: {e}"),
                Err(_) => debug!("disconnect request not queued within {CLOSE_GRACE:?}"),
            }
        } else {
            self.cancel.cancel();
        }

        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            warn!("network loop did not stop within {CLOSE_GRACE:?}, cancelling");
            self.cancel.cancel();
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                warn!("network loop ignored cancellation, aborting it");
                task.abort();
            }
        }

        let _ = self.client.status().apply(ConnectionEvent::Shutdown);
        info!("broker session closed");
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_message_names_the_broker() {
        let err = ConnectionError::Network("connection refused".into());
        let line = retry_message("mqtt.local:1883", &err, 3, Duration::from_millis(400));
        assert!(line.contains("mqtt.local:1883"), "{line}");
        assert!(line.contains("connection refused"));
        assert!(line.contains("retry #3 in 400ms"));
    }
}
