use skywatch_core::codec;
use skywatch_core::{BusClient, PublishError, Reading};
use std::sync::Arc;
use tracing::info;

/// Encodes readings and hands them to the broker on the fixed topic.
pub struct Publisher {
    client: Arc<dyn BusClient>,
    topic: String,
}

impl Publisher {
    pub fn new(client: Arc<dyn BusClient>, topic: impl Into<String>) -> Self {
        Self {
            client,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Not connected / timed out is reported to the caller; nothing is queued.
    pub async fn publish_reading(&self, reading: &Reading) -> Result<(), PublishError> {
        let payload = codec::encode(reading).map_err(|e| PublishError::Encode(e.to_string()))?;
        self.client.publish(&self.topic, payload.into_bytes()).await?;
        info!("published reading for {} on {}", reading.city(), self.topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skywatch_devkit::MockBus;

    #[tokio::test]
    async fn publishes_json_on_topic() {
        let bus = Arc::new(MockBus::connected());
        let publisher = Publisher::new(bus.clone(), "weather/readings");
        let reading = Reading::new()
            .with("city", "Cairo")
            .with("temperature_c", "36.0");

        publisher.publish_reading(&reading).await.unwrap();

        let msg: serde_json::Value = bus.last_json("weather/readings").unwrap().unwrap();
        assert_eq!(msg["city"], "Cairo");
        assert_eq!(msg["temperature_c"], "36.0");
    }

    #[tokio::test]
    async fn not_connected_is_reported() {
        let bus = Arc::new(MockBus::new());
        let publisher = Publisher::new(bus.clone(), "weather/readings");
        let err = publisher
            .publish_reading(&Reading::new().with("city", "Oslo"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::NotConnected { ref topic } if topic == "weather/readings"));
        assert!(bus.published().is_empty());
    }
}
