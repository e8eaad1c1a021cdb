//! Queue publisher (C6): durable publish of response envelopes to a
//! caller-named reply queue.

use crate::envelope::ResponseEnvelope;
use crate::error::BrokerError;
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::info;

/// Abstraction over "publish a response envelope", so the dispatch loop can
/// be tested against an in-memory fake instead of a live broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `response` to `queue_name`. §4.5: failure must propagate —
    /// the caller must not ACK the originating delivery until this returns
    /// `Ok`.
    async fn publish(&self, response: &ResponseEnvelope, queue_name: &str) -> Result<(), BrokerError>;
}

/// `lapin`-backed [`Publisher`] using the default exchange (direct routing
/// by queue name, matching `aio-pika`'s `channel.default_exchange.publish`).
pub struct QueuePublisher {
    channel: Channel,
}

impl QueuePublisher {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        Ok(Self { channel })
    }
}

#[async_trait]
impl Publisher for QueuePublisher {
    async fn publish(
        &self,
        response: &ResponseEnvelope,
        queue_name: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| BrokerError::Publish {
                queue: queue_name.to_string(),
                source,
            })?;

        let body = serde_json::to_vec(response).expect("ResponseEnvelope serializes infallibly");
        let properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_content_type("application/json".into())
            .with_correlation_id(response.request_id.to_string().into());

        self.channel
            .basic_publish(
                "",
                queue_name,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|source| BrokerError::Publish {
                queue: queue_name.to_string(),
                source,
            })?;

        info!(
            request_id = %response.request_id,
            queue = queue_name,
            status = ?response.status,
            "published response"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::fakes::FakePublisher;
    use uuid::Uuid;

    #[tokio::test]
    async fn fake_publisher_records_publishes() {
        let publisher = FakePublisher::default();
        let response = ResponseEnvelope::success(
            Uuid::new_v4(),
            "hi".to_string(),
            None,
            1.0,
            "m".to_string(),
            None,
        );
        publisher.publish(&response, "callback.q").await.unwrap();

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "callback.q");
    }

    #[tokio::test]
    async fn fake_publisher_can_simulate_failure() {
        let publisher = FakePublisher::default();
        publisher
            .fail_next
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let response = ResponseEnvelope::success(
            Uuid::new_v4(),
            "hi".to_string(),
            None,
            1.0,
            "m".to_string(),
            None,
        );
        let err = publisher.publish(&response, "callback.q").await;
        assert!(err.is_err());
    }
}
