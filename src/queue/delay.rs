//! Delay-requeue helper (C7): TTL + dead-letter-exchange based delayed
//! redelivery, needing no broker scheduling plugin.

use crate::envelope::RequestEnvelope;
use crate::error::BrokerError;
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::info;

/// Abstraction over "requeue this envelope after a delay", mirrored as a
/// trait for the same reason as [`crate::queue::Publisher`]: dispatch-loop
/// tests run against an in-memory fake.
#[async_trait]
pub trait DelayQueue: Send + Sync {
    /// Publish a retry-incremented copy of `request` into the delay queue
    /// for `delay_seconds`. Does not touch the original delivery; the
    /// caller acks it only after this returns `Ok`.
    async fn requeue_with_delay(
        &self,
        request: &RequestEnvelope,
        delay_seconds: u64,
    ) -> Result<(), BrokerError>;
}

/// `lapin`-backed [`DelayQueue`] targeting a fixed original request queue.
pub struct LapinDelayQueue {
    channel: Channel,
    request_queue: String,
}

impl LapinDelayQueue {
    pub async fn connect(url: &str, request_queue: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        Ok(Self {
            channel,
            request_queue: request_queue.to_string(),
        })
    }

    fn delay_queue_name(&self, delay_seconds: u64) -> String {
        delay_queue_name(&self.request_queue, delay_seconds)
    }
}

fn delay_queue_name(request_queue: &str, delay_seconds: u64) -> String {
    format!("{}.delay.{}s", request_queue, delay_seconds)
}

#[async_trait]
impl DelayQueue for LapinDelayQueue {
    async fn requeue_with_delay(
        &self,
        request: &RequestEnvelope,
        delay_seconds: u64,
    ) -> Result<(), BrokerError> {
        let retried = request.with_retry_incremented();
        let delay_queue_name = self.delay_queue_name(delay_seconds);

        let mut args = FieldTable::default();
        args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(self.request_queue.clone().into()),
        );
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongInt((delay_seconds * 1000) as i32),
        );

        self.channel
            .queue_declare(
                &delay_queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|source| BrokerError::Publish {
                queue: delay_queue_name.clone(),
                source,
            })?;

        let body =
            serde_json::to_vec(&retried).expect("RequestEnvelope serializes infallibly");
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_correlation_id(retried.request_id.to_string().into());

        self.channel
            .basic_publish(
                "",
                &delay_queue_name,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|source| BrokerError::Publish {
                queue: delay_queue_name.clone(),
                source,
            })?;

        info!(
            request_id = %retried.request_id,
            delay_seconds,
            retry_count = retried.retry_count,
            delay_queue = %delay_queue_name,
            "requeued with delay"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::fakes::FakeDelayQueue;

    #[test]
    fn delay_queue_name_embeds_delay() {
        assert_eq!(
            delay_queue_name("gemini.requests", 60),
            "gemini.requests.delay.60s"
        );
    }

    #[tokio::test]
    async fn fake_delay_queue_increments_retry_count() {
        let body = serde_json::json!({
            "request_id": "123e4567-e89b-12d3-a456-426614174000",
            "prompt": "hi",
            "model": "m",
            "callback_queue": "q",
            "retry_count": 1,
        })
        .to_string();
        let envelope = RequestEnvelope::decode(body.as_bytes()).unwrap();

        let fake = FakeDelayQueue::default();
        fake.requeue_with_delay(&envelope, 600).await.unwrap();

        let requeued = fake.requeued.lock().unwrap();
        assert_eq!(requeued[0].0.retry_count, 2);
        assert_eq!(requeued[0].1, 600);
    }
}
