//! Queue consumer (C5): durable request queue, bounded prefetch, ACK/NACK
//! discipline delegated to the caller.

use crate::envelope::RequestEnvelope;
use crate::error::BrokerError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use std::future::Future;
use tracing::{error, info, warn};

/// A single broker delivery, abstracted so the dispatch loop (C8) can be
/// tested against an in-memory fake instead of a live broker.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Raw message body, prior to any decoding.
    fn body(&self) -> &[u8];

    /// Acknowledge successful, terminal processing.
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Reject without requeue — reserved for poison messages (§4.4) and
    /// handler-internal failures that must not loop.
    async fn reject_without_requeue(&self) -> Result<(), BrokerError>;
}

/// `lapin`-backed [`Delivery`].
pub struct LapinDelivery {
    inner: lapin::message::Delivery,
}

#[async_trait]
impl Delivery for LapinDelivery {
    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.inner.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject_without_requeue(&self) -> Result<(), BrokerError> {
        self.inner
            .reject(BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }
}

/// Connects to the broker, declares the request queue durable, and drives a
/// caller-supplied handler for each delivery.
pub struct QueueConsumer {
    channel: Channel,
    queue_name: String,
}

impl QueueConsumer {
    /// Connect, set prefetch (`BasicQos`), and declare `queue_name` durable.
    pub async fn connect(
        url: &str,
        queue_name: &str,
        prefetch_count: u16,
    ) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(queue = queue_name, prefetch_count, "queue consumer connected");

        Ok(Self {
            channel,
            queue_name: queue_name.to_string(),
        })
    }

    /// Consume indefinitely. For each delivery: decode into a
    /// [`RequestEnvelope`], reject-without-requeue on failure (poison
    /// message, §4.4), otherwise invoke `handler` with the envelope and the
    /// raw delivery handle so it controls ACK/NACK.
    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), BrokerError>
    where
        F: Fn(RequestEnvelope, Box<dyn Delivery>) -> Fut + Send + Sync,
        Fut: Future<Output = ()> + Send,
    {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                "worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(d) => d,
                Err(err) => {
                    error!(error = %err, "consumer stream error");
                    continue;
                }
            };

            match RequestEnvelope::decode(&delivery.data) {
                Ok(envelope) => {
                    let wrapped = LapinDelivery { inner: delivery };
                    handler(envelope, Box::new(wrapped)).await;
                }
                Err(err) => {
                    warn!(error = %err, "rejecting poison message");
                    let wrapped = LapinDelivery { inner: delivery };
                    if let Err(reject_err) = wrapped.reject_without_requeue().await {
                        error!(error = %reject_err, "failed to reject poison message");
                    }
                }
            }
        }

        Ok(())
    }
}
