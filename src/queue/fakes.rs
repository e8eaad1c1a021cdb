//! In-memory fakes shared by `publisher`, `delay`, and `dispatch` tests.

use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::BrokerError;
use crate::queue::{DelayQueue, Publisher};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct FakePublisher {
    pub published: Mutex<Vec<(String, ResponseEnvelope)>>,
    pub fail_next: AtomicBool,
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish(
        &self,
        response: &ResponseEnvelope,
        queue_name: &str,
    ) -> Result<(), BrokerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BrokerError::Other("simulated publish failure".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((queue_name.to_string(), response.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDelayQueue {
    pub requeued: Mutex<Vec<(RequestEnvelope, u64)>>,
}

#[async_trait]
impl DelayQueue for FakeDelayQueue {
    async fn requeue_with_delay(
        &self,
        request: &RequestEnvelope,
        delay_seconds: u64,
    ) -> Result<(), BrokerError> {
        self.requeued
            .lock()
            .unwrap()
            .push((request.with_retry_incremented(), delay_seconds));
        Ok(())
    }
}
