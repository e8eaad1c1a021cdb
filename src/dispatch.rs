//! Dispatch loop (C8): orchestrates C2-C7 per delivery, owns the
//! ACK/NACK/requeue decision.
//!
//! Re-expresses the spec's state machine (§4.8) as an explicit loop per
//! delivery rather than the recursive re-entry the original Python
//! (`gemini.py`'s rate-limit handling) sometimes used — see `SPEC_FULL.md`'s
//! resolution of the open question in §9. The loop terminates whenever
//! [`crate::credentials::CredentialPool::acquire`] returns `None`, which is
//! guaranteed because `mark_rate_limited` strictly shrinks the eligible set.

use crate::credentials::CredentialPool;
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::WorkerError;
use crate::queue::{DelayQueue, Delivery, Publisher};
use crate::retry_schedule::RetrySchedule;
use crate::upstream::UpstreamGenerator;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Wires the credential pool (C2), upstream caller (C3), publisher (C6),
/// and delay queue (C7) into the per-delivery state machine.
pub struct DispatchLoop {
    credentials: Arc<CredentialPool>,
    upstream: Arc<dyn UpstreamGenerator>,
    publisher: Arc<dyn Publisher>,
    delay_queue: Arc<dyn DelayQueue>,
    retry_schedule: RetrySchedule,
}

impl DispatchLoop {
    pub fn new(
        credentials: Arc<CredentialPool>,
        upstream: Arc<dyn UpstreamGenerator>,
        publisher: Arc<dyn Publisher>,
        delay_queue: Arc<dyn DelayQueue>,
        retry_schedule: RetrySchedule,
    ) -> Self {
        Self {
            credentials,
            upstream,
            publisher,
            delay_queue,
            retry_schedule,
        }
    }

    /// Handle one decoded delivery to completion: exactly one of publish+ack,
    /// delay-requeue+ack, or reject-without-requeue happens per invocation
    /// (P6, P7). Errors along the way are logged; the only unrecoverable
    /// outcome is a publish failure, which per §4.5 must leave the delivery
    /// unacked rather than silently drop the response.
    pub async fn handle(&self, request: RequestEnvelope, delivery: Box<dyn Delivery>) {
        let start = Instant::now();

        loop {
            let key = match self.credentials.acquire().await {
                Some(key) => key,
                None => {
                    self.handle_exhausted(&request, delivery.as_ref(), start).await;
                    return;
                }
            };

            let outcome = self
                .upstream
                .generate(
                    &key,
                    &request.prompt,
                    &request.model,
                    &request.parameters,
                    &request.request_id,
                    request.system_instruction.as_deref(),
                )
                .await;

            match outcome {
                Ok(result) => {
                    if result.truncated {
                        warn!(
                            request_id = %request.request_id,
                            "upstream response truncated"
                        );
                    }
                    let response = ResponseEnvelope::success(
                        request.request_id,
                        result.content,
                        result.usage,
                        elapsed_ms(start),
                        request.model.clone(),
                        request.metadata.clone(),
                    );
                    self.publish_and_ack(&response, &request.callback_queue, delivery.as_ref())
                        .await;
                    return;
                }
                Err(WorkerError::RateLimited { .. }) => {
                    self.credentials.mark_rate_limited(&key).await;
                    continue;
                }
                Err(other) => {
                    warn!(
                        request_id = %request.request_id,
                        error = %other,
                        "terminal upstream error"
                    );
                    let response = ResponseEnvelope::error(
                        request.request_id,
                        other.to_response_message(),
                        elapsed_ms(start),
                        request.metadata.clone(),
                    );
                    self.publish_and_ack(&response, &request.callback_queue, delivery.as_ref())
                        .await;
                    return;
                }
            }
        }
    }

    /// Step 4 of §4.8: the credential pool is exhausted for this attempt.
    /// Either the retry budget is spent (terminal error response) or the
    /// message is requeued with an escalating delay.
    async fn handle_exhausted(
        &self,
        request: &RequestEnvelope,
        delivery: &dyn Delivery,
        start: Instant,
    ) {
        if self.retry_schedule.is_exhausted(request.retry_count) {
            let message = format!(
                "Rate limit exceeded after {} retries",
                self.retry_schedule.max_retries()
            );
            let response = ResponseEnvelope::error(
                request.request_id,
                message,
                elapsed_ms(start),
                request.metadata.clone(),
            );
            self.publish_and_ack(&response, &request.callback_queue, delivery)
                .await;
            return;
        }

        let delay = self.retry_schedule.delay_for(request.retry_count);
        match self
            .delay_queue
            .requeue_with_delay(request, delay.as_secs())
            .await
        {
            Ok(()) => {
                if let Err(err) = delivery.ack().await {
                    error!(request_id = %request.request_id, error = %err, "failed to ack after requeue");
                }
            }
            Err(err) => {
                warn!(
                    request_id = %request.request_id,
                    error = %err,
                    "failed to requeue with delay, rejecting without requeue"
                );
                if let Err(reject_err) = delivery.reject_without_requeue().await {
                    error!(request_id = %request.request_id, error = %reject_err, "failed to reject after requeue failure");
                }
            }
        }
    }

    /// §4.5: publish must succeed before the originating delivery is acked.
    /// A publish failure leaves the delivery unacked; the broker redelivers
    /// it after reconnect (at-least-once, §5).
    async fn publish_and_ack(
        &self,
        response: &ResponseEnvelope,
        queue: &str,
        delivery: &dyn Delivery,
    ) {
        match self.publisher.publish(response, queue).await {
            Ok(()) => {
                if let Err(err) = delivery.ack().await {
                    error!(request_id = %response.request_id, error = %err, "failed to ack after publish");
                }
            }
            Err(err) => {
                error!(
                    request_id = %response.request_id,
                    error = %err,
                    "publish failed, leaving delivery unacked for redelivery"
                );
            }
        }
        info!(request_id = %response.request_id, status = ?response.status, "delivery handled");
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
