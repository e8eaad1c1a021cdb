//! Broker plumbing: consumer (C5), publisher (C6), and delay-requeue helper
//! (C7), all built on `lapin` against a plain AMQP 0.9.1 broker.
//!
//! Grounded on `examples/original_source/gemini-client/src/worker/consumer.py`
//! and `publisher.py` (`aio-pika`), re-expressed with `lapin` as the
//! idiomatic Rust counterpart — no example repo in the pack ships an AMQP
//! client, so this is deliberate enrichment rather than a teacher
//! substitution (see `DESIGN.md`).

pub mod consumer;
pub mod delay;
#[cfg(test)]
pub mod fakes;
pub mod publisher;

pub use consumer::{Delivery, QueueConsumer};
pub use delay::{DelayQueue, LapinDelayQueue};
pub use publisher::{Publisher, QueuePublisher};
