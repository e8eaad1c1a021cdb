//! # llm-broker-worker
//!
//! A broker-mediated dispatch worker: it consumes chat-completion requests
//! from a durable queue, runs them against an OpenRouter-compatible upstream
//! through a rotating pool of API credentials, and publishes exactly one
//! response envelope per decodable request.
//!
//! ## Core components
//!
//! - [`credentials::CredentialPool`] — round-robin credential rotation with
//!   per-minute quotas and rate-limit cooldowns.
//! - [`upstream::UpstreamCaller`] — the HTTP client for the upstream chat
//!   completion endpoint, with in-process retry and error classification.
//! - [`queue`] — the broker plumbing: consumer, publisher, and the
//!   delay-requeue helper used for cross-attempt retry.
//! - [`dispatch::DispatchLoop`] — orchestrates the above per delivery and
//!   owns the ACK/NACK/requeue decision.
//!
//! ## Quick start
//!
//! ```no_run
//! use llm_broker_worker::config::Settings;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::from_env()?;
//!     println!("consuming from {}", settings.request_queue);
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod queue;
pub mod retry_policy;
pub mod retry_schedule;
pub mod upstream;

pub use config::{ConfigError, Settings};
pub use credentials::{CredentialPool, CredentialPoolConfig, CredentialStats};
pub use dispatch::DispatchLoop;
pub use envelope::{GenerationParameters, RequestEnvelope, ResponseEnvelope, ResponseStatus, TokenUsage};
pub use error::{BrokerError, DecodeError, WorkerError};
pub use queue::{DelayQueue, Delivery, LapinDelayQueue, Publisher, QueueConsumer, QueuePublisher};
pub use retry_policy::BackoffPolicy;
pub use retry_schedule::RetrySchedule;
pub use upstream::{GenerationResult, UpstreamCaller, UpstreamConfig, UpstreamGenerator};
