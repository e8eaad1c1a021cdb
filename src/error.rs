use thiserror::Error;

/// Errors raised by the upstream caller (C3) and classified for the
/// dispatch loop (C8). Each variant maps 1:1 onto the error taxonomy in
/// the spec.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// HTTP 429, or an error body mentioning "rate limit" / "quota" / "429".
    /// Retryable in-process (C1) and, on exhaustion, via the delay queue (C7).
    #[error("rate limit exceeded: {detail}")]
    RateLimited { detail: String },

    /// Upstream rejected the request because of the caller's apparent
    /// location/region. Retryable in-process only.
    #[error("request blocked by upstream location policy: {detail}")]
    LocationBlocked { detail: String },

    /// HTTP 401. Terminal.
    #[error("invalid API key: {detail}")]
    AuthFailed { detail: String },

    /// HTTP 400, or a 200 response with empty choices. Terminal.
    #[error("bad request to upstream API: {detail}")]
    BadRequest { detail: String },

    /// HTTP 5xx, timeout, or connection failure. Terminal at C3; the
    /// dispatch loop does not retry it beyond what C1 already attempted
    /// inside the call (amplifying an outage serves nobody).
    #[error("upstream server error: {detail}")]
    ServerError { detail: String },

    /// HTTP 200 with no extractable text. Terminal.
    #[error("empty response from upstream (finish_reason={finish_reason:?})")]
    EmptyResponse { finish_reason: Option<String> },

    /// Low-level HTTP transport failure (connection refused, DNS, etc.)
    /// that didn't reach an HTTP status code at all.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// JSON decoding of the upstream response body failed.
    #[error("failed to parse upstream response: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkerError {
    /// Whether C1's in-process backoff should retry this error with the
    /// same credential. Only `rate_limited` and `location_blocked` qualify
    /// per §4.3 of the spec.
    pub fn retryable_in_process(&self) -> bool {
        matches!(
            self,
            WorkerError::RateLimited { .. } | WorkerError::LocationBlocked { .. }
        )
    }

    /// The human-readable string placed into a response envelope's `error`
    /// field for a terminal failure.
    pub fn to_response_message(&self) -> String {
        self.to_string()
    }
}

/// Errors that can terminate the broker connection or a single publish.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The AMQP connection or channel failed (connect, declare, consume).
    #[error("broker connection error: {0}")]
    Connection(#[from] lapin::Error),

    /// A publish did not complete; per §4.5 the caller must not ack the
    /// originating delivery when this happens.
    #[error("failed to publish to '{queue}': {source}")]
    Publish {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    /// Broker failure that didn't originate from `lapin` itself — used by
    /// in-memory test fakes to simulate a publish failure without
    /// constructing a real `lapin::Error`.
    #[error("broker error: {0}")]
    Other(String),
}

/// Errors raised while decoding and validating a request envelope (C4).
/// Any of these mean the message is poison: reject without requeue, no
/// response is ever produced because no `request_id` can be trusted.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation failed: {0}")]
    Validation(String),
}
