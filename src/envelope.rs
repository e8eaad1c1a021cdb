//! Request/response envelope schemas and strict (de)serialization (C4).
//!
//! Grounded on `examples/original_source/gemini-client/src/schemas/request.py`
//! and `response.py`; field names and numeric ranges are carried over, with
//! `top_k`/`candidate_count` intentionally dropped (see `SPEC_FULL.md`) since
//! the spec's own parameters table does not name them and OpenRouter ignores
//! both anyway.

use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Sampling and length controls for a single generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationParameters {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

fn default_temperature() -> f64 {
    0.7
}
fn default_top_p() -> f64 {
    0.95
}
fn default_max_output_tokens() -> u32 {
    8192
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_output_tokens: default_max_output_tokens(),
            stop_sequences: None,
        }
    }
}

impl GenerationParameters {
    fn validate(&self) -> Result<(), DecodeError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(DecodeError::Validation(format!(
                "temperature must be in [0, 2], got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(DecodeError::Validation(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if !(1..=32768).contains(&self.max_output_tokens) {
            return Err(DecodeError::Validation(format!(
                "max_output_tokens must be in [1, 32768], got {}",
                self.max_output_tokens
            )));
        }
        Ok(())
    }
}

/// A decoded, validated message consumed from the request queue (C5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestEnvelope {
    pub request_id: Uuid,
    pub prompt: String,
    pub model: String,
    #[serde(default)]
    pub parameters: GenerationParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    pub callback_queue: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl RequestEnvelope {
    /// Decode and validate a raw delivery body. Any failure here means the
    /// message is poison: the caller rejects it without requeue (§4.4).
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let envelope: RequestEnvelope = serde_json::from_slice(body)?;
        envelope.validate()?;
        Ok(envelope)
    }

    fn validate(&self) -> Result<(), DecodeError> {
        if self.prompt.is_empty() {
            return Err(DecodeError::Validation("prompt must be non-empty".into()));
        }
        if self.model.is_empty() {
            return Err(DecodeError::Validation("model must be non-empty".into()));
        }
        if self.callback_queue.is_empty() {
            return Err(DecodeError::Validation(
                "callback_queue must be non-empty".into(),
            ));
        }
        self.parameters.validate()
    }

    /// Return a copy suitable for requeueing via C7: `retry_count`
    /// incremented, `timestamp` refreshed to now.
    pub fn with_retry_incremented(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next.timestamp = Utc::now();
        next
    }
}

/// Token accounting reported by the upstream caller, when available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Outcome published to the callback queue (C6). Exactly one of
/// `content`/`error` is populated, depending on `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: Uuid,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

impl ResponseEnvelope {
    pub fn success(
        request_id: Uuid,
        content: String,
        usage: Option<TokenUsage>,
        processing_time_ms: f64,
        model_used: String,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Success,
            content: Some(content),
            error: None,
            usage,
            timestamp: Utc::now(),
            processing_time_ms: Some(processing_time_ms),
            model_used: Some(model_used),
            metadata,
        }
    }

    pub fn error(
        request_id: Uuid,
        error: String,
        processing_time_ms: f64,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Error,
            content: None,
            error: Some(error),
            usage: None,
            timestamp: Utc::now(),
            processing_time_ms: Some(processing_time_ms),
            model_used: None,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_body() -> Value {
        json!({
            "request_id": "123e4567-e89b-12d3-a456-426614174000",
            "prompt": "Tell me about Rust",
            "model": "google/gemini-2.5-flash",
            "callback_queue": "gemini.responses",
        })
    }

    #[test]
    fn decodes_minimal_envelope_with_defaults() {
        let body = valid_body();
        let envelope = RequestEnvelope::decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.retry_count, 0);
        assert_eq!(envelope.parameters.temperature, 0.7);
        assert!(envelope.metadata.is_none());
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut body = valid_body();
        body["extra_field"] = json!("surprise");
        let err = RequestEnvelope::decode(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn rejects_empty_prompt() {
        let mut body = valid_body();
        body["prompt"] = json!("");
        let err = RequestEnvelope::decode(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::Validation(_)));
    }

    #[test]
    fn rejects_temperature_out_of_range() {
        let mut body = valid_body();
        body["parameters"] = json!({ "temperature": 3.0 });
        let err = RequestEnvelope::decode(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::Validation(_)));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = RequestEnvelope::decode(b"not-json").unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn with_retry_incremented_bumps_count_and_timestamp() {
        let body = valid_body();
        let envelope = RequestEnvelope::decode(body.to_string().as_bytes()).unwrap();
        let retried = envelope.with_retry_incremented();
        assert_eq!(retried.retry_count, 1);
        assert!(retried.timestamp >= envelope.timestamp);
    }

    #[test]
    fn response_envelope_round_trips_through_json() {
        let resp = ResponseEnvelope::success(
            Uuid::new_v4(),
            "hello".to_string(),
            Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            42.0,
            "google/gemini-2.5-flash".to_string(),
            None,
        );
        let json = serde_json::to_string(&resp).unwrap();
        let decoded: ResponseEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, resp);
    }
}
