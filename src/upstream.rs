//! Upstream chat-completion caller (C3): request construction, response
//! parsing, error classification, and in-process retry for a single call.
//!
//! Grounded on `backend/openai.rs`'s `OpenAiBackend` (request/header building,
//! metadata extraction) and `backend/mod.rs`'s `with_backoff` (the retry-loop
//! shape), generalized from a provider-agnostic `Backend` trait to the one
//! concrete OpenRouter-compatible endpoint this spec calls for. Error
//! classification substrings are taken from
//! `examples/original_source/gemini-client/src/client/gemini.py`.

use crate::envelope::{GenerationParameters, TokenUsage};
use crate::error::WorkerError;
use crate::retry_policy::BackoffPolicy;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// A successful upstream generation: extracted text plus token accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub truncated: bool,
}

/// Configuration fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub site_url: Option<String>,
    pub site_name: Option<String>,
    pub backoff: BackoffPolicy,
}

/// Object-safe seam so the dispatch loop (C8) can run against an in-memory
/// stub instead of a live HTTP client. Mirrors the `Backend` trait's role in
/// `backend/mod.rs`.
#[async_trait]
pub trait UpstreamGenerator: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn generate(
        &self,
        key: &str,
        prompt: &str,
        model: &str,
        parameters: &GenerationParameters,
        request_id: &Uuid,
        system_instruction: Option<&str>,
    ) -> Result<GenerationResult, WorkerError>;
}

/// Thin HTTP client wrapper implementing C3's contract.
pub struct UpstreamCaller {
    client: Client,
    config: UpstreamConfig,
}

impl UpstreamCaller {
    /// Build a caller with the spec's default timeouts (§4.3: connect 10s,
    /// read 120s, write 10s, pool 10s). `reqwest` exposes connect/overall
    /// timeouts directly; write/pool timeouts are not independently
    /// configurable on its `ClientBuilder`, so `timeout` covers the full
    /// request lifecycle and `connect_timeout` covers the handshake.
    pub fn new(config: UpstreamConfig, proxy: Option<&str>) -> Result<Self, WorkerError> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .pool_idle_timeout(Duration::from_secs(10));

        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url)?;
            builder = builder.proxy(proxy);
        }

        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    /// Run a single `generate` call with C1's in-process retry wrapper:
    /// `rate_limited`/`location_blocked` are retried with the same
    /// credential up to `backoff.max_retries` times; every other error
    /// kind returns immediately.
    pub async fn generate(
        &self,
        key: &str,
        prompt: &str,
        model: &str,
        parameters: &GenerationParameters,
        request_id: &uuid::Uuid,
        system_instruction: Option<&str>,
    ) -> Result<GenerationResult, WorkerError> {
        let mut attempt = 0;
        loop {
            let outcome = self
                .call_once(key, prompt, model, parameters, request_id, system_instruction)
                .await;

            match outcome {
                Ok(result) => return Ok(result),
                Err(err) if self.config.backoff.is_retryable(&err) && attempt < self.config.backoff.max_retries => {
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    warn!(
                        %request_id,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "retrying upstream call in-process"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_once(
        &self,
        key: &str,
        prompt: &str,
        model: &str,
        parameters: &GenerationParameters,
        request_id: &uuid::Uuid,
        system_instruction: Option<&str>,
    ) -> Result<GenerationResult, WorkerError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = self.build_body(prompt, model, parameters, system_instruction);

        let mut req = self.client.post(&url).bearer_auth(key).json(&body);
        if let Some(site_url) = &self.config.site_url {
            req = req.header("HTTP-Referer", site_url);
        }
        if let Some(site_name) = &self.config.site_name {
            req = req.header("X-Title", site_name);
        }

        let resp = req.send().await.map_err(classify_transport_error)?;
        let status = resp.status();

        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            debug!(%request_id, %status, "upstream returned non-success status");
            return Err(classify_status_error(status, &text));
        }

        let json_resp: Value = resp.json().await?;
        parse_generation_response(&json_resp)
    }

    fn build_body(
        &self,
        prompt: &str,
        model: &str,
        parameters: &GenerationParameters,
        system_instruction: Option<&str>,
    ) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = system_instruction {
            if !system.is_empty() {
                messages.push(json!({"role": "system", "content": system}));
            }
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": parameters.temperature,
            "top_p": parameters.top_p,
            "max_tokens": parameters.max_output_tokens,
        });
        if let Some(stop) = &parameters.stop_sequences {
            body["stop"] = json!(stop);
        }
        body
    }
}

#[async_trait]
impl UpstreamGenerator for UpstreamCaller {
    async fn generate(
        &self,
        key: &str,
        prompt: &str,
        model: &str,
        parameters: &GenerationParameters,
        request_id: &Uuid,
        system_instruction: Option<&str>,
    ) -> Result<GenerationResult, WorkerError> {
        UpstreamCaller::generate(self, key, prompt, model, parameters, request_id, system_instruction).await
    }
}

/// Extract text and usage from an OpenAI-compatible chat-completion body.
fn parse_generation_response(json_resp: &Value) -> Result<GenerationResult, WorkerError> {
    let first_choice = json_resp.get("choices").and_then(|c| c.get(0));

    let content = first_choice
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let finish_reason = first_choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if content.is_empty() {
        return Err(WorkerError::EmptyResponse { finish_reason });
    }

    let usage = json_resp.get("usage").map(|u| TokenUsage {
        prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        completion_tokens: u
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
    });

    Ok(GenerationResult {
        content: content.to_string(),
        usage,
        truncated: finish_reason.as_deref() == Some("length"),
    })
}

/// Status-code-first classification for a non-2xx HTTP response.
fn classify_status_error(status: StatusCode, body: &str) -> WorkerError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => WorkerError::RateLimited {
            detail: body.to_string(),
        },
        StatusCode::UNAUTHORIZED => WorkerError::AuthFailed {
            detail: body.to_string(),
        },
        StatusCode::BAD_REQUEST => WorkerError::BadRequest {
            detail: body.to_string(),
        },
        s if s.is_server_error() => WorkerError::ServerError {
            detail: body.to_string(),
        },
        _ => classify_by_substring(body).unwrap_or(WorkerError::ServerError {
            detail: format!("unexpected status {status}: {body}"),
        }),
    }
}

/// Substring fallback for providers that encode the real error in the body
/// text rather than the status code (mirrors `gemini.py`'s exception-message
/// inspection for the cases a status code alone can't disambiguate).
fn classify_by_substring(body: &str) -> Option<WorkerError> {
    let lower = body.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("quota") {
        return Some(WorkerError::RateLimited {
            detail: body.to_string(),
        });
    }
    if lower.contains("location") || lower.contains("region") {
        return Some(WorkerError::LocationBlocked {
            detail: body.to_string(),
        });
    }
    None
}

/// A transport-level failure (connection refused, DNS, timeout) that never
/// produced an HTTP status. Classified as `server_error`: per §4.3 this is
/// terminal at C3, the dispatch loop does not amplify an outage.
fn classify_transport_error(err: reqwest::Error) -> WorkerError {
    if err.is_timeout() || err.is_connect() {
        WorkerError::ServerError {
            detail: err.to_string(),
        }
    } else {
        WorkerError::Transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::GenerationParameters;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn caller(base_url: String) -> UpstreamCaller {
        UpstreamCaller::new(
            UpstreamConfig {
                base_url,
                site_url: None,
                site_name: None,
                backoff: BackoffPolicy {
                    base: Duration::from_millis(1),
                    exp_base: 2.0,
                    max_delay: Duration::from_millis(5),
                    max_retries: 2,
                },
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn parses_success_response_with_usage() {
        let body = json!({
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
        });
        let result = parse_generation_response(&body).unwrap();
        assert_eq!(result.content, "hello");
        assert!(!result.truncated);
        assert_eq!(result.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn flags_truncation_on_length_finish_reason() {
        let body = json!({
            "choices": [{"message": {"content": "partial"}, "finish_reason": "length"}],
        });
        let result = parse_generation_response(&body).unwrap();
        assert!(result.truncated);
    }

    #[test]
    fn empty_content_is_empty_response_error() {
        let body = json!({
            "choices": [{"message": {"content": ""}, "finish_reason": "stop"}],
        });
        let err = parse_generation_response(&body).unwrap_err();
        assert!(matches!(err, WorkerError::EmptyResponse { .. }));
    }

    #[test]
    fn classifies_429_as_rate_limited() {
        let err = classify_status_error(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err, WorkerError::RateLimited { .. }));
    }

    #[test]
    fn classifies_401_as_auth_failed() {
        let err = classify_status_error(StatusCode::UNAUTHORIZED, "bad key");
        assert!(matches!(err, WorkerError::AuthFailed { .. }));
    }

    #[test]
    fn classifies_substring_quota_as_rate_limited() {
        let err = classify_status_error(StatusCode::INTERNAL_SERVER_ERROR, "quota exceeded");
        // 5xx is matched before substring fallback per the status-first rule.
        assert!(matches!(err, WorkerError::ServerError { .. }));

        let err = classify_status_error(StatusCode::OK, "quota exceeded for this key");
        assert!(matches!(err, WorkerError::RateLimited { .. }));
    }

    #[test]
    fn classifies_location_substring() {
        let err = classify_status_error(StatusCode::OK, "unsupported region for this request");
        assert!(matches!(err, WorkerError::LocationBlocked { .. }));
    }

    #[tokio::test]
    async fn generate_happy_path_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "hi there"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5},
            })))
            .mount(&server)
            .await;

        let caller = caller(server.uri());
        let params = GenerationParameters::default();
        let result = caller
            .generate(
                "test-key",
                "hello",
                "some-model",
                &params,
                &uuid::Uuid::new_v4(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.content, "hi there");
    }

    #[tokio::test]
    async fn generate_retries_rate_limit_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limit exceeded"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "recovered"}, "finish_reason": "stop"}],
            })))
            .mount(&server)
            .await;

        let caller = caller(server.uri());
        let params = GenerationParameters::default();
        let result = caller
            .generate(
                "test-key",
                "hello",
                "some-model",
                &params,
                &uuid::Uuid::new_v4(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.content, "recovered");
    }

    #[tokio::test]
    async fn generate_auth_failure_is_terminal_no_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .expect(1)
            .mount(&server)
            .await;

        let caller = caller(server.uri());
        let params = GenerationParameters::default();
        let err = caller
            .generate(
                "test-key",
                "hello",
                "some-model",
                &params,
                &uuid::Uuid::new_v4(),
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::AuthFailed { .. }));
    }
}
