use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde_json::{Value, json};
use thiserror::Error;

use super::{Dialect, Provider};

const ERROR_BODY_EXCERPT_CHARS: usize = 500;

pub type CallFuture<'a> = Pin<Box<dyn Future<Output = Result<CallSuccess, CallError>> + Send + 'a>>;

/// Uniform calling surface over every provider dialect. The production
/// implementation is [`ProviderAdapter`]; tests substitute stubs.
pub trait ProviderCaller: Send + Sync {
    fn call<'a>(&'a self, target: CallTarget, request: CallRequest) -> CallFuture<'a>;
}

#[derive(Debug, Clone)]
pub struct CallTarget {
    pub provider: &'static Provider,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct CallRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone)]
pub struct CallSuccess {
    pub text: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallErrorKind {
    /// Invalid or expired credential; the key should be rotated.
    Auth,
    RateLimited,
    Transient,
    NonRetryable,
}

impl CallErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::NonRetryable => "non_retryable",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Transient)
    }
}

#[derive(Debug, Clone)]
pub struct CallError {
    pub kind: CallErrorKind,
    pub detail: String,
    pub latency_ms: i64,
}

#[derive(Debug, Error)]
pub enum AdapterBuildError {
    #[error("failed to build provider http client: {0}")]
    HttpClient(String),
}

/// Shapes requests and extracts responses for every configured dialect over
/// one pooled HTTP client.
pub struct ProviderAdapter {
    client: reqwest::Client,
    call_timeout: Duration,
}

impl ProviderAdapter {
    pub fn new(per_call_timeout_ms: u64) -> Result<Self, AdapterBuildError> {
        let call_timeout = Duration::from_millis(per_call_timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|err| AdapterBuildError::HttpClient(err.to_string()))?;

        Ok(Self {
            client,
            call_timeout,
        })
    }

    async fn send(&self, target: &CallTarget, request: &CallRequest) -> Result<CallSuccess, CallError> {
        let provider = target.provider;
        let url = endpoint_url(provider, &target.key);
        let body = request_body(provider.dialect, provider.default_model, request);
        let started = Instant::now();

        let mut builder = self
            .client
            .post(url)
            .timeout(self.call_timeout)
            .json(&body);
        builder = apply_auth(builder, provider.dialect, &target.key);

        let response = builder.send().await.map_err(|err| {
            let detail = if err.is_timeout() {
                "request timed out".to_string()
            } else {
                format!("request failed: {err}")
            };
            CallError {
                kind: CallErrorKind::Transient,
                detail,
                latency_ms: elapsed_ms(started),
            }
        })?;

        let status = response.status();
        let body_text = response.text().await.map_err(|err| CallError {
            kind: CallErrorKind::Transient,
            detail: format!("response body read failed: {err}"),
            latency_ms: elapsed_ms(started),
        })?;
        let latency_ms = elapsed_ms(started);

        if !status.is_success() {
            return Err(CallError {
                kind: classify_status(status),
                detail: format!(
                    "status={} body={}",
                    status.as_u16(),
                    excerpt(&body_text)
                ),
                latency_ms,
            });
        }

        let parsed: Value = serde_json::from_str(&body_text).map_err(|_| CallError {
            kind: CallErrorKind::NonRetryable,
            detail: "response was not valid json".to_string(),
            latency_ms,
        })?;

        let text = extract_text(provider.dialect, &parsed).ok_or_else(|| CallError {
            kind: CallErrorKind::NonRetryable,
            detail: "response payload had no completion text".to_string(),
            latency_ms,
        })?;

        let (prompt_tokens, completion_tokens) = extract_usage(provider.dialect, &parsed)
            .unwrap_or_else(|| (estimate_tokens(&request.prompt), estimate_tokens(&text)));

        Ok(CallSuccess {
            text,
            model: provider.default_model.to_string(),
            prompt_tokens,
            completion_tokens,
            latency_ms,
        })
    }
}

impl ProviderCaller for ProviderAdapter {
    fn call<'a>(&'a self, target: CallTarget, request: CallRequest) -> CallFuture<'a> {
        Box::pin(async move { self.send(&target, &request).await })
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

fn excerpt(body: &str) -> String {
    body.chars().take(ERROR_BODY_EXCERPT_CHARS).collect()
}

/// Rough token estimate used when a provider does not report usage.
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.len().div_ceil(4)).unwrap_or(u32::MAX)
}

fn endpoint_url(provider: &Provider, key: &str) -> String {
    match provider.dialect {
        Dialect::GeminiGenerateContent => format!(
            "{}/{}:generateContent?key={}",
            provider.endpoint, provider.default_model, key
        ),
        Dialect::Ai21Complete => {
            format!("{}/{}/complete", provider.endpoint, provider.default_model)
        }
        _ => provider.endpoint.to_string(),
    }
}

fn apply_auth(
    builder: reqwest::RequestBuilder,
    dialect: Dialect,
    key: &str,
) -> reqwest::RequestBuilder {
    match dialect {
        Dialect::OpenAiChat | Dialect::Ai21Complete | Dialect::CohereGenerate => {
            builder.bearer_auth(key)
        }
        Dialect::AnthropicMessages => builder
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01"),
        // Key travels as a query parameter.
        Dialect::GeminiGenerateContent => builder,
    }
}

fn request_body(dialect: Dialect, model: &str, request: &CallRequest) -> Value {
    match dialect {
        Dialect::OpenAiChat => json!({
            "model": model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        }),
        Dialect::AnthropicMessages => json!({
            "model": model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{ "role": "user", "content": request.prompt }],
        }),
        Dialect::GeminiGenerateContent => json!({
            "contents": [{ "parts": [{ "text": request.prompt }] }],
            "generationConfig": {
                "maxOutputTokens": request.max_tokens,
                "temperature": request.temperature,
            },
        }),
        Dialect::Ai21Complete => json!({
            "prompt": request.prompt,
            "maxTokens": request.max_tokens,
            "temperature": request.temperature,
        }),
        Dialect::CohereGenerate => json!({
            "model": model,
            "prompt": request.prompt,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        }),
    }
}

fn extract_text(dialect: Dialect, value: &Value) -> Option<String> {
    let pointer = match dialect {
        Dialect::OpenAiChat => "/choices/0/message/content",
        Dialect::AnthropicMessages => "/content/0/text",
        Dialect::GeminiGenerateContent => "/candidates/0/content/parts/0/text",
        Dialect::Ai21Complete => "/completions/0/data/text",
        Dialect::CohereGenerate => "/generations/0/text",
    };
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn extract_usage(dialect: Dialect, value: &Value) -> Option<(u32, u32)> {
    let (prompt_pointer, completion_pointer) = match dialect {
        Dialect::OpenAiChat => ("/usage/prompt_tokens", "/usage/completion_tokens"),
        Dialect::AnthropicMessages => ("/usage/input_tokens", "/usage/output_tokens"),
        Dialect::GeminiGenerateContent => (
            "/usageMetadata/promptTokenCount",
            "/usageMetadata/candidatesTokenCount",
        ),
        // AI21 completion responses carry no usable usage block.
        Dialect::Ai21Complete => return None,
        Dialect::CohereGenerate => (
            "/meta/billed_units/input_tokens",
            "/meta/billed_units/output_tokens",
        ),
    };

    let prompt = value.pointer(prompt_pointer)?.as_u64()?;
    let completion = value.pointer(completion_pointer)?.as_u64()?;
    Some((clamp_u64(prompt), clamp_u64(completion)))
}

fn clamp_u64(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn classify_status(status: StatusCode) -> CallErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CallErrorKind::Auth,
        StatusCode::TOO_MANY_REQUESTS => CallErrorKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT => CallErrorKind::Transient,
        status if status.is_server_error() => CallErrorKind::Transient,
        _ => CallErrorKind::NonRetryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderId, provider};

    fn request() -> CallRequest {
        CallRequest {
            prompt: "Tell me about example.com".to_string(),
            max_tokens: 500,
            temperature: 0.7,
        }
    }

    #[test]
    fn openai_chat_body_shape() {
        let body = request_body(Dialect::OpenAiChat, "gpt-4o-mini", &request());
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Tell me about example.com");
        assert_eq!(body["max_tokens"], 500);
    }

    #[test]
    fn anthropic_body_carries_max_tokens_at_top_level() {
        let body = request_body(Dialect::AnthropicMessages, "claude-3-5-haiku-20241022", &request());
        assert_eq!(body["max_tokens"], 500);
        assert_eq!(body["messages"][0]["content"], "Tell me about example.com");
    }

    #[test]
    fn gemini_key_is_a_query_parameter() {
        let url = endpoint_url(provider(ProviderId::Google), "g-key");
        assert!(url.ends_with("gemini-1.5-flash:generateContent?key=g-key"));
    }

    #[test]
    fn ai21_model_is_in_the_path() {
        let url = endpoint_url(provider(ProviderId::Ai21), "unused");
        assert_eq!(url, "https://api.ai21.com/studio/v1/j2-ultra/complete");
        let body = request_body(Dialect::Ai21Complete, "j2-ultra", &request());
        assert_eq!(body["maxTokens"], 500);
        assert!(body.get("model").is_none());
    }

    #[test]
    fn text_extraction_per_dialect() {
        let cases = [
            (
                Dialect::OpenAiChat,
                json!({"choices": [{"message": {"content": "hi"}}]}),
            ),
            (
                Dialect::AnthropicMessages,
                json!({"content": [{"type": "text", "text": "hi"}]}),
            ),
            (
                Dialect::GeminiGenerateContent,
                json!({"candidates": [{"content": {"parts": [{"text": "hi"}]}}]}),
            ),
            (
                Dialect::Ai21Complete,
                json!({"completions": [{"data": {"text": "hi"}}]}),
            ),
            (
                Dialect::CohereGenerate,
                json!({"generations": [{"text": "hi"}]}),
            ),
        ];
        for (dialect, payload) in cases {
            assert_eq!(extract_text(dialect, &payload).as_deref(), Some("hi"));
        }
    }

    #[test]
    fn missing_completion_text_is_detected() {
        let payload = json!({"choices": []});
        assert_eq!(extract_text(Dialect::OpenAiChat, &payload), None);
    }

    #[test]
    fn usage_extraction_falls_back_to_estimate() {
        let payload = json!({"completions": [{"data": {"text": "four char"}}]});
        assert_eq!(extract_usage(Dialect::Ai21Complete, &payload), None);
        assert_eq!(estimate_tokens("12345678"), 2);
        assert_eq!(estimate_tokens("123456789"), 3);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            CallErrorKind::Auth
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            CallErrorKind::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            CallErrorKind::Transient
        );
        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT),
            CallErrorKind::Transient
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            CallErrorKind::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            CallErrorKind::NonRetryable
        );
    }
}
