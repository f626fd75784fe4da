//! Vision-model interaction: build the request body and call the provider.
//!
//! Prompt wording lives in [`crate::prompts`] and JSON cleanup in
//! [`crate::pipeline::postprocess`]. What remains here is the wire format of the two supported APIs and the
//! mapping of transport/HTTP failures onto [`InvoiceError::ApiRequest`].
//!
//! ## Message Layout
//!
//! Every request has exactly one system entry and one user entry. The user
//! entry carries an optional text block followed by one image block per
//! photo, in the order given. OpenAI-compatible endpoints take the system
//! prompt as a `role: system` message and images as data URIs; Anthropic
//! takes a top-level `system` string and base64 `source` blocks.
//!
//! There is no retry. A failed call surfaces immediately with the remote
//! status and message; batch callers re-run and skip-if-exists resumes.

use crate::error::{snippet, InvoiceError};
use crate::pipeline::encode::EncodedImage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Sent with every Anthropic request.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Which wire format and defaults to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI chat-completions, or any compatible server.
    #[default]
    OpenAi,
    /// Anthropic messages API.
    Anthropic,
}

impl Provider {
    pub fn default_endpoint(self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1/chat/completions",
            Provider::Anthropic => "https://api.anthropic.com/v1/messages",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::Anthropic => "claude-3-7-sonnet-20250219",
        }
    }

    pub fn api_key_env(self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    pub fn endpoint_env(self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_ENDPOINT",
            Provider::Anthropic => "ANTHROPIC_API_ENDPOINT",
        }
    }

    pub fn model_env(self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_MODEL",
            Provider::Anthropic => "ANTHROPIC_MODEL",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Provider {
    type Err = InvoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" | "open-ai" => Ok(Provider::OpenAi),
            "anthropic" | "claude" => Ok(Provider::Anthropic),
            other => Err(InvoiceError::InvalidConfig(format!(
                "unknown provider '{other}' (expected 'openai' or 'anthropic')"
            ))),
        }
    }
}

/// One multimodal call.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub model: String,
    pub system: String,
    /// Optional user text placed before the images.
    pub text: Option<String>,
    pub images: Vec<EncodedImage>,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// The raw reply text plus token accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Completion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// A vision-capable model endpoint.
#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn complete(&self, request: &InferenceRequest) -> Result<Completion, InvoiceError>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "vision"
    }
}

// ── HTTP client ──────────────────────────────────────────────────────────────

/// [`VisionClient`] over HTTPS via `reqwest`.
pub struct HttpVisionClient {
    provider: Provider,
    endpoint: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpVisionClient {
    pub fn new(
        provider: Provider,
        api_key: impl Into<String>,
        endpoint: Option<String>,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, InvoiceError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| InvoiceError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_http_client(provider, api_key, endpoint, http))
    }

    /// Use a caller-configured `reqwest::Client` (proxy, TLS roots, timeouts).
    pub fn with_http_client(
        provider: Provider,
        api_key: impl Into<String>,
        endpoint: Option<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            provider,
            endpoint: endpoint.unwrap_or_else(|| provider.default_endpoint().to_string()),
            api_key: api_key.into(),
            http,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl std::fmt::Debug for HttpVisionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVisionClient")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl VisionClient for HttpVisionClient {
    async fn complete(&self, request: &InferenceRequest) -> Result<Completion, InvoiceError> {
        let start = Instant::now();
        let body = build_body(self.provider, request);

        let builder = self.http.post(&self.endpoint).json(&body);
        let builder = match self.provider {
            Provider::OpenAi => builder.bearer_auth(&self.api_key),
            Provider::Anthropic => builder
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| InvoiceError::api(format!("request to {} failed: {e}", self.endpoint)))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| InvoiceError::ApiRequest {
            status: Some(status.as_u16()),
            message: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(InvoiceError::ApiRequest {
                status: Some(status.as_u16()),
                message: error_message(&text),
            });
        }

        let envelope: Value = serde_json::from_str(&text).map_err(|e| InvoiceError::ApiRequest {
            status: Some(status.as_u16()),
            message: format!("response is not JSON ({e}): {}", snippet(&text)),
        })?;
        if envelope.get("error").is_some_and(|e| !e.is_null()) {
            return Err(InvoiceError::ApiRequest {
                status: Some(status.as_u16()),
                message: error_message(&text),
            });
        }

        let completion = parse_completion(self.provider, &envelope)?;
        debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            self.provider,
            completion.input_tokens,
            completion.output_tokens,
            start.elapsed()
        );
        Ok(completion)
    }

    fn name(&self) -> &str {
        self.provider.name()
    }
}

/// Request body for `provider`.
pub fn build_body(provider: Provider, request: &InferenceRequest) -> Value {
    let mut content = Vec::with_capacity(request.images.len() + 1);
    if let Some(text) = request.text.as_deref().filter(|t| !t.is_empty()) {
        content.push(json!({ "type": "text", "text": text }));
    }

    match provider {
        Provider::OpenAi => {
            content.extend(request.images.iter().map(|img| {
                json!({ "type": "image_url", "image_url": { "url": img.data_uri() } })
            }));
            json!({
                "model": request.model,
                "max_tokens": request.max_tokens,
                "temperature": request.temperature,
                "messages": [
                    { "role": "system", "content": request.system },
                    { "role": "user", "content": content },
                ],
            })
        }
        Provider::Anthropic => {
            content.extend(request.images.iter().map(|img| {
                json!({
                    "type": "image",
                    "source": { "type": "base64", "media_type": img.media_type, "data": img.data },
                })
            }));
            json!({
                "model": request.model,
                "max_tokens": request.max_tokens,
                "temperature": request.temperature,
                "system": request.system,
                "messages": [
                    { "role": "user", "content": content },
                ],
            })
        }
    }
}

/// Pull the reply text and token counts out of a 2xx envelope.
pub fn parse_completion(provider: Provider, envelope: &Value) -> Result<Completion, InvoiceError> {
    let (text, input, output) = match provider {
        Provider::OpenAi => (
            envelope
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str),
            envelope.pointer("/usage/prompt_tokens"),
            envelope.pointer("/usage/completion_tokens"),
        ),
        Provider::Anthropic => (
            envelope
                .get("content")
                .and_then(Value::as_array)
                .and_then(|blocks| {
                    blocks
                        .iter()
                        .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                })
                .and_then(|b| b.get("text"))
                .and_then(Value::as_str),
            envelope.pointer("/usage/input_tokens"),
            envelope.pointer("/usage/output_tokens"),
        ),
    };

    let text = text.ok_or_else(|| InvoiceError::api("no content in response"))?;
    let tokens = |v: Option<&Value>| {
        v.and_then(Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(0)
    };
    Ok(Completion {
        text: text.to_string(),
        input_tokens: tokens(input),
        output_tokens: tokens(output),
    })
}

/// The remote `error.message`, or the raw body when it does not parse.
pub fn error_message(body: &str) -> String {
    if body.trim().is_empty() {
        return "empty response body".to_string();
    }
    let Ok(v) = serde_json::from_str::<Value>(body) else {
        return snippet(body);
    };
    match v.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(err) => err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| snippet(body)),
        None => v
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| snippet(body)),
    }
}

// ── Canned client ────────────────────────────────────────────────────────────

/// Returns the same reply to every request without touching the network.
///
/// Used by tests and by callers wiring up a pipeline without an API key.
#[derive(Debug, Default)]
pub struct StaticClient {
    reply: String,
    calls: AtomicUsize,
}

impl StaticClient {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `complete` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionClient for StaticClient {
    async fn complete(&self, request: &InferenceRequest) -> Result<Completion, InvoiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            text: self.reply.clone(),
            input_tokens: request.images.len() as u32,
            output_tokens: 0,
        })
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InferenceRequest {
        InferenceRequest {
            model: "m".into(),
            system: "sys".into(),
            text: Some("extract".into()),
            images: vec![
                EncodedImage::new("image/jpeg", "AAAA"),
                EncodedImage::new("image/png", "BBBB"),
            ],
            max_tokens: 4096,
            temperature: 0.1,
        }
    }

    #[test]
    fn openai_body_layout() {
        let body = build_body(Provider::OpenAi, &request());
        assert_eq!(body["model"], "m");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["temperature"], 0.1);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "sys");
        let content = messages[1]["content"].as_array().unwrap();
        assert_eq!(content.len(), 3);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["image_url"]["url"], "data:image/jpeg;base64,AAAA");
        assert_eq!(content[2]["image_url"]["url"], "data:image/png;base64,BBBB");
    }

    #[test]
    fn anthropic_body_layout() {
        let body = build_body(Provider::Anthropic, &request());
        assert_eq!(body["system"], "sys");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        let content = messages[0]["content"].as_array().unwrap();
        assert_eq!(content[1]["type"], "image");
        assert_eq!(content[1]["source"]["type"], "base64");
        assert_eq!(content[1]["source"]["media_type"], "image/jpeg");
        assert_eq!(content[2]["source"]["data"], "BBBB");
    }

    #[test]
    fn empty_text_block_is_omitted() {
        let mut req = request();
        req.text = None;
        let body = build_body(Provider::OpenAi, &req);
        assert_eq!(body["messages"][1]["content"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn parse_openai_envelope() {
        let env = json!({
            "choices": [{ "message": { "role": "assistant", "content": "{}" } }],
            "usage": { "prompt_tokens": 812, "completion_tokens": 95 }
        });
        let c = parse_completion(Provider::OpenAi, &env).unwrap();
        assert_eq!(c, Completion { text: "{}".into(), input_tokens: 812, output_tokens: 95 });
    }

    #[test]
    fn parse_anthropic_envelope_takes_first_text_block() {
        let env = json!({
            "content": [
                { "type": "thinking", "thinking": "…" },
                { "type": "text", "text": "{\"a\":1}" },
                { "type": "text", "text": "ignored" }
            ],
            "usage": { "input_tokens": 10, "output_tokens": 3 }
        });
        let c = parse_completion(Provider::Anthropic, &env).unwrap();
        assert_eq!(c.text, "{\"a\":1}");
        assert_eq!((c.input_tokens, c.output_tokens), (10, 3));
    }

    #[test]
    fn missing_content_is_api_error() {
        let env = json!({ "choices": [{ "message": { "content": null } }] });
        let err = parse_completion(Provider::OpenAi, &env).unwrap_err();
        assert_eq!(err.to_string(), "API request failed: no content in response");
        assert!(parse_completion(Provider::Anthropic, &json!({ "content": [] })).is_err());
    }

    #[test]
    fn error_message_prefers_remote_message() {
        assert_eq!(
            error_message(r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#),
            "Incorrect API key provided"
        );
        assert_eq!(
            error_message(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#),
            "Overloaded"
        );
        assert_eq!(error_message("<html>Bad Gateway</html>"), "<html>Bad Gateway</html>");
        assert_eq!(error_message(""), "empty response body");
    }

    #[test]
    fn provider_parsing_and_defaults() {
        assert_eq!("OpenAI".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert_eq!("anthropic".parse::<Provider>().unwrap(), Provider::Anthropic);
        assert!("gemini".parse::<Provider>().is_err());
        assert_eq!(Provider::OpenAi.api_key_env(), "OPENAI_API_KEY");
        assert_eq!(Provider::Anthropic.default_model(), "claude-3-7-sonnet-20250219");
    }

    #[test]
    fn static_client_counts_calls() {
        let client = StaticClient::new("{}");
        let c = tokio_test::block_on(client.complete(&request())).unwrap();
        assert_eq!(c.text, "{}");
        assert_eq!(client.calls(), 1);
    }

    #[test]
    fn http_client_debug_redacts_key() {
        let client = HttpVisionClient::new(
            Provider::Anthropic,
            "sk-secret",
            None,
            Duration::from_secs(300),
            Duration::from_secs(30),
        )
        .unwrap();
        let dbg = format!("{client:?}");
        assert!(!dbg.contains("sk-secret"));
        assert_eq!(client.endpoint(), "https://api.anthropic.com/v1/messages");
    }
}
