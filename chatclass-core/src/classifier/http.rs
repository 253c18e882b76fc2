//! HTTP completion client for the supported providers.

use super::CompletionClient;
use crate::config::{LlmConfig, LlmProvider};
use crate::{Error, Result};
use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_AZURE_API_VERSION: &str = "2024-06-01";

/// Build the HTTP client for `[llm]`.
pub fn create_completion_client(config: &LlmConfig) -> Result<HttpCompletionClient> {
    HttpCompletionClient::new(config)
}

pub struct HttpCompletionClient {
    model: String,
    provider: LlmProvider,
    endpoint: String,
    api_key: Option<String>,
    api_version: String,
    max_tokens: u32,
    temperature: f32,
    runtime: tokio::runtime::Runtime,
    http: reqwest::Client,
}

impl HttpCompletionClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .or_else(|| config.provider.default_endpoint().map(ToString::to_string))
            .ok_or_else(|| Error::Config("llm.endpoint is required for azure_openai".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let api_key = if config.provider.requires_api_key() {
            let key = config.resolve_api_key();
            if key.is_none() {
                return Err(Error::Fatal(
                    "llm.api_key (or provider env var) is required".to_string(),
                ));
            }
            key
        } else {
            None
        };

        // Pipeline workers share this client and each blocks on it
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| Error::Fatal(format!("failed to build tokio runtime: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Fatal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            model: config.model.clone(),
            provider: config.provider,
            endpoint,
            api_key,
            api_version: config
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            runtime,
            http,
        })
    }

    fn url(&self) -> String {
        match self.provider {
            LlmProvider::Ollama => format!("{}/api/chat", self.endpoint),
            LlmProvider::Claude => format!("{}/v1/messages", self.endpoint),
            LlmProvider::OpenAI => format!("{}/v1/chat/completions", self.endpoint),
            LlmProvider::AzureOpenAI => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.endpoint,
                urlencoding::encode(&self.model),
                urlencoding::encode(&self.api_version)
            ),
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let key = self.api_key.as_deref().unwrap_or_default();
        let invalid = |e: InvalidHeaderValue| Error::Fatal(format!("invalid api key header: {e}"));
        match self.provider {
            LlmProvider::Ollama => {}
            LlmProvider::Claude => {
                headers.insert("x-api-key", HeaderValue::from_str(key).map_err(invalid)?);
                headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
            }
            LlmProvider::OpenAI => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {key}")).map_err(invalid)?,
                );
            }
            LlmProvider::AzureOpenAI => {
                headers.insert("api-key", HeaderValue::from_str(key).map_err(invalid)?);
            }
        }
        Ok(headers)
    }

    fn body(&self, system: &str, user: &str) -> Value {
        match self.provider {
            LlmProvider::Ollama => json!({
                "model": self.model,
                "stream": false,
                "format": "json",
                "options": { "temperature": self.temperature },
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user }
                ],
            }),
            LlmProvider::Claude => json!({
                "model": self.model,
                "max_tokens": self.max_tokens,
                "temperature": self.temperature,
                "system": system,
                "messages": [{ "role": "user", "content": user }],
            }),
            LlmProvider::OpenAI | LlmProvider::AzureOpenAI => json!({
                "model": self.model,
                "max_tokens": self.max_tokens,
                "temperature": self.temperature,
                "response_format": { "type": "json_object" },
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user }
                ],
            }),
        }
    }

    fn provider_name(&self) -> &'static str {
        match self.provider {
            LlmProvider::Ollama => "ollama",
            LlmProvider::Claude => "claude",
            LlmProvider::OpenAI => "openai",
            LlmProvider::AzureOpenAI => "azure_openai",
        }
    }
}

impl CompletionClient for HttpCompletionClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, system: &str, user: &str) -> Result<String> {
        let name = self.provider_name();
        let url = self.url();
        let headers = self.headers()?;
        let body = self.body(system, user);

        let (status, text) = self.runtime.block_on(async {
            let resp = self
                .http
                .post(&url)
                .headers(headers)
                .json(&body)
                .send()
                .await
                .map_err(|e| request_error(name, e))?;
            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| Error::Transient(format!("{name} read body failed: {e}")))?;
            Ok::<_, Error>((status, text))
        })?;

        if !status.is_success() {
            return Err(status_error(name, status, &text));
        }

        let envelope: Value = serde_json::from_str(&text).map_err(|e| {
            Error::SchemaViolation(format!("{name} returned a malformed envelope: {e}"))
        })?;
        extract_content(self.provider, &envelope).ok_or_else(|| {
            Error::SchemaViolation(format!("{name} response is missing message content"))
        })
    }
}

fn extract_content(provider: LlmProvider, envelope: &Value) -> Option<String> {
    let content = match provider {
        LlmProvider::Ollama => envelope.get("message").and_then(|m| m.get("content")),
        LlmProvider::Claude => envelope
            .get("content")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .and_then(|v| v.get("text")),
        LlmProvider::OpenAI | LlmProvider::AzureOpenAI => envelope
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content")),
    };
    content.and_then(Value::as_str).map(ToString::to_string)
}

fn request_error(name: &str, e: reqwest::Error) -> Error {
    if e.is_builder() {
        Error::Fatal(format!("{name} request could not be built: {e}"))
    } else {
        Error::Transient(format!("{name} request failed: {e}"))
    }
}

/// Rate limits, timeouts and server errors are transient. A request the
/// endpoint refuses on its content (400, 413, 422) fails only that unit;
/// other client errors (auth, bad deployment) are fatal.
fn status_error(name: &str, status: StatusCode, body: &str) -> Error {
    let message = format!("{} returned {}: {}", name, status.as_u16(), truncate(body, 500));
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Error::Transient(message),
        s if s.is_server_error() => Error::Transient(message),
        StatusCode::BAD_REQUEST
        | StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNPROCESSABLE_ENTITY => Error::Rejected(message),
        _ => Error::Fatal(message),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
