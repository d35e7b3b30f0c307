#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use courtintel_domain::{hash_bytes, ConfigError, TokenUsage, UpstreamFailure};
use courtintel_prompts::Prompt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub const RULING_TEMPERATURE: f64 = 0.35;
pub const BIAS_TEMPERATURE: f64 = 0.20;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const MODEL_ENV: &str = "OPENAI_MODEL";
pub const BASE_URL_ENV: &str = "OPENAI_BASE_URL";

/// One chat completion call against a language-model backend.
pub trait ModelGateway {
    fn gateway_name(&self) -> &'static str;

    /// Send `prompt` and return the backend's free-form text.
    ///
    /// # Errors
    /// Returns [`UpstreamFailure`] when the backend is unreachable, rejects the
    /// call, or returns no usable text.
    fn complete(&self, prompt: &Prompt, temperature: f64) -> Result<Completion, UpstreamFailure>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Clone)]
pub struct GatewayConfig {
    api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout_ms: u64,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl GatewayConfig {
    /// Build a gateway configuration. The API key has no default.
    ///
    /// # Errors
    /// Returns [`ConfigError::MissingApiKey`] when the key is absent or blank and
    /// [`ConfigError::InvalidBaseUrl`] when the base URL is not http(s).
    pub fn new(
        api_key: Option<String>,
        model: Option<String>,
        base_url: Option<String>,
    ) -> Result<Self, ConfigError> {
        let api_key = api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let model = model
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let base_url = base_url
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            return Err(ConfigError::InvalidBaseUrl(base_url));
        }

        Ok(Self {
            api_key,
            model,
            base_url,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        })
    }

    /// Read `OPENAI_API_KEY`, `OPENAI_MODEL` and `OPENAI_BASE_URL`.
    ///
    /// # Errors
    /// Same as [`GatewayConfig::new`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(
            std::env::var(API_KEY_ENV).ok(),
            std::env::var(MODEL_ENV).ok(),
            std::env::var(BASE_URL_ENV).ok(),
        )
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Gateway for any backend speaking the OpenAI chat-completions format.
#[derive(Debug)]
pub struct OpenAiChatGateway {
    config: GatewayConfig,
    agent: ureq::Agent,
}

impl OpenAiChatGateway {
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build();
        Self { config, agent }
    }
}

impl ModelGateway for OpenAiChatGateway {
    fn gateway_name(&self) -> &'static str {
        "openai_chat"
    }

    fn complete(&self, prompt: &Prompt, temperature: f64) -> Result<Completion, UpstreamFailure> {
        let request_json = build_request_json(&self.config.model, prompt, temperature);
        let request_hash = hash_bytes(request_json.to_string().as_bytes());
        debug!(
            model = %self.config.model,
            temperature,
            request_hash = %request_hash,
            system_chars = prompt.system.len(),
            user_chars = prompt.user.len(),
            "sending chat completion request"
        );

        let started = Instant::now();
        let response = self
            .agent
            .post(&self.config.completions_url())
            .set("content-type", "application/json")
            .set("authorization", &format!("Bearer {}", self.config.api_key))
            .send_json(&request_json);

        let body: Value = match response {
            Ok(response) => response
                .into_json()
                .map_err(|err| UpstreamFailure::MalformedEnvelope(err.to_string()))?,
            Err(ureq::Error::Status(status, _)) => {
                warn!(status, model = %self.config.model, "model backend rejected request");
                return Err(UpstreamFailure::Status { status });
            }
            Err(ureq::Error::Transport(err)) => {
                warn!(error = %err, model = %self.config.model, "model backend unreachable");
                return Err(UpstreamFailure::Transport(err.to_string()));
            }
        };
        let latency_ms = u64::try_from(started.elapsed().as_millis()).ok();

        let (text, usage) = extract_completion(&body, &self.config.model)?;
        info!(
            model = %usage.model_name,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            latency_ms,
            "chat completion received"
        );

        Ok(Completion { text, usage })
    }
}

#[must_use]
pub fn build_request_json(model: &str, prompt: &Prompt, temperature: f64) -> Value {
    json!({
        "model": model,
        "temperature": temperature,
        "response_format": { "type": "json_object" },
        "messages": [
            { "role": "system", "content": prompt.system },
            { "role": "user", "content": prompt.user },
        ],
    })
}

/// Pull the first choice's text and the usage block out of a chat-completions body.
///
/// # Errors
/// Returns [`UpstreamFailure::EmptyResponse`] when no choice carries non-blank text.
pub fn extract_completion(
    body: &Value,
    fallback_model: &str,
) -> Result<(String, TokenUsage), UpstreamFailure> {
    let text = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .filter(|content| !content.trim().is_empty())
        .ok_or(UpstreamFailure::EmptyResponse)?
        .to_string();

    let model_name = body
        .get("model")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .unwrap_or(fallback_model)
        .to_string();

    let usage = TokenUsage {
        model_name,
        prompt_tokens: usage_count(body, "prompt_tokens"),
        completion_tokens: usage_count(body, "completion_tokens"),
    };
    Ok((text, usage))
}

fn usage_count(body: &Value, field: &str) -> u32 {
    body.get("usage")
        .and_then(|usage| usage.get(field))
        .and_then(Value::as_u64)
        .map_or(0, |count| u32::try_from(count).unwrap_or(u32::MAX))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub prompt: Prompt,
    pub temperature: f64,
}

/// Offline gateway replaying canned replies in order.
///
/// Token counts are whitespace word counts so runs stay reproducible.
#[derive(Debug)]
pub struct ScriptedGateway {
    model_name: String,
    replies: Mutex<VecDeque<Result<String, UpstreamFailure>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self::new("scripted-model")
    }
}

impl ScriptedGateway {
    #[must_use]
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            replies: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_reply(self, text: impl Into<String>) -> Self {
        lock(&self.replies).push_back(Ok(text.into()));
        self
    }

    #[must_use]
    pub fn with_failure(self, failure: UpstreamFailure) -> Self {
        lock(&self.replies).push_back(Err(failure));
        self
    }

    pub fn push_reply(&self, text: impl Into<String>) {
        lock(&self.replies).push_back(Ok(text.into()));
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }
}

impl ModelGateway for ScriptedGateway {
    fn gateway_name(&self) -> &'static str {
        "scripted"
    }

    fn complete(&self, prompt: &Prompt, temperature: f64) -> Result<Completion, UpstreamFailure> {
        lock(&self.calls).push(RecordedCall {
            prompt: prompt.clone(),
            temperature,
        });

        let reply = lock(&self.replies)
            .pop_front()
            .unwrap_or(Err(UpstreamFailure::EmptyResponse))?;
        if reply.trim().is_empty() {
            return Err(UpstreamFailure::EmptyResponse);
        }

        let prompt_words = prompt.system.split_whitespace().count()
            + prompt.user.split_whitespace().count();
        let usage = TokenUsage {
            model_name: self.model_name.clone(),
            prompt_tokens: u32::try_from(prompt_words).unwrap_or(u32::MAX),
            completion_tokens: u32::try_from(reply.split_whitespace().count())
                .unwrap_or(u32::MAX),
        };

        Ok(Completion { text: reply, usage })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
