// AI Provider Service
// OpenAI-compatible moderation and chat completion calls

use crate::models::{Category, ModerationResult, SamplingParams};
use crate::services::config_store::AppConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4.1-mini-2025-04-14";
pub const DEFAULT_MODERATION_MODEL: &str = "omni-moderation-latest";
const REQUEST_TIMEOUT_SECS: u64 = 80;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Missing content in response")]
    MissingContent,
    #[error("JSON parse error: {0}")]
    JsonError(String),
    #[error("API key not configured")]
    MissingApiKey,
}

/// The two external calls the scoring core needs.
#[async_trait]
pub trait ScoringProvider: Send + Sync {
    /// Content-moderation classifier for one text.
    async fn classify(&self, text: &str) -> Result<ModerationResult, ProviderError>;

    /// Single-turn chat completion.
    async fn complete(
        &self,
        system: &str,
        user: &str,
        sampling: SamplingParams,
    ) -> Result<ChatResult, ProviderError>;
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    top_p: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ModerationRequest {
    model: String,
    input: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ModerationResponse {
    #[serde(default)]
    results: Vec<ModerationEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ModerationEntry {
    #[serde(default)]
    categories: HashMap<String, serde_json::Value>,
    #[serde(default)]
    category_scores: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResult {
    pub content: String,
    pub latency_ms: i64,
}

/// Map the raw category tables onto the fixed category set. Unknown categories
/// are dropped; missing or non-boolean/non-numeric entries read as the default.
fn moderation_from_entry(entry: ModerationEntry) -> ModerationResult {
    let mut result = ModerationResult::default();
    for (name, value) in &entry.categories {
        if let (Some(category), Some(flag)) = (Category::from_name(name), value.as_bool()) {
            result.flags.insert(category, flag);
        }
    }
    for (name, value) in &entry.category_scores {
        if let (Some(category), Some(score)) = (Category::from_name(name), value.as_f64()) {
            result.scores.insert(category, score.clamp(0.0, 1.0));
        }
    }
    result
}

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    moderation_model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self::with_timeout(api_key, base_url, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(api_key: impl Into<String>, base_url: Option<&str>, timeout: Duration) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_default();

        let base_url = base_url
            .map(|s| s.to_string())
            .or_else(|| env::var("OPENAI_BASE_URL").ok().filter(|s| !s.trim().is_empty()))
            .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            moderation_model: DEFAULT_MODERATION_MODEL.to_string(),
        }
    }

    /// Provider for the active config: key via [`resolve_api_key`], base URL
    /// from `OPENAI_BASE_URL` then `baseUrl`, models from the config.
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let api_key = resolve_api_key("openai", config).ok_or(ProviderError::MissingApiKey)?;
        let base_url = env::var("OPENAI_BASE_URL")
            .ok()
            .and_then(|v| non_empty(&v))
            .or_else(|| config.base_url.as_deref().and_then(non_empty));
        Ok(Self::new(api_key, base_url.as_deref())
            .with_models(config.model.clone(), config.moderation_model.clone()))
    }

    pub fn with_models(mut self, model: impl Into<String>, moderation_model: impl Into<String>) -> Self {
        self.model = model.into();
        self.moderation_model = moderation_model.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn post_json<B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<(reqwest::Response, i64), ProviderError> {
        if self.api_key.trim().is_empty() {
            return Err(ProviderError::MissingApiKey);
        }

        let url = format!("{}/{}", self.base_url, endpoint);
        let start = Instant::now();

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::HttpError(e)
                }
            })?;

        let latency_ms = start.elapsed().as_millis() as i64;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok((response, latency_ms))
    }
}

#[async_trait]
impl ScoringProvider for OpenAiProvider {
    async fn classify(&self, text: &str) -> Result<ModerationResult, ProviderError> {
        let request = ModerationRequest {
            model: self.moderation_model.clone(),
            input: text.to_string(),
        };

        let (response, _latency_ms) = self.post_json("moderations", &request).await?;
        let data: ModerationResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::JsonError(e.to_string()))?;

        let entry = data
            .results
            .into_iter()
            .next()
            .ok_or(ProviderError::MissingContent)?;

        Ok(moderation_from_entry(entry))
    }

    async fn complete(
        &self,
        system: &str,
        user: &str,
        sampling: SamplingParams,
    ) -> Result<ChatResult, ProviderError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: sampling.temperature,
            top_p: sampling.top_p,
        };

        let (response, latency_ms) = self.post_json("chat/completions", &request).await?;
        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::JsonError(e.to_string()))?;

        let content = data
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ProviderError::MissingContent)?;

        Ok(ChatResult {
            content,
            latency_ms,
        })
    }
}

fn api_key_vars(provider: &str) -> &'static [&'static str] {
    match provider {
        "openai" => &["OPENAI_API_KEY", "AGGROSCORE_OPENAI_API_KEY"],
        _ => &[],
    }
}

fn non_empty(value: &str) -> Option<String> {
    let v = value.trim();
    (!v.is_empty()).then(|| v.to_string())
}

/// API key from the provider's environment variables only.
pub fn api_key_from_env(provider: &str) -> Option<String> {
    api_key_vars(provider)
        .iter()
        .find_map(|var| env::var(var).ok().and_then(|v| non_empty(&v)))
}

/// Environment first, then `apiKeys` of the loaded config.
pub fn resolve_api_key(provider: &str, config: &AppConfig) -> Option<String> {
    api_key_from_env(provider).or_else(|| {
        config
            .api_keys
            .get(provider)
            .and_then(|k| non_empty(k))
    })
}
