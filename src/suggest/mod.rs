//! LLM-assisted ruleset suggestion.
//!
//! Only aggregated per-kind counts are sent to the model, never events. The
//! reply is returned as TOML text; callers decide whether to load it.

use crate::error::{PipelineError, PipelineResult};
use crate::models::EventKind;
use crate::rules;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You are a helpful assistant that designs fair scoring rules for open source \
contributions. Return a minimal TOML document with [dimensions.<name>] tables having 'kinds', 'weight' \
and optional 'weights_by_kind'. Also add [fairness.clip_per_user_day] with daily caps per kind. \
Valid kinds are commit, pr, issue and review. Output only TOML.";

const PROMPT_PREFIX: &str = "Please propose fair scoring rules for the following event counts as TOML.\n";

/// A feature that may not be usable in this build or configuration.
pub enum Capability<T> {
    Available(T),
    Unavailable { reason: String },
}

/// Connection settings for the suggestion model.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    /// `ollama`, or `none` to disable suggestions.
    pub provider: String,
    pub url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "none".to_string(),
            url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            temperature: 0.2,
            timeout: Duration::from_secs(120),
        }
    }
}

/// A chat model that turns a prompt into text.
#[async_trait]
pub trait RuleSuggester: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> PipelineResult<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

/// Non-streaming client for Ollama's `/api/chat`.
pub struct OllamaSuggester {
    http_client: reqwest::Client,
    settings: LlmSettings,
}

impl OllamaSuggester {
    pub fn new(settings: LlmSettings) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self { http_client, settings })
    }
}

#[async_trait]
impl RuleSuggester for OllamaSuggester {
    async fn complete(&self, system: &str, prompt: &str) -> PipelineResult<String> {
        let url = format!("{}/api/chat", self.settings.url.trim_end_matches('/'));

        let request = OllamaChatRequest {
            model: self.settings.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            stream: false,
            options: OllamaOptions {
                temperature: self.settings.temperature,
            },
        };

        debug!("Requesting rule suggestion from {} ({})", url, self.settings.model);
        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                let detail = if e.is_timeout() {
                    format!("request timed out after {}s", self.settings.timeout.as_secs())
                } else if e.is_connect() {
                    format!("cannot connect to Ollama at {}", self.settings.url)
                } else {
                    format!("failed to send request: {}", e)
                };
                PipelineError::TransientNetwork { attempts: 1, detail }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Api {
                status: status.as_u16(),
                url,
            });
        }

        let chat: OllamaChatResponse = response.json().await.map_err(|e| PipelineError::Decode {
            url,
            detail: e.to_string(),
        })?;
        Ok(chat.message.content)
    }
}

/// Pick the suggester named by `settings.provider`.
pub fn suggester_for(settings: &LlmSettings) -> Capability<Box<dyn RuleSuggester>> {
    match settings.provider.trim().to_lowercase().as_str() {
        "" | "none" => Capability::Unavailable {
            reason: "no LLM provider configured (set [llm] provider = \"ollama\")".to_string(),
        },
        "ollama" => match OllamaSuggester::new(settings.clone()) {
            Ok(suggester) => Capability::Available(Box::new(suggester)),
            Err(e) => Capability::Unavailable {
                reason: format!("failed to build HTTP client: {}", e),
            },
        },
        other => Capability::Unavailable {
            reason: format!("provider '{}' is not supported by this build", other),
        },
    }
}

/// The user prompt: a fixed request followed by `{"counts": {...}}`.
pub fn build_prompt(counts: &BTreeMap<EventKind, usize>) -> String {
    let body = serde_json::json!({ "counts": counts });
    format!("{}{}", PROMPT_PREFIX, body)
}

/// Strip a Markdown code fence around the model's answer, if present.
pub fn extract_toml(reply: &str) -> String {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the info string (`toml`) on the opening fence line.
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim().to_string()
}

/// Ask `suggester` for rules fitting `counts`.
pub async fn suggest_with(suggester: &dyn RuleSuggester, counts: &BTreeMap<EventKind, usize>) -> PipelineResult<String> {
    let reply = suggester.complete(SYSTEM_PROMPT, &build_prompt(counts)).await?;
    let text = extract_toml(&reply);
    match rules::parse_toml(&text) {
        Ok(ruleset) => info!(
            "Suggested ruleset has {} dimension(s)",
            ruleset.dimensions.len()
        ),
        Err(e) => warn!("Suggested ruleset does not validate: {}", e),
    }
    Ok(text)
}

/// Suggest rules with the configured provider.
pub async fn suggest_rules(counts: &BTreeMap<EventKind, usize>, settings: &LlmSettings) -> PipelineResult<String> {
    match suggester_for(settings) {
        Capability::Available(suggester) => suggest_with(suggester.as_ref(), counts).await,
        Capability::Unavailable { reason } => Err(PipelineError::FeatureUnavailable {
            feature: "rule suggestion".to_string(),
            reason,
        }),
    }
}
