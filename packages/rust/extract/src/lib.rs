//! Requirement extraction: research sources in, prerequisite summary out.
//!
//! [`ChatExtractor`] calls an OpenAI-compatible chat completions endpoint
//! (Groq by default). [`OfflineExtractor`] builds a deterministic summary
//! straight from the sources and never leaves the process.

mod parse;
mod prompt;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use compliance_shared::{
    ComplianceError, ComplianceItem, Extractor, LlmConfig, PrerequisiteSummary, ResearchResult,
    Result,
};

pub use parse::parse_summary;
pub use prompt::{
    MAX_PROMPT_SOURCES, NO_PREREQUISITES_MARKER, SOURCE_CHARS, build_prompt, format_sources,
};

// ---------------------------------------------------------------------------
// Protocol types (OpenAI-compatible chat completions)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// ChatExtractor
// ---------------------------------------------------------------------------

/// Extractor backed by a chat completions API.
pub struct ChatExtractor {
    config: LlmConfig,
    api_key: String,
    client: Client,
}

impl ChatExtractor {
    /// Create an extractor with an explicit API key.
    pub fn new(config: LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                ComplianceError::Dependency(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            config,
            api_key: api_key.into(),
            client,
        })
    }

    /// Create an extractor reading the API key from `config.api_key_env`.
    pub fn from_env(config: LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ComplianceError::config(format!(
                    "LLM API key not found. Set the {} environment variable.",
                    config.api_key_env
                ))
            })?;
        Self::new(config, api_key)
    }

    async fn complete(&self, prompt: &str) -> Result<(String, Option<String>)> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let request = ChatRequest {
            model: &self.config.model,
            temperature: self.config.temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: prompt::SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ComplianceError::Transient(format!("chat completion request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail: String = body.chars().take(200).collect();
            return Err(
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    ComplianceError::Transient(format!("chat completion: HTTP {status}: {detail}"))
                } else {
                    ComplianceError::Dependency(format!("chat completion: HTTP {status}: {detail}"))
                },
            );
        }

        let body = response.text().await.map_err(|e| {
            ComplianceError::Transient(format!("reading chat completion body failed: {e}"))
        })?;
        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            ComplianceError::Dependency(format!("invalid chat completion response: {e}"))
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok((content, parsed.model))
    }
}

#[async_trait]
impl Extractor for ChatExtractor {
    #[instrument(skip_all, fields(title = %item.title, sources = research.len()))]
    async fn extract(
        &self,
        item: &ComplianceItem,
        research: &ResearchResult,
    ) -> Result<PrerequisiteSummary> {
        let prompt = build_prompt(item, research);
        debug!(prompt_len = prompt.len(), model = %self.config.model, "invoking model");

        let (content, model) = self.complete(&prompt).await?;
        let model = model.or_else(|| Some(self.config.model.clone()));

        let summary = parse_summary(&content, research.sources(), model)?;
        info!(
            prerequisites = summary.prerequisites.len(),
            validity = summary.validity_period.as_deref().unwrap_or("-"),
            "prerequisites extracted"
        );
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// OfflineExtractor
// ---------------------------------------------------------------------------

/// Deterministic extractor: one "review this source" step per source.
pub struct OfflineExtractor;

#[async_trait]
impl Extractor for OfflineExtractor {
    async fn extract(
        &self,
        item: &ComplianceItem,
        research: &ResearchResult,
    ) -> Result<PrerequisiteSummary> {
        if research.is_empty() {
            return Ok(PrerequisiteSummary::none("No research sources were found."));
        }

        let prerequisites = research
            .entries
            .iter()
            .take(MAX_PROMPT_SOURCES)
            .map(|e| format!("Review {} ({})", e.title, e.source))
            .collect();

        debug!(title = %item.title, "offline summary built");
        Ok(PrerequisiteSummary {
            prerequisites,
            rationale: format!(
                "Based on web search for {}; verify each source manually.",
                item.title
            ),
            sources: research.sources(),
            ..Default::default()
        })
    }
}
