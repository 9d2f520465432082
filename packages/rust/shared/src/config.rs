//! Application configuration for the Compliance Assistant.
//!
//! User config lives at `~/.compliance-assistant/compliance.toml`.
//! CLI flags override config file values, which override defaults.
//! Secrets are never stored in the file, only the names of the env vars
//! that hold them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ComplianceError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "compliance.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".compliance-assistant";

// ---------------------------------------------------------------------------
// Config structs (matching compliance.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding the database and audit files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Submissions file read by `run` when `--input` is not given.
    #[serde(default = "default_submissions_file")]
    pub submissions_file: String,

    /// Write raw research and extracted summaries under the data dir.
    #[serde(default = "default_true")]
    pub audit: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            submissions_file: default_submissions_file(),
            audit: true,
        }
    }
}

fn default_data_dir() -> String {
    "~/compliance-assistant".into()
}
fn default_submissions_file() -> String {
    "data/new_submissions.json".into()
}
fn default_true() -> bool {
    true
}

impl DefaultsConfig {
    /// `data_dir` with a leading `~` expanded to the home directory.
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        expand_home(&self.data_dir)
    }
}

/// Search backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProvider {
    /// DuckDuckGo HTML endpoint.
    DuckDuckGo,
    /// No web research; every item gets an empty result.
    Disabled,
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_provider")]
    pub provider: SearchProvider,

    /// Base URL of the HTML search endpoint.
    #[serde(default = "default_search_base_url")]
    pub base_url: String,

    /// Cap on sources returned per query.
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Fetch each result page and extract its text.
    #[serde(default = "default_true")]
    pub fetch_content: bool,

    /// Characters of page text kept per source.
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,

    /// HTTP timeout per request.
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,

    /// Pause between page fetches.
    #[serde(default = "default_fetch_delay")]
    pub fetch_delay_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: default_search_provider(),
            base_url: default_search_base_url(),
            max_results: default_max_results(),
            fetch_content: true,
            max_content_chars: default_max_content_chars(),
            timeout_secs: default_search_timeout(),
            fetch_delay_ms: default_fetch_delay(),
        }
    }
}

fn default_search_provider() -> SearchProvider {
    SearchProvider::DuckDuckGo
}
fn default_search_base_url() -> String {
    "https://html.duckduckgo.com".into()
}
fn default_max_results() -> usize {
    8
}
fn default_max_content_chars() -> usize {
    5_000
}
fn default_search_timeout() -> u64 {
    10
}
fn default_fetch_delay() -> u64 {
    1_000
}

/// Language model backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenAI-compatible chat completions endpoint.
    OpenAi,
    /// Deterministic summary built from the research sources.
    Offline,
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: LlmProvider,

    /// Base URL of the chat completions API.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: default_llm_base_url(),
            api_key_env: default_llm_api_key_env(),
            model: default_model(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

fn default_llm_provider() -> LlmProvider {
    LlmProvider::OpenAi
}
fn default_llm_base_url() -> String {
    "https://api.groq.com/openai/v1".into()
}
fn default_llm_api_key_env() -> String {
    "GROQ_API_KEY".into()
}
fn default_model() -> String {
    "qwen/qwen3-32b".into()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_llm_timeout() -> u64 {
    60
}

/// Notification transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyProvider {
    /// Microsoft Graph `sendMail`.
    Graph,
    /// Log the message instead of sending it.
    Log,
}

/// `[notify]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_provider")]
    pub provider: NotifyProvider,

    /// OAuth authority base (tenant id is appended).
    #[serde(default = "default_authority_url")]
    pub authority_url: String,

    /// Microsoft Graph base URL.
    #[serde(default = "default_graph_url")]
    pub graph_url: String,

    #[serde(default = "default_tenant_env")]
    pub tenant_id_env: String,

    #[serde(default = "default_client_id_env")]
    pub client_id_env: String,

    #[serde(default = "default_client_secret_env")]
    pub client_secret_env: String,

    /// Mailbox the notifications are sent from.
    #[serde(default)]
    pub sender_email: String,

    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            provider: default_notify_provider(),
            authority_url: default_authority_url(),
            graph_url: default_graph_url(),
            tenant_id_env: default_tenant_env(),
            client_id_env: default_client_id_env(),
            client_secret_env: default_client_secret_env(),
            sender_email: String::new(),
            timeout_secs: default_notify_timeout(),
        }
    }
}

fn default_notify_provider() -> NotifyProvider {
    NotifyProvider::Log
}
fn default_authority_url() -> String {
    "https://login.microsoftonline.com".into()
}
fn default_graph_url() -> String {
    "https://graph.microsoft.com".into()
}
fn default_tenant_env() -> String {
    "AZURE_TENANT_ID".into()
}
fn default_client_id_env() -> String {
    "AZURE_CLIENT_ID".into()
}
fn default_client_secret_env() -> String {
    "AZURE_CLIENT_SECRET".into()
}
fn default_notify_timeout() -> u64 {
    20
}

/// Embedding backend for knowledge retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// OpenAI-compatible `/embeddings` endpoint.
    OpenAi,
    /// Local sentence-transformer model run with ONNX Runtime.
    Onnx,
    /// Feature hashing of words and character trigrams. No model, no network.
    Hashing,
}

/// `[embedding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: EmbeddingProvider,

    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,

    #[serde(default = "default_embedding_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Directory holding `model.onnx` and `tokenizer.json` for the onnx provider.
    #[serde(default = "default_embedding_model_dir")]
    pub model_dir: String,

    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            base_url: default_embedding_base_url(),
            api_key_env: default_embedding_api_key_env(),
            model: default_embedding_model(),
            model_dir: default_embedding_model_dir(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl EmbeddingConfig {
    /// `model_dir` with a leading `~` expanded to the home directory.
    pub fn resolved_model_dir(&self) -> Result<PathBuf> {
        expand_home(&self.model_dir)
    }
}

fn default_embedding_provider() -> EmbeddingProvider {
    EmbeddingProvider::OpenAi
}
fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_embedding_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_embedding_model_dir() -> String {
    "~/.compliance-assistant/models/all-MiniLM-L6-v2".into()
}
fn default_embedding_timeout() -> u64 {
    30
}

/// `[retry]` section. Delays double per attempt, capped at `max_delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub research_attempts: u32,

    /// Clamped to 2: one call plus at most one retry.
    #[serde(default = "default_extraction_attempts")]
    pub extraction_attempts: u32,

    #[serde(default = "default_attempts")]
    pub notify_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            research_attempts: default_attempts(),
            extraction_attempts: default_extraction_attempts(),
            notify_attempts: default_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_attempts() -> u32 {
    3
}
fn default_extraction_attempts() -> u32 {
    2
}
fn default_base_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    8_000
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Items processed at once. 1 means strictly sequential.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Per-attempt timeout for a research call (search plus page fetches).
    #[serde(default = "default_research_timeout")]
    pub research_timeout_secs: u64,

    #[serde(default = "default_extract_timeout")]
    pub extract_timeout_secs: u64,

    /// Covers the Graph token request and the send, so it is raised to at
    /// least twice `notify.timeout_secs` when the pipeline starts.
    #[serde(default = "default_notify_stage_timeout")]
    pub notify_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            research_timeout_secs: default_research_timeout(),
            extract_timeout_secs: default_extract_timeout(),
            notify_timeout_secs: default_notify_stage_timeout(),
        }
    }
}

fn default_concurrency() -> u32 {
    1
}
fn default_research_timeout() -> u64 {
    120
}
fn default_extract_timeout() -> u64 {
    90
}
fn default_notify_stage_timeout() -> u64 {
    2 * default_notify_timeout() + 20
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.compliance-assistant/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ComplianceError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.compliance-assistant/compliance.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ComplianceError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        ComplianceError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ComplianceError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ComplianceError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ComplianceError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the LLM API key env var is set when a remote model is used.
pub fn validate_llm_credentials(config: &AppConfig) -> Result<()> {
    if config.llm.provider == LlmProvider::Offline {
        return Ok(());
    }
    require_env(&config.llm.api_key_env, "LLM API key")
}

/// Check that the embedding API key env var is set when a remote model is used.
pub fn validate_embedding_credentials(config: &AppConfig) -> Result<()> {
    if config.embedding.provider != EmbeddingProvider::OpenAi {
        return Ok(());
    }
    require_env(&config.embedding.api_key_env, "Embedding API key")
}

/// Check that Graph credentials and a sender mailbox are configured.
pub fn validate_notify_credentials(config: &AppConfig) -> Result<()> {
    if config.notify.provider == NotifyProvider::Log {
        return Ok(());
    }
    require_env(&config.notify.tenant_id_env, "Azure tenant id")?;
    require_env(&config.notify.client_id_env, "Azure client id")?;
    require_env(&config.notify.client_secret_env, "Azure client secret")?;
    if config.notify.sender_email.trim().is_empty() {
        return Err(ComplianceError::config(
            "notify.sender_email must be set when notify.provider = \"graph\"",
        ));
    }
    Ok(())
}

fn require_env(var_name: &str, what: &str) -> Result<()> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(ComplianceError::config(format!(
            "{what} not found. Set the {var_name} environment variable."
        ))),
    }
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| ComplianceError::config("could not determine home directory"))?;
            Ok(home.join(rest.trim_start_matches(['/', '\\'])))
        }
        None => Ok(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("GROQ_API_KEY"));
        assert!(toml_str.contains("duckduckgo"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.search.max_results, 8);
        assert_eq!(parsed.retry.extraction_attempts, 2);
        assert_eq!(parsed.pipeline.concurrency, 1);
        assert_eq!(parsed.notify.provider, NotifyProvider::Log);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[llm]
provider = "offline"

[notify]
provider = "graph"
sender_email = "compliance@co.com"

[pipeline]
concurrency = 4
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.llm.provider, LlmProvider::Offline);
        assert_eq!(config.llm.model, "qwen/qwen3-32b");
        assert_eq!(config.notify.provider, NotifyProvider::Graph);
        assert_eq!(config.pipeline.concurrency, 4);
        assert_eq!(config.search.max_content_chars, 5_000);
    }

    #[test]
    fn llm_credentials_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.llm.api_key_env = "CA_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_llm_credentials(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("CA_TEST_NONEXISTENT_KEY_12345"));

        config.llm.provider = LlmProvider::Offline;
        assert!(validate_llm_credentials(&config).is_ok());
    }

    #[test]
    fn notify_stage_outlasts_token_and_send_requests() {
        let config = AppConfig::default();
        assert!(config.pipeline.notify_timeout_secs >= 2 * config.notify.timeout_secs);
    }

    #[test]
    fn embedding_section_parses() {
        let toml_str = r#"
[embedding]
provider = "onnx"
model_dir = "models/minilm"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.embedding.provider, EmbeddingProvider::Onnx);
        assert_eq!(
            config.embedding.resolved_model_dir().unwrap(),
            PathBuf::from("models/minilm")
        );
        assert_eq!(config.embedding.model, "text-embedding-3-small");
        assert!(validate_embedding_credentials(&config).is_ok());

        let mut remote = AppConfig::default();
        remote.embedding.api_key_env = "CA_TEST_NONEXISTENT_EMBED_KEY".into();
        assert!(validate_embedding_credentials(&remote).is_err());
    }

    #[test]
    fn log_notifier_needs_no_credentials() {
        let config = AppConfig::default();
        assert!(validate_notify_credentials(&config).is_ok());
    }

    #[test]
    fn relative_data_dir_is_untouched() {
        let defaults = DefaultsConfig {
            data_dir: "var/data".into(),
            ..Default::default()
        };
        assert_eq!(defaults.resolved_data_dir().unwrap(), PathBuf::from("var/data"));
    }
}
