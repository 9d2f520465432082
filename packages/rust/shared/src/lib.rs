//! Shared types, error model, capability traits, and configuration for the
//! Compliance Assistant.
//!
//! This crate is the foundation depended on by all other crates.
//! It provides:
//! - [`ComplianceError`] — the unified error type
//! - Domain types ([`ComplianceItem`], [`MasterRecord`], [`PrerequisiteSummary`], ...)
//! - Capability traits implemented by the adapters ([`Researcher`], [`Extractor`], ...)
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod contracts;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, EmbeddingConfig, EmbeddingProvider, LlmConfig, LlmProvider,
    NotifyConfig, NotifyProvider, PipelineConfig, RetryConfig, SearchConfig, SearchProvider,
    config_dir, config_file_path, init_config, load_config, load_config_from,
    validate_embedding_credentials, validate_llm_credentials, validate_notify_credentials,
};
pub use contracts::{
    Embedder, Extractor, KnowledgeStore, MasterRecordStore, NotificationLog, Notifier,
    Researcher,
};
pub use error::{ComplianceError, Result};
pub use types::{
    ComplianceItem, EMBEDDING_DIM, ItemCategory, ItemIdentity, KnowledgeHit, MasterRecord,
    NotificationAttempt, PrerequisiteSummary, RawSubmission, RecordId, RecordStatus,
    ResearchEntry, ResearchResult, StoreReceipt,
};
