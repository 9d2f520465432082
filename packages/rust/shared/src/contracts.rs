//! Capability traits for the collaborators the pipeline calls out to.
//!
//! Production adapters live in the `compliance-research`, `compliance-extract`,
//! `compliance-notify`, and `compliance-storage` crates; tests substitute
//! in-memory fakes.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    ComplianceItem, ItemIdentity, MasterRecord, NotificationAttempt, PrerequisiteSummary,
    ResearchResult, StoreReceipt,
};

/// Finds candidate source documents for a research query.
#[async_trait]
pub trait Researcher: Send + Sync {
    /// Zero hits is `Ok` with an empty result, never an error.
    async fn search(&self, query: &str) -> Result<ResearchResult>;
}

/// Turns research sources into a structured prerequisite summary.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Malformed or empty model output must surface as
    /// [`ComplianceError::Extraction`](crate::ComplianceError::Extraction).
    async fn extract(
        &self,
        item: &ComplianceItem,
        research: &ResearchResult,
    ) -> Result<PrerequisiteSummary>;
}

/// Persists enriched items for later retrieval by relevance.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Stores the item summary together with the research sources it was
    /// extracted from, all linked to `identity`. Storing the same identity
    /// again replaces the earlier document and its sources.
    async fn store(
        &self,
        identity: &ItemIdentity,
        item: &ComplianceItem,
        summary: &PrerequisiteSummary,
        research: &ResearchResult,
    ) -> Result<StoreReceipt>;
}

/// Maps text to dense vectors for similarity search.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier recorded next to every stored vector.
    fn model(&self) -> &str;

    /// One unit-length vector of [`EMBEDDING_DIM`](crate::EMBEDDING_DIM)
    /// values per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// The append-only ledger of processed and failed items.
#[async_trait]
pub trait MasterRecordStore: Send + Sync {
    /// The only mutation primitive.
    async fn append(&self, record: &MasterRecord) -> Result<()>;

    /// Identities of every record with a processed status.
    async fn list_identities(&self) -> Result<HashSet<ItemIdentity>>;
}

/// Delivers a message to the responsible party.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, contact: &str, subject: &str, body: &str) -> Result<()>;
}

/// Append-only log of notification attempts, used for manual re-notification.
#[async_trait]
pub trait NotificationLog: Send + Sync {
    async fn record_attempt(&self, attempt: &NotificationAttempt) -> Result<()>;

    /// Latest attempt per record, for records whose latest attempt failed.
    async fn undelivered(&self) -> Result<Vec<NotificationAttempt>>;
}
