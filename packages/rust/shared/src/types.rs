//! Core domain types for compliance items and the master ledger.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RecordId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for master record identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Generate a new time-sortable record identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// ItemIdentity
// ---------------------------------------------------------------------------

/// Normalized `title|email|YYYY-MM-DD` deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemIdentity(String);

impl ItemIdentity {
    /// Build an identity from already-normalized parts.
    pub fn from_parts(title: &str, email: &str, due_date: NaiveDate) -> Self {
        Self(format!("{title}|{email}|{}", due_date.format("%Y-%m-%d")))
    }

    /// Rehydrate an identity read back from storage.
    pub fn from_stored(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SHA-256 hex digest, used as a stable file and document key.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl std::fmt::Display for ItemIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Submissions and items
// ---------------------------------------------------------------------------

/// Optional classification of an obligation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCategory {
    /// ISO standard or regulatory category (e.g. `ISO 9001 - Quality Management`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard: Option<String>,
    /// Activity type (e.g. `Recertification`, `Surveillance Audit`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    /// Jurisdiction or authority (e.g. `India`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
}

impl ItemCategory {
    pub fn is_empty(&self) -> bool {
        self.standard.is_none() && self.activity.is_none() && self.jurisdiction.is_none()
    }
}

/// An unvalidated intake record as submitted through the form.
///
/// Every field is lenient: missing fields become empty strings and are
/// rejected per item during validation, never for the whole file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSubmission {
    #[serde(default, alias = "Title", deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(default, alias = "Description", deserialize_with = "lenient_string")]
    pub description: String,
    #[serde(
        default,
        alias = "Responsible Email",
        alias = "responsible",
        deserialize_with = "lenient_string"
    )]
    pub responsible_email: String,
    #[serde(default, alias = "Due Date", deserialize_with = "lenient_string")]
    pub due_date: String,
    #[serde(
        default,
        alias = "Application Date",
        skip_serializing_if = "Option::is_none"
    )]
    pub application_date: Option<String>,
    #[serde(default, alias = "Standard", skip_serializing_if = "Option::is_none")]
    pub standard: Option<String>,
    #[serde(default, alias = "Activity", skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default, alias = "Jurisdiction", skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
}

impl RawSubmission {
    pub fn category(&self) -> ItemCategory {
        ItemCategory {
            standard: non_blank(self.standard.as_deref()),
            activity: non_blank(self.activity.as_deref()),
            jurisdiction: non_blank(self.jurisdiction.as_deref()),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Accept strings, numbers, and null for free-form spreadsheet cells.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

/// A validated compliance obligation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceItem {
    pub title: String,
    pub description: String,
    pub responsible_email: String,
    pub due_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_date: Option<NaiveDate>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub category: ItemCategory,
}

// ---------------------------------------------------------------------------
// Research
// ---------------------------------------------------------------------------

/// One source found while researching an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchEntry {
    /// Source reference (URL).
    pub source: String,
    /// Result title as shown by the search engine.
    pub title: String,
    /// Search snippet text.
    pub snippet: String,
    /// Extracted page text, when the page was fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ResearchEntry {
    /// Best available text: fetched content, falling back to the snippet.
    pub fn text(&self) -> &str {
        self.content
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(&self.snippet)
    }
}

/// Ordered research sources for one item. May be empty, never absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchResult {
    pub entries: Vec<ResearchEntry>,
}

impl ResearchResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Keep at most `cap` entries, preserving order.
    pub fn capped(mut self, cap: usize) -> Self {
        self.entries.truncate(cap);
        self
    }

    pub fn sources(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.source.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// PrerequisiteSummary
// ---------------------------------------------------------------------------

/// Structured prerequisites derived from research and the item.
///
/// An empty `prerequisites` list means "no prerequisites found", which is a
/// successful outcome distinct from an extraction failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrerequisiteSummary {
    pub prerequisites: Vec<String>,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_due_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl PrerequisiteSummary {
    /// The explicit "no prerequisites found" summary.
    pub fn none(rationale: impl Into<String>) -> Self {
        Self {
            rationale: rationale.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prerequisites.is_empty()
    }

    /// Render as numbered plain text.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        if self.prerequisites.is_empty() {
            out.push_str("No prerequisites found.\n");
        }
        for (i, p) in self.prerequisites.iter().enumerate() {
            out.push_str(&format!("{}. {p}\n", i + 1));
        }
        if let Some(validity) = &self.validity_period {
            out.push_str(&format!("\nValidity period: {validity}\n"));
        }
        if !self.rationale.is_empty() {
            out.push_str(&format!("\n{}\n", self.rationale));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// MasterRecord
// ---------------------------------------------------------------------------

/// Terminal status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Processed,
    ProcessedNoPrerequisites,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::ProcessedNoPrerequisites => "processed_no_prerequisites",
            Self::Failed => "failed",
        }
    }

    /// Processed records are the ones that count for deduplication.
    pub fn is_processed(&self) -> bool {
        matches!(self, Self::Processed | Self::ProcessedNoPrerequisites)
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "processed" => Ok(Self::Processed),
            "processed_no_prerequisites" => Ok(Self::ProcessedNoPrerequisites),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown record status '{other}'")),
        }
    }
}

/// One append-only entry in the master ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub id: RecordId,
    /// Absent only when the submission failed validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ItemIdentity>,
    pub title: String,
    pub description: String,
    pub responsible_email: String,
    /// ISO date when the item validated, the raw submitted value otherwise.
    pub due_date: String,
    #[serde(default)]
    pub category: ItemCategory,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<PrerequisiteSummary>,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl MasterRecord {
    /// Record for an item that completed extraction and storage.
    pub fn completed(
        identity: ItemIdentity,
        item: &ComplianceItem,
        summary: PrerequisiteSummary,
    ) -> Self {
        let status = if summary.is_empty() {
            RecordStatus::ProcessedNoPrerequisites
        } else {
            RecordStatus::Processed
        };
        Self::from_item(Some(identity), item, Some(summary), status, None)
    }

    /// Record for a validated item whose pipeline run failed.
    pub fn failed(identity: ItemIdentity, item: &ComplianceItem, reason: impl Into<String>) -> Self {
        Self::from_item(
            Some(identity),
            item,
            None,
            RecordStatus::Failed,
            Some(reason.into()),
        )
    }

    /// Record for a submission rejected before an identity could be derived.
    pub fn rejected(raw: &RawSubmission, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            identity: None,
            title: raw.title.clone(),
            description: raw.description.clone(),
            responsible_email: raw.responsible_email.clone(),
            due_date: raw.due_date.clone(),
            category: raw.category(),
            submitted_at: now,
            summary: None,
            status: RecordStatus::Failed,
            failure: Some(reason.into()),
            recorded_at: now,
        }
    }

    fn from_item(
        identity: Option<ItemIdentity>,
        item: &ComplianceItem,
        summary: Option<PrerequisiteSummary>,
        status: RecordStatus,
        failure: Option<String>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            identity,
            title: item.title.clone(),
            description: item.description.clone(),
            responsible_email: item.responsible_email.clone(),
            due_date: item.due_date.format("%Y-%m-%d").to_string(),
            category: item.category.clone(),
            submitted_at: item.submitted_at,
            summary,
            status,
            failure,
            recorded_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Knowledge store and notification log
// ---------------------------------------------------------------------------

/// Width of every stored embedding vector.
pub const EMBEDDING_DIM: usize = 384;

/// Acknowledgement of a successful knowledge store write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReceipt {
    pub document_id: String,
}

/// A knowledge store search hit.
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeHit {
    pub document_id: String,
    pub title: String,
    pub responsible_email: String,
    pub due_date: String,
    /// `item_summary` or `source_document`.
    pub kind: String,
    /// Source URL for `source_document` hits.
    pub source: Option<String>,
    /// Leading excerpt of the matched text.
    pub excerpt: String,
    /// Cosine similarity for vector hits, negated bm25 rank for keyword
    /// hits. Higher is better in both cases.
    pub score: f64,
}

/// One notification delivery attempt, after retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAttempt {
    pub record_id: RecordId,
    pub contact: String,
    pub subject: String,
    pub body: String,
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}
