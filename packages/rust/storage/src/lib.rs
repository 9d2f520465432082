//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding the append-only
//! master ledger, the knowledge documents with their embedded chunks, and
//! the notification log. It implements the [`MasterRecordStore`] and
//! [`NotificationLog`] capability traits; [`KnowledgeBase`] pairs it with an
//! [`Embedder`](compliance_shared::Embedder) to implement
//! [`KnowledgeStore`](compliance_shared::KnowledgeStore).
//!
//! **Access rules:**
//! - `run` / `renotify`: read-write via [`Storage::open`]
//! - `records` / `search`: read-only via [`Storage::open_readonly`]

mod knowledge;
mod migrations;

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use compliance_shared::{
    ComplianceError, ComplianceItem, EMBEDDING_DIM, ItemCategory, ItemIdentity, KnowledgeHit,
    MasterRecord, MasterRecordStore, NotificationAttempt, NotificationLog, PrerequisiteSummary,
    RecordStatus, Result, StoreReceipt,
};
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;

pub use knowledge::{KnowledgeBase, SOURCE_CHUNK_CHARS};

/// Characters of prerequisite text returned with a search hit.
const EXCERPT_CHARS: usize = 240;

/// What an embedded chunk was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    ItemSummary,
    SourceDocument,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ItemSummary => "item_summary",
            Self::SourceDocument => "source_document",
        }
    }
}

/// One embedded text linked to a knowledge document.
#[derive(Debug, Clone)]
pub struct KnowledgeChunk {
    pub kind: ChunkKind,
    pub source_url: Option<String>,
    pub title: String,
    pub content: String,
    /// Embedding model that produced `embedding`.
    pub model: String,
    pub embedding: Vec<f32>,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    /// Held by every write so concurrent pipeline tasks sharing `conn` never
    /// issue statements inside another task's knowledge transaction.
    write_lock: Mutex<()>,
}

fn db_err(e: libsql::Error) -> ComplianceError {
    ComplianceError::Persistence(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ComplianceError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ComplianceError::Persistence(format!(
                "no database at {}; run a batch first",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ComplianceError::Persistence(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ComplianceError::Persistence(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Master ledger
    // -----------------------------------------------------------------------

    /// Append a ledger entry. Fails if a processed entry already exists for
    /// the same identity.
    pub async fn append_record(&self, record: &MasterRecord) -> Result<()> {
        self.check_writable()?;

        let category_json = if record.category.is_empty() {
            None
        } else {
            Some(to_json(&record.category)?)
        };
        let summary_json = record.summary.as_ref().map(to_json).transpose()?;

        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO master_records (id, identity, title, description, responsible_email,
                   due_date, category_json, submitted_at, summary_json, status, failure, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.id.to_string(),
                    record.identity.as_ref().map(|i| i.as_str().to_string()),
                    record.title.as_str(),
                    record.description.as_str(),
                    record.responsible_email.as_str(),
                    record.due_date.as_str(),
                    category_json,
                    record.submitted_at.to_rfc3339(),
                    summary_json,
                    record.status.as_str(),
                    record.failure.as_deref(),
                    record.recorded_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Distinct identities of processed ledger entries.
    pub async fn processed_identities(&self) -> Result<HashSet<ItemIdentity>> {
        let mut rows = self
            .conn
            .query(
                "SELECT DISTINCT identity FROM master_records
                 WHERE identity IS NOT NULL
                   AND status IN ('processed', 'processed_no_prerequisites')",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut identities = HashSet::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let key: String = row.get(0).map_err(db_err)?;
            identities.insert(ItemIdentity::from_stored(key));
        }
        Ok(identities)
    }

    /// Most recent ledger entries, newest first.
    pub async fn list_records(&self, limit: u32) -> Result<Vec<MasterRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, identity, title, description, responsible_email, due_date,
                        category_json, submitted_at, summary_json, status, failure, recorded_at
                 FROM master_records ORDER BY recorded_at DESC, id DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_master_record(&row)?);
        }
        Ok(results)
    }

    /// Fetch a single ledger entry by id.
    pub async fn get_record(&self, id: &str) -> Result<Option<MasterRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, identity, title, description, responsible_email, due_date,
                        category_json, submitted_at, summary_json, status, failure, recorded_at
                 FROM master_records WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_master_record(&row)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Knowledge documents
    // -----------------------------------------------------------------------

    /// Upsert the knowledge document for an identity and replace its
    /// embedded chunks, in one transaction. Re-storing after a failed run
    /// replaces the earlier document and sources.
    pub async fn upsert_knowledge(
        &self,
        identity: &ItemIdentity,
        item: &ComplianceItem,
        summary: &PrerequisiteSummary,
        chunks: &[KnowledgeChunk],
    ) -> Result<StoreReceipt> {
        self.check_writable()?;
        let document_id = identity.digest();
        let now = Utc::now().to_rfc3339();

        for chunk in chunks {
            if chunk.embedding.len() != EMBEDDING_DIM {
                return Err(ComplianceError::Persistence(format!(
                    "embedding has {} dimensions, expected {EMBEDDING_DIM}",
                    chunk.embedding.len()
                )));
            }
        }

        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        tx.execute(
            "INSERT INTO knowledge_documents (id, identity, title, description, responsible_email,
               due_date, prerequisites_text, summary_json, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
               title = excluded.title,
               description = excluded.description,
               prerequisites_text = excluded.prerequisites_text,
               summary_json = excluded.summary_json,
               stored_at = excluded.stored_at",
            params![
                document_id.as_str(),
                identity.as_str(),
                item.title.as_str(),
                item.description.as_str(),
                item.responsible_email.as_str(),
                item.due_date.format("%Y-%m-%d").to_string(),
                summary.to_text(),
                to_json(summary)?,
                now.as_str(),
            ],
        )
        .await
        .map_err(db_err)?;

        tx.execute(
            "DELETE FROM knowledge_chunks WHERE document_id = ?1",
            params![document_id.as_str()],
        )
        .await
        .map_err(db_err)?;

        for chunk in chunks {
            tx.execute(
                "INSERT INTO knowledge_chunks (document_id, identity, kind, source_url, title,
                   content, model, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, vector32(?8))",
                params![
                    document_id.as_str(),
                    identity.as_str(),
                    chunk.kind.as_str(),
                    chunk.source_url.clone(),
                    chunk.title.as_str(),
                    chunk.content.as_str(),
                    chunk.model.as_str(),
                    to_json(&chunk.embedding)?,
                ],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(document_id = %document_id, chunks = chunks.len(), "knowledge stored");
        Ok(StoreReceipt { document_id })
    }

    /// Nearest chunks to `embedding` by cosine distance, via the vector index.
    pub async fn search_similar(&self, embedding: &[f32], limit: u32) -> Result<Vec<KnowledgeHit>> {
        let query_vector = to_json(&embedding)?;

        let mut rows = self
            .conn
            .query(
                "SELECT c.document_id, d.title, d.responsible_email, d.due_date, c.kind,
                        c.source_url, c.content,
                        vector_distance_cos(c.embedding, vector32(?1)) AS distance
                 FROM vector_top_k('knowledge_chunks_vec', vector32(?1), ?2) AS v
                 JOIN knowledge_chunks c ON c.rowid = v.id
                 JOIN knowledge_documents d ON d.id = c.document_id
                 ORDER BY distance ASC",
                params![query_vector, limit],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let content: String = row.get(6).map_err(db_err)?;
            let distance: f64 = row.get(7).unwrap_or(1.0);
            results.push(KnowledgeHit {
                document_id: row.get(0).map_err(db_err)?,
                title: row.get(1).map_err(db_err)?,
                responsible_email: row.get(2).map_err(db_err)?,
                due_date: row.get(3).map_err(db_err)?,
                kind: row.get(4).map_err(db_err)?,
                source: row.get::<String>(5).ok(),
                excerpt: content.chars().take(EXCERPT_CHARS).collect(),
                score: 1.0 - distance,
            });
        }
        Ok(results)
    }

    /// Full-text search across stored knowledge documents.
    pub async fn search_keywords(&self, query: &str, limit: u32) -> Result<Vec<KnowledgeHit>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let mut rows = self
            .conn
            .query(
                "SELECT d.id, d.title, d.responsible_email, d.due_date, d.prerequisites_text,
                        knowledge_fts.rank
                 FROM knowledge_fts
                 JOIN knowledge_documents d ON d.rowid = knowledge_fts.rowid
                 WHERE knowledge_fts MATCH ?1
                 ORDER BY knowledge_fts.rank
                 LIMIT ?2",
                params![match_expr, limit],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let text: String = row.get(4).map_err(db_err)?;
            let rank: f64 = row.get(5).unwrap_or(0.0);
            results.push(KnowledgeHit {
                document_id: row.get(0).map_err(db_err)?,
                title: row.get(1).map_err(db_err)?,
                responsible_email: row.get(2).map_err(db_err)?,
                due_date: row.get(3).map_err(db_err)?,
                kind: ChunkKind::ItemSummary.as_str().into(),
                source: None,
                excerpt: text.chars().take(EXCERPT_CHARS).collect(),
                score: -rank,
            });
        }
        Ok(results)
    }

    /// Research source URLs stored for an identity, in insertion order.
    pub async fn knowledge_sources(&self, identity: &ItemIdentity) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_url FROM knowledge_chunks
                 WHERE identity = ?1 AND kind = 'source_document'
                 ORDER BY id",
                params![identity.as_str()],
            )
            .await
            .map_err(db_err)?;

        let mut sources = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            sources.push(row.get::<String>(0).map_err(db_err)?);
        }
        Ok(sources)
    }

    // -----------------------------------------------------------------------
    // Notification log
    // -----------------------------------------------------------------------

    /// Append one delivery attempt.
    pub async fn insert_notification_attempt(&self, attempt: &NotificationAttempt) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO notification_log (record_id, contact, subject, body, delivered, error, attempted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    attempt.record_id.to_string(),
                    attempt.contact.as_str(),
                    attempt.subject.as_str(),
                    attempt.body.as_str(),
                    i64::from(attempt.delivered),
                    attempt.error.as_deref(),
                    attempt.attempted_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Latest attempt per record where that attempt was not delivered.
    pub async fn list_undelivered(&self) -> Result<Vec<NotificationAttempt>> {
        let mut rows = self
            .conn
            .query(
                "SELECT n.record_id, n.contact, n.subject, n.body, n.delivered, n.error, n.attempted_at
                 FROM notification_log n
                 WHERE n.id = (SELECT MAX(id) FROM notification_log WHERE record_id = n.record_id)
                   AND n.delivered = 0
                 ORDER BY n.id",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let record_id: String = row.get(0).map_err(db_err)?;
            let delivered: i64 = row.get(4).map_err(db_err)?;
            results.push(NotificationAttempt {
                record_id: record_id.parse().map_err(|e| {
                    ComplianceError::Persistence(format!("invalid record id '{record_id}': {e}"))
                })?,
                contact: row.get(1).map_err(db_err)?,
                subject: row.get(2).map_err(db_err)?,
                body: row.get(3).map_err(db_err)?,
                delivered: delivered != 0,
                error: row.get::<String>(5).ok(),
                attempted_at: parse_timestamp(&row.get::<String>(6).map_err(db_err)?)?,
            });
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Capability trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl MasterRecordStore for Storage {
    async fn append(&self, record: &MasterRecord) -> Result<()> {
        self.append_record(record).await
    }

    async fn list_identities(&self) -> Result<HashSet<ItemIdentity>> {
        self.processed_identities().await
    }
}

#[async_trait]
impl NotificationLog for Storage {
    async fn record_attempt(&self, attempt: &NotificationAttempt) -> Result<()> {
        self.insert_notification_attempt(attempt).await
    }

    async fn undelivered(&self) -> Result<Vec<NotificationAttempt>> {
        self.list_undelivered().await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ComplianceError::Persistence(e.to_string()))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ComplianceError::Persistence(format!("invalid timestamp '{s}': {e}")))
}

/// Quote each word so user input never reaches FTS5 query syntax.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Convert a database row to a [`MasterRecord`].
fn row_to_master_record(row: &libsql::Row) -> Result<MasterRecord> {
    let id: String = row.get(0).map_err(db_err)?;
    let status: String = row.get(9).map_err(db_err)?;

    let category = match row.get::<String>(6).ok() {
        Some(json) => serde_json::from_str::<ItemCategory>(&json)
            .map_err(|e| ComplianceError::Persistence(format!("invalid category_json: {e}")))?,
        None => ItemCategory::default(),
    };
    let summary = match row.get::<String>(8).ok() {
        Some(json) => Some(
            serde_json::from_str::<PrerequisiteSummary>(&json)
                .map_err(|e| ComplianceError::Persistence(format!("invalid summary_json: {e}")))?,
        ),
        None => None,
    };

    Ok(MasterRecord {
        id: id
            .parse()
            .map_err(|e| ComplianceError::Persistence(format!("invalid record id '{id}': {e}")))?,
        identity: row.get::<String>(1).ok().map(ItemIdentity::from_stored),
        title: row.get(2).map_err(db_err)?,
        description: row.get(3).map_err(db_err)?,
        responsible_email: row.get(4).map_err(db_err)?,
        due_date: row.get(5).map_err(db_err)?,
        category,
        submitted_at: parse_timestamp(&row.get::<String>(7).map_err(db_err)?)?,
        summary,
        status: status
            .parse::<RecordStatus>()
            .map_err(ComplianceError::Persistence)?,
        failure: row.get::<String>(10).ok(),
        recorded_at: parse_timestamp(&row.get::<String>(11).map_err(db_err)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use compliance_shared::{RawSubmission, RecordId};
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("ca_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn item(title: &str) -> ComplianceItem {
        ComplianceItem {
            title: title.into(),
            description: "Annual recertification audit".into(),
            responsible_email: "qm@co.com".into(),
            due_date: NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
            application_date: None,
            submitted_at: Utc::now(),
            category: ItemCategory {
                standard: Some("ISO 9001 - Quality Management".into()),
                ..Default::default()
            },
        }
    }

    fn identity(title: &str) -> ItemIdentity {
        ItemIdentity::from_parts(
            &title.to_lowercase(),
            "qm@co.com",
            NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
        )
    }

    fn summary() -> PrerequisiteSummary {
        PrerequisiteSummary {
            prerequisites: vec![
                "Complete internal audit".into(),
                "Hold management review".into(),
            ],
            rationale: "Certification bodies require both before stage 2.".into(),
            validity_period: Some("3 Years".into()),
            sources: vec!["https://www.iso.org/iso-9001".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("ca_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn append_and_list_records() {
        let storage = test_storage().await;
        let record = MasterRecord::completed(identity("ISO 9001 Recert"), &item("ISO 9001 Recert"), summary());
        storage.append(&record).await.expect("append");

        let records = storage.list_records(10).await.expect("list");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, record.id);
        assert_eq!(records[0].status, RecordStatus::Processed);
        assert_eq!(records[0].summary.as_ref().unwrap().prerequisites.len(), 2);
        assert_eq!(
            records[0].category.standard.as_deref(),
            Some("ISO 9001 - Quality Management")
        );

        let fetched = storage.get_record(&record.id.to_string()).await.unwrap();
        assert_eq!(fetched.unwrap().identity, record.identity);
    }

    #[tokio::test]
    async fn identities_include_only_processed_records() {
        let storage = test_storage().await;
        storage
            .append(&MasterRecord::completed(identity("A"), &item("A"), summary()))
            .await
            .unwrap();
        storage
            .append(&MasterRecord::completed(
                identity("B"),
                &item("B"),
                PrerequisiteSummary::none("no sources"),
            ))
            .await
            .unwrap();
        storage
            .append(&MasterRecord::failed(identity("C"), &item("C"), "extraction error"))
            .await
            .unwrap();
        storage
            .append(&MasterRecord::rejected(&RawSubmission::default(), "validation error"))
            .await
            .unwrap();

        let ids = storage.list_identities().await.expect("identities");
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&identity("A")));
        assert!(ids.contains(&identity("B")));
        assert!(!ids.contains(&identity("C")));
    }

    #[tokio::test]
    async fn second_processed_record_for_identity_is_rejected() {
        let storage = test_storage().await;
        let first = MasterRecord::completed(identity("A"), &item("A"), summary());
        storage.append(&first).await.expect("first append");

        let second = MasterRecord::completed(identity("A"), &item("A"), summary());
        let err = storage.append(&second).await.unwrap_err();
        assert!(matches!(err, ComplianceError::Persistence(_)));

        // Failed entries for the same identity are still allowed
        storage
            .append(&MasterRecord::failed(identity("A"), &item("A"), "retry"))
            .await
            .expect("failed entry");
    }

    #[tokio::test]
    async fn ledger_rejects_updates_and_deletes() {
        let storage = test_storage().await;
        let record = MasterRecord::failed(identity("A"), &item("A"), "persistence error");
        storage.append(&record).await.unwrap();

        let update = storage
            .conn
            .execute(
                "UPDATE master_records SET status = 'processed' WHERE id = ?1",
                params![record.id.to_string()],
            )
            .await;
        assert!(update.is_err());

        let delete = storage
            .conn
            .execute("DELETE FROM master_records", params![])
            .await;
        assert!(delete.is_err());
    }

    #[tokio::test]
    async fn knowledge_keyword_search() {
        let storage = test_storage().await;
        storage
            .upsert_knowledge(&identity("ISO 9001 Recert"), &item("ISO 9001 Recert"), &summary(), &[])
            .await
            .expect("store");

        let mut gst = item("GST Return Filing");
        gst.description = "Quarterly GSTR-3B filing".into();
        storage
            .upsert_knowledge(
                &identity("GST Return Filing"),
                &gst,
                &PrerequisiteSummary {
                    prerequisites: vec!["Reconcile input tax credit".into()],
                    ..Default::default()
                },
                &[],
            )
            .await
            .expect("store");

        let hits = storage.search_keywords("management review", 10).await.expect("search");
        assert!(!hits.is_empty());
        assert_eq!(hits[0].title, "ISO 9001 Recert");
        assert!(hits[0].excerpt.contains("internal audit"));

        let hits = storage.search_keywords("tax credit", 10).await.unwrap();
        assert_eq!(hits[0].title, "GST Return Filing");

        assert!(storage.search_keywords("   ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn knowledge_restore_replaces_document() {
        let storage = test_storage().await;
        let id = identity("A");
        let first = storage
            .upsert_knowledge(&id, &item("A"), &summary(), &[])
            .await
            .unwrap();
        let second = storage
            .upsert_knowledge(&id, &item("A"), &PrerequisiteSummary::none(""), &[])
            .await
            .unwrap();
        assert_eq!(first, second);

        let hits = storage.search_keywords("audit", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].excerpt.contains("No prerequisites found"));
    }

    #[tokio::test]
    async fn wrong_width_embedding_is_rejected_before_writing() {
        let storage = test_storage().await;
        let chunk = KnowledgeChunk {
            kind: ChunkKind::ItemSummary,
            source_url: None,
            title: "A".into(),
            content: "internal audit".into(),
            model: "test".into(),
            embedding: vec![1.0, 0.0, 0.0],
        };
        let err = storage
            .upsert_knowledge(&identity("A"), &item("A"), &summary(), &[chunk])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "persistence");
        assert!(storage.search_keywords("audit", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn vector_search_ranks_nearest_chunk_first() {
        let storage = test_storage().await;
        let axis = |i: usize| {
            let mut v = vec![0.0f32; EMBEDDING_DIM];
            v[i] = 1.0;
            v
        };
        let chunk = |kind, url: Option<&str>, content: &str, embedding| KnowledgeChunk {
            kind,
            source_url: url.map(String::from),
            title: "A".into(),
            content: content.into(),
            model: "test".into(),
            embedding,
        };

        storage
            .upsert_knowledge(
                &identity("A"),
                &item("A"),
                &summary(),
                &[
                    chunk(ChunkKind::ItemSummary, None, "summary text", axis(0)),
                    chunk(
                        ChunkKind::SourceDocument,
                        Some("https://www.iso.org/iso-9001"),
                        "source text",
                        axis(1),
                    ),
                ],
            )
            .await
            .unwrap();

        let hits = storage.search_similar(&axis(1), 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].kind, "source_document");
        assert_eq!(hits[0].source.as_deref(), Some("https://www.iso.org/iso-9001"));
        assert!((hits[0].score - 1.0).abs() < 1e-4);
        assert_eq!(hits[1].kind, "item_summary");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn chunk_table_matches_embedding_width() {
        let sql: String = migrations::all_migrations().iter().map(|m| m.sql).collect();
        assert!(sql.contains(&format!("F32_BLOB({EMBEDDING_DIM})")));
    }

    #[tokio::test]
    async fn undelivered_uses_latest_attempt() {
        let storage = test_storage().await;
        let delivered_later = RecordId::new();
        let still_pending = RecordId::new();

        let attempt = |record_id: &RecordId, delivered: bool| NotificationAttempt {
            record_id: record_id.clone(),
            contact: "qm@co.com".into(),
            subject: "New Compliance Item: ISO 9001 Recert".into(),
            body: "<p>body</p>".into(),
            delivered,
            error: (!delivered).then(|| "HTTP 503".to_string()),
            attempted_at: Utc::now(),
        };

        storage.record_attempt(&attempt(&delivered_later, false)).await.unwrap();
        storage.record_attempt(&attempt(&still_pending, false)).await.unwrap();
        storage.record_attempt(&attempt(&delivered_later, true)).await.unwrap();

        let pending = storage.undelivered().await.expect("undelivered");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record_id, still_pending);
        assert_eq!(pending[0].error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("ca_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.append(&MasterRecord::failed(identity("A"), &item("A"), "x"))
            .await
            .unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.list_records(5).await.unwrap().len(), 1);
        let result = ro
            .append(&MasterRecord::failed(identity("B"), &item("B"), "y"))
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(
            fts_query("ISO 9001: recert").as_deref(),
            Some("\"iso\" OR \"9001\" OR \"recert\"")
        );
        assert!(fts_query("  -- ").is_none());
    }
}
