//! Per-item state machine and batch driver.
//!
//! Each submission moves through
//! `received → checked → researched → extracted → stored → notified → done`,
//! with `failed` reachable from any stage. Errors never cross the item
//! boundary: every submission ends with an [`ItemOutcome`], and one item's
//! failure or panic never stops the batch.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, instrument, warn};

use compliance_shared::{
    AppConfig, ComplianceError, Extractor, ItemIdentity, KnowledgeStore, MasterRecord,
    MasterRecordStore, NotificationAttempt, NotificationLog, Notifier, PrerequisiteSummary,
    RawSubmission, RecordId, RecordStatus, ResearchResult, Researcher, Result,
};

use crate::audit::AuditTrail;
use crate::identity::{DuplicateFilter, derive_identity};
use crate::notification::compose;
use crate::query::build_query;
use crate::retry::{RetryPolicy, with_backoff};
use crate::validate::validate;

/// One extraction call plus at most one retry.
pub const MAX_EXTRACTION_ATTEMPTS: u32 = 2;

// ---------------------------------------------------------------------------
// Stages and outcomes
// ---------------------------------------------------------------------------

/// Item lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStage {
    Received,
    Checked,
    Researched,
    Extracted,
    Stored,
    Notified,
    Done,
    Failed,
}

impl ItemStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Checked => "checked",
            Self::Researched => "researched",
            Self::Extracted => "extracted",
            Self::Stored => "stored",
            Self::Notified => "notified",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ItemStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a submission left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    SkippedDuplicate,
    Processed,
    ProcessedNoPrerequisites,
    Failed,
}

impl From<RecordStatus> for ItemStatus {
    fn from(status: RecordStatus) -> Self {
        match status {
            RecordStatus::Processed => Self::Processed,
            RecordStatus::ProcessedNoPrerequisites => Self::ProcessedNoPrerequisites,
            RecordStatus::Failed => Self::Failed,
        }
    }
}

/// Result of running one submission through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    /// Position in the submitted batch.
    pub index: usize,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<ItemIdentity>,
    /// Ledger entry written for this item, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
    pub status: ItemStatus,
    /// Terminal state: `done` or `failed`.
    pub stage: ItemStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<ItemStage>,
    pub prerequisites: usize,
    /// Whether the notification was delivered; absent when none was due.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemOutcome {
    fn new(index: usize, title: &str) -> Self {
        Self {
            index,
            title: title.to_string(),
            identity: None,
            record_id: None,
            status: ItemStatus::Failed,
            stage: ItemStage::Received,
            failed_at: None,
            prerequisites: 0,
            notified: None,
            error: None,
        }
    }

    fn skipped(mut self) -> Self {
        self.status = ItemStatus::SkippedDuplicate;
        self.stage = ItemStage::Done;
        self
    }

    fn failed(mut self, at: ItemStage, err: &ComplianceError) -> Self {
        self.status = ItemStatus::Failed;
        self.stage = ItemStage::Failed;
        self.failed_at = Some(at);
        self.error = Some(err.to_string());
        self
    }

    fn aborted(index: usize, title: &str, reason: String) -> Self {
        let mut outcome = Self::new(index, title);
        outcome.stage = ItemStage::Failed;
        outcome.error = Some(reason);
        outcome
    }
}

/// Counts and per-item outcomes for one batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub received: usize,
    pub skipped_duplicate: usize,
    /// Includes `processed_no_prerequisites`.
    pub processed: usize,
    pub processed_no_prerequisites: usize,
    pub failed: usize,
    pub notify_failed: usize,
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchSummary {
    fn from_outcomes(outcomes: Vec<ItemOutcome>) -> Self {
        let mut summary = Self {
            received: outcomes.len(),
            ..Default::default()
        };
        for outcome in &outcomes {
            match outcome.status {
                ItemStatus::SkippedDuplicate => summary.skipped_duplicate += 1,
                ItemStatus::Processed => summary.processed += 1,
                ItemStatus::ProcessedNoPrerequisites => {
                    summary.processed += 1;
                    summary.processed_no_prerequisites += 1;
                }
                ItemStatus::Failed => summary.failed += 1,
            }
            if outcome.notified == Some(false) {
                summary.notify_failed += 1;
            }
        }
        summary.outcomes = outcomes;
        summary
    }
}

/// Result of re-sending undelivered notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenotifySummary {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting batch status.
pub trait ProgressReporter: Send + Sync {
    /// Called once before any item is processed.
    fn batch_started(&self, total: usize);
    /// Called when an item enters a stage.
    fn stage(&self, index: usize, title: &str, stage: ItemStage);
    /// Called when an item reaches a terminal state.
    fn item_finished(&self, outcome: &ItemOutcome);
    /// Called when the batch completes.
    fn done(&self, summary: &BatchSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn batch_started(&self, _total: usize) {}
    fn stage(&self, _index: usize, _title: &str, _stage: ItemStage) {}
    fn item_finished(&self, _outcome: &ItemOutcome) {}
    fn done(&self, _summary: &BatchSummary) {}
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// The collaborators the pipeline calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub researcher: Arc<dyn Researcher>,
    pub extractor: Arc<dyn Extractor>,
    pub knowledge: Arc<dyn KnowledgeStore>,
    pub records: Arc<dyn MasterRecordStore>,
    pub notifier: Arc<dyn Notifier>,
    pub notification_log: Arc<dyn NotificationLog>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Items processed at once; 1 is strictly sequential.
    pub concurrency: usize,
    pub research_retry: RetryPolicy,
    pub extraction_retry: RetryPolicy,
    pub notify_retry: RetryPolicy,
    /// Cap re-applied to every research result.
    pub max_sources: usize,
    /// Root of the audit trail; `None` disables it.
    pub audit_dir: Option<PathBuf>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(8);
        Self {
            concurrency: 1,
            research_retry: RetryPolicy::new(3, base, max),
            extraction_retry: RetryPolicy::new(MAX_EXTRACTION_ATTEMPTS, base, max),
            notify_retry: RetryPolicy::new(3, base, max),
            max_sources: 8,
            audit_dir: None,
        }
    }
}

impl OrchestratorOptions {
    /// Options from the `[retry]`, `[pipeline]`, `[search]`, and `[defaults]` sections.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let retry = &config.retry;
        let pipeline = &config.pipeline;
        let base = Duration::from_millis(retry.base_delay_ms);
        let max = Duration::from_millis(retry.max_delay_ms);

        Ok(Self {
            concurrency: pipeline.concurrency.max(1) as usize,
            research_retry: RetryPolicy::new(retry.research_attempts, base, max)
                .with_timeout(Duration::from_secs(pipeline.research_timeout_secs)),
            extraction_retry: RetryPolicy::new(
                retry.extraction_attempts.clamp(1, MAX_EXTRACTION_ATTEMPTS),
                base,
                max,
            )
            .with_timeout(Duration::from_secs(pipeline.extract_timeout_secs)),
            notify_retry: RetryPolicy::new(retry.notify_attempts, base, max).with_timeout(
                Duration::from_secs(notify_stage_timeout(config)),
            ),
            max_sources: config.search.max_results,
            audit_dir: if config.defaults.audit {
                Some(config.defaults.resolved_data_dir()?)
            } else {
                None
            },
        })
    }
}

/// A Graph delivery is a token request followed by a send, each bounded by
/// `notify.timeout_secs`, so one attempt needs at least twice that.
fn notify_stage_timeout(config: &AppConfig) -> u64 {
    config
        .pipeline
        .notify_timeout_secs
        .max(2 * config.notify.timeout_secs)
}

// ---------------------------------------------------------------------------
// Claim gate
// ---------------------------------------------------------------------------

type InFlight = Arc<Mutex<HashSet<ItemIdentity>>>;

fn lock_set(set: &Mutex<HashSet<ItemIdentity>>) -> MutexGuard<'_, HashSet<ItemIdentity>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

/// Serializes the duplicate check against the ledger and in-flight items.
struct ClaimGate {
    filter: DuplicateFilter,
    check: tokio::sync::Mutex<()>,
    in_flight: InFlight,
}

enum ClaimOutcome {
    Claimed(Claim),
    Recorded,
    InFlight,
}

/// Exclusive claim on an identity; released on drop, including on panic.
struct Claim {
    identity: ItemIdentity,
    in_flight: InFlight,
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock_set(&self.in_flight).remove(&self.identity);
    }
}

impl ClaimGate {
    fn new(records: Arc<dyn MasterRecordStore>) -> Self {
        Self {
            filter: DuplicateFilter::new(records),
            check: tokio::sync::Mutex::new(()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    async fn claim(&self, identity: &ItemIdentity) -> ClaimOutcome {
        let _serial = self.check.lock().await;

        let busy = lock_set(&self.in_flight).contains(identity);
        if busy {
            return ClaimOutcome::InFlight;
        }
        if self.filter.is_recorded(identity).await {
            return ClaimOutcome::Recorded;
        }

        lock_set(&self.in_flight).insert(identity.clone());
        ClaimOutcome::Claimed(Claim {
            identity: identity.clone(),
            in_flight: self.in_flight.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs batches of submissions through the pipeline.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    collaborators: Collaborators,
    options: OrchestratorOptions,
    gate: ClaimGate,
    audit: Option<AuditTrail>,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, options: OrchestratorOptions) -> Self {
        let gate = ClaimGate::new(collaborators.records.clone());
        let audit = options.audit_dir.as_deref().map(AuditTrail::new);
        Self {
            inner: Arc::new(Inner {
                collaborators,
                options,
                gate,
                audit,
            }),
        }
    }

    /// Process every submission and summarize the run.
    #[instrument(skip_all, fields(items = submissions.len(), concurrency = self.inner.options.concurrency))]
    pub async fn process_batch(
        &self,
        submissions: Vec<RawSubmission>,
        progress: Arc<dyn ProgressReporter>,
    ) -> BatchSummary {
        progress.batch_started(submissions.len());
        info!("starting batch");

        let outcomes = if self.inner.options.concurrency <= 1 {
            let mut outcomes = Vec::with_capacity(submissions.len());
            for (index, raw) in submissions.into_iter().enumerate() {
                let title = raw.title.clone();
                let handle = self.spawn_item(index, raw, progress.clone(), None);
                outcomes.push(join_item(index, &title, handle, progress.as_ref()).await);
            }
            outcomes
        } else {
            self.run_concurrent(submissions, progress.clone()).await
        };

        let summary = BatchSummary::from_outcomes(outcomes);
        info!(
            received = summary.received,
            processed = summary.processed,
            processed_no_prerequisites = summary.processed_no_prerequisites,
            skipped_duplicate = summary.skipped_duplicate,
            failed = summary.failed,
            notify_failed = summary.notify_failed,
            "batch complete"
        );
        progress.done(&summary);
        summary
    }

    async fn run_concurrent(
        &self,
        submissions: Vec<RawSubmission>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Vec<ItemOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.inner.options.concurrency));
        let mut handles = Vec::with_capacity(submissions.len());

        for (index, raw) in submissions.into_iter().enumerate() {
            let title = raw.title.clone();
            let handle = self.spawn_item(index, raw, progress.clone(), Some(semaphore.clone()));
            handles.push((index, title, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (index, title, handle) in handles {
            outcomes.push(join_item(index, &title, handle, progress.as_ref()).await);
        }
        outcomes
    }

    /// Every item runs on its own task, so a panic ends that task only.
    fn spawn_item(
        &self,
        index: usize,
        raw: RawSubmission,
        progress: Arc<dyn ProgressReporter>,
        semaphore: Option<Arc<Semaphore>>,
    ) -> JoinHandle<ItemOutcome> {
        let inner = self.inner.clone();
        tokio::spawn(
            async move {
                let _permit = match semaphore {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                let outcome = inner.process_item(index, raw, progress.as_ref()).await;
                progress.item_finished(&outcome);
                outcome
            }
            .in_current_span(),
        )
    }

    /// Re-send every notification whose latest attempt was not delivered.
    /// Never re-runs any other stage.
    #[instrument(skip_all)]
    pub async fn renotify(&self) -> Result<RenotifySummary> {
        let pending = self.inner.collaborators.notification_log.undelivered().await?;
        let mut summary = RenotifySummary {
            attempted: pending.len(),
            ..Default::default()
        };

        for attempt in pending {
            let delivered = self
                .inner
                .deliver(
                    attempt.record_id.clone(),
                    &attempt.contact,
                    &attempt.subject,
                    &attempt.body,
                )
                .await;
            if delivered {
                summary.delivered += 1;
            } else {
                summary.failed += 1;
            }
        }

        info!(
            attempted = summary.attempted,
            delivered = summary.delivered,
            failed = summary.failed,
            "renotify complete"
        );
        Ok(summary)
    }
}

async fn join_item(
    index: usize,
    title: &str,
    handle: JoinHandle<ItemOutcome>,
    progress: &dyn ProgressReporter,
) -> ItemOutcome {
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(item = index, error = %e, "item task aborted");
            let outcome = ItemOutcome::aborted(index, title, format!("item task aborted: {e}"));
            progress.item_finished(&outcome);
            outcome
        }
    }
}

impl Inner {
    #[instrument(skip_all, fields(item = index, title = %raw.title))]
    async fn process_item(
        &self,
        index: usize,
        raw: RawSubmission,
        progress: &dyn ProgressReporter,
    ) -> ItemOutcome {
        let mut outcome = ItemOutcome::new(index, &raw.title);

        // --- received ---
        progress.stage(index, &raw.title, ItemStage::Received);
        let item = match validate(&raw, Utc::now()) {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "submission rejected");
                self.record_failure(&mut outcome, MasterRecord::rejected(&raw, e.to_string()))
                    .await;
                progress.stage(index, &raw.title, ItemStage::Failed);
                return outcome.failed(ItemStage::Received, &e);
            }
        };

        // --- checked ---
        let identity = derive_identity(&item);
        outcome.identity = Some(identity.clone());
        progress.stage(index, &item.title, ItemStage::Checked);

        let claim = match self.gate.claim(&identity).await {
            ClaimOutcome::Claimed(claim) => claim,
            ClaimOutcome::Recorded => {
                info!(%identity, "already processed, skipping");
                progress.stage(index, &item.title, ItemStage::Done);
                return outcome.skipped();
            }
            ClaimOutcome::InFlight => {
                info!(%identity, "same item already in flight, skipping");
                progress.stage(index, &item.title, ItemStage::Done);
                return outcome.skipped();
            }
        };

        // --- researched ---
        let query = build_query(&item);
        let research = self.research(&query).await;
        progress.stage(index, &item.title, ItemStage::Researched);
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record_research(&identity, &item, &query, &research).await {
                warn!(error = %e, "audit write failed");
            }
        }

        // --- extracted ---
        let summary = if research.is_empty() {
            info!("no research sources, skipping extraction");
            PrerequisiteSummary::none("No research sources were found for this item.")
        } else {
            let extractor = self.collaborators.extractor.as_ref();
            let (item_ref, research_ref) = (&item, &research);
            let extracted = with_backoff(&self.options.extraction_retry, "extraction", move || {
                extractor.extract(item_ref, research_ref)
            })
            .await;
            match extracted {
                Ok(summary) => summary,
                Err(e) => {
                    error!(error = %e, "extraction failed");
                    self.record_failure(&mut outcome, MasterRecord::failed(identity, &item, e.to_string()))
                        .await;
                    progress.stage(index, &item.title, ItemStage::Failed);
                    return outcome.failed(ItemStage::Extracted, &e);
                }
            }
        };
        progress.stage(index, &item.title, ItemStage::Extracted);
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record_summary(&item, &summary).await {
                warn!(error = %e, "audit write failed");
            }
        }

        // --- stored ---
        // Knowledge first: a ledger entry marked processed must never point at
        // a knowledge document that was not written.
        if let Err(e) = self
            .collaborators
            .knowledge
            .store(&identity, &item, &summary, &research)
            .await
        {
            error!(error = %e, "knowledge store write failed");
            self.record_failure(&mut outcome, MasterRecord::failed(identity, &item, e.to_string()))
                .await;
            progress.stage(index, &item.title, ItemStage::Failed);
            return outcome.failed(ItemStage::Stored, &e);
        }

        let record = MasterRecord::completed(identity.clone(), &item, summary.clone());
        if let Err(e) = self.collaborators.records.append(&record).await {
            error!(error = %e, "master record append failed");
            self.record_failure(&mut outcome, MasterRecord::failed(identity, &item, e.to_string()))
                .await;
            progress.stage(index, &item.title, ItemStage::Failed);
            return outcome.failed(ItemStage::Stored, &e);
        }
        drop(claim);

        outcome.record_id = Some(record.id.clone());
        outcome.status = record.status.into();
        outcome.prerequisites = summary.prerequisites.len();
        progress.stage(index, &item.title, ItemStage::Stored);
        debug!(record_id = %record.id, status = %record.status, "item stored");

        // --- notified ---
        let message = compose(&item, &summary, Utc::now().date_naive());
        let delivered = self
            .deliver(
                record.id.clone(),
                &item.responsible_email,
                &message.subject,
                &message.body,
            )
            .await;
        outcome.notified = Some(delivered);
        if delivered {
            progress.stage(index, &item.title, ItemStage::Notified);
        }

        outcome.stage = ItemStage::Done;
        progress.stage(index, &item.title, ItemStage::Done);
        outcome
    }

    /// Research with retries; exhausted retries degrade to no sources.
    async fn research(&self, query: &str) -> ResearchResult {
        let researcher = self.collaborators.researcher.as_ref();
        match with_backoff(&self.options.research_retry, "research", move || {
            researcher.search(query)
        })
        .await
        {
            Ok(result) => result.capped(self.options.max_sources),
            Err(e) => {
                warn!(error = %e, "research failed, continuing with no sources");
                ResearchResult::empty()
            }
        }
    }

    /// Send one notification and log the attempt. Returns whether it was delivered.
    async fn deliver(&self, record_id: RecordId, contact: &str, subject: &str, body: &str) -> bool {
        let notifier = self.collaborators.notifier.as_ref();
        let result = with_backoff(&self.options.notify_retry, "notification", move || {
            notifier.notify(contact, subject, body)
        })
        .await;

        match &result {
            Ok(()) => info!(%contact, "notification delivered"),
            Err(e) => warn!(%contact, error = %e, "notification failed, left for renotify"),
        }

        let attempt = NotificationAttempt {
            record_id,
            contact: contact.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            delivered: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
            attempted_at: Utc::now(),
        };
        if let Err(e) = self.collaborators.notification_log.record_attempt(&attempt).await {
            warn!(error = %e, "could not log notification attempt");
        }

        result.is_ok()
    }

    async fn record_failure(&self, outcome: &mut ItemOutcome, record: MasterRecord) {
        match self.collaborators.records.append(&record).await {
            Ok(()) => outcome.record_id = Some(record.id),
            Err(e) => error!(error = %e, "could not record failure in master ledger"),
        }
    }
}
