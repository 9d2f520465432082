//! Core pipeline for the compliance assistant.
//!
//! Takes raw submissions through validation, duplicate detection, research,
//! prerequisite extraction, persistence, and notification. External systems
//! are reached only through the capability traits in `compliance-shared`.

pub mod audit;
pub mod identity;
pub mod intake;
pub mod notification;
pub mod orchestrator;
pub mod query;
pub mod retry;
pub mod schedule;
pub mod validate;

pub use identity::{DuplicateFilter, derive_identity};
pub use intake::read_submissions;
pub use orchestrator::{
    BatchSummary, Collaborators, ItemOutcome, ItemStage, ItemStatus, Orchestrator,
    OrchestratorOptions, ProgressReporter, RenotifySummary, SilentProgress,
};
pub use retry::RetryPolicy;
