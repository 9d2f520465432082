//! Derived item identity and the duplicate filter.
//!
//! Two submissions are the same obligation when their normalized title,
//! responsible email, and due date match. Descriptions never take part.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::warn;

use compliance_shared::{
    ComplianceError, ComplianceItem, ItemIdentity, MasterRecordStore, RawSubmission, Result,
};

/// Date formats accepted for due and application dates, tried in order.
const DATE_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%Y/%m/%d",
    "%B %d, %Y",
    "%d %B %Y",
];

/// Lowercase, trim, and collapse internal whitespace runs.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Parse a free-form date into a calendar date.
///
/// Day-first wins over month-first for ambiguous slash dates
/// (`01/02/2025` is 1 February).
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ComplianceError::validation("date is empty"));
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Ok(date);
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.date_naive());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(dt.date());
        }
    }

    Err(ComplianceError::validation(format!(
        "'{value}' is not a recognized date"
    )))
}

/// Identity of a validated item.
pub fn derive_identity(item: &ComplianceItem) -> ItemIdentity {
    ItemIdentity::from_parts(
        &normalize_title(&item.title),
        &normalize_email(&item.responsible_email),
        item.due_date,
    )
}

/// Identity straight from a raw submission. Fails only on the due date.
pub fn identity_from_raw(raw: &RawSubmission) -> Result<ItemIdentity> {
    let due_date = parse_date(&raw.due_date)?;
    Ok(ItemIdentity::from_parts(
        &normalize_title(&raw.title),
        &normalize_email(&raw.responsible_email),
        due_date,
    ))
}

// ---------------------------------------------------------------------------
// DuplicateFilter
// ---------------------------------------------------------------------------

/// Checks submissions against the identities in the master ledger.
///
/// Every uncertainty resolves to "not a duplicate": a legitimate new item
/// must never be dropped because its identity or the ledger could not be
/// read. The ledger's unique index still rejects a second processed record.
#[derive(Clone)]
pub struct DuplicateFilter {
    store: Arc<dyn MasterRecordStore>,
}

impl DuplicateFilter {
    pub fn new(store: Arc<dyn MasterRecordStore>) -> Self {
        Self { store }
    }

    /// Whether `raw` matches an already processed ledger entry.
    pub async fn is_duplicate(&self, raw: &RawSubmission) -> bool {
        match identity_from_raw(raw) {
            Ok(identity) => self.is_recorded(&identity).await,
            Err(e) => {
                warn!(title = %raw.title, error = %e, "cannot derive identity, treating as new");
                false
            }
        }
    }

    /// Whether a processed ledger entry exists for `identity`.
    pub async fn is_recorded(&self, identity: &ItemIdentity) -> bool {
        match self.store.list_identities().await {
            Ok(identities) => identities.contains(identity),
            Err(e) => {
                warn!(%identity, error = %e, "cannot read ledger identities, treating as new");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use async_trait::async_trait;
    use compliance_shared::MasterRecord;

    struct FixedIdentities(Result<HashSet<ItemIdentity>>);

    #[async_trait]
    impl MasterRecordStore for FixedIdentities {
        async fn append(&self, _record: &MasterRecord) -> Result<()> {
            Ok(())
        }

        async fn list_identities(&self) -> Result<HashSet<ItemIdentity>> {
            match &self.0 {
                Ok(set) => Ok(set.clone()),
                Err(e) => Err(ComplianceError::Persistence(e.to_string())),
            }
        }
    }

    fn raw(title: &str, email: &str, due: &str) -> RawSubmission {
        RawSubmission {
            title: title.into(),
            description: "anything".into(),
            responsible_email: email.into(),
            due_date: due.into(),
            ..Default::default()
        }
    }

    fn known() -> ItemIdentity {
        ItemIdentity::from_stored("iso 9001 recert|qm@co.com|2025-03-31")
    }

    #[test]
    fn title_normalization() {
        assert_eq!(normalize_title("  ISO   9001\tRecert "), "iso 9001 recert");
        assert_eq!(normalize_email(" QM@Co.COM "), "qm@co.com");
    }

    #[test]
    fn date_formats_are_equivalent() {
        let expected = NaiveDate::from_ymd_opt(2025, 1, 31).unwrap();
        for raw in [
            "2025-01-31",
            "31/01/2025",
            "01/31/2025",
            "31-01-2025",
            "2025/01/31",
            "January 31, 2025",
            "31 January 2025",
            "2025-01-31T09:30:00Z",
            "2025-01-31 00:00:00",
        ] {
            assert_eq!(parse_date(raw).unwrap(), expected, "format {raw}");
        }
    }

    #[test]
    fn ambiguous_slash_date_is_day_first() {
        assert_eq!(
            parse_date("01/02/2025").unwrap(),
            NaiveDate::from_ymd_opt(2025, 2, 1).unwrap()
        );
    }

    #[test]
    fn malformed_dates_are_validation_errors() {
        for raw in ["", "   ", "someday", "2025-13-45", "45000"] {
            let err = parse_date(raw).unwrap_err();
            assert_eq!(err.kind(), "validation", "input {raw:?}");
        }
    }

    #[test]
    fn identity_ignores_case_whitespace_and_date_format() {
        let a = identity_from_raw(&raw("ISO 9001 Recert", "qm@co.com", "2025-03-31")).unwrap();
        let b = identity_from_raw(&raw(" iso  9001 RECERT", "QM@CO.COM", "31/03/2025")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, known());
    }

    #[test]
    fn different_due_date_is_a_different_identity() {
        let a = identity_from_raw(&raw("ISO 9001 Recert", "qm@co.com", "2025-03-31")).unwrap();
        let b = identity_from_raw(&raw("ISO 9001 Recert", "qm@co.com", "2026-03-31")).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn duplicate_filter_matches_recorded_identities() {
        let filter = DuplicateFilter::new(Arc::new(FixedIdentities(Ok(HashSet::from([known()])))));
        assert!(filter.is_duplicate(&raw("ISO 9001 RECERT", "qm@co.com", "31/03/2025")).await);
        assert!(!filter.is_duplicate(&raw("ISO 14001", "qm@co.com", "2025-03-31")).await);
    }

    #[tokio::test]
    async fn duplicate_filter_is_conservative() {
        let filter = DuplicateFilter::new(Arc::new(FixedIdentities(Ok(HashSet::from([known()])))));
        assert!(!filter.is_duplicate(&raw("ISO 9001 Recert", "qm@co.com", "not a date")).await);

        let broken = DuplicateFilter::new(Arc::new(FixedIdentities(Err(
            ComplianceError::Persistence("db locked".into()),
        ))));
        assert!(!broken.is_recorded(&known()).await);
    }
}
