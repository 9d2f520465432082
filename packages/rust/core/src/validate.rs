//! Validation of raw submissions into [`ComplianceItem`]s.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::warn;

use compliance_shared::{ComplianceError, ComplianceItem, RawSubmission, Result};

use crate::identity::parse_date;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid regex")
});

/// Validate a submission received at `submitted_at`.
///
/// The title, an email-shaped contact, and a parseable due date are
/// required. An unparseable application date is dropped with a warning,
/// since it only feeds the model prompt.
pub fn validate(raw: &RawSubmission, submitted_at: DateTime<Utc>) -> Result<ComplianceItem> {
    let title = raw.title.trim();
    if title.is_empty() {
        return Err(ComplianceError::validation("title is empty"));
    }

    let email = raw.responsible_email.trim();
    if email.is_empty() {
        return Err(ComplianceError::validation("responsible email is empty"));
    }
    if !EMAIL_RE.is_match(email) {
        return Err(ComplianceError::validation(format!(
            "responsible email '{email}' is not an email address"
        )));
    }

    let due_date = parse_date(&raw.due_date).map_err(|e| {
        ComplianceError::validation(format!("due date: {}", validation_message(&e)))
    })?;

    let application_date = match raw.application_date.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(value) => match parse_date(value) {
            Ok(date) => Some(date),
            Err(e) => {
                warn!(%title, error = %e, "ignoring unparseable application date");
                None
            }
        },
    };

    Ok(ComplianceItem {
        title: title.to_string(),
        description: raw.description.trim().to_string(),
        responsible_email: email.to_string(),
        due_date,
        application_date,
        submitted_at,
        category: raw.category(),
    })
}

fn validation_message(err: &ComplianceError) -> String {
    match err {
        ComplianceError::Validation { message } => message.clone(),
        other => other.to_string(),
    }
}
