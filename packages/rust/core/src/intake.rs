//! Item Source: reads raw submissions from JSON or JSON-lines files.

use std::path::Path;

use tracing::{debug, info};

use compliance_shared::{ComplianceError, RawSubmission, Result};

/// Read all submissions from `path`.
///
/// `.jsonl` files hold one JSON object per line (blank lines ignored); any
/// other extension is read as a JSON array. Field-level problems are left to
/// per-item validation; only an unreadable or unparseable file is an error.
pub fn read_submissions(path: &Path) -> Result<Vec<RawSubmission>> {
    let content = std::fs::read_to_string(path).map_err(|e| ComplianceError::io(path, e))?;

    let is_jsonl = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jsonl"));

    let submissions = if is_jsonl {
        parse_json_lines(&content, path)?
    } else {
        serde_json::from_str::<Vec<RawSubmission>>(&content).map_err(|e| {
            ComplianceError::parse(format!("{}: expected a JSON array of submissions: {e}", path.display()))
        })?
    };

    info!(path = %path.display(), count = submissions.len(), "submissions loaded");
    Ok(submissions)
}

fn parse_json_lines(content: &str, path: &Path) -> Result<Vec<RawSubmission>> {
    let mut submissions = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let submission = serde_json::from_str::<RawSubmission>(line).map_err(|e| {
            ComplianceError::parse(format!("{}:{}: {e}", path.display(), i + 1))
        })?;
        submissions.push(submission);
    }
    debug!(lines = submissions.len(), "parsed JSON lines");
    Ok(submissions)
}
