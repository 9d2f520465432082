//! Parsing of model output into a [`PrerequisiteSummary`].

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

use compliance_shared::{ComplianceError, PrerequisiteSummary, Result};

use crate::prompt::NO_PREREQUISITES_MARKER;

static THINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));

static DUE_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[DUE_DATE\]:\s*(\d{4}-\d{2}-\d{2})").expect("valid regex"));

static VALIDITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)\[VALIDITY_PERIOD\]:[ \t]*(.*)$").expect("valid regex"));

static LIST_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:\d+[.)]|[-*•])\s+(.+)$").expect("valid regex"));

static NOTES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\**additional notes\**:\**").expect("valid regex"));

/// Parse raw model output.
///
/// Output without a list and without the no-prerequisites marker is an
/// extraction error, as is output that is empty after stripping `<think>`.
pub fn parse_summary(
    raw: &str,
    sources: Vec<String>,
    model: Option<String>,
) -> Result<PrerequisiteSummary> {
    let text = THINK_RE.replace_all(raw, "");
    let text = text.trim();
    if text.is_empty() {
        return Err(ComplianceError::Extraction("empty model output".into()));
    }

    let suggested_due_date = DUE_DATE_RE
        .captures(text)
        .and_then(|c| NaiveDate::parse_from_str(&c[1], "%Y-%m-%d").ok());

    let validity_period = VALIDITY_RE
        .captures(text)
        .map(|c| clean_line(&c[1]))
        .filter(|v| is_meaningful(v));

    let (body, notes) = match NOTES_RE.find(text) {
        Some(m) => (&text[..m.start()], Some(text[m.end()..].trim())),
        None => (text, None),
    };

    let mut prerequisites = Vec::new();
    let mut prose = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with("[DUE_DATE]")
            || trimmed.starts_with("[VALIDITY_PERIOD]")
            || trimmed.contains(NO_PREREQUISITES_MARKER)
        {
            continue;
        }
        match LIST_ITEM_RE.captures(trimmed) {
            Some(c) => {
                let item = clean_line(&c[1]);
                if is_meaningful(&item) {
                    prerequisites.push(item);
                }
            }
            None if !is_heading(trimmed) => prose.push(clean_line(trimmed)),
            None => {}
        }
    }

    let marker = text.contains(NO_PREREQUISITES_MARKER);
    if marker {
        prerequisites.clear();
    } else if prerequisites.is_empty() {
        return Err(ComplianceError::Extraction(
            "model output contained no prerequisite list".into(),
        ));
    }

    let rationale = notes
        .map(|n| n.lines().map(clean_line).collect::<Vec<_>>().join(" "))
        .map(|n| n.trim().to_string())
        .filter(|n| is_meaningful(n))
        .unwrap_or_else(|| prose.join(" "));

    Ok(PrerequisiteSummary {
        prerequisites,
        rationale,
        validity_period,
        suggested_due_date,
        sources,
        model,
    })
}

/// Drop markdown emphasis and surrounding whitespace.
fn clean_line(s: &str) -> String {
    s.replace("**", "").trim().to_string()
}

/// Whether a value carries content rather than a template placeholder.
fn is_meaningful(s: &str) -> bool {
    let lower = s.trim().to_lowercase();
    !(lower.is_empty()
        || lower == "n/a"
        || lower == "unknown"
        || lower.starts_with("e.g.")
        || (lower.starts_with('[') && lower.ends_with(']')))
}

fn is_heading(line: &str) -> bool {
    let stripped = line.trim_start_matches('#').trim().replace("**", "");
    stripped.starts_with("Prerequisites for") || stripped.ends_with(':') || line.starts_with('#')
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = "<think>The user wants ISO details. Let me check.</think>
[DUE_DATE]: 2027-09-01
[VALIDITY_PERIOD]: 3 Years

Prerequisites for ISO 9001 Recertification:
1. Complete a full internal audit cycle
2) Hold a **management review** meeting
- Close all major nonconformities

Additional Notes: Stage 2 audit must occur
before certificate expiry.";

    #[test]
    fn parses_tags_list_and_notes() {
        let summary = parse_summary(
            WELL_FORMED,
            vec!["https://www.iso.org".into()],
            Some("qwen/qwen3-32b".into()),
        )
        .unwrap();

        assert_eq!(
            summary.prerequisites,
            vec![
                "Complete a full internal audit cycle",
                "Hold a management review meeting",
                "Close all major nonconformities",
            ]
        );
        assert_eq!(summary.validity_period.as_deref(), Some("3 Years"));
        assert_eq!(
            summary.suggested_due_date,
            NaiveDate::from_ymd_opt(2027, 9, 1)
        );
        assert_eq!(
            summary.rationale,
            "Stage 2 audit must occur before certificate expiry."
        );
        assert_eq!(summary.model.as_deref(), Some("qwen/qwen3-32b"));
        assert!(!summary.rationale.contains("think"));
    }

    #[test]
    fn marker_means_no_prerequisites() {
        let summary = parse_summary(
            "[VALIDITY_PERIOD]: Annual\nNO_PREREQUISITES_FOUND\nThe sources describe a simple annual return.",
            vec![],
            None,
        )
        .unwrap();
        assert!(summary.is_empty());
        assert_eq!(summary.validity_period.as_deref(), Some("Annual"));
        assert_eq!(summary.rationale, "The sources describe a simple annual return.");
    }

    #[test]
    fn empty_output_is_extraction_error() {
        let err = parse_summary("<think>only thinking</think>  ", vec![], None).unwrap_err();
        assert!(matches!(err, ComplianceError::Extraction(_)));
    }

    #[test]
    fn prose_without_list_is_extraction_error() {
        let err = parse_summary(
            "I could not determine anything useful from these sources.",
            vec![],
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "extraction");
    }

    #[test]
    fn template_placeholders_are_ignored() {
        let summary = parse_summary(
            "[DUE_DATE]: YYYY-MM-DD\n[VALIDITY_PERIOD]: e.g., 3 Years / Annual\n1. File Form GSTR-3B\n2. [Requirement 2]\nAdditional Notes: [Technical context only]",
            vec![],
            None,
        )
        .unwrap();
        assert_eq!(summary.prerequisites, vec!["File Form GSTR-3B"]);
        assert!(summary.validity_period.is_none());
        assert!(summary.suggested_due_date.is_none());
        assert_eq!(summary.rationale, "");
    }
}
