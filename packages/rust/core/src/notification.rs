//! Composition of the notification sent to the responsible party.

use chrono::NaiveDate;

use compliance_shared::{ComplianceItem, PrerequisiteSummary};

use crate::schedule::schedule_hint;

/// A composed message, ready for a [`Notifier`](compliance_shared::Notifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    /// HTML body.
    pub body: String,
}

pub fn subject_for(item: &ComplianceItem) -> String {
    format!("New Compliance Item: {}", item.title)
}

/// Build the subject and HTML body for a stored item.
pub fn compose(
    item: &ComplianceItem,
    summary: &PrerequisiteSummary,
    today: NaiveDate,
) -> Notification {
    let hint = schedule_hint(item, today);
    let mut body = String::new();

    body.push_str("<html><body style=\"font-family: 'Segoe UI', sans-serif;\">\n");
    body.push_str("<h2>New Compliance Item Assigned</h2>\n");
    body.push_str("<p>You have been assigned a compliance item that requires your attention.</p>\n");

    body.push_str("<table>\n");
    row(&mut body, "Title", &escape_html(&item.title));
    if !item.description.is_empty() {
        row(&mut body, "Description", &escape_html(&item.description));
    }
    row(
        &mut body,
        "Due Date",
        &format!(
            "<strong>{}</strong> ({} days)",
            item.due_date.format("%Y-%m-%d"),
            hint.days_remaining
        ),
    );
    row(&mut body, "Urgency", hint.urgency.as_str());
    row(
        &mut body,
        "Recommended Start",
        &format!(
            "{} ({} days lead time)",
            hint.recommended_start.format("%Y-%m-%d"),
            hint.lead_time_days
        ),
    );
    if let Some(validity) = &summary.validity_period {
        row(&mut body, "Validity Period", &escape_html(validity));
    }
    if let Some(suggested) = summary.suggested_due_date {
        if suggested != item.due_date {
            row(
                &mut body,
                "Suggested Due Date",
                &suggested.format("%Y-%m-%d").to_string(),
            );
        }
    }
    body.push_str("</table>\n");

    body.push_str("<h3>Prerequisites and Requirements</h3>\n");
    if summary.prerequisites.is_empty() {
        body.push_str("<p>No prerequisites were found. Please confirm the requirements manually.</p>\n");
    } else {
        body.push_str("<ol>\n");
        for prerequisite in &summary.prerequisites {
            body.push_str(&format!("<li>{}</li>\n", escape_html(prerequisite)));
        }
        body.push_str("</ol>\n");
    }

    if !summary.rationale.is_empty() {
        body.push_str(&format!(
            "<p><em>Notes:</em> {}</p>\n",
            escape_html(&summary.rationale)
        ));
    }

    if !summary.sources.is_empty() {
        body.push_str("<h3>Sources</h3>\n<ul>\n");
        for source in &summary.sources {
            let escaped = escape_html(source);
            body.push_str(&format!("<li><a href=\"{escaped}\">{escaped}</a></li>\n"));
        }
        body.push_str("</ul>\n");
    }

    body.push_str("<p>This is an automated message from the Compliance Assistant. Please do not reply.</p>\n");
    body.push_str("</body></html>\n");

    Notification {
        subject: subject_for(item),
        body,
    }
}

fn row(body: &mut String, label: &str, value_html: &str) {
    body.push_str(&format!(
        "<tr><td><strong>{label}:</strong></td><td>{value_html}</td></tr>\n"
    ));
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
