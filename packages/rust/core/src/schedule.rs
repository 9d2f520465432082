//! Scheduling hints: lead times, recommended start dates, and urgency.
//!
//! Lead times are static estimates in days of how long before the due date
//! work on an obligation should begin.

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use compliance_shared::{ComplianceItem, ItemCategory};

/// Used when neither the category nor the title names a known standard.
pub const DEFAULT_LEAD_TIME_DAYS: i64 = 30;

const ISO_LEAD_TIMES: [(&str, i64); 8] = [
    ("iso 9001", 90),
    ("iso 14001", 90),
    ("iso 27001", 120),
    ("iso 45001", 90),
    ("iso 22000", 90),
    ("iso 50001", 120),
    ("iso 13485", 120),
    ("iso 20000", 120),
];

const ISO_ACTIVITY_ADJUSTMENTS: [(&str, i64); 7] = [
    ("new certification", 30),
    ("recertification", 0),
    ("surveillance audit", -30),
    ("gap analysis", -60),
    ("internal audit preparation", -45),
    ("document review", -75),
    ("corrective action implementation", -30),
];

/// India regulatory categories. Each entry lists the phrases that identify it.
const INDIA_LEAD_TIMES: [(&[&str], i64); 9] = [
    (&["bureau of indian standards", "bis"], 180),
    (&["central pollution control board", "cpcb", "pollution control"], 120),
    (&["environmental clearance"], 270),
    (&["factory act", "factories act"], 60),
    (&["labour law", "labor law"], 60),
    (&["gst"], 30),
    (&["import/export", "import export", "export regulations"], 90),
    (&["industry-specific license", "industry specific license"], 120),
    (&["state-level compliance", "state level compliance"], 90),
];

/// How soon an item is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Critical,
    High,
    Medium,
    Low,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overdue or within 3 days is critical, then 7 high, 14 medium.
pub fn urgency(due_date: NaiveDate, today: NaiveDate) -> Urgency {
    match (due_date - today).num_days() {
        i64::MIN..=3 => Urgency::Critical,
        4..=7 => Urgency::High,
        8..=14 => Urgency::Medium,
        _ => Urgency::Low,
    }
}

/// Lead time for an item, from its category or, failing that, its title.
pub fn lead_time_days(category: &ItemCategory, title: &str) -> i64 {
    let standard = category.standard.as_deref().unwrap_or_default();

    for text in [standard, title] {
        let text = text.to_lowercase();
        if let Some((_, base)) = ISO_LEAD_TIMES.iter().find(|(key, _)| text.contains(key)) {
            let activity = category
                .activity
                .as_deref()
                .map(str::to_lowercase)
                .unwrap_or_default();
            let adjustment = ISO_ACTIVITY_ADJUSTMENTS
                .iter()
                .find(|(key, _)| activity.contains(key))
                .map(|(_, days)| *days)
                .unwrap_or(0);
            return (base + adjustment).max(0);
        }
        if let Some((_, days)) = INDIA_LEAD_TIMES
            .iter()
            .find(|(phrases, _)| phrases.iter().any(|p| mentions(&text, p)))
        {
            return *days;
        }
    }

    DEFAULT_LEAD_TIME_DAYS
}

/// Whether `text` mentions `phrase`; single words must match a whole token.
fn mentions(text: &str, phrase: &str) -> bool {
    if phrase.contains([' ', '/', '-']) {
        return text.contains(phrase);
    }
    text.split(|c: char| !c.is_alphanumeric())
        .any(|token| token == phrase)
}

/// Lead time, recommended start, and urgency for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleHint {
    pub lead_time_days: i64,
    pub recommended_start: NaiveDate,
    pub days_remaining: i64,
    pub urgency: Urgency,
}

pub fn schedule_hint(item: &ComplianceItem, today: NaiveDate) -> ScheduleHint {
    let lead_time_days = lead_time_days(&item.category, &item.title);
    ScheduleHint {
        lead_time_days,
        recommended_start: item.due_date - Duration::days(lead_time_days),
        days_remaining: (item.due_date - today).num_days(),
        urgency: urgency(item.due_date, today),
    }
}
