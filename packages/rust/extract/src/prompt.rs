//! Prompt construction for prerequisite extraction.

use compliance_shared::{ComplianceItem, ResearchResult};

/// Sources included in a single prompt.
pub const MAX_PROMPT_SOURCES: usize = 8;

/// Characters of each source's text included in the prompt.
pub const SOURCE_CHARS: usize = 1_000;

/// Marker the model emits when the sources show no prerequisites.
pub const NO_PREREQUISITES_MARKER: &str = "NO_PREREQUISITES_FOUND";

pub(crate) const SYSTEM_PROMPT: &str = "You are a Senior Compliance Specialist and Auditor. \
You answer only from the sources you are given and never include reasoning or <think> tags.";

/// Build the user prompt for one item.
pub fn build_prompt(item: &ComplianceItem, research: &ResearchResult) -> String {
    let application_date = item
        .application_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "Not specified".into());

    let mut category = String::new();
    if let Some(standard) = &item.category.standard {
        category.push_str(&format!("Standard / Category: {standard}\n"));
    }
    if let Some(activity) = &item.category.activity {
        category.push_str(&format!("Activity: {activity}\n"));
    }
    if let Some(jurisdiction) = &item.category.jurisdiction {
        category.push_str(&format!("Jurisdiction: {jurisdiction}\n"));
    }

    format!(
        r#"Analyze the search results and determine BOTH the prerequisites AND the validity period for a compliance item.

**Compliance Item:**
Title: {title}
Description: {description}
Due Date: {due_date}
Application Date: {application_date}
{category}
**Search Results:**
{sources}

**Instructions:**
1. Determine the standard validity or renewal period for this certificate or filing.
2. If an application date is given and the sources state a validity period, calculate the due date as application date plus that period (YYYY-MM-DD).
3. Extract a numbered list of actionable prerequisites from official sources only.
4. If the sources show no prerequisites, write {marker} on its own line instead of a list.
5. Do not include <think> tags or any reasoning. Do not guess.

**Output Format:**

[DUE_DATE]: YYYY-MM-DD
[VALIDITY_PERIOD]: e.g., 3 Years / Annual

Prerequisites for {title}:
1. [Requirement 1]
2. [Requirement 2]

Additional Notes: [Technical context only]
"#,
        title = item.title,
        description = item.description,
        due_date = item.due_date.format("%Y-%m-%d"),
        sources = format_sources(research),
        marker = NO_PREREQUISITES_MARKER,
    )
}

/// Format research sources as numbered blocks separated by `---`.
pub fn format_sources(research: &ResearchResult) -> String {
    if research.is_empty() {
        return "No sources found.".into();
    }

    research
        .entries
        .iter()
        .take(MAX_PROMPT_SOURCES)
        .enumerate()
        .map(|(i, entry)| {
            format!(
                "Source {}: {}\nURL: {}\n{}\n",
                i + 1,
                entry.title,
                entry.source,
                truncate_chars(entry.text(), SOURCE_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
