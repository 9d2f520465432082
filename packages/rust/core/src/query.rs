//! Research query construction.

use compliance_shared::ComplianceItem;

/// Characters of the description included in a query.
const DESCRIPTION_PREFIX_CHARS: usize = 100;

const QUERY_SUFFIX: &str = "certification requirements prerequisites validity period renewal";

/// Deterministic search query for an item.
pub fn build_query(item: &ComplianceItem) -> String {
    let description: String = item
        .description
        .chars()
        .take(DESCRIPTION_PREFIX_CHARS)
        .collect();

    let mut parts = vec![item.title.as_str(), description.as_str(), QUERY_SUFFIX];
    if let Some(jurisdiction) = item.category.jurisdiction.as_deref() {
        parts.push(jurisdiction);
    }

    parts
        .iter()
        .flat_map(|p| p.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}
