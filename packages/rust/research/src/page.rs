//! Readable text extraction from fetched source pages.

use scraper::{Html, Selector};

use compliance_shared::{ComplianceError, Result};

/// Tags dropped before conversion; they never carry source text.
const SKIP_TAGS: [&str; 10] = [
    "script", "style", "nav", "header", "footer", "aside", "iframe", "noscript", "svg", "form",
];

/// Convert a page to plain Markdown text, truncated to `max_chars` characters.
pub(crate) fn page_text(html: &str, max_chars: usize) -> Result<String> {
    let content_html = main_content_html(html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIP_TAGS.to_vec())
        .build();

    let markdown = converter
        .convert(&content_html)
        .map_err(|e| ComplianceError::parse(format!("htmd conversion failed: {e}")))?;

    let text = squeeze_blank_lines(&markdown);
    Ok(truncate_chars(&text, max_chars))
}

/// The main content container if one exists, otherwise the body.
fn main_content_html(html: &str) -> String {
    let doc = Html::parse_document(html);

    let selectors = ["main", "article", "[role=\"main\"]", ".content", "body"];
    for sel_str in &selectors {
        if let Ok(selector) = Selector::parse(sel_str) {
            if let Some(el) = doc.select(&selector).next() {
                return el.inner_html();
            }
        }
    }

    html.to_string()
}

fn squeeze_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

/// Truncate on a char boundary.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
