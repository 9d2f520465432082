//! Parsing of the DuckDuckGo HTML results page.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

/// One organic result from the results page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

static RESULT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.result").expect("valid selector"));
static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.result__a").expect("valid selector"));
static SNIPPET_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".result__snippet").expect("valid selector"));

/// Extract up to `max` results, skipping ads and repeated URLs.
pub(crate) fn parse_results(html: &str, max: usize) -> Vec<SearchHit> {
    let doc = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut hits = Vec::new();

    for result in doc.select(&RESULT_SEL) {
        if hits.len() >= max {
            break;
        }
        if result.value().classes().any(|c| c == "result--ad") {
            continue;
        }

        let Some(anchor) = result.select(&TITLE_SEL).next() else {
            continue;
        };
        let Some(url) = anchor.value().attr("href").and_then(resolve_result_url) else {
            continue;
        };
        if !seen.insert(url.clone()) {
            continue;
        }

        let title = collapse_whitespace(&anchor.text().collect::<String>());
        let snippet = result
            .select(&SNIPPET_SEL)
            .next()
            .map(|s| collapse_whitespace(&s.text().collect::<String>()))
            .unwrap_or_default();

        hits.push(SearchHit {
            url,
            title,
            snippet,
        });
    }

    hits
}

/// Resolve a result href to the target page URL.
///
/// Result links usually go through the `/l/?uddg=<target>` redirector; the
/// target is unwrapped so the stored source is the real page.
fn resolve_result_url(href: &str) -> Option<String> {
    let base = Url::parse("https://duckduckgo.com/").ok()?;
    let url = base.join(href).ok()?;

    let target = if url.path().starts_with("/l/") {
        let uddg = url
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, v)| v.into_owned())?;
        Url::parse(&uddg).ok()?
    } else {
        url
    };

    matches!(target.scheme(), "http" | "https").then(|| target.to_string())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
