//! Web research for compliance items.
//!
//! [`DuckDuckGoResearcher`] queries the DuckDuckGo HTML endpoint, then
//! optionally fetches each result page and keeps its readable text. A page
//! that cannot be fetched falls back to the search snippet; only the search
//! request itself can fail the call.

mod page;
mod parser;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, instrument, warn};

use compliance_shared::{
    ComplianceError, ResearchEntry, ResearchResult, Researcher, Result, SearchConfig,
};

/// User-Agent string for research requests.
const USER_AGENT: &str = concat!("ComplianceAssistant/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects to follow when fetching a source page.
const MAX_REDIRECTS: usize = 5;

// ---------------------------------------------------------------------------
// DuckDuckGoResearcher
// ---------------------------------------------------------------------------

/// Researcher backed by the DuckDuckGo HTML results page.
pub struct DuckDuckGoResearcher {
    config: SearchConfig,
    client: Client,
}

impl DuckDuckGoResearcher {
    /// Create a researcher from the `[search]` config section.
    pub fn new(config: SearchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                ComplianceError::Dependency(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { config, client })
    }

    /// Fetch and parse the results page for `query`.
    async fn fetch_results(&self, query: &str) -> Result<Vec<parser::SearchHit>> {
        let url = format!("{}/html/", self.config.base_url.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| ComplianceError::Transient(format!("search request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("search", status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ComplianceError::Transient(format!("failed to read search body: {e}")))?;

        Ok(parser::parse_results(&body, self.config.max_results))
    }

    /// Fetch one source page and extract its text.
    async fn fetch_page_text(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ComplianceError::Transient(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(url, status));
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_none_or(|ct| ct.contains("html") || ct.contains("text/plain"));
        if !is_html {
            return Err(ComplianceError::Dependency(format!(
                "{url}: unsupported content type"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ComplianceError::Transient(format!("{url}: failed to read body: {e}")))?;

        page::page_text(&body, self.config.max_content_chars)
    }
}

#[async_trait]
impl Researcher for DuckDuckGoResearcher {
    #[instrument(skip_all, fields(query = %query))]
    async fn search(&self, query: &str) -> Result<ResearchResult> {
        let hits = self.fetch_results(query).await?;
        if hits.is_empty() {
            info!("search returned no results");
            return Ok(ResearchResult::empty());
        }

        let delay = Duration::from_millis(self.config.fetch_delay_ms);
        let mut entries = Vec::with_capacity(hits.len());

        for (i, hit) in hits.into_iter().enumerate() {
            let content = if self.config.fetch_content {
                if i > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match self.fetch_page_text(&hit.url).await {
                    Ok(text) if !text.is_empty() => Some(text),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(url = %hit.url, error = %e, "page fetch failed, keeping snippet");
                        None
                    }
                }
            } else {
                None
            };

            debug!(url = %hit.url, fetched = content.is_some(), "research source");
            entries.push(ResearchEntry {
                source: hit.url,
                title: hit.title,
                snippet: hit.snippet,
                content,
            });
        }

        info!(sources = entries.len(), "research complete");
        Ok(ResearchResult { entries }.capped(self.config.max_results))
    }
}

// ---------------------------------------------------------------------------
// DisabledResearcher
// ---------------------------------------------------------------------------

/// Researcher used when web research is turned off. Always finds nothing.
pub struct DisabledResearcher;

#[async_trait]
impl Researcher for DisabledResearcher {
    async fn search(&self, query: &str) -> Result<ResearchResult> {
        debug!(%query, "research disabled");
        Ok(ResearchResult::empty())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// 5xx and 429 are worth retrying; other statuses are not.
fn status_error(what: &str, status: StatusCode) -> ComplianceError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ComplianceError::Transient(format!("{what}: HTTP {status}"))
    } else {
        ComplianceError::Dependency(format!("{what}: HTTP {status}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> SearchConfig {
        SearchConfig {
            base_url: server.uri(),
            fetch_delay_ms: 0,
            ..Default::default()
        }
    }

    fn results_page(server: &MockServer) -> String {
        format!(
            r#"<html><body>
              <div class="result"><a class="result__a" href="{0}/iso-9001">ISO 9001 Guide</a>
                <a class="result__snippet">Snippet one</a></div>
              <div class="result"><a class="result__a" href="{0}/missing">Missing page</a>
                <a class="result__snippet">Snippet two</a></div>
            </body></html>"#,
            server.uri()
        )
    }

    #[tokio::test]
    async fn search_fetches_pages_and_falls_back_to_snippets() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/html/"))
            .and(query_param("q", "ISO 9001 recertification"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(results_page(&server), "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/iso-9001"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<html><body><main><p>Complete an internal audit first.</p></main></body></html>",
                "text/html",
            ))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let researcher = DuckDuckGoResearcher::new(config_for(&server)).unwrap();
        let result = researcher.search("ISO 9001 recertification").await.unwrap();

        assert_eq!(result.len(), 2);
        assert!(result.entries[0].text().contains("internal audit"));
        assert!(result.entries[1].content.is_none());
        assert_eq!(result.entries[1].text(), "Snippet two");
        assert_eq!(result.sources()[0], format!("{}/iso-9001", server.uri()));
    }

    #[tokio::test]
    async fn search_without_page_fetch_keeps_snippets() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/html/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(results_page(&server), "text/html"),
            )
            .mount(&server)
            .await;

        let config = SearchConfig {
            fetch_content: false,
            max_results: 1,
            ..config_for(&server)
        };
        let researcher = DuckDuckGoResearcher::new(config).unwrap();
        let result = researcher.search("anything").await.unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result.entries[0].text(), "Snippet one");
    }

    #[tokio::test]
    async fn zero_hits_is_empty_not_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/html/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<html><body></body></html>", "text/html"),
            )
            .mount(&server)
            .await;

        let researcher = DuckDuckGoResearcher::new(config_for(&server)).unwrap();
        let result = researcher.search("obscure permit").await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/html/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let researcher = DuckDuckGoResearcher::new(config_for(&server)).unwrap();
        let err = researcher.search("x").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "transient_dependency");
    }

    #[tokio::test]
    async fn client_errors_are_not_retryable() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/html/"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let researcher = DuckDuckGoResearcher::new(config_for(&server)).unwrap();
        let err = researcher.search("x").await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "dependency");
    }

    #[tokio::test]
    async fn disabled_researcher_finds_nothing() {
        let result = DisabledResearcher.search("ISO 27001").await.unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn rate_limit_is_transient() {
        assert!(status_error("search", StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!status_error("search", StatusCode::NOT_FOUND).is_retryable());
    }
}
