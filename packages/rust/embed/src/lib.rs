//! Text embedding backends for knowledge retrieval.
//!
//! Every backend produces L2-normalized vectors of
//! [`EMBEDDING_DIM`](compliance_shared::EMBEDDING_DIM) values, so cosine
//! distance in the store is comparable across items.
//!
//! - [`ApiEmbedder`] calls an OpenAI-compatible `/embeddings` endpoint.
//! - [`OnnxEmbedder`] runs all-MiniLM-L6-v2 locally (feature `onnx`).
//! - [`HashingEmbedder`] hashes words and character trigrams; it needs no
//!   model and is used offline and in tests.

mod hashing;
#[cfg(feature = "onnx")]
mod onnx;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use compliance_shared::{ComplianceError, EMBEDDING_DIM, Embedder, EmbeddingConfig, Result};

pub use hashing::HashingEmbedder;
#[cfg(feature = "onnx")]
pub use onnx::OnnxEmbedder;

/// L2-normalize a vector in place. Zero vectors are left as they are.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Dot product of two unit vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

// ---------------------------------------------------------------------------
// Protocol types (OpenAI-compatible embeddings)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

// ---------------------------------------------------------------------------
// ApiEmbedder
// ---------------------------------------------------------------------------

/// Embedder backed by a remote embeddings API.
pub struct ApiEmbedder {
    config: EmbeddingConfig,
    api_key: String,
    client: Client,
}

impl ApiEmbedder {
    pub fn new(config: EmbeddingConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                ComplianceError::Dependency(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            config,
            api_key: api_key.into(),
            client,
        })
    }

    /// Create an embedder reading the API key from `config.api_key_env`.
    pub fn from_env(config: EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ComplianceError::config(format!(
                    "Embedding API key not found. Set the {} environment variable.",
                    config.api_key_env
                ))
            })?;
        Self::new(config, api_key)
    }
}

#[async_trait]
impl Embedder for ApiEmbedder {
    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip_all, fields(inputs = texts.len(), model = %self.config.model))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let request = EmbeddingRequest {
            model: &self.config.model,
            input: texts,
            dimensions: EMBEDDING_DIM,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ComplianceError::Transient(format!("embedding request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail: String = body.chars().take(200).collect();
            return Err(
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    ComplianceError::Transient(format!("embeddings: HTTP {status}: {detail}"))
                } else {
                    ComplianceError::Dependency(format!("embeddings: HTTP {status}: {detail}"))
                },
            );
        }

        let body = response.text().await.map_err(|e| {
            ComplianceError::Transient(format!("reading embeddings body failed: {e}"))
        })?;
        let mut parsed: EmbeddingResponse = serde_json::from_str(&body).map_err(|e| {
            ComplianceError::Dependency(format!("invalid embeddings response: {e}"))
        })?;

        if parsed.data.len() != texts.len() {
            return Err(ComplianceError::Dependency(format!(
                "embeddings response has {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }

        parsed.data.sort_by_key(|d| d.index);
        let mut vectors = Vec::with_capacity(parsed.data.len());
        for data in parsed.data {
            if data.embedding.len() != EMBEDDING_DIM {
                return Err(ComplianceError::Dependency(format!(
                    "embedding has {} dimensions, expected {EMBEDDING_DIM}",
                    data.embedding.len()
                )));
            }
            let mut v = data.embedding;
            normalize(&mut v);
            vectors.push(v);
        }

        debug!(vectors = vectors.len(), "embedded");
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> EmbeddingConfig {
        EmbeddingConfig {
            base_url: server.uri(),
            ..Default::default()
        }
    }

    fn vector(seed: usize) -> Vec<f32> {
        (0..EMBEDDING_DIM).map(|i| ((i + seed) % 7) as f32).collect()
    }

    #[tokio::test]
    async fn embeds_in_input_order() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "text-embedding-3-small",
                "dimensions": 384
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "object": "list",
                "data": [
                    {"object": "embedding", "index": 1, "embedding": vector(1)},
                    {"object": "embedding", "index": 0, "embedding": vector(0)}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = ApiEmbedder::new(config_for(&server), "test-key").unwrap();
        let texts = vec!["fire safety".to_string(), "pollution consent".to_string()];
        let vectors = embedder.embed(&texts).await.unwrap();

        assert_eq!(vectors.len(), 2);
        let mut expected = vector(0);
        normalize(&mut expected);
        assert_eq!(vectors[0], expected);
        let norm: f32 = vectors[1].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn wrong_dimension_is_dependency_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [0.1, 0.2, 0.3]}]
            })))
            .mount(&server)
            .await;

        let embedder = ApiEmbedder::new(config_for(&server), "k").unwrap();
        let err = embedder.embed(&["x".to_string()]).await.unwrap_err();
        assert_eq!(err.kind(), "dependency");
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let embedder = ApiEmbedder::new(config_for(&server), "k").unwrap();
        let err = embedder.embed(&["x".to_string()]).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn empty_input_makes_no_request() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let embedder = ApiEmbedder::new(config_for(&server), "k").unwrap();
        assert!(embedder.embed(&[]).await.unwrap().is_empty());
    }

    #[test]
    fn from_env_requires_key() {
        let config = EmbeddingConfig {
            api_key_env: "COMPLIANCE_TEST_UNSET_EMBED_VAR".into(),
            ..Default::default()
        };
        let err = ApiEmbedder::from_env(config).err().unwrap();
        assert!(err.to_string().contains("COMPLIANCE_TEST_UNSET_EMBED_VAR"));
    }

    #[test]
    fn normalize_leaves_zero_vector() {
        let mut v = vec![0.0f32; 4];
        normalize(&mut v);
        assert!(v.iter().all(|x| *x == 0.0));

        let mut w = vec![3.0f32, 4.0];
        normalize(&mut w);
        assert!((cosine_similarity(&w, &w) - 1.0).abs() < 1e-6);
    }
}
