//! Knowledge base: embedded item summaries and research sources.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use compliance_shared::{
    ComplianceError, ComplianceItem, Embedder, ItemIdentity, KnowledgeHit, KnowledgeStore,
    PrerequisiteSummary, ResearchResult, Result, StoreReceipt,
};

use crate::{ChunkKind, KnowledgeChunk, Storage};

/// Characters of source text embedded per research source.
pub const SOURCE_CHUNK_CHARS: usize = 2_000;

/// [`Storage`] plus an [`Embedder`]: stores vectors on write and answers
/// queries by cosine similarity, falling back to FTS5 keyword search when
/// the query cannot be embedded or the vector search fails.
pub struct KnowledgeBase {
    storage: Arc<Storage>,
    embedder: Arc<dyn Embedder>,
}

impl KnowledgeBase {
    pub fn new(storage: Arc<Storage>, embedder: Arc<dyn Embedder>) -> Self {
        Self { storage, embedder }
    }

    /// Hits ordered by descending score.
    #[instrument(skip_all, fields(limit = limit, model = self.embedder.model()))]
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<KnowledgeHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        match self.embedder.embed(&[query.to_string()]).await {
            Ok(mut vectors) => match vectors.pop() {
                Some(vector) if vector.iter().any(|x| *x != 0.0) => {
                    match self.storage.search_similar(&vector, limit).await {
                        Ok(hits) if !hits.is_empty() => return Ok(hits),
                        Ok(_) => debug!("no vector hits, trying keywords"),
                        Err(e) => warn!(error = %e, "vector search failed, trying keywords"),
                    }
                }
                _ => debug!("query has no embedding, trying keywords"),
            },
            Err(e) => warn!(error = %e, "query embedding failed, trying keywords"),
        }

        self.storage.search_keywords(query, limit).await
    }
}

fn chunk_texts(
    item: &ComplianceItem,
    summary: &PrerequisiteSummary,
    research: &ResearchResult,
) -> Vec<(ChunkKind, Option<String>, String, String)> {
    let mut texts = vec![(
        ChunkKind::ItemSummary,
        None,
        item.title.clone(),
        format!("{}\n{}\n{}", item.title, item.description, summary.to_text()),
    )];

    for entry in &research.entries {
        let body: String = entry.text().chars().take(SOURCE_CHUNK_CHARS).collect();
        if entry.title.trim().is_empty() && body.trim().is_empty() {
            continue;
        }
        let title = if entry.title.trim().is_empty() {
            entry.source.clone()
        } else {
            entry.title.clone()
        };
        texts.push((
            ChunkKind::SourceDocument,
            Some(entry.source.clone()),
            title.clone(),
            format!("{title}\n{body}"),
        ));
    }
    texts
}

#[async_trait]
impl KnowledgeStore for KnowledgeBase {
    #[instrument(skip_all, fields(title = %item.title, sources = research.len()))]
    async fn store(
        &self,
        identity: &ItemIdentity,
        item: &ComplianceItem,
        summary: &PrerequisiteSummary,
        research: &ResearchResult,
    ) -> Result<StoreReceipt> {
        let texts = chunk_texts(item, summary, research);
        let inputs: Vec<String> = texts.iter().map(|(_, _, _, content)| content.clone()).collect();

        let vectors = self.embedder.embed(&inputs).await?;
        if vectors.len() != inputs.len() {
            return Err(ComplianceError::Dependency(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                inputs.len()
            )));
        }

        let model = self.embedder.model().to_string();
        let chunks: Vec<KnowledgeChunk> = texts
            .into_iter()
            .zip(vectors)
            .map(|((kind, source_url, title, content), embedding)| KnowledgeChunk {
                kind,
                source_url,
                title,
                content,
                model: model.clone(),
                embedding,
            })
            .collect();

        self.storage
            .upsert_knowledge(identity, item, summary, &chunks)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use compliance_embed::HashingEmbedder;
    use compliance_shared::{ItemCategory, ResearchEntry};
    use uuid::Uuid;

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn model(&self) -> &str {
            "failing"
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(ComplianceError::Transient("embedding service down".into()))
        }
    }

    async fn test_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("ca_test_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&tmp).await.expect("open test db"))
    }

    fn item(title: &str, description: &str) -> ComplianceItem {
        ComplianceItem {
            title: title.into(),
            description: description.into(),
            responsible_email: "ehs@co.com".into(),
            due_date: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
            application_date: None,
            submitted_at: Utc::now(),
            category: ItemCategory::default(),
        }
    }

    fn identity(title: &str) -> ItemIdentity {
        ItemIdentity::from_parts(
            &title.to_lowercase(),
            "ehs@co.com",
            NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
        )
    }

    fn source(url: &str, title: &str, content: &str) -> ResearchEntry {
        ResearchEntry {
            source: url.into(),
            title: title.into(),
            snippet: String::new(),
            content: Some(content.into()),
        }
    }

    fn summary(steps: &[&str]) -> PrerequisiteSummary {
        PrerequisiteSummary {
            prerequisites: steps.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stores_sources_linked_to_identity() {
        let storage = test_storage().await;
        let kb = KnowledgeBase::new(storage.clone(), Arc::new(HashingEmbedder::new()));
        let research = ResearchResult {
            entries: vec![
                source("https://fire.gov.in/noc", "Fire NOC", "Extinguisher servicing records"),
                source("https://fire.gov.in/drill", "Fire Drill", "Evacuation drill log"),
            ],
        };

        kb.store(
            &identity("Fire NOC Renewal"),
            &item("Fire NOC Renewal", "Renew the fire no-objection certificate"),
            &summary(&["Service extinguishers"]),
            &research,
        )
        .await
        .expect("store");

        let sources = storage
            .knowledge_sources(&identity("Fire NOC Renewal"))
            .await
            .unwrap();
        assert_eq!(sources, vec!["https://fire.gov.in/noc", "https://fire.gov.in/drill"]);
    }

    #[tokio::test]
    async fn similarity_search_finds_source_documents() {
        let storage = test_storage().await;
        let kb = KnowledgeBase::new(storage, Arc::new(HashingEmbedder::new()));

        kb.store(
            &identity("Fire NOC Renewal"),
            &item("Fire NOC Renewal", "Renew the fire no-objection certificate"),
            &summary(&["Service extinguishers"]),
            &ResearchResult {
                entries: vec![source(
                    "https://fire.gov.in/hydrant",
                    "Hydrant pressure testing",
                    "Hydrant pressure testing must be certified by a licensed agency",
                )],
            },
        )
        .await
        .unwrap();

        kb.store(
            &identity("GST Return"),
            &item("GST Return", "Quarterly GSTR-3B filing"),
            &summary(&["Reconcile input tax credit"]),
            &ResearchResult::empty(),
        )
        .await
        .unwrap();

        let hits = kb.search("hydrant pressure tests", 3).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].kind, "source_document");
        assert_eq!(hits[0].source.as_deref(), Some("https://fire.gov.in/hydrant"));
        assert_eq!(hits[0].title, "Fire NOC Renewal");
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));

        let hits = kb.search("input tax credit reconciliation", 1).await.unwrap();
        assert_eq!(hits[0].title, "GST Return");
        assert_eq!(hits[0].kind, "item_summary");
    }

    #[tokio::test]
    async fn restoring_replaces_sources() {
        let storage = test_storage().await;
        let kb = KnowledgeBase::new(storage.clone(), Arc::new(HashingEmbedder::new()));
        let id = identity("Boiler Inspection");
        let it = item("Boiler Inspection", "Annual boiler inspection");

        let first = kb
            .store(
                &id,
                &it,
                &summary(&["Book inspector"]),
                &ResearchResult {
                    entries: vec![
                        source("https://a.example", "A", "old source a"),
                        source("https://b.example", "B", "old source b"),
                    ],
                },
            )
            .await
            .unwrap();
        let second = kb
            .store(
                &id,
                &it,
                &summary(&["Book inspector"]),
                &ResearchResult {
                    entries: vec![source("https://c.example", "C", "new source")],
                },
            )
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(
            storage.knowledge_sources(&id).await.unwrap(),
            vec!["https://c.example"]
        );
    }

    #[tokio::test]
    async fn search_falls_back_to_keywords_when_embedding_fails() {
        let storage = test_storage().await;
        let writer = KnowledgeBase::new(storage.clone(), Arc::new(HashingEmbedder::new()));
        writer
            .store(
                &identity("ISO 9001 Recert"),
                &item("ISO 9001 Recert", "Annual recertification audit"),
                &summary(&["Hold management review"]),
                &ResearchResult::empty(),
            )
            .await
            .unwrap();

        let reader = KnowledgeBase::new(storage, Arc::new(FailingEmbedder));
        let hits = reader.search("management review", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "ISO 9001 Recert");
        assert_eq!(hits[0].kind, "item_summary");

        assert!(reader.search("  ", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn embedding_failure_fails_store_without_writing() {
        let storage = test_storage().await;
        let kb = KnowledgeBase::new(storage.clone(), Arc::new(FailingEmbedder));
        let err = kb
            .store(
                &identity("X"),
                &item("X", "x"),
                &summary(&["y"]),
                &ResearchResult::empty(),
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(storage.search_keywords("x", 5).await.unwrap().is_empty());
    }
}
