//! Feature-hashing embedder.
//!
//! Each lowercase word and each character trigram of `#word#` is hashed
//! with SHA-256 into one of [`EMBEDDING_DIM`] buckets with a hash-derived
//! sign. Trigrams let inflections ("certified", "certification") share
//! weight. Similarity is lexical, not semantic.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use compliance_shared::{EMBEDDING_DIM, Embedder, Result};

use crate::normalize;

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

/// Deterministic embedder with no model and no network.
#[derive(Debug, Clone, Default)]
pub struct HashingEmbedder;

impl HashingEmbedder {
    pub fn new() -> Self {
        Self
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            add_feature(&mut v, &word, WORD_WEIGHT);

            let padded: Vec<char> = format!("#{word}#").chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                add_feature(&mut v, &gram, TRIGRAM_WEIGHT);
            }
        }
        normalize(&mut v);
        v
    }
}

fn add_feature(v: &mut [f32], feature: &str, weight: f32) {
    let digest = Sha256::digest(feature.as_bytes());
    let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize;
    let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
    v[bucket % v.len()] += sign * weight;
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model(&self) -> &str {
        "feature-hash-384"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosine_similarity;

    #[test]
    fn vectors_are_unit_length() {
        let v = HashingEmbedder::new().embed_one("Fire NOC renewal for warehouse");
        assert_eq!(v.len(), EMBEDDING_DIM);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let v = HashingEmbedder::new().embed_one("  ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn related_texts_score_higher() {
        let e = HashingEmbedder::new();
        let query = e.embed_one("ISO certification audit");
        let related = e.embed_one("ISO 9001 certified quality audit checklist");
        let unrelated = e.embed_one("boiler pressure vessel inspection");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn embedding_is_deterministic_and_case_insensitive() {
        let e = HashingEmbedder::new();
        assert_eq!(e.embed_one("Pollution Consent"), e.embed_one("pollution consent"));
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let e = HashingEmbedder::new();
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let out = e.embed(&texts).await.unwrap();
        assert_eq!(out[0], e.embed_one("alpha"));
        assert_eq!(out[1], e.embed_one("beta"));
    }
}
