//! ONNX Runtime sentence embeddings (all-MiniLM-L6-v2, mean pooled).
//!
//! The model directory must contain `model.onnx` and `tokenizer.json`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;
use tracing::info;

use compliance_shared::{ComplianceError, EMBEDDING_DIM, Embedder, Result};

use crate::normalize;

/// MiniLM was trained on 256-token inputs.
const MAX_TOKENS: usize = 256;

/// Local embedder. Inference runs on the blocking pool.
pub struct OnnxEmbedder {
    inner: Arc<Inner>,
    model: String,
}

struct Inner {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

fn onnx_err(e: impl std::fmt::Display) -> ComplianceError {
    ComplianceError::Dependency(format!("onnx embedding: {e}"))
}

impl OnnxEmbedder {
    pub fn load(model_dir: &Path) -> Result<Self> {
        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        for required in [&model_path, &tokenizer_path] {
            if !required.exists() {
                return Err(ComplianceError::config(format!(
                    "embedding model file not found: {}",
                    required.display()
                )));
            }
        }

        let session = Session::builder()
            .map_err(onnx_err)?
            .commit_from_file(&model_path)
            .map_err(onnx_err)?;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(onnx_err)?;
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_TOKENS,
                ..Default::default()
            }))
            .map_err(onnx_err)?;
        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            ..Default::default()
        }));

        let model = model_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".into());

        info!(model = %model_path.display(), "loaded embedding model");
        Ok(Self {
            inner: Arc::new(Inner {
                session: Mutex::new(session),
                tokenizer,
            }),
            model,
        })
    }
}

#[async_trait]
impl Embedder for OnnxEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let inner = Arc::clone(&self.inner);
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || inner.embed_batch(texts))
            .await
            .map_err(onnx_err)?
    }
}

impl Inner {
    fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let batch_size = texts.len();

        let encodings = self.tokenizer.encode_batch(texts, true).map_err(onnx_err)?;
        let seq_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0);

        let mut input_ids = vec![0i64; batch_size * seq_len];
        let mut attention_mask = vec![0i64; batch_size * seq_len];
        let mut token_type_ids = vec![0i64; batch_size * seq_len];

        for (i, encoding) in encodings.iter().enumerate() {
            let offset = i * seq_len;
            for (j, &id) in encoding.get_ids().iter().enumerate() {
                input_ids[offset + j] = id as i64;
            }
            for (j, &mask) in encoding.get_attention_mask().iter().enumerate() {
                attention_mask[offset + j] = mask as i64;
            }
            for (j, &tid) in encoding.get_type_ids().iter().enumerate() {
                token_type_ids[offset + j] = tid as i64;
            }
        }

        let shape = [batch_size as i64, seq_len as i64];
        let ids_tensor =
            Tensor::from_array((shape, input_ids.into_boxed_slice())).map_err(onnx_err)?;
        let mask_tensor = Tensor::from_array((shape, attention_mask.clone().into_boxed_slice()))
            .map_err(onnx_err)?;
        let type_tensor =
            Tensor::from_array((shape, token_type_ids.into_boxed_slice())).map_err(onnx_err)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| onnx_err("session lock poisoned"))?;
        let outputs = session
            .run(ort::inputs![
                "input_ids" => ids_tensor,
                "attention_mask" => mask_tensor,
                "token_type_ids" => type_tensor,
            ])
            .map_err(onnx_err)?;

        // [batch_size, seq_len, dim]
        let (output_shape, output_data) =
            outputs[0].try_extract_tensor::<f32>().map_err(onnx_err)?;
        let dims: &[i64] = output_shape;
        if dims.len() != 3 || dims[0] as usize != batch_size || dims[2] as usize != EMBEDDING_DIM
        {
            return Err(onnx_err(format!(
                "unexpected output shape {dims:?}, expected [{batch_size}, {seq_len}, {EMBEDDING_DIM}]"
            )));
        }
        let actual_seq_len = dims[1] as usize;

        let mut embeddings = Vec::with_capacity(batch_size);
        for i in 0..batch_size {
            let mut pooled = vec![0.0f32; EMBEDDING_DIM];
            let mut token_count = 0.0f32;

            for j in 0..actual_seq_len.min(seq_len) {
                let mask_val = attention_mask[i * seq_len + j] as f32;
                if mask_val > 0.0 {
                    let offset = (i * actual_seq_len + j) * EMBEDDING_DIM;
                    for (d, p) in pooled.iter_mut().enumerate() {
                        *p += output_data[offset + d] * mask_val;
                    }
                    token_count += mask_val;
                }
            }

            if token_count > 0.0 {
                for p in &mut pooled {
                    *p /= token_count;
                }
            }
            normalize(&mut pooled);
            embeddings.push(pooled);
        }

        Ok(embeddings)
    }
}
