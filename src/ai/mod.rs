//! AI provider ports and their in-process doubles.
//!
//! The pipeline only ever talks to these traits; concrete HTTP providers are
//! wired in by the host. The scripted implementations drive tests and dry
//! runs without a network.

pub mod budget;
pub mod cost;
pub mod ledger;
pub mod prompts;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{EmbeddingError, LlmError};

/// Largest batch an embedding provider accepts in one call.
pub const MAX_EMBED_BATCH: usize = 2048;

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub raw_output: String,
    /// Parsed structured output, when the provider could parse it.
    pub parsed: Option<Value>,
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub latency_ms: i64,
    pub cost_micros: i64,
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn extract_from_text(&self, system: &str, user: &str) -> Result<LlmResponse, LlmError>;

    async fn extract_from_images(
        &self,
        system: &str,
        user: &str,
        page_images: &[Vec<u8>],
    ) -> Result<LlmResponse, LlmError>;

    /// One-shot repair of invalid structured output.
    async fn repair_structured_output(
        &self,
        system: &str,
        user: &str,
    ) -> Result<LlmResponse, LlmError>;
}

#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub vector: Vec<f32>,
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub latency_ms: i64,
    pub cost_micros: i64,
}

#[async_trait]
pub trait EmbeddingPort: Send + Sync {
    async fn embed_text(&self, model: &str, text: &str) -> Result<EmbeddingResponse, EmbeddingError>;

    async fn embed_batch(
        &self,
        model: &str,
        texts: &[String],
    ) -> Result<Vec<EmbeddingResponse>, EmbeddingError>;
}

/// Scripted LLM double: pops queued responses in order and counts calls.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_ok(&self, response: LlmResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    pub fn push_err(&self, err: LlmError) {
        self.responses.lock().push_back(Err(err));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::ServiceUnavailable("no scripted response".into())))
    }
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a scripted response around a JSON payload.
pub fn scripted_json_response(payload: Value) -> LlmResponse {
    LlmResponse {
        raw_output: payload.to_string(),
        parsed: Some(payload),
        provider: "scripted".into(),
        model: "scripted-v1".into(),
        input_tokens: 1000,
        output_tokens: 400,
        latency_ms: 10,
        cost_micros: 450,
        warnings: Vec::new(),
    }
}

#[async_trait]
impl LlmPort for ScriptedLlm {
    async fn extract_from_text(&self, _system: &str, _user: &str) -> Result<LlmResponse, LlmError> {
        self.next()
    }

    async fn extract_from_images(
        &self,
        _system: &str,
        _user: &str,
        _page_images: &[Vec<u8>],
    ) -> Result<LlmResponse, LlmError> {
        self.next()
    }

    async fn repair_structured_output(
        &self,
        _system: &str,
        _user: &str,
    ) -> Result<LlmResponse, LlmError> {
        self.next()
    }
}

/// Deterministic embedding double: hashes the text into a small stable
/// vector, so identical texts embed identically.
pub struct ScriptedEmbedder {
    pub dimensions: usize,
    calls: AtomicUsize,
}

impl ScriptedEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(text.as_bytes());
        (0..self.dimensions)
            .map(|i| {
                let byte = digest[i % digest.len()];
                (byte as f32 / 127.5) - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingPort for ScriptedEmbedder {
    async fn embed_text(&self, model: &str, text: &str) -> Result<EmbeddingResponse, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("empty input".into()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(EmbeddingResponse {
            vector: self.vector_for(text),
            provider: "scripted".into(),
            model: model.to_string(),
            input_tokens: (text.len() / 4) as i64,
            latency_ms: 1,
            cost_micros: 2,
        })
    }

    async fn embed_batch(
        &self,
        model: &str,
        texts: &[String],
    ) -> Result<Vec<EmbeddingResponse>, EmbeddingError> {
        if texts.is_empty() {
            return Err(EmbeddingError::InvalidInput("empty batch".into()));
        }
        if texts.len() > MAX_EMBED_BATCH {
            return Err(EmbeddingError::InvalidInput(format!(
                "batch of {} exceeds provider limit {}",
                texts.len(),
                MAX_EMBED_BATCH
            )));
        }
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed_text(model, text).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_llm_pops_in_order() {
        let llm = ScriptedLlm::new();
        llm.push_ok(scripted_json_response(serde_json::json!({"a": 1})));
        llm.push_err(LlmError::Timeout(30));

        let first = llm.extract_from_text("s", "u").await.unwrap();
        assert!(first.parsed.is_some());
        assert!(llm.extract_from_text("s", "u").await.is_err());
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn embedder_is_deterministic_and_rejects_empty() {
        let embedder = ScriptedEmbedder::new(16);
        let a = embedder.embed_text("m", "Kabel NYM-J").await.unwrap();
        let b = embedder.embed_text("m", "Kabel NYM-J").await.unwrap();
        assert_eq!(a.vector, b.vector);
        assert!(embedder.embed_text("m", "  ").await.is_err());
    }

    #[tokio::test]
    async fn embed_batch_enforces_provider_limit() {
        let embedder = ScriptedEmbedder::new(4);
        let batch: Vec<String> = (0..MAX_EMBED_BATCH + 1).map(|i| format!("t{i}")).collect();
        assert!(embedder.embed_batch("m", &batch).await.is_err());
        assert!(embedder.embed_batch("m", &[]).await.is_err());
    }
}
