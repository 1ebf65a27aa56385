//! Vector embeddings for convergence, novelty, and drift scoring
//!
//! All distance computation in the engine is cosine similarity over
//! embeddings produced here. Repeated embedding of the same text must not
//! produce two network calls: [`CachedEmbeddings`] caches by content hash
//! in the state store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::store::StateStore;
use crate::types::EmbeddingError;

/// Generates vector embeddings for text.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Output vector dimension.
    fn dimension(&self) -> usize;
}

/// HTTP embedding client against an OpenAI-compatible `/embeddings`
/// endpoint.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl HttpEmbeddingClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EmbeddingError::Request(format!("HTTP client build failed: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            dimension: 1536,
        })
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post(&url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Request(format!(
                "embedding API error ({}): {}",
                status, text
            )));
        }

        let resp: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Malformed(e.to_string()))?;

        let data = resp
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| EmbeddingError::Malformed("no data array".into()))?;

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let vector: Vec<f32> = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| EmbeddingError::Malformed("no embedding field".into()))?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            vectors.push(vector);
        }
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::Malformed(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Caching wrapper: SHA-256 content hash → vector, persisted through the
/// state store's raw KV surface so restarts reuse prior embeddings too.
pub struct CachedEmbeddings {
    inner: Arc<dyn EmbeddingClient>,
    store: Arc<dyn StateStore>,
    ttl: Option<Duration>,
}

impl CachedEmbeddings {
    pub fn new(inner: Arc<dyn EmbeddingClient>, store: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            store,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn cache_key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("embedding:{}", hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl EmbeddingClient for CachedEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let key = self.cache_key(text);
            match self.store.get_raw(&key).await {
                Ok(Some(bytes)) => match serde_json::from_slice::<Vec<f32>>(&bytes) {
                    Ok(vector) => results[i] = Some(vector),
                    Err(_) => misses.push(i),
                },
                Ok(None) => misses.push(i),
                Err(e) => {
                    // Cache trouble is never fatal to scoring.
                    tracing::warn!("⚠ embedding cache read failed ({}); re-embedding", e);
                    misses.push(i);
                }
            }
        }

        if !misses.is_empty() {
            let miss_texts: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.inner.embed(&miss_texts).await?;
            for (&i, vector) in misses.iter().zip(vectors.into_iter()) {
                let key = self.cache_key(&texts[i]);
                if let Ok(bytes) = serde_json::to_vec(&vector) {
                    if let Err(e) = self.store.put_raw(&key, bytes, self.ttl).await {
                        tracing::warn!("⚠ embedding cache write failed: {}", e);
                    }
                }
                results[i] = Some(vector);
            }
        }

        Ok(results.into_iter().map(|v| v.unwrap_or_default()).collect())
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

/// Deterministic hash-based embedder used when no embedding credential is
/// configured. Convergence scoring degrades to lexical identity: repeated
/// text converges, novel text scores novel. Good enough to keep the
/// safety rails working; not a semantic signal.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new() -> Self {
        tracing::warn!(
            "⚠ no embedding credential configured; using hash-based mock embeddings — \
             convergence detection will be lexical, not semantic"
        );
        Self { dimension: 64 }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingClient for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut hasher = Sha256::new();
                hasher.update(text.to_lowercase().as_bytes());
                let digest = hasher.finalize();
                (0..self.dimension)
                    .map(|i| digest[i % digest.len()] as f32 / 255.0 - 0.5)
                    .collect()
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Cosine similarity in [-1, 1]; 0 for zero-length or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Mean pairwise cosine similarity across a set of vectors. 0 when fewer
/// than two vectors are given.
pub fn mean_pairwise_similarity(vectors: &[Vec<f32>]) -> f64 {
    if vectors.len() < 2 {
        return 0.0;
    }
    let mut sum = 0.0;
    let mut pairs = 0usize;
    for i in 0..vectors.len() {
        for j in (i + 1)..vectors.len() {
            sum += cosine_similarity(&vectors[i], &vectors[j]);
            pairs += 1;
        }
    }
    sum / pairs as f64
}

/// Highest cosine similarity between `target` and any of `others`.
pub fn max_similarity(target: &[f32], others: &[Vec<f32>]) -> f64 {
    others
        .iter()
        .map(|v| cosine_similarity(target, v))
        .fold(f64::MIN, f64::max)
        .max(-1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic embedder that counts real calls.
    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    impl CountingEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingClient for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut hasher = Sha256::new();
                    hasher.update(t.as_bytes());
                    hasher
                        .finalize()
                        .iter()
                        .take(8)
                        .map(|&b| b as f32 / 255.0)
                        .collect()
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            8
        }
    }

    #[tokio::test]
    async fn test_repeated_embedding_hits_cache() {
        let inner = Arc::new(CountingEmbedder::new());
        let store = Arc::new(MemoryStore::new());
        let cached = CachedEmbeddings::new(inner.clone(), store);

        let texts = vec!["the same text".to_string()];
        let first = cached.embed(&texts).await.unwrap();
        let second = cached.embed(&texts).await.unwrap();

        assert_eq!(first, second);
        // One network call, not two.
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_cache_only_embeds_misses() {
        let inner = Arc::new(CountingEmbedder::new());
        let store = Arc::new(MemoryStore::new());
        let cached = CachedEmbeddings::new(inner.clone(), store);

        cached.embed(&["a".to_string()]).await.unwrap();
        let out = cached
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        // Call 1 for "a", call 2 for the "b" miss only.
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_no_call() {
        let inner = Arc::new(CountingEmbedder::new());
        let store = Arc::new(MemoryStore::new());
        let cached = CachedEmbeddings::new(inner.clone(), store);
        let out = cached.embed(&[]).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cosine_identical_vectors() {
        let v = vec![0.5, 0.3, -0.2];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_opposed() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_mean_pairwise() {
        let vectors = vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![0.0, 1.0]];
        // Pairs: (1,1)=1, (1,3)=0, (2,3)=0 → mean 1/3
        let mean = mean_pairwise_similarity(&vectors);
        assert!((mean - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(mean_pairwise_similarity(&vectors[..1]), 0.0);
    }

    #[test]
    fn test_max_similarity() {
        let target = vec![1.0, 0.0];
        let others = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        assert!((max_similarity(&target, &others) - 1.0).abs() < 1e-6);
        assert_eq!(max_similarity(&target, &[]), -1.0);
    }
}
