//! Relevance-based truncation (spec §4.6.1).
//!
//! Scores each droppable message by cosine similarity against the most
//! recent user turn and drops the lowest-scoring messages first, skipping
//! messages at or above `similarity_threshold` unless there is no
//! alternative. Embeddings are cached by content hash, grounded in the
//! teacher's classifier cache shape (cache-by-content-hash with a bounded
//! entry count) generalized from prompt-complexity classification to
//! message-relevance scoring.

use crate::truncation::{estimate_message_tokens, estimate_tokens};
use arena_domain::tool::{Message, Role};
use arena_domain::Result;
use arena_providers::{EmbeddingsRequest, LlmProvider};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Caps unbounded growth across a long-running engine process; eviction is
/// oldest-inserted-first once the cap is hit.
const CACHE_MAX_ENTRIES: usize = 10_000;

pub struct EmbeddingCache {
    entries: Mutex<HashMap<String, Vec<f32>>>,
    order: Mutex<Vec<String>>,
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
        }
    }

    fn get(&self, key: &str) -> Option<Vec<f32>> {
        self.entries.lock().get(key).cloned()
    }

    fn insert(&self, key: String, value: Vec<f32>) {
        let mut entries = self.entries.lock();
        let mut order = self.order.lock();
        if !entries.contains_key(&key) {
            order.push(key.clone());
            if order.len() > CACHE_MAX_ENTRIES {
                let oldest = order.remove(0);
                entries.remove(&oldest);
            }
        }
        entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

async fn embed_cached(
    cache: &EmbeddingCache,
    provider: &dyn LlmProvider,
    text: &str,
) -> Result<Vec<f32>> {
    let key = content_hash(text);
    if let Some(v) = cache.get(&key) {
        return Ok(v);
    }
    let resp = provider
        .embeddings(EmbeddingsRequest { input: vec![text.to_string()], model: None })
        .await?;
    let embedding = resp.embeddings.into_iter().next().unwrap_or_default();
    cache.insert(key, embedding.clone());
    Ok(embedding)
}

/// Apply relevance-based truncation. `provider` supplies embeddings;
/// `min_recent` non-system messages and all system messages are always
/// kept regardless of score.
pub async fn truncate_relevance(
    cache: &EmbeddingCache,
    provider: &dyn LlmProvider,
    messages: &[Message],
    token_budget: u32,
    min_recent: usize,
    similarity_threshold: f32,
) -> Result<Vec<Message>> {
    let last_user_text = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.extract_all_text())
        .unwrap_or_default();

    if last_user_text.is_empty() {
        return Ok(messages.to_vec());
    }

    let non_system: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role != Role::System)
        .map(|(i, _)| i)
        .collect();
    let protected_tail_start = non_system.len().saturating_sub(min_recent);
    let protected_tail: std::collections::HashSet<usize> =
        non_system[protected_tail_start..].iter().copied().collect();

    let mut droppable: Vec<usize> = Vec::new();
    for (i, msg) in messages.iter().enumerate() {
        if msg.role != Role::System && !protected_tail.contains(&i) {
            droppable.push(i);
        }
    }

    let query_embedding = embed_cached(cache, provider, &last_user_text).await?;

    let mut scored: Vec<(usize, f32)> = Vec::with_capacity(droppable.len());
    for &idx in &droppable {
        let text = messages[idx].content.extract_all_text();
        let embedding = embed_cached(cache, provider, &text).await?;
        scored.push((idx, cosine_similarity(&query_embedding, &embedding)));
    }
    // Lowest relevance first.
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut dropped: std::collections::HashSet<usize> = std::collections::HashSet::new();
    let kept_tokens = |dropped: &std::collections::HashSet<usize>| -> u32 {
        messages
            .iter()
            .enumerate()
            .filter(|(i, _)| !dropped.contains(i))
            .map(|(_, m)| estimate_message_tokens(m))
            .sum()
    };

    // First pass: drop only below-threshold candidates, lowest score first.
    for &(idx, score) in scored.iter() {
        if kept_tokens(&dropped) <= token_budget {
            break;
        }
        if score < similarity_threshold {
            dropped.insert(idx);
        }
    }
    // Second pass: if still over budget, there's no alternative left —
    // drop from the remaining candidates regardless of score.
    if kept_tokens(&dropped) > token_budget {
        for &(idx, _) in scored.iter() {
            if kept_tokens(&dropped) <= token_budget {
                break;
            }
            dropped.insert(idx);
        }
    }

    let _ = estimate_tokens;
    Ok(messages
        .iter()
        .enumerate()
        .filter(|(i, _)| !dropped.contains(i))
        .map(|(_, m)| m.clone())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let a = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_zero_vector_is_zero_not_nan() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn content_hash_is_deterministic() {
        assert_eq!(content_hash("hello"), content_hash("hello"));
        assert_ne!(content_hash("hello"), content_hash("world"));
    }

    #[test]
    fn cache_evicts_oldest_past_capacity() {
        let cache = EmbeddingCache::new();
        cache.insert("a".into(), vec![1.0]);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("a").is_some());
    }

    #[tokio::test]
    async fn relevance_truncation_keeps_system_and_recent() {
        use arena_domain::model::{ProviderSpec, ProviderType};

        let provider = arena_providers::mock::MockProvider::from_spec(&ProviderSpec {
            id: "m".into(),
            kind: ProviderType::Mock,
            model: "mock".into(),
            base_url: None,
            credential_env: None,
            default_params: Default::default(),
            pricing: Default::default(),
            supports_streaming: true,
            tool_dialect: None,
            mock: None,
        });
        let cache = EmbeddingCache::new();
        let messages = vec![
            Message::system("be helpful"),
            Message::user("unrelated filler text padded out"),
            Message::assistant("more unrelated filler text"),
            Message::user("final question"),
        ];
        let out = truncate_relevance(&cache, &provider, &messages, 1, 1, 0.3).await.unwrap();
        assert!(out.iter().any(|m| m.role == Role::System));
        assert_eq!(out.last().unwrap().content.extract_all_text(), "final question");
    }
}
