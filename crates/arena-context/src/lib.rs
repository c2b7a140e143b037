//! ContextPolicy middleware (spec §4.6 step 3, §4.6.1): enforces a
//! per-request token budget over the message log by truncating either the
//! oldest non-system messages or the least-relevant ones.

pub mod relevance;
pub mod truncation;

use arena_domain::model::{ContextPolicySpec, TruncationStrategy};
use arena_domain::tool::Message;
use arena_domain::Result;
use arena_providers::LlmProvider;
use relevance::EmbeddingCache;

pub use truncation::{estimate_tokens, projected_tokens};

/// Holds the embedding cache across calls within a single engine process;
/// one instance is shared by every run's ContextPolicy middleware
/// invocation so relevance scores for repeated content are not
/// recomputed.
#[derive(Default)]
pub struct ContextPolicyEngine {
    cache: EmbeddingCache,
}

impl ContextPolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Enforce `policy.token_budget` over `messages`, returning the
    /// (possibly truncated) log. No-ops when already within budget.
    ///
    /// `relevance` requires an embedding-capable provider; callers resolve
    /// `policy.embedding_provider` (falling back to the run's own
    /// provider) before calling this.
    pub async fn apply(
        &self,
        messages: &[Message],
        policy: &ContextPolicySpec,
        embedding_provider: Option<&dyn LlmProvider>,
    ) -> Result<Vec<Message>> {
        if truncation::projected_tokens(messages) <= policy.token_budget {
            return Ok(messages.to_vec());
        }

        match policy.strategy {
            TruncationStrategy::TruncateOldest => Ok(truncation::truncate_oldest(
                messages,
                policy.token_budget,
                policy.min_recent_messages,
            )),
            TruncationStrategy::Relevance => match embedding_provider {
                Some(provider) => {
                    relevance::truncate_relevance(
                        &self.cache,
                        provider,
                        messages,
                        policy.token_budget,
                        policy.min_recent_messages,
                        policy.similarity_threshold,
                    )
                    .await
                }
                // No embedding provider configured: fall back to the
                // cheaper, synchronous strategy rather than failing the
                // turn over a missing optional dependency.
                None => Ok(truncation::truncate_oldest(
                    messages,
                    policy.token_budget,
                    policy.min_recent_messages,
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_domain::model::{ContextPolicySpec, TruncationStrategy};

    fn policy(budget: u32) -> ContextPolicySpec {
        ContextPolicySpec {
            token_budget: budget,
            strategy: TruncationStrategy::TruncateOldest,
            min_recent_messages: 1,
            similarity_threshold: 0.3,
            embedding_provider: None,
        }
    }

    #[tokio::test]
    async fn no_op_when_within_budget() {
        let engine = ContextPolicyEngine::new();
        let messages = vec![Message::user("hi")];
        let out = engine.apply(&messages, &policy(1_000), None).await.unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn truncates_when_over_budget() {
        let engine = ContextPolicyEngine::new();
        let messages = vec![
            Message::user(&"a".repeat(400)),
            Message::user(&"b".repeat(400)),
            Message::user("recent"),
        ];
        let out = engine.apply(&messages, &policy(1), None).await.unwrap();
        assert!(out.len() < messages.len());
    }

    #[tokio::test]
    async fn relevance_without_provider_falls_back_to_truncate_oldest() {
        let engine = ContextPolicyEngine::new();
        let mut p = policy(1);
        p.strategy = TruncationStrategy::Relevance;
        let messages = vec![Message::user(&"x".repeat(400)), Message::user("recent")];
        let out = engine.apply(&messages, &p, None).await.unwrap();
        assert_eq!(out.last().unwrap().content.extract_all_text(), "recent");
    }
}
