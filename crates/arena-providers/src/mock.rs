//! Deterministic mock provider.
//!
//! Used when a `ProviderSpec.type == "mock"` or the global `ARENA_MOCK=1`
//! override is set (spec §6). Echoes the last user message back with a
//! fixed prefix so scenario assertions can be written against a known,
//! reproducible output without hitting a real API.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::traits::{
    ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider,
};
use arena_domain::capability::{LlmCapabilities, ToolSupport};
use arena_domain::model::{CostSummary, MockFailureKind, MockScriptSpec, ProviderSpec};
use arena_domain::stream::{BoxStream, StreamEvent, Usage};
use arena_domain::ArenaError;
use arena_domain::Result;
use arena_domain::tool::Role;

pub struct MockProvider {
    id: String,
    default_model: String,
    capabilities: LlmCapabilities,
    script: MockScriptSpec,
    calls: AtomicU32,
}

impl MockProvider {
    pub fn from_spec(spec: &ProviderSpec) -> Self {
        Self {
            id: spec.id.clone(),
            default_model: spec.model.clone(),
            capabilities: LlmCapabilities {
                supports_tools: ToolSupport::Basic,
                supports_streaming: true,
                supports_json_mode: true,
                supports_vision: false,
                supports_duplex: true,
                context_window_tokens: Some(128_000),
                max_output_tokens: Some(4_096),
            },
            script: spec.mock.clone().unwrap_or_default(),
            calls: AtomicU32::new(0),
        }
    }

    /// Returns `Err` while the scripted failure budget (`fail_times`)
    /// hasn't been exhausted yet; otherwise bumps the call counter and
    /// clears the way for a canned/echoed response. Each call counts
    /// regardless of outcome, so `fail_times = 2` fails exactly the first
    /// two calls and succeeds from the third attempt on (spec §8
    /// scenario 3: "fail with a transient error twice then succeed").
    fn maybe_fail(&self) -> Result<()> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        let call_number = attempt + 1;
        let should_fail = call_number <= self.script.fail_times
            || self.script.fail_after.is_some_and(|n| call_number >= n);
        if should_fail {
            return Err(match self.script.fail_kind {
                MockFailureKind::Transient => ArenaError::ProviderTransient {
                    provider: self.id.clone(),
                    message: format!("scripted transient failure (attempt {})", attempt + 1),
                },
                MockFailureKind::SessionInterrupted => ArenaError::SessionInterrupted(format!(
                    "scripted session interruption (attempt {})",
                    attempt + 1
                )),
            });
        }
        Ok(())
    }

    fn reply_text(&self, req: &ChatRequest) -> String {
        if !self.script.responses.is_empty() {
            let idx = (self.calls.load(Ordering::SeqCst) as usize).saturating_sub(1) % self.script.responses.len();
            return self.script.responses[idx].clone();
        }
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.extract_all_text())
            .unwrap_or_default();
        format!("mock reply to: {last_user}")
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.maybe_fail()?;
        let content = self.reply_text(&req);
        let usage = Usage {
            prompt_tokens: content.len() as u32,
            completion_tokens: content.len() as u32,
            cached_tokens: 0,
            total_tokens: content.len() as u32 * 2,
        };
        Ok(ChatResponse {
            content,
            tool_calls: Vec::new(),
            usage: Some(usage),
            model: req.model.unwrap_or_else(|| self.default_model.clone()),
            finish_reason: Some("stop".into()),
        })
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.maybe_fail()?;
        let content = self.reply_text(&req);
        let usage = Usage {
            prompt_tokens: content.len() as u32,
            completion_tokens: content.len() as u32,
            cached_tokens: 0,
            total_tokens: content.len() as u32 * 2,
        };
        let stream = async_stream::stream! {
            for word in content.split_whitespace() {
                yield Ok(StreamEvent::Token { text: format!("{word} ") });
            }
            yield Ok(StreamEvent::Done {
                usage: Some(usage),
                finish_reason: Some("stop".into()),
            });
        };
        Ok(Box::pin(stream))
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        // Deterministic low-dimensional embedding derived from byte length
        // and char sum — good enough for testing relevance truncation
        // without a real embedding model.
        let embeddings = req
            .input
            .iter()
            .map(|text| {
                let len = text.len() as f32;
                let sum: u32 = text.bytes().map(|b| b as u32).sum();
                vec![len, sum as f32, (len * 2.0).sin()]
            })
            .collect();
        Ok(EmbeddingsResponse { embeddings })
    }

    fn calculate_cost(&self, _usage: &Usage) -> CostSummary {
        CostSummary::default()
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_domain::model::ProviderType;
    use arena_domain::tool::Message;

    fn spec() -> ProviderSpec {
        ProviderSpec {
            id: "mock-1".into(),
            kind: ProviderType::Mock,
            model: "mock-model".into(),
            base_url: None,
            credential_env: None,
            default_params: Default::default(),
            pricing: Default::default(),
            supports_streaming: true,
            tool_dialect: None,
            mock: None,
        }
    }

    #[tokio::test]
    async fn echoes_last_user_message() {
        let provider = MockProvider::from_spec(&spec());
        let req = ChatRequest {
            messages: vec![Message::user("hello there")],
            ..Default::default()
        };
        let resp = provider.chat(req).await.unwrap();
        assert!(resp.content.contains("hello there"));
    }

    #[tokio::test]
    async fn streaming_ends_with_done() {
        let provider = MockProvider::from_spec(&spec());
        let req = ChatRequest {
            messages: vec![Message::user("a b c")],
            ..Default::default()
        };
        let mut stream = provider.chat_stream(req).await.unwrap();
        use futures_util::StreamExt;
        let mut saw_done = false;
        while let Some(event) = stream.next().await {
            if matches!(event, Ok(StreamEvent::Done { .. })) {
                saw_done = true;
            }
        }
        assert!(saw_done);
    }

    #[tokio::test]
    async fn scripted_transient_failures_then_succeeds() {
        let mut s = spec();
        s.mock = Some(arena_domain::model::MockScriptSpec {
            fail_times: 2,
            fail_after: None,
            fail_kind: arena_domain::model::MockFailureKind::Transient,
            responses: Vec::new(),
        });
        let provider = MockProvider::from_spec(&s);
        let req = || ChatRequest {
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        assert!(matches!(
            provider.chat(req()).await,
            Err(ArenaError::ProviderTransient { .. })
        ));
        assert!(matches!(
            provider.chat(req()).await,
            Err(ArenaError::ProviderTransient { .. })
        ));
        assert!(provider.chat(req()).await.is_ok());
    }

    #[tokio::test]
    async fn scripted_session_interruption_kind_is_distinct() {
        let mut s = spec();
        s.mock = Some(arena_domain::model::MockScriptSpec {
            fail_times: 1,
            fail_after: None,
            fail_kind: arena_domain::model::MockFailureKind::SessionInterrupted,
            responses: Vec::new(),
        });
        let provider = MockProvider::from_spec(&s);
        let req = ChatRequest {
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        assert!(matches!(
            provider.chat(req).await,
            Err(ArenaError::SessionInterrupted(_))
        ));
    }

    #[tokio::test]
    async fn embeddings_are_deterministic() {
        let provider = MockProvider::from_spec(&spec());
        let req = EmbeddingsRequest {
            input: vec!["same text".into()],
            model: None,
        };
        let r1 = provider.embeddings(req.clone()).await.unwrap();
        let r2 = provider.embeddings(req).await.unwrap();
        assert_eq!(r1.embeddings, r2.embeddings);
    }
}
