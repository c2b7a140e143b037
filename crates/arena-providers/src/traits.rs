use arena_domain::capability::LlmCapabilities;
use arena_domain::model::CostSummary;
use arena_domain::stream::Usage;
use arena_domain::stream::{BoxStream, StreamEvent};
use arena_domain::tool::{Message, ToolCall, ToolDefinition};
use arena_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature (0.0 – 2.0). `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
    /// When `true`, request the model to respond with valid JSON only.
    pub json_mode: bool,
    /// Model identifier override. When `None`, the provider uses its default.
    pub model: Option<String>,
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Textual content of the response.
    pub content: String,
    /// Tool calls emitted by the model.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage information.
    pub usage: Option<Usage>,
    /// The model that actually produced the response.
    pub model: String,
    /// The reason the model stopped generating (e.g. "stop", "tool_calls").
    pub finish_reason: Option<String>,
}

/// A request for text embeddings (used by the relevance truncation
/// strategy, §4.6.1, and by embedding-backed validators).
#[derive(Debug, Clone)]
pub struct EmbeddingsRequest {
    pub input: Vec<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingsResponse {
    pub embeddings: Vec<Vec<f32>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait (spec §6 "Provider capability interface")
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every adapter (OpenAI-compat, Anthropic, Google, mock) translates
/// between these neutral types and its own wire format.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// `Complete(request) -> response` — unary, cost-annotated via `usage`.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse>;

    /// `Stream(request) -> sequence of chunks terminating in a final with usage`.
    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// Generate text embeddings (for relevance truncation / embedding-backed validators).
    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse>;

    fn supports_streaming(&self) -> bool {
        self.capabilities().supports_streaming
    }
    fn supports_tools(&self) -> bool {
        !matches!(
            self.capabilities().supports_tools,
            arena_domain::capability::ToolSupport::None
        )
    }
    fn supports_duplex(&self) -> bool {
        self.capabilities().supports_duplex
    }

    /// `CalculateCost(input_tokens, output_tokens, cached_tokens) -> cost`.
    fn calculate_cost(&self, usage: &Usage) -> CostSummary;

    fn capabilities(&self) -> &LlmCapabilities;

    fn provider_id(&self) -> &str;
}
