//! Anthropic-native adapter.
//!
//! Implements the Anthropic Messages API including tool use and streaming.
//! Anthropic's wire format splits the system prompt into a top-level
//! `system` field rather than a `system`-role message, and expresses tool
//! results as `tool_result` content blocks on a `user`-role message rather
//! than a dedicated `tool` role.

use crate::traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};
use crate::util::{classify_http_error, from_reqwest, resolve_api_key};
use arena_domain::capability::LlmCapabilities;
use arena_domain::model::{CostSummary, Pricing, ProviderSpec};
use arena_domain::stream::{BoxStream, StreamEvent, Usage};
use arena_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
use arena_domain::{ArenaError, Result};
use serde_json::Value;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
    pricing: Pricing,
}

impl AnthropicProvider {
    pub fn from_spec(spec: &ProviderSpec) -> Result<Self> {
        let api_key = resolve_api_key(&spec.id, &spec.credential_env)?;
        let base_url = spec
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.anthropic.com/v1".into());

        let capabilities = LlmCapabilities {
            supports_tools: arena_domain::capability::ToolSupport::StrictJson,
            supports_streaming: spec.supports_streaming,
            supports_json_mode: false,
            supports_vision: true,
            supports_duplex: false,
            context_window_tokens: Some(200_000),
            max_output_tokens: Some(8_192),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: spec.id.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: spec.model.clone(),
            capabilities,
            client,
            pricing: spec.pricing,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
    }

    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let system = req
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.extract_all_text())
            .collect::<Vec<_>>()
            .join("\n\n");

        let messages: Vec<Value> = coalesce_anthropic_messages(
            req.messages.iter().filter(|m| m.role != Role::System),
        );

        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": messages,
            "max_tokens": req.max_tokens.unwrap_or(4096),
            "stream": stream,
        });
        if !system.is_empty() {
            body["system"] = serde_json::json!(system);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        body
    }
}

// ── Message serialization ───────────────────────────────────────────

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

/// Anthropic requires alternating `user`/`assistant` turns; a tool-result
/// message (our `Role::Tool`) is folded into the *next* user turn as a
/// `tool_result` content block rather than sent as its own turn.
fn coalesce_anthropic_messages<'a>(msgs: impl Iterator<Item = &'a Message>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for msg in msgs {
        match msg.role {
            Role::Tool => {
                let blocks = tool_result_blocks(msg);
                if let Some(last) = out.last_mut() {
                    if last.get("role").and_then(|r| r.as_str()) == Some("user") {
                        if let Some(content) = last.get_mut("content").and_then(|c| c.as_array_mut()) {
                            content.extend(blocks);
                            continue;
                        }
                    }
                }
                out.push(serde_json::json!({"role": "user", "content": blocks}));
            }
            Role::Assistant => out.push(assistant_to_anthropic(msg)),
            _ => out.push(serde_json::json!({
                "role": "user",
                "content": content_to_anthropic_blocks(&msg.content),
            })),
        }
    }
    out
}

/// Renders a system/user message's content blocks, including media parts
/// (`image`/`audio`/`video`) as Anthropic `source`-typed blocks — mirrors
/// `google.rs`'s `content_to_gemini_parts` so every adapter actually sends
/// the non-text parts its capability flags claim to support.
fn content_to_anthropic_blocks(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(t) => vec![serde_json::json!({"type": "text", "text": t})],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(serde_json::json!({"type": "text", "text": text})),
                ContentPart::Image { url, media_type } => Some(serde_json::json!({
                    "type": "image",
                    "source": {"type": "url", "url": url, "media_type": media_type},
                })),
                ContentPart::Audio { url, media_type } => Some(serde_json::json!({
                    "type": "audio",
                    "source": {"type": "url", "url": url, "media_type": media_type},
                })),
                ContentPart::Video { url, media_type } => Some(serde_json::json!({
                    "type": "video",
                    "source": {"type": "url", "url": url, "media_type": media_type},
                })),
                _ => None,
            })
            .collect(),
    }
}

fn tool_result_blocks(msg: &Message) -> Vec<Value> {
    match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult { tool_use_id, content, is_error } => Some(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                    "is_error": is_error,
                })),
                _ => None,
            })
            .collect(),
        MessageContent::Text(t) => vec![serde_json::json!({"type": "tool_result", "tool_use_id": "", "content": t})],
    }
}

fn assistant_to_anthropic(msg: &Message) -> Value {
    let mut blocks: Vec<Value> = Vec::new();
    match &msg.content {
        MessageContent::Text(t) => {
            if !t.is_empty() {
                blocks.push(serde_json::json!({"type": "text", "text": t}));
            }
        }
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => blocks.push(serde_json::json!({"type": "text", "text": text})),
                    ContentPart::ToolUse { id, name, input } => blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": input,
                    })),
                    _ => {}
                }
            }
        }
    }
    serde_json::json!({"role": "assistant", "content": blocks})
}

fn parse_chat_response(provider_id: &str, body: &Value) -> Result<ChatResponse> {
    let content_blocks = body
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| ArenaError::ProviderPermanent {
            provider: provider_id.to_string(),
            message: "no content array in response".into(),
        })?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in content_blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                let call_id = block.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let tool_name = block.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let arguments = block.get("input").cloned().unwrap_or(Value::Null);
                tool_calls.push(ToolCall { call_id, tool_name, arguments });
            }
            _ => {}
        }
    }

    let finish_reason = body.get("stop_reason").and_then(|v| v.as_str()).map(String::from);
    let model = body.get("model").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
    let usage = body.get("usage").and_then(parse_anthropic_usage);

    Ok(ChatResponse { content: text, tool_calls, usage, model, finish_reason })
}

fn parse_anthropic_usage(v: &Value) -> Option<Usage> {
    let input_tokens = v.get("input_tokens")?.as_u64()? as u32;
    let output_tokens = v.get("output_tokens")?.as_u64()? as u32;
    let cached_tokens = v.get("cache_read_input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    Some(Usage {
        prompt_tokens: input_tokens,
        completion_tokens: output_tokens,
        cached_tokens,
        total_tokens: input_tokens + output_tokens,
    })
}

// ── Streaming ────────────────────────────────────────────────────────

/// Anthropic streams tool-call arguments incrementally across
/// `content_block_start`/`content_block_delta` events; accumulate state
/// across the SSE parser's closure calls to pair the final delta with a
/// call-id and name.
#[derive(Default)]
struct StreamState {
    current_tool: Option<(String, String)>, // (call_id, tool_name)
}

fn parse_sse_event(state: &mut StreamState, data: &str) -> Vec<Result<StreamEvent>> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(e.into())],
    };
    match v.get("type").and_then(|t| t.as_str()) {
        Some("content_block_start") => {
            if let Some(block) = v.get("content_block") {
                if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                    let call_id = block.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let name = block.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    state.current_tool = Some((call_id.clone(), name.clone()));
                    return vec![Ok(StreamEvent::ToolCallStarted { call_id, tool_name: name })];
                }
            }
            Vec::new()
        }
        Some("content_block_delta") => {
            if let Some(delta) = v.get("delta") {
                if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                    return vec![Ok(StreamEvent::Token { text: text.to_string() })];
                }
                if let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) {
                    if let Some((call_id, _)) = &state.current_tool {
                        return vec![Ok(StreamEvent::ToolCallDelta {
                            call_id: call_id.clone(),
                            delta: partial.to_string(),
                        })];
                    }
                }
            }
            Vec::new()
        }
        Some("content_block_stop") => {
            state.current_tool = None;
            Vec::new()
        }
        Some("message_delta") => {
            let finish_reason = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str())
                .map(String::from);
            let usage = v.get("usage").and_then(parse_anthropic_usage);
            if finish_reason.is_some() {
                vec![Ok(StreamEvent::Done { usage, finish_reason })]
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/messages", self.base_url);
        let body = self.build_chat_body(&req, false);

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;
        if !status.is_success() {
            return Err(classify_http_error(&self.id, status.as_u16(), &resp_text));
        }
        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_chat_response(&self.id, &resp_json)
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/messages", self.base_url);
        let body = self.build_chat_body(&req, true);
        let provider_id = self.id.clone();

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(classify_http_error(&provider_id, status.as_u16(), &err_text));
        }

        let mut state = StreamState::default();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_sse_event(&mut state, data)
        }))
    }

    async fn embeddings(&self, _req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        Err(ArenaError::ProviderPermanent {
            provider: self.id.clone(),
            message: "Anthropic does not expose an embeddings endpoint".into(),
        })
    }

    fn calculate_cost(&self, usage: &Usage) -> CostSummary {
        self.pricing.cost(usage.prompt_tokens, usage.completion_tokens, usage.cached_tokens)
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

    #[test]
    fn parses_text_and_tool_use_blocks() {
        let body = serde_json::json!({
            "model": "claude-3",
            "stop_reason": "tool_use",
            "content": [
                {"type": "text", "text": "let me check"},
                {"type": "tool_use", "id": "call_1", "name": "search", "input": {"q": "x"}},
            ],
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let resp = parse_chat_response("p", &body).unwrap();
        assert_eq!(resp.content, "let me check");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].tool_name, "search");
    }

    #[test]
    fn cached_tokens_read_from_cache_read_field() {
        let v = serde_json::json!({"input_tokens": 100, "output_tokens": 20, "cache_read_input_tokens": 40});
        let usage = parse_anthropic_usage(&v).unwrap();
        assert_eq!(usage.cached_tokens, 40);
    }

    #[test]
    fn tool_result_folds_into_preceding_user_turn() {
        let msgs = vec![
            Message::assistant("checking"),
            Message::tool_result("call_1", "42"),
        ];
        let out = coalesce_anthropic_messages(msgs.iter());
        assert_eq!(out.len(), 2);
        assert_eq!(out[1]["role"], "user");
        assert_eq!(out[1]["content"][0]["type"], "tool_result");
    }

    #[test]
    fn streaming_tool_call_delta_requires_started_call() {
        let mut state = StreamState::default();
        let started = parse_sse_event(
            &mut state,
            &serde_json::json!({
                "type": "content_block_start",
                "content_block": {"type": "tool_use", "id": "c1", "name": "search"}
            })
            .to_string(),
        );
        assert!(matches!(started[0], Ok(StreamEvent::ToolCallStarted { .. })));

        let delta = parse_sse_event(
            &mut state,
            &serde_json::json!({"type": "content_block_delta", "delta": {"partial_json": "{\"q\":"}}).to_string(),
        );
        match &delta[0] {
            Ok(StreamEvent::ToolCallDelta { call_id, .. }) => assert_eq!(call_id, "c1"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn user_message_with_image_part_emits_image_source_block() {
        let msg = Message {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: "describe this".into() },
                ContentPart::Image { url: "https://example.com/cat.png".into(), media_type: Some("image/png".into()) },
            ]),
        };
        let out = coalesce_anthropic_messages(std::iter::once(&msg));
        let blocks = out[0]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1]["type"], "image");
        assert_eq!(blocks[1]["source"]["url"], "https://example.com/cat.png");
    }

    #[test]
    fn user_message_with_audio_part_emits_audio_source_block() {
        let msg = Message {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::Audio {
                url: "data:base64,xyz".into(),
                media_type: Some("audio/wav".into()),
            }]),
        };
        let out = coalesce_anthropic_messages(std::iter::once(&msg));
        let blocks = out[0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "audio");
        assert_eq!(blocks[0]["source"]["media_type"], "audio/wav");
    }
}
