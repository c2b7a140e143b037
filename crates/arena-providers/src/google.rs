//! Google Gemini adapter.
//!
//! Implements the `generateContent`/`streamGenerateContent` REST surface.
//! Gemini has no dedicated `system` role — the system prompt travels as
//! `systemInstruction` — and tool results are expressed as a
//! `functionResponse` part on a `user`-role turn.

use crate::traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};
use crate::util::{classify_http_error, from_reqwest, resolve_api_key};
use arena_domain::capability::LlmCapabilities;
use arena_domain::model::{CostSummary, Pricing, ProviderSpec};
use arena_domain::stream::{BoxStream, StreamEvent, Usage};
use arena_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
use arena_domain::{ArenaError, Result};
use serde_json::Value;

pub struct GoogleProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
    pricing: Pricing,
}

impl GoogleProvider {
    pub fn from_spec(spec: &ProviderSpec) -> Result<Self> {
        let api_key = resolve_api_key(&spec.id, &spec.credential_env)?;
        let base_url = spec
            .base_url
            .clone()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".into());

        let capabilities = LlmCapabilities {
            supports_tools: arena_domain::capability::ToolSupport::Basic,
            supports_streaming: spec.supports_streaming,
            supports_json_mode: true,
            supports_vision: true,
            supports_duplex: true,
            context_window_tokens: Some(1_000_000),
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

    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let system_text = req
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.extract_all_text())
            .collect::<Vec<_>>()
            .join("\n\n");

        let contents: Vec<Value> = req
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(msg_to_gemini)
            .collect();

        let mut body = serde_json::json!({ "contents": contents });
        if !system_text.is_empty() {
            body["systemInstruction"] = serde_json::json!({"parts": [{"text": system_text}]});
        }
        if !req.tools.is_empty() {
            let decls: Vec<Value> = req.tools.iter().map(tool_to_gemini).collect();
            body["tools"] = serde_json::json!([{"functionDeclarations": decls}]);
        }

        let mut gen_config = serde_json::json!({});
        if let Some(temp) = req.temperature {
            gen_config["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            gen_config["maxOutputTokens"] = serde_json::json!(max);
        }
        if req.json_mode {
            gen_config["responseMimeType"] = serde_json::json!("application/json");
        }
        if gen_config.as_object().is_some_and(|o| !o.is_empty()) {
            body["generationConfig"] = gen_config;
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_gemini(role: Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        _ => "user",
    }
}

fn msg_to_gemini(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => tool_result_to_gemini(msg),
        Role::Assistant => assistant_to_gemini(msg),
        _ => serde_json::json!({
            "role": role_to_gemini(msg.role),
            "parts": content_to_gemini_parts(&msg.content),
        }),
    }
}

fn assistant_to_gemini(msg: &Message) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    match &msg.content {
        MessageContent::Text(t) => {
            if !t.is_empty() {
                parts.push(serde_json::json!({"text": t}));
            }
        }
        MessageContent::Parts(ps) => {
            for p in ps {
                match p {
                    ContentPart::Text { text } => parts.push(serde_json::json!({"text": text})),
                    ContentPart::ToolUse { name, input, .. } => parts.push(serde_json::json!({
                        "functionCall": {"name": name, "args": input},
                    })),
                    _ => {}
                }
            }
        }
    }
    serde_json::json!({"role": "model", "parts": parts})
}

/// Gemini addresses `functionResponse` by the function *name*, not a call
/// id; our `tool_use_id` doubles as that name since the coalescer always
/// sets it to the originating `ToolCall::tool_name`.
fn tool_result_to_gemini(msg: &Message) -> Value {
    let (name, response) = match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .find_map(|p| match p {
                ContentPart::ToolResult { tool_use_id, content, .. } => {
                    Some((tool_use_id.clone(), serde_json::json!({"content": content})))
                }
                _ => None,
            })
            .unwrap_or_else(|| ("unknown".into(), serde_json::json!({"content": ""}))),
        MessageContent::Text(t) => ("unknown".into(), serde_json::json!({"content": t})),
    };
    serde_json::json!({
        "role": "user",
        "parts": [{"functionResponse": {"name": name, "response": response}}],
    })
}

fn content_to_gemini_parts(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(t) => vec![serde_json::json!({"text": t})],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(serde_json::json!({"text": text})),
                ContentPart::Image { url, media_type } => {
                    let mt = media_type.as_deref().unwrap_or("image/png");
                    Some(serde_json::json!({"inlineData": {"mimeType": mt, "data": url}}))
                }
                ContentPart::Audio { url, media_type } => {
                    let mt = media_type.as_deref().unwrap_or("audio/wav");
                    Some(serde_json::json!({"inlineData": {"mimeType": mt, "data": url}}))
                }
                ContentPart::Video { url, media_type } => {
                    let mt = media_type.as_deref().unwrap_or("video/mp4");
                    Some(serde_json::json!({"inlineData": {"mimeType": mt, "data": url}}))
                }
                _ => None,
            })
            .collect(),
    }
}

fn tool_to_gemini(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(provider_id: &str, model: &str, body: &Value) -> Result<ChatResponse> {
    let candidate = body
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| ArenaError::ProviderPermanent {
            provider: provider_id.to_string(),
            message: "no candidates in response".into(),
        })?;

    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
            text.push_str(t);
        }
        if let Some(fc) = part.get("functionCall") {
            let tool_name = fc.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let arguments = fc.get("args").cloned().unwrap_or(Value::Null);
            tool_calls.push(ToolCall {
                call_id: format!("gemini_call_{i}"),
                tool_name,
                arguments,
            });
        }
    }

    let finish_reason = candidate.get("finishReason").and_then(|v| v.as_str()).map(String::from);
    let usage = body.get("usageMetadata").and_then(parse_gemini_usage);

    Ok(ChatResponse {
        content: text,
        tool_calls,
        usage,
        model: model.to_string(),
        finish_reason,
    })
}

fn parse_gemini_usage(v: &Value) -> Option<Usage> {
    let prompt_tokens = v.get("promptTokenCount")?.as_u64()? as u32;
    let completion_tokens = v.get("candidatesTokenCount").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    let total_tokens = v
        .get("totalTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or((prompt_tokens + completion_tokens) as u64) as u32;
    let cached_tokens = v.get("cachedContentTokenCount").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    Some(Usage { prompt_tokens, completion_tokens, cached_tokens, total_tokens })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_sse_chunk(data: &str) -> Vec<Result<StreamEvent>> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(e.into())],
    };
    let candidate = match v.get("candidates").and_then(|c| c.as_array()).and_then(|a| a.first()) {
        Some(c) => c,
        None => return Vec::new(),
    };
    let mut out = Vec::new();
    if let Some(parts) = candidate.get("content").and_then(|c| c.get("parts")).and_then(|p| p.as_array()) {
        for (i, part) in parts.iter().enumerate() {
            if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
                if !t.is_empty() {
                    out.push(Ok(StreamEvent::Token { text: t.to_string() }));
                }
            }
            if let Some(fc) = part.get("functionCall") {
                let tool_name = fc.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let arguments = fc.get("args").cloned().unwrap_or(Value::Null);
                let call_id = format!("gemini_call_{i}");
                out.push(Ok(StreamEvent::ToolCallStarted { call_id: call_id.clone(), tool_name: tool_name.clone() }));
                out.push(Ok(StreamEvent::ToolCallFinished { call_id, tool_name, arguments }));
            }
        }
    }
    if let Some(reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
        let usage = v.get("usageMetadata").and_then(parse_gemini_usage);
        out.push(Ok(StreamEvent::Done { usage, finish_reason: Some(reason.to_string()) }));
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for GoogleProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let model = self.effective_model(&req);
        let url = format!("{}/models/{model}:generateContent?key={}", self.base_url, self.api_key);
        let body = self.build_body(&req);

        let resp = self.client.post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;
        if !status.is_success() {
            return Err(classify_http_error(&self.id, status.as_u16(), &resp_text));
        }
        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_chat_response(&self.id, &model, &resp_json)
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let model = self.effective_model(&req);
        let url = format!(
            "{}/models/{model}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.api_key
        );
        let body = self.build_body(&req);
        let provider_id = self.id.clone();

        let resp = self.client.post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(classify_http_error(&provider_id, status.as_u16(), &err_text));
        }
        Ok(crate::sse::sse_response_stream(resp, parse_sse_chunk))
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let model = req.model.unwrap_or_else(|| "text-embedding-004".into());
        let url = format!("{}/models/{model}:batchEmbedContents?key={}", self.base_url, self.api_key);
        let requests: Vec<Value> = req
            .input
            .iter()
            .map(|text| {
                serde_json::json!({"model": format!("models/{model}"), "content": {"parts": [{"text": text}]}})
            })
            .collect();
        let body = serde_json::json!({"requests": requests});

        let resp = self.client.post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;
        if !status.is_success() {
            return Err(classify_http_error(&self.id, status.as_u16(), &resp_text));
        }
        let resp_json: Value = serde_json::from_str(&resp_text)?;
        let embeddings: Vec<Vec<f32>> = resp_json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| {
                        item.get("values")?.as_array().map(|values| {
                            values.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(EmbeddingsResponse { embeddings })
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
