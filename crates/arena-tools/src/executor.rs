//! Tool Executor (spec §4.4): dispatches a resolved `ToolCall` by the
//! descriptor's mode, enforcing the descriptor-level timeout, the global
//! HTTP response-size cap, and field redaction.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use arena_domain::tool::ToolCall;
use arena_domain::tool_descriptor::{HttpToolConfig, McpToolConfig, ToolMode, ToolPolicy};
use arena_domain::{ArenaError, Result};
use futures_util::StreamExt;

use crate::registry::ToolRegistry;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A host-provided function implementing a `local`-mode tool.
pub type LocalToolFn = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// What a tool invocation produced. A `Pending` outcome (spec §4.4 "async
/// tool" / HITL) suspends the current turn rather than failing it; the
/// executor stores it in the [`crate::PendingToolMap`] keyed by call id.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Result {
        value: serde_json::Value,
        is_error: bool,
    },
    Pending {
        reason: String,
        message: String,
    },
}

impl ToolOutcome {
    pub fn ok(value: serde_json::Value) -> Self {
        ToolOutcome::Result {
            value,
            is_error: false,
        }
    }
    pub fn error(message: impl Into<String>) -> Self {
        ToolOutcome::Result {
            value: serde_json::json!({ "error": message.into() }),
            is_error: true,
        }
    }
}

pub struct ToolExecutor {
    registry: ToolRegistry,
    mcp: Option<Arc<arena_mcp::McpManager>>,
    http: reqwest::Client,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, mcp: Option<Arc<arena_mcp::McpManager>>) -> Self {
        Self {
            registry,
            mcp,
            http: reqwest::Client::new(),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Invoke `call` under the descriptor's timeout and the policy's
    /// blocklist. Returns `ArenaError::ToolError` for an unknown or
    /// blocked tool name (the caller, the Pipeline's ToolLoop, converts
    /// this into a tool-result message with `is_error=true` per spec §7).
    #[tracing::instrument(skip(self, call), fields(tool = %call.tool_name, call_id = %call.call_id))]
    pub async fn invoke(&self, call: &ToolCall, policy: &ToolPolicy) -> Result<ToolOutcome> {
        if !policy.allows(&call.tool_name) {
            return Err(ArenaError::ToolError {
                tool_name: call.tool_name.clone(),
                message: "tool is blocklisted by tool_policy".into(),
            });
        }
        let descriptor = self.registry.get(&call.tool_name).ok_or_else(|| ArenaError::ToolError {
            tool_name: call.tool_name.clone(),
            message: "no descriptor registered for this tool name".into(),
        })?;

        let timeout = Duration::from_millis(descriptor.timeout_ms.unwrap_or(match &descriptor.mode {
            ToolMode::Http(cfg) => cfg.timeout_ms,
            _ => 30_000,
        }));

        let fut = match &descriptor.mode {
            ToolMode::Local => self.invoke_local(call),
            ToolMode::Http(cfg) => Box::pin(self.invoke_http(call, cfg, policy)),
            ToolMode::Mcp(cfg) => Box::pin(self.invoke_mcp(call, cfg)),
        };

        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ArenaError::Timeout(format!(
                "tool `{}` exceeded its {}ms timeout",
                call.tool_name,
                timeout.as_millis()
            ))),
        }
    }

    fn invoke_local(&self, call: &ToolCall) -> BoxFuture<'_, Result<ToolOutcome>> {
        let call = call.clone();
        Box::pin(async move {
            let f = self.registry.local_fn(&call.tool_name).ok_or_else(|| ArenaError::ToolError {
                tool_name: call.tool_name.clone(),
                message: "local tool declared but no host function registered".into(),
            })?;
            let value = f(call.arguments.clone()).await?;
            Ok(ToolOutcome::ok(value))
        })
    }

    /// Serializes args to JSON, issues the HTTP request, caps the response
    /// body at `policy.http_response_cap_bytes` via a streamed early-abort
    /// read (spec §6 "Tool HTTP wire format"), wraps a non-JSON body as
    /// `{"result": <text>}`, then redacts the descriptor's `redact` fields.
    async fn invoke_http(
        &self,
        call: &ToolCall,
        cfg: &HttpToolConfig,
        policy: &ToolPolicy,
    ) -> Result<ToolOutcome> {
        let mut builder = self
            .http
            .request(
                cfg.method.parse().unwrap_or(reqwest::Method::POST),
                &cfg.url,
            )
            .json(&call.arguments);

        for (header, value) in &cfg.headers {
            builder = builder.header(header, value);
        }
        for (header, env_var) in &cfg.env_headers {
            if let Ok(value) = std::env::var(env_var) {
                builder = builder.header(header, value);
            }
        }

        let response = builder.send().await.map_err(|e| ArenaError::ProviderTransient {
            provider: format!("tool:{}", call.tool_name),
            message: e.to_string(),
        })?;

        let body = read_capped(response, policy.http_response_cap_bytes).await?;

        let mut value: serde_json::Value = serde_json::from_slice(&body)
            .unwrap_or_else(|_| serde_json::json!({ "result": String::from_utf8_lossy(&body) }));
        redact_fields(&mut value, &cfg.redact);

        Ok(ToolOutcome::ok(value))
    }

    async fn invoke_mcp(&self, call: &ToolCall, cfg: &McpToolConfig) -> Result<ToolOutcome> {
        let mcp = self.mcp.as_ref().ok_or_else(|| ArenaError::ToolError {
            tool_name: call.tool_name.clone(),
            message: "no MCP manager configured for this engine".into(),
        })?;
        let remote_name = cfg.remote_name.as_deref().unwrap_or(&call.tool_name);
        let result = mcp
            .call_tool(&cfg.server_handle, remote_name, call.arguments.clone())
            .await
            .map_err(ArenaError::from)?;

        let text: String = result
            .content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolOutcome::Result {
            value: serde_json::json!({ "result": text }),
            is_error: result.is_error,
        })
    }
}

async fn read_capped(response: reqwest::Response, cap: u64) -> Result<Vec<u8>> {
    let mut stream = response.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ArenaError::Http(e.to_string()))?;
        buf.extend_from_slice(&chunk);
        if buf.len() as u64 > cap {
            buf.truncate(cap as usize);
            break;
        }
    }
    Ok(buf)
}

/// Replace each dotted field path in `redact` with `"[REDACTED]"` inside
/// `value`. Paths address nested object fields only (arrays are not
/// indexed); a missing path is a no-op.
fn redact_fields(value: &mut serde_json::Value, redact: &[String]) {
    for path in redact {
        let parts: Vec<&str> = path.split('.').collect();
        if let Some(target) = navigate_mut(value, &parts) {
            *target = serde_json::Value::String("[REDACTED]".into());
        }
    }
}

fn navigate_mut<'a>(value: &'a mut serde_json::Value, parts: &[&str]) -> Option<&'a mut serde_json::Value> {
    match parts {
        [] => Some(value),
        [head, rest @ ..] => {
            let obj = value.as_object_mut()?;
            let next = obj.get_mut(*head)?;
            navigate_mut(next, rest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_domain::tool_descriptor::ToolDescriptor;
    use serde_json::json;

    fn policy() -> ToolPolicy {
        ToolPolicy::default()
    }

    #[tokio::test]
    async fn invoke_unknown_tool_is_tool_error() {
        let registry = ToolRegistry::new();
        let executor = ToolExecutor::new(registry, None);
        let call = ToolCall {
            call_id: "c1".into(),
            tool_name: "missing".into(),
            arguments: json!({}),
        };
        let err = executor.invoke(&call, &policy()).await.unwrap_err();
        assert_eq!(err.kind(), "ToolError");
    }

    #[tokio::test]
    async fn invoke_blocklisted_tool_is_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolDescriptor {
            name: "danger".into(),
            description: "d".into(),
            input_schema: json!({}),
            mode: ToolMode::Local,
            timeout_ms: None,
        });
        let executor = ToolExecutor::new(registry, None);
        let call = ToolCall {
            call_id: "c1".into(),
            tool_name: "danger".into(),
            arguments: json!({}),
        };
        let blocked_policy = ToolPolicy {
            blocklist: vec!["danger".into()],
            ..ToolPolicy::default()
        };
        let err = executor.invoke(&call, &blocked_policy).await.unwrap_err();
        assert_eq!(err.kind(), "ToolError");
    }

    #[tokio::test]
    async fn invoke_local_tool_runs_registered_fn() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolDescriptor {
            name: "echo".into(),
            description: "d".into(),
            input_schema: json!({}),
            mode: ToolMode::Local,
            timeout_ms: None,
        });
        registry.register_local_fn(
            "echo",
            Arc::new(|args| Box::pin(async move { Ok(args) })),
        );
        let executor = ToolExecutor::new(registry, None);
        let call = ToolCall {
            call_id: "c1".into(),
            tool_name: "echo".into(),
            arguments: json!({"x": 1}),
        };
        let outcome = executor.invoke(&call, &policy()).await.unwrap();
        match outcome {
            ToolOutcome::Result { value, is_error } => {
                assert!(!is_error);
                assert_eq!(value, json!({"x": 1}));
            }
            _ => panic!("expected Result outcome"),
        }
    }

    #[test]
    fn redact_fields_masks_nested_path() {
        let mut value = json!({"user": {"ssn": "123-45-6789"}, "ok": true});
        redact_fields(&mut value, &["user.ssn".to_string()]);
        assert_eq!(value["user"]["ssn"], json!("[REDACTED]"));
        assert_eq!(value["ok"], json!(true));
    }

    #[test]
    fn redact_fields_missing_path_is_noop() {
        let mut value = json!({"ok": true});
        redact_fields(&mut value, &["nope.nested".to_string()]);
        assert_eq!(value, json!({"ok": true}));
    }
}
