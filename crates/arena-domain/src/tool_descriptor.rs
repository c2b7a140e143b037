use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `name`, description, JSON-Schema input, dispatch mode (spec §3 "Tool
/// Descriptor"). Lives in the pack; immutable during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub mode: ToolMode,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ToolMode {
    Local,
    Http(HttpToolConfig),
    Mcp(McpToolConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpToolConfig {
    pub url: String,
    #[serde(default = "d_method")]
    pub method: String,
    /// Header name -> env var holding the value (credentials never live
    /// in the pack itself).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub env_headers: HashMap<String, String>,
    #[serde(default = "d_http_timeout_ms")]
    pub timeout_ms: u64,
    /// Dotted JSON-pointer-ish field paths redacted from the response
    /// before it is returned to the conversation (spec §6 "Tool HTTP wire
    /// format").
    #[serde(default)]
    pub redact: Vec<String>,
}

fn d_method() -> String {
    "POST".into()
}
fn d_http_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolConfig {
    pub server_handle: String,
    /// The tool's name on the MCP server, if different from `name`.
    #[serde(default)]
    pub remote_name: Option<String>,
}

/// Caps and denylist enforced by the Tool Executor (spec §4.4) — these
/// bound every tool invocation regardless of dispatch mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default = "d_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "d_max_tool_calls_per_turn")]
    pub max_tool_calls_per_turn: u32,
    #[serde(default)]
    pub blocklist: Vec<String>,
    #[serde(default = "d_http_response_cap_bytes")]
    pub http_response_cap_bytes: u64,
    /// Required when any tool in the registry can return a `Pending`
    /// outcome (spec §4.4 HITL). No implicit default — see DESIGN.md's
    /// Open Question decision 3.
    #[serde(default)]
    pub pending_timeout_ms: Option<u64>,
}

fn d_max_rounds() -> u32 {
    5
}
fn d_max_tool_calls_per_turn() -> u32 {
    3
}
fn d_http_response_cap_bytes() -> u64 {
    10 * 1024 * 1024
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            max_rounds: d_max_rounds(),
            max_tool_calls_per_turn: d_max_tool_calls_per_turn(),
            blocklist: Vec::new(),
            http_response_cap_bytes: d_http_response_cap_bytes(),
            pending_timeout_ms: None,
        }
    }
}

impl ToolPolicy {
    pub fn allows(&self, tool_name: &str) -> bool {
        !self.blocklist.iter().any(|b| b == tool_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_spec_defaults() {
        let p = ToolPolicy::default();
        assert_eq!(p.max_rounds, 5);
        assert_eq!(p.max_tool_calls_per_turn, 3);
        assert_eq!(p.http_response_cap_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn blocklist_denies_named_tool() {
        let p = ToolPolicy {
            blocklist: vec!["dangerous".into()],
            ..Default::default()
        };
        assert!(!p.allows("dangerous"));
        assert!(p.allows("safe"));
    }

    #[test]
    fn max_rounds_zero_fails_any_turn_with_tool_call() {
        // Boundary behavior from spec §8: max_rounds=0 means any tool
        // call exhausts the loop immediately. We only assert the policy
        // carries the value through unmodified; the loop enforcement
        // lives in the engine's ToolLoop middleware.
        let p = ToolPolicy {
            max_rounds: 0,
            ..Default::default()
        };
        assert_eq!(p.max_rounds, 0);
    }
}
