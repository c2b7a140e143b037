mod document;

pub use document::*;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::model::{ProviderSpec, Scenario};
use crate::tool_descriptor::{ToolDescriptor, ToolPolicy};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config (spec §6 "ArenaConfig")
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The typed record the (out-of-scope) loader hands to the engine. Textual
/// YAML/JSON parsing, schema validation, and `$ref`-style fragment
/// resolution all happen before this struct exists; everything from here
/// down is plain data the scheduler and pipeline consume directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaConfig {
    pub providers: Vec<ProviderSpec>,
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default = "d_regions")]
    pub regions: Vec<String>,
    #[serde(default = "d_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "d_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub mock: bool,
    #[serde(default)]
    pub junit_output: Option<PathBuf>,
    #[serde(default)]
    pub tool_policy: ToolPolicy,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub filters: RunFilters,
    /// Provider id consulted by `llm_judge` assertions. Falls back to the
    /// run's own provider when unset.
    #[serde(default)]
    pub judge_provider: Option<String>,
}

fn d_regions() -> Vec<String> {
    vec!["default".into()]
}
fn d_output_dir() -> PathBuf {
    PathBuf::from("./arena-out")
}
fn d_parallelism() -> usize {
    4
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            scenarios: Vec::new(),
            tools: Vec::new(),
            mcp: McpConfig::default(),
            regions: d_regions(),
            output_dir: d_output_dir(),
            parallelism: d_parallelism(),
            mock: false,
            junit_output: None,
            tool_policy: ToolPolicy::default(),
            retry: RetryConfig::default(),
            filters: RunFilters::default(),
            judge_provider: None,
        }
    }
}

/// Optional include lists restricting which axis values of the run matrix
/// (spec §4.3 "Optional filters restrict any axis") are actually dispatched.
/// An empty vector means "no filter on this axis".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilters {
    #[serde(default)]
    pub scenarios: Vec<String>,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
}

impl RunFilters {
    pub fn allows_scenario(&self, id: &str) -> bool {
        self.scenarios.is_empty() || self.scenarios.iter().any(|s| s == id)
    }
    pub fn allows_provider(&self, id: &str) -> bool {
        self.providers.is_empty() || self.providers.iter().any(|p| p == id)
    }
    pub fn allows_region(&self, id: &str) -> bool {
        self.regions.is_empty() || self.regions.iter().any(|r| r == id)
    }
}

/// Provider-call retry/backoff (spec §4.3): exponential growth with
/// deterministic jitter, grounded on the reconnect-backoff pattern used
/// elsewhere in the corpus for transient-failure recovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "d_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "d_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "d_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "d_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "d_jitter_fraction")]
    pub jitter_fraction: f64,
}

fn d_max_attempts() -> u32 {
    3
}
fn d_base_delay_ms() -> u64 {
    500
}
fn d_max_delay_ms() -> u64 {
    10_000
}
fn d_backoff_factor() -> f64 {
    2.0
}
fn d_jitter_fraction() -> f64 {
    0.25
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: d_max_attempts(),
            base_delay_ms: d_base_delay_ms(),
            max_delay_ms: d_max_delay_ms(),
            backoff_factor: d_backoff_factor(),
            jitter_fraction: d_jitter_fraction(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP server configuration (consumed by `arena-mcp`; the canonical
// definitions live here so the config loader can deserialize them
// without depending on the MCP client crate itself).
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub transport: McpTransportKind,
    /// Only consulted for `McpTransportKind::Sse`; the stdio transport
    /// launches `command` as a subprocess instead.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransportKind {
    #[default]
    Stdio,
    Sse,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl ArenaConfig {
    /// Non-parsing validation: numeric range checks and cross-field
    /// consistency the loader can't express as a schema constraint alone.
    /// Textual parsing/schema validation is the loader's job (spec §1).
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.providers.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "providers".into(),
                message: "at least one provider is required".into(),
            });
        }
        if self.scenarios.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "scenarios".into(),
                message: "no scenarios configured; the run matrix will be empty".into(),
            });
        }
        if self.parallelism == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "parallelism".into(),
                message: "parallelism must be >= 1".into(),
            });
        }

        let has_async_tool = self.tools.iter().any(|t| {
            matches!(
                t.mode,
                crate::tool_descriptor::ToolMode::Mcp(_) | crate::tool_descriptor::ToolMode::Http(_)
            )
        });
        if has_async_tool && self.tool_policy.pending_timeout_ms.is_none() {
            // Per DESIGN.md Open Question decision 3: HITL pending timeout
            // is required configuration, not an implicit default.
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "tool_policy.pending_timeout_ms".into(),
                message: "registry declares an http/mcp tool capable of a pending outcome; \
                          pending_timeout_ms must be set explicitly"
                    .into(),
            });
        }

        issues
    }

    pub fn has_errors(issues: &[ConfigIssue]) -> bool {
        issues.iter().any(|i| i.severity == ConfigSeverity::Error)
    }
}
