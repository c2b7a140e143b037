use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::tool::{Message, ToolCall};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario (spec §3 "Scenario")
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable once loaded. Owned by the config loader; borrowed read-only
/// by the scheduler and the conversation driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub turns: Vec<ScenarioTurn>,
    #[serde(default)]
    pub context_policy: Option<ContextPolicySpec>,
    #[serde(default)]
    pub duplex: Option<DuplexSpec>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub assertions: Vec<AssertionSpec>,
    #[serde(default)]
    pub fixtures: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnRole {
    User,
    Assistant,
    SelfplayUser,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioTurn {
    pub role: TurnRole,
    pub content: TurnContent,
    #[serde(default)]
    pub assertions: Vec<AssertionSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Parts(Vec<crate::tool::ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPolicySpec {
    pub token_budget: u32,
    #[serde(default)]
    pub strategy: TruncationStrategy,
    #[serde(default = "d_min_recent")]
    pub min_recent_messages: usize,
    /// Only consulted when `strategy == Relevance`.
    #[serde(default = "d_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default)]
    pub embedding_provider: Option<String>,
}

fn d_min_recent() -> usize {
    3
}
fn d_similarity_threshold() -> f32 {
    0.3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationStrategy {
    #[default]
    TruncateOldest,
    Relevance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplexSpec {
    #[serde(default)]
    pub turn_detection: TurnDetectionMode,
    #[serde(default = "d_silence_ms")]
    pub silence_threshold_ms: u64,
    #[serde(default = "d_min_speech_ms")]
    pub min_speech_ms: u64,
    #[serde(default)]
    pub inter_turn_delay_ms: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub partial_success_min_turns: usize,
    #[serde(default)]
    pub ignore_last_turn_session_end: bool,
    #[serde(default)]
    pub session_timeout_ms: Option<u64>,
    pub tts_provider: Option<String>,
    pub selfplay_turns: Option<usize>,
}

fn d_silence_ms() -> u64 {
    600
}
fn d_min_speech_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetectionMode {
    #[default]
    Asm,
    Vad,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider Spec (spec §3 "Provider Spec")
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Openai,
    Claude,
    Gemini,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ProviderType,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default)]
    pub default_params: ProviderDefaultParams,
    #[serde(default)]
    pub pricing: Pricing,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub tool_dialect: Option<String>,
    /// Scripted behavior for `type: mock` providers (spec §8 scenario 3
    /// "Provider retry"); `None` for every real adapter.
    #[serde(default)]
    pub mock: Option<MockScriptSpec>,
}

/// Deterministic failure injection for the mock provider, so retry and
/// session-resilience behavior (spec §4.3, §4.7) are testable without a
/// live endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockScriptSpec {
    /// Number of leading calls that fail before a canned success.
    #[serde(default)]
    pub fail_times: u32,
    /// When set, every call numbered `>=` this (1-indexed) fails forever —
    /// for scripting a session that degrades partway through a run rather
    /// than one that recovers after N attempts.
    #[serde(default)]
    pub fail_after: Option<u32>,
    #[serde(default)]
    pub fail_kind: MockFailureKind,
    /// Canned reply text, cycled through in order once failures are
    /// exhausted. Empty means "echo the last user message" (the default
    /// mock behavior).
    #[serde(default)]
    pub responses: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockFailureKind {
    #[default]
    Transient,
    SessionInterrupted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderDefaultParams {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Dollars per 1K tokens (spec §3: "pricing (input/output $/1K tokens)").
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default)]
    pub input_per_1k: f64,
    #[serde(default)]
    pub output_per_1k: f64,
    #[serde(default)]
    pub cached_per_1k: f64,
}

impl Pricing {
    pub fn cost(&self, input_tokens: u32, output_tokens: u32, cached_tokens: u32) -> CostSummary {
        let input_dollars = (input_tokens.saturating_sub(cached_tokens)) as f64 / 1000.0 * self.input_per_1k;
        let cached_dollars = cached_tokens as f64 / 1000.0 * self.cached_per_1k;
        let output_dollars = output_tokens as f64 / 1000.0 * self.output_per_1k;
        CostSummary {
            input_tokens,
            output_tokens,
            cached_tokens,
            input_dollars,
            output_dollars,
            total_dollars: input_dollars + cached_dollars + output_dollars,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run Spec / Run Result / Turn Result (spec §3)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    pub run_id: String,
    pub scenario_id: String,
    pub provider_id: String,
    pub region: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// `status` transitions monotonically: `pending -> running -> (completed | failed)`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Pending, RunStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: u32,
    pub input_dollars: f64,
    pub output_dollars: f64,
    pub total_dollars: f64,
}

impl CostSummary {
    /// Merge another turn's cost into this run-level accumulator.
    /// Cost aggregates are monotonic non-decreasing per run (spec §4.2
    /// invariant 3) — accumulation is the only mutation allowed.
    pub fn accumulate(&mut self, other: &CostSummary) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.input_dollars += other.input_dollars;
        self.output_dollars += other.output_dollars;
        self.total_dollars += other.total_dollars;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssertionsSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

impl AssertionsSummary {
    pub fn record(&mut self, passed: bool) {
        self.total += 1;
        if passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
    }

    /// `assertions.total == assertions.passed + assertions.failed` (spec §8).
    pub fn is_consistent(&self) -> bool {
        self.total == self.passed + self.failed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub scenario_id: String,
    pub provider_id: String,
    pub region: String,
    pub status: RunStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub cost: CostSummary,
    #[serde(default)]
    pub turn_results: Vec<TurnResult>,
    #[serde(default)]
    pub assertions_summary: AssertionsSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub kind: String,
    pub message: String,
    pub is_assertion_failure: bool,
}

impl RunResult {
    pub fn pending(spec: &RunSpec, started_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            run_id: spec.run_id.clone(),
            scenario_id: spec.scenario_id.clone(),
            provider_id: spec.provider_id.clone(),
            region: spec.region.clone(),
            status: RunStatus::Pending,
            started_at,
            finished_at: None,
            duration_ms: 0,
            cost: CostSummary::default(),
            turn_results: Vec::new(),
            assertions_summary: AssertionsSummary::default(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub turn_index: usize,
    pub role: TurnRole,
    pub sent_messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub assertion_outcomes: Vec<AssertionOutcome>,
    pub latency_ms: u64,
    #[serde(default)]
    pub cost: CostSummary,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Assertion Spec (spec §3, §4.5)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionOutcome {
    #[serde(rename = "type")]
    pub kind: String,
    pub passed: bool,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_valid_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
    }

    #[test]
    fn run_status_rejects_backwards_transition() {
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
    }

    #[test]
    fn run_status_is_terminal() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn assertions_summary_consistent_after_records() {
        let mut s = AssertionsSummary::default();
        s.record(true);
        s.record(false);
        s.record(true);
        assert_eq!(s.total, 3);
        assert_eq!(s.passed, 2);
        assert_eq!(s.failed, 1);
        assert!(s.is_consistent());
    }

    #[test]
    fn cost_summary_accumulates_monotonically() {
        let mut total = CostSummary::default();
        let a = Pricing {
            input_per_1k: 1.0,
            output_per_1k: 2.0,
            cached_per_1k: 0.5,
        }
        .cost(1000, 500, 0);
        let b = Pricing {
            input_per_1k: 1.0,
            output_per_1k: 2.0,
            cached_per_1k: 0.5,
        }
        .cost(200, 100, 0);
        total.accumulate(&a);
        let after_a = total.total_dollars;
        total.accumulate(&b);
        assert!(total.total_dollars >= after_a);
        assert_eq!(total.input_tokens, 1200);
    }

    #[test]
    fn pricing_cached_tokens_billed_at_cached_rate() {
        let p = Pricing {
            input_per_1k: 2.0,
            output_per_1k: 4.0,
            cached_per_1k: 0.5,
        };
        let cost = p.cost(1000, 0, 1000);
        // All 1000 input tokens are cached: input_dollars should reflect
        // zero non-cached tokens, total reflects the cached rate only.
        assert_eq!(cost.input_dollars, 0.0);
        assert!((cost.total_dollars - 0.5).abs() < 1e-9);
    }
}
