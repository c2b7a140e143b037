//! Pipeline (C6, spec §4.6): the ordered middleware chain that turns one
//! scenario turn's input message into a recorded assistant response.
//!
//! The nine middlewares run in a fixed order — StateLoader, PromptAssembly,
//! ContextPolicy, ToolBinder, Provider, ToolLoop, Validators,
//! CostAccounting, StatePersist — and `execute()` pushes each middleware's
//! name onto `PipelineResponse::trace` as it runs, so the ordering
//! contract itself is directly assertable in tests rather than merely
//! implied by call order.

use std::collections::HashMap;
use std::sync::Arc;

use arena_context::ContextPolicyEngine;
use arena_domain::event::Event;
use arena_domain::model::{AssertionOutcome, AssertionSpec, ContextPolicySpec, CostSummary};
use arena_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall};
use arena_domain::tool_descriptor::ToolPolicy;
use arena_domain::{ArenaError, Result};
use arena_providers::{ChatRequest, ChatResponse, LlmProvider, RetryPolicy};
use futures_util::StreamExt;
use arena_tools::{PendingToolMap, ToolExecutor, ToolOutcome};
use arena_validators::TurnContext;

use crate::event_bus::EventBus;

/// The nine middleware names, in contractual order.
pub const MIDDLEWARE_ORDER: [&str; 9] = [
    "state_loader",
    "prompt_assembly",
    "context_policy",
    "tool_binder",
    "provider",
    "tool_loop",
    "validators",
    "cost_accounting",
    "state_persist",
];

/// One turn's input to the Pipeline. `history` is the run's message log up
/// to (not including) this turn, hydrated by the StateLoader middleware's
/// caller (the Conversation Driver owns the log itself — the middleware's
/// job is simply to treat it as authoritative for this call).
pub struct PipelineRequest {
    pub history: Vec<Message>,
    pub new_message: Message,
    pub system_prompt_template: Option<String>,
    pub template_vars: HashMap<String, String>,
    pub context_policy: Option<ContextPolicySpec>,
    pub tool_allow_list: Option<Vec<String>>,
    pub assertions: Vec<AssertionSpec>,
    pub streaming: bool,
}

impl PipelineRequest {
    pub fn new(history: Vec<Message>, new_message: Message) -> Self {
        Self {
            history,
            new_message,
            system_prompt_template: None,
            template_vars: HashMap::new(),
            context_policy: None,
            tool_allow_list: None,
            assertions: Vec::new(),
            streaming: false,
        }
    }
}

/// Appended messages, recorded outcomes, and running cost for one turn.
pub struct PipelineResponse {
    pub assistant_text: String,
    pub tool_calls: Vec<ToolCall>,
    pub appended_messages: Vec<Message>,
    pub cost: CostSummary,
    pub assertion_outcomes: Vec<AssertionOutcome>,
    pub trace: Vec<&'static str>,
}

/// Constructed once per run by the Conversation Driver and reused across
/// every turn in that run (and again, with a different system prompt, for
/// selfplay-user turns — it is the same struct, not a distinct code path,
/// per SPEC_FULL.md §4.7's recorded decision).
pub struct Pipeline {
    pub provider: Arc<dyn LlmProvider>,
    pub judge_provider: Option<Arc<dyn LlmProvider>>,
    pub embedding_provider: Option<Arc<dyn LlmProvider>>,
    pub tool_executor: Arc<ToolExecutor>,
    pub tool_policy: ToolPolicy,
    pub context_engine: Arc<ContextPolicyEngine>,
    pub pending_tools: Option<Arc<PendingToolMap>>,
    pub retry_policy: RetryPolicy,
}

impl Pipeline {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tool_executor: Arc<ToolExecutor>,
        tool_policy: ToolPolicy,
        context_engine: Arc<ContextPolicyEngine>,
    ) -> Self {
        Self {
            provider,
            judge_provider: None,
            embedding_provider: None,
            tool_executor,
            tool_policy,
            context_engine,
            pending_tools: None,
            retry_policy: RetryPolicy::from(&arena_domain::config::RetryConfig::default()),
        }
    }

    pub fn with_judge_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.judge_provider = Some(provider);
        self
    }

    pub fn with_embedding_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    pub fn with_pending_tools(mut self, pending: Arc<PendingToolMap>) -> Self {
        self.pending_tools = Some(pending);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    #[tracing::instrument(skip_all, fields(run_id = %run_id, turn_index))]
    pub async fn execute(
        &self,
        run_id: &str,
        turn_index: usize,
        req: PipelineRequest,
        bus: Option<&EventBus>,
    ) -> Result<PipelineResponse> {
        let mut trace = Vec::with_capacity(9);

        // 1. StateLoader
        trace.push("state_loader");
        let mut messages = req.history;
        messages.push(req.new_message);

        // 2. PromptAssembly
        trace.push("prompt_assembly");
        if let Some(template) = &req.system_prompt_template {
            let rendered = render_template(template, &req.template_vars);
            if !messages.iter().any(|m| m.role == Role::System) {
                messages.insert(0, Message::system(rendered));
            }
        }

        // 3. ContextPolicy
        trace.push("context_policy");
        let messages = if let Some(policy) = &req.context_policy {
            self.context_engine
                .apply(&messages, policy, self.embedding_provider.as_deref())
                .await?
        } else {
            messages
        };

        // 4. ToolBinder
        trace.push("tool_binder");
        let tool_defs = self
            .tool_executor
            .registry()
            .bind(req.tool_allow_list.as_deref(), &self.tool_policy.blocklist);

        // 5. Provider (+ 6. ToolLoop)
        trace.push("provider");
        let mut turn_cost = CostSummary::default();
        let mut conversation = messages.clone();
        let mut round = 0u32;
        let mut final_text = String::new();
        let mut final_tool_calls = Vec::new();
        let mut appended = Vec::new();

        loop {
            // Provider transport errors (spec §4.3) are retried here, before
            // any message is appended to `conversation` — so a retried call
            // never produces duplicate messages in the log, and cost
            // accounting below only ever sees the attempt that succeeded.
            let resp = self
                .retry_policy
                .retry(|| {
                    self.call_provider(
                        req.streaming,
                        ChatRequest {
                            messages: conversation.clone(),
                            tools: tool_defs.clone(),
                            ..Default::default()
                        },
                    )
                })
                .await?;

            if let Some(usage) = &resp.usage {
                turn_cost.accumulate(&self.provider.calculate_cost(usage));
            }

            let assistant_message = assistant_message_from_response(&resp);
            conversation.push(assistant_message.clone());
            appended.push(assistant_message);
            final_text = resp.content.clone();
            final_tool_calls = resp.tool_calls.clone();

            if resp.tool_calls.is_empty() {
                break;
            }

            trace.push("tool_loop");
            if round >= self.tool_policy.max_rounds {
                return Err(ArenaError::ToolError {
                    tool_name: "tool_loop".into(),
                    message: format!(
                        "tool loop exceeded max_rounds={} for run {run_id} turn {turn_index}",
                        self.tool_policy.max_rounds
                    ),
                });
            }

            let calls: Vec<ToolCall> = resp
                .tool_calls
                .iter()
                .take(self.tool_policy.max_tool_calls_per_turn as usize)
                .cloned()
                .collect();

            let results = futures_util::future::join_all(calls.iter().map(|call| async move {
                if let Some(bus) = bus {
                    bus.publish(Event::ToolCalled {
                        run_id: run_id.to_string(),
                        call_id: call.call_id.clone(),
                        tool_name: call.tool_name.clone(),
                    });
                }
                let outcome = self.resolve_tool_call(call).await;
                (call.clone(), outcome)
            }))
            .await;

            for (call, outcome) in results {
                let (content, is_error) = match outcome {
                    Ok(ToolOutcome::Result { value, is_error }) => (value.to_string(), is_error),
                    Ok(ToolOutcome::Pending { .. }) => {
                        // Resolved via resolve_tool_call's internal await; unreachable here.
                        (serde_json::json!({"error": "tool pending resolution never completed"}).to_string(), true)
                    }
                    Err(e) => (serde_json::json!({"error": e.to_string()}).to_string(), true),
                };
                if let Some(bus) = bus {
                    bus.publish(Event::ToolResolved {
                        run_id: run_id.to_string(),
                        call_id: call.call_id.clone(),
                        is_error,
                    });
                }
                let tool_msg = Message::tool_result(call.call_id.clone(), content);
                let tool_msg = if is_error {
                    error_tool_result(&call.call_id, &tool_msg)
                } else {
                    tool_msg
                };
                conversation.push(tool_msg.clone());
                appended.push(tool_msg);
            }

            round += 1;
        }

        if let Some(bus) = bus {
            bus.publish(Event::AssistantResponse {
                run_id: run_id.to_string(),
                turn_index,
                text_chars: final_text.chars().count(),
                tool_call_count: final_tool_calls.len(),
            });
        }

        // 7. Validators
        trace.push("validators");
        let mut assertion_outcomes = Vec::with_capacity(req.assertions.len());
        let ctx = TurnContext {
            response_text: &final_text,
            messages: &conversation,
            judge_provider: self.judge_provider.as_deref(),
        };
        for spec in &req.assertions {
            let outcome = arena_validators::evaluate(&ctx, spec).await;
            if let Some(bus) = bus {
                bus.publish(Event::AssertionEvaluated {
                    run_id: run_id.to_string(),
                    turn_index: Some(turn_index),
                    assertion_type: outcome.kind.clone(),
                    passed: outcome.passed,
                });
            }
            assertion_outcomes.push(outcome);
        }

        // 8. CostAccounting already folded into `turn_cost` above.
        trace.push("cost_accounting");

        // 9. StatePersist: the driver appends `appended_messages` to the
        // run log and owns persistence; the Pipeline only hands them back.
        trace.push("state_persist");

        Ok(PipelineResponse {
            assistant_text: final_text,
            tool_calls: final_tool_calls,
            appended_messages: appended,
            cost: turn_cost,
            assertion_outcomes,
            trace,
        })
    }

    /// Issues the provider call (spec §4.6 step 5: "streaming or unary per
    /// provider capability and the scenario flag"). Streaming is only used
    /// when both the turn requests it and the provider supports it;
    /// `StreamEvent`s are assembled back into a single `ChatResponse` since
    /// the Pipeline's downstream steps (ToolLoop, CostAccounting) are
    /// defined in terms of the unary shape either way.
    async fn call_provider(&self, want_streaming: bool, req: ChatRequest) -> Result<ChatResponse> {
        if !want_streaming || !self.provider.supports_streaming() {
            return self.provider.chat(req).await;
        }

        let mut stream = self.provider.chat_stream(req).await?;
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = None;
        let mut finish_reason = None;

        while let Some(event) = stream.next().await {
            match event? {
                arena_domain::stream::StreamEvent::Token { text: chunk } => text.push_str(&chunk),
                arena_domain::stream::StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => tool_calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                }),
                arena_domain::stream::StreamEvent::ToolCallStarted { .. }
                | arena_domain::stream::StreamEvent::ToolCallDelta { .. } => {}
                arena_domain::stream::StreamEvent::Done {
                    usage: u,
                    finish_reason: fr,
                } => {
                    usage = u;
                    finish_reason = fr;
                }
                arena_domain::stream::StreamEvent::Error { message } => {
                    return Err(ArenaError::ProviderTransient {
                        provider: self.provider.provider_id().to_string(),
                        message,
                    });
                }
            }
        }

        Ok(ChatResponse {
            content: text,
            tool_calls,
            usage,
            model: self.provider.provider_id().to_string(),
            finish_reason,
        })
    }

    /// Invokes the tool and, for a `Pending` (HITL) outcome, suspends this
    /// call until `pending_tools` resolves or rejects it, or its timeout
    /// elapses (spec §4.4 "the current turn is suspended, not failed").
    async fn resolve_tool_call(&self, call: &ToolCall) -> Result<ToolOutcome> {
        let outcome = self.tool_executor.invoke(call, &self.tool_policy).await?;
        match outcome {
            ToolOutcome::Pending { reason, message } => {
                let pending = self.pending_tools.as_ref().ok_or_else(|| ArenaError::ToolError {
                    tool_name: call.tool_name.clone(),
                    message: "tool returned a pending outcome but no pending-tool map is configured".into(),
                })?;
                let rx = pending.insert(call.call_id.clone(), call.tool_name.clone(), reason, message);
                match tokio::time::timeout(pending.timeout(), rx).await {
                    Ok(Ok(arena_tools::PendingOutcome::Resolved(value))) => Ok(ToolOutcome::ok(value)),
                    Ok(Ok(arena_tools::PendingOutcome::Rejected { reason })) => Ok(ToolOutcome::error(reason)),
                    Ok(Err(_)) => Err(ArenaError::Internal(format!(
                        "pending tool `{}` sender dropped without resolving",
                        call.tool_name
                    ))),
                    Err(_) => {
                        pending.remove_expired(&call.call_id);
                        Err(ArenaError::Timeout(format!(
                            "pending tool `{}` (call {}) timed out waiting for resolution",
                            call.tool_name, call.call_id
                        )))
                    }
                }
            }
            other => Ok(other),
        }
    }
}

fn assistant_message_from_response(resp: &arena_providers::ChatResponse) -> Message {
    if resp.tool_calls.is_empty() {
        Message::assistant(resp.content.clone())
    } else {
        let mut parts = Vec::new();
        if !resp.content.is_empty() {
            parts.push(ContentPart::Text { text: resp.content.clone() });
        }
        for call in &resp.tool_calls {
            parts.push(ContentPart::ToolUse {
                id: call.call_id.clone(),
                name: call.tool_name.clone(),
                input: call.arguments.clone(),
            });
        }
        Message {
            role: Role::Assistant,
            content: MessageContent::Parts(parts),
        }
    }
}

fn error_tool_result(tool_use_id: &str, msg: &Message) -> Message {
    let text = msg.content.extract_all_text();
    Message {
        role: Role::Tool,
        content: MessageContent::Parts(vec![ContentPart::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content: text,
            is_error: true,
        }]),
    }
}

/// Minimal `{{var}}` substitution — the (out-of-scope) loader resolves
/// fragment references before this struct exists; only plain variable
/// interpolation happens here.
fn render_template(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_domain::model::{ProviderSpec, ProviderType};
    use arena_providers::mock::MockProvider;
    use arena_tools::ToolRegistry;

    fn mock_pipeline() -> Pipeline {
        let spec = ProviderSpec {
            id: "mock".into(),
            kind: ProviderType::Mock,
            model: "mock-1".into(),
            base_url: None,
            credential_env: None,
            default_params: Default::default(),
            pricing: Default::default(),
            supports_streaming: false,
            tool_dialect: None,
            mock: None,
        };
        let provider = Arc::new(MockProvider::from_spec(&spec));
        let executor = Arc::new(ToolExecutor::new(ToolRegistry::new(), None));
        Pipeline::new(provider, executor, ToolPolicy::default(), Arc::new(ContextPolicyEngine::new()))
    }

    #[tokio::test]
    async fn middleware_order_is_contractual() {
        let pipeline = mock_pipeline();
        let req = PipelineRequest::new(vec![], Message::user("hello"));
        let resp = pipeline.execute("r1", 0, req, None).await.unwrap();
        let expected: Vec<&str> = vec![
            "state_loader",
            "prompt_assembly",
            "context_policy",
            "tool_binder",
            "provider",
            "validators",
            "cost_accounting",
            "state_persist",
        ];
        assert_eq!(resp.trace, expected);
    }

    #[tokio::test]
    async fn assistant_text_is_recorded_and_appended() {
        let pipeline = mock_pipeline();
        let req = PipelineRequest::new(vec![], Message::user("ping"));
        let resp = pipeline.execute("r1", 0, req, None).await.unwrap();
        assert!(!resp.assistant_text.is_empty());
        assert!(!resp.appended_messages.is_empty());
    }

    #[tokio::test]
    async fn validators_record_outcomes_for_turn_assertions() {
        let pipeline = mock_pipeline();
        let mut req = PipelineRequest::new(vec![], Message::user("say hi"));
        req.assertions = vec![AssertionSpec {
            kind: "is_valid_json".into(),
            params: serde_json::json!({}),
            message: None,
        }];
        let resp = pipeline.execute("r1", 0, req, None).await.unwrap();
        assert_eq!(resp.assertion_outcomes.len(), 1);
    }

    #[test]
    fn render_template_substitutes_variables() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "Ada".to_string());
        assert_eq!(render_template("Hello {{name}}!", &vars), "Hello Ada!");
    }
}
