//! Validator Library (spec §4.5): the closed set of deterministic and
//! LLM-judge assertion evaluators. Every validator implements the same
//! shape — `Evaluate(turn_context, assertion_spec) -> outcome` — and
//! never propagates an `Err`; an evaluator that cannot run (malformed
//! params, judge provider unreachable) reports a failed outcome whose
//! `message` names the reason, since an assertion failure is data, not a
//! control-flow error (spec §7: `AssertionFailure` is recorded, does not
//! abort the run).

mod json;
mod judge;
mod pattern;

use arena_domain::model::{AssertionOutcome, AssertionSpec};
use arena_domain::tool::Message;
use arena_providers::LlmProvider;

/// Everything a validator needs to judge one assertion. For a per-turn
/// assertion, `response_text` is the assistant's reply to that turn; for
/// a conversation-level assertion (spec §4.5 "evaluator is called once
/// after the last turn with the entire message log in context"),
/// `response_text` is the transcript rendered as plain text and
/// `messages` is the full log either way.
pub struct TurnContext<'a> {
    pub response_text: &'a str,
    pub messages: &'a [Message],
    pub judge_provider: Option<&'a dyn LlmProvider>,
}

impl<'a> TurnContext<'a> {
    pub fn for_turn(response_text: &'a str, messages: &'a [Message]) -> Self {
        Self {
            response_text,
            messages,
            judge_provider: None,
        }
    }

    pub fn with_judge(mut self, provider: &'a dyn LlmProvider) -> Self {
        self.judge_provider = Some(provider);
        self
    }
}

/// The closed set of validator type names (spec §4.5 table). Anything
/// else is an implementation-defined extension handled by the catch-all
/// arm below.
pub async fn evaluate(ctx: &TurnContext<'_>, spec: &AssertionSpec) -> AssertionOutcome {
    let outcome = match spec.kind.as_str() {
        "content_includes" => pattern::content_includes(ctx, spec),
        "content_not_includes" => pattern::content_not_includes(ctx, spec),
        "content_matches" => pattern::content_matches(ctx, spec),
        "is_valid_json" => json::is_valid_json(ctx, spec),
        "json_schema" => json::json_schema(ctx, spec),
        "json_path" => json::json_path(ctx, spec),
        "llm_judge" => judge::llm_judge(ctx, spec).await,
        "sentiment" | "tone" => judge::sentiment_or_tone(ctx, spec).await,
        other => Err(format!("unknown validator type `{other}`")),
    };

    match outcome {
        Ok(mut o) => {
            o.kind = spec.kind.clone();
            o
        }
        Err(message) => AssertionOutcome {
            kind: spec.kind.clone(),
            passed: false,
            message,
            details: serde_json::Value::Null,
        },
    }
}

/// Result alias used internally by validator implementations: `Err`
/// carries a human message for an evaluator that could not run at all
/// (bad params); a validator that ran and decided pass/fail always
/// returns `Ok`.
pub(crate) type ValidatorResult = Result<AssertionOutcome, String>;

pub(crate) fn outcome(passed: bool, message: impl Into<String>, details: serde_json::Value) -> AssertionOutcome {
    AssertionOutcome {
        kind: String::new(),
        passed,
        message: message.into(),
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(kind: &str, params: serde_json::Value) -> AssertionSpec {
        AssertionSpec {
            kind: kind.into(),
            params,
            message: None,
        }
    }

    #[tokio::test]
    async fn unknown_validator_type_fails_with_message() {
        let ctx = TurnContext::for_turn("hello", &[]);
        let out = evaluate(&ctx, &spec("not_a_real_type", json!({}))).await;
        assert!(!out.passed);
        assert!(out.message.contains("unknown validator type"));
    }
}
