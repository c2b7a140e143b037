//! `llm_judge`, and the pattern/judge-hybrid `sentiment` / `tone`
//! validators.

use arena_domain::model::AssertionSpec;
use arena_domain::tool::Message;
use arena_providers::ChatRequest;
use serde::Deserialize;

use crate::{outcome, TurnContext, ValidatorResult};

#[derive(Deserialize)]
struct JudgeParams {
    rubric: String,
    #[serde(default)]
    pass_label: Option<String>,
}

/// Asks the configured judge provider to rate the response against a
/// declared rubric; passes iff the judge's verdict is the pass label
/// (default `"pass"`), matched case-insensitively against the start of
/// its reply so a judge that explains itself after the verdict still
/// parses.
pub async fn llm_judge(ctx: &TurnContext<'_>, spec: &AssertionSpec) -> ValidatorResult {
    let params: JudgeParams =
        serde_json::from_value(spec.params.clone()).map_err(|e| format!("invalid params for llm_judge: {e}"))?;
    let provider = ctx
        .judge_provider
        .ok_or_else(|| "llm_judge requires a judge provider but none was configured".to_string())?;

    let pass_label = params.pass_label.as_deref().unwrap_or("pass").to_lowercase();
    let verdict = judge_verdict(provider, &params.rubric, ctx.response_text)
        .await
        .map_err(|e| format!("judge call failed: {e}"))?;

    let passed = verdict.to_lowercase().trim_start().starts_with(&pass_label);
    Ok(outcome(
        passed,
        format!("judge verdict: {verdict}"),
        serde_json::json!({ "rubric": params.rubric, "verdict": verdict }),
    ))
}

async fn judge_verdict(
    provider: &dyn arena_providers::LlmProvider,
    rubric: &str,
    response: &str,
) -> arena_domain::Result<String> {
    let prompt = format!(
        "You are grading an AI assistant's response against a rubric.\n\
         Rubric: {rubric}\n\n\
         Response to grade:\n{response}\n\n\
         Reply with exactly one word, \"pass\" or \"fail\", optionally followed \
         by a one-sentence justification."
    );
    let req = ChatRequest {
        messages: vec![Message::user(prompt)],
        temperature: Some(0.0),
        ..Default::default()
    };
    let resp = provider.chat(req).await?;
    Ok(resp.content)
}

/// `sentiment` / `tone` are implementation-defined (spec §4.5). Default
/// behavior is a small curated lexicon of positive/negative markers; when
/// `params.rubric` is supplied, evaluation routes through `llm_judge`
/// instead, since a free-text rubric is better judged by a model than by
/// a fixed word list.
const POSITIVE_MARKERS: &[&str] = &[
    "great", "happy", "glad", "thanks", "thank you", "excellent", "wonderful", "pleased", "delighted",
];
const NEGATIVE_MARKERS: &[&str] = &[
    "angry", "upset", "terrible", "awful", "disappointed", "frustrated", "sorry", "unacceptable",
];

#[derive(Deserialize, Default)]
struct ToneParams {
    #[serde(default)]
    rubric: Option<String>,
    /// For pattern mode: which polarity must dominate. `"positive"` or
    /// `"negative"`. Defaults to `"positive"`.
    #[serde(default)]
    expect: Option<String>,
}

pub async fn sentiment_or_tone(ctx: &TurnContext<'_>, spec: &AssertionSpec) -> ValidatorResult {
    let params: ToneParams =
        serde_json::from_value(spec.params.clone()).map_err(|e| format!("invalid params for {}: {e}", spec.kind))?;

    if let Some(rubric) = &params.rubric {
        let judge_spec = AssertionSpec {
            kind: "llm_judge".into(),
            params: serde_json::json!({ "rubric": rubric }),
            message: spec.message.clone(),
        };
        return llm_judge(ctx, &judge_spec).await;
    }

    let text = ctx.response_text.to_lowercase();
    let positive_hits = POSITIVE_MARKERS.iter().filter(|m| text.contains(*m)).count();
    let negative_hits = NEGATIVE_MARKERS.iter().filter(|m| text.contains(*m)).count();
    let expect_positive = params.expect.as_deref().unwrap_or("positive") != "negative";

    let passed = if expect_positive {
        positive_hits > negative_hits
    } else {
        negative_hits > positive_hits
    };

    Ok(outcome(
        passed,
        format!("positive_hits={positive_hits} negative_hits={negative_hits} expect={}", if expect_positive { "positive" } else { "negative" }),
        serde_json::json!({ "positive_hits": positive_hits, "negative_hits": negative_hits }),
    ))
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
    async fn sentiment_pattern_mode_detects_positive() {
        let ctx = TurnContext::for_turn("Thank you so much, this is wonderful!", &[]);
        let out = sentiment_or_tone(&ctx, &spec("sentiment", json!({}))).await.unwrap();
        assert!(out.passed);
    }

    #[tokio::test]
    async fn sentiment_pattern_mode_detects_negative_when_expected() {
        let ctx = TurnContext::for_turn("This is terrible and unacceptable.", &[]);
        let out = sentiment_or_tone(&ctx, &spec("sentiment", json!({"expect": "negative"})))
            .await
            .unwrap();
        assert!(out.passed);
    }

    #[tokio::test]
    async fn llm_judge_without_provider_fails_with_message() {
        let ctx = TurnContext::for_turn("some response", &[]);
        let result = llm_judge(&ctx, &spec("llm_judge", json!({"rubric": "is it polite?"}))).await;
        assert!(result.is_err());
    }
}
