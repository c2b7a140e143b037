//! `content_includes` / `content_not_includes` / `content_matches`.

use arena_domain::model::AssertionSpec;
use serde::Deserialize;

use crate::{outcome, TurnContext, ValidatorResult};

#[derive(Deserialize)]
struct PatternsParams {
    patterns: Vec<String>,
    #[serde(default)]
    case_sensitive: bool,
}

fn parse_patterns(spec: &AssertionSpec) -> Result<PatternsParams, String> {
    serde_json::from_value(spec.params.clone())
        .map_err(|e| format!("invalid params for pattern validator: {e}"))
}

pub fn content_includes(ctx: &TurnContext<'_>, spec: &AssertionSpec) -> ValidatorResult {
    let params = parse_patterns(spec)?;
    let haystack = normalize(ctx.response_text, params.case_sensitive);
    let missing: Vec<&String> = params
        .patterns
        .iter()
        .filter(|p| !haystack.contains(&normalize(p, params.case_sensitive)))
        .collect();
    if missing.is_empty() {
        Ok(outcome(true, "all patterns present", serde_json::Value::Null))
    } else {
        Ok(outcome(
            false,
            format!("missing pattern: {:?}", missing[0]),
            serde_json::json!({ "missing": missing }),
        ))
    }
}

pub fn content_not_includes(ctx: &TurnContext<'_>, spec: &AssertionSpec) -> ValidatorResult {
    let params = parse_patterns(spec)?;
    let haystack = normalize(ctx.response_text, params.case_sensitive);
    let present: Vec<&String> = params
        .patterns
        .iter()
        .filter(|p| haystack.contains(&normalize(p, params.case_sensitive)))
        .collect();
    if present.is_empty() {
        Ok(outcome(true, "no forbidden patterns present", serde_json::Value::Null))
    } else {
        Ok(outcome(
            false,
            format!("forbidden pattern present: {:?}", present[0]),
            serde_json::json!({ "present": present }),
        ))
    }
}

fn normalize(s: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        s.to_string()
    } else {
        s.to_lowercase()
    }
}

#[derive(Deserialize)]
struct RegexParams {
    pattern: String,
}

/// `content_matches` uses the `regex` crate: a language-agnostic subset of
/// PCRE (no backreferences, no lookaround/lookahead, no recursion) —
/// documented here since the spec leaves the exact dialect open.
pub fn content_matches(ctx: &TurnContext<'_>, spec: &AssertionSpec) -> ValidatorResult {
    let params: RegexParams =
        serde_json::from_value(spec.params.clone()).map_err(|e| format!("invalid params for content_matches: {e}"))?;
    let re = regex::Regex::new(&params.pattern).map_err(|e| format!("invalid regex `{}`: {e}", params.pattern))?;
    if re.is_match(ctx.response_text) {
        Ok(outcome(true, "pattern matched", serde_json::Value::Null))
    } else {
        Ok(outcome(
            false,
            format!("response did not match /{}/", params.pattern),
            serde_json::Value::Null,
        ))
    }
}
