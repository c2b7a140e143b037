//! `is_valid_json` / `json_schema` / `json_path`.

use arena_domain::model::AssertionSpec;
use jmespath::ToJmespath;
use serde::Deserialize;

use crate::{outcome, TurnContext, ValidatorResult};

pub fn is_valid_json(ctx: &TurnContext<'_>, _spec: &AssertionSpec) -> ValidatorResult {
    match serde_json::from_str::<serde_json::Value>(ctx.response_text) {
        Ok(_) => Ok(outcome(true, "response is valid JSON", serde_json::Value::Null)),
        Err(e) => Ok(outcome(false, format!("response is not valid JSON: {e}"), serde_json::Value::Null)),
    }
}

#[derive(Deserialize)]
struct SchemaParams {
    schema: serde_json::Value,
}

/// Parses the response as JSON, then validates it against `params.schema`
/// with the `jsonschema` crate. Failure details name the first schema
/// violation's instance path (spec §4.5 "identify ... the JSON-Schema
/// error path").
pub fn json_schema(ctx: &TurnContext<'_>, spec: &AssertionSpec) -> ValidatorResult {
    let params: SchemaParams =
        serde_json::from_value(spec.params.clone()).map_err(|e| format!("invalid params for json_schema: {e}"))?;

    let instance: serde_json::Value = match serde_json::from_str(ctx.response_text) {
        Ok(v) => v,
        Err(e) => return Ok(outcome(false, format!("response is not valid JSON: {e}"), serde_json::Value::Null)),
    };

    let compiled = jsonschema::JSONSchema::compile(&params.schema)
        .map_err(|e| format!("invalid json_schema params.schema: {e}"))?;

    match compiled.validate(&instance) {
        Ok(()) => Ok(outcome(true, "response validates against schema", serde_json::Value::Null)),
        Err(errors) => {
            let details: Vec<serde_json::Value> = errors
                .map(|e| serde_json::json!({ "path": e.instance_path.to_string(), "message": e.to_string() }))
                .collect();
            let first_path = details
                .first()
                .and_then(|d| d.get("path"))
                .and_then(|p| p.as_str())
                .unwrap_or("<root>")
                .to_string();
            Ok(outcome(
                false,
                format!("schema violation at `{first_path}`"),
                serde_json::json!({ "errors": details }),
            ))
        }
    }
}

#[derive(Deserialize)]
struct JsonPathParams {
    expression: String,
}

/// `json_path` uses JMESPath as the concrete expression dialect (the spec
/// allows either JSONPath or JMESPath and leaves the choice to the
/// implementation — documented as the `json_path` dialect here).
pub fn json_path(ctx: &TurnContext<'_>, spec: &AssertionSpec) -> ValidatorResult {
    let params: JsonPathParams =
        serde_json::from_value(spec.params.clone()).map_err(|e| format!("invalid params for json_path: {e}"))?;

    let instance: serde_json::Value = match serde_json::from_str(ctx.response_text) {
        Ok(v) => v,
        Err(e) => return Ok(outcome(false, format!("response is not valid JSON: {e}"), serde_json::Value::Null)),
    };

    let expr = jmespath::compile(&params.expression)
        .map_err(|e| format!("invalid json_path expression `{}`: {e}", params.expression))?;
    let var = instance
        .to_jmespath()
        .map_err(|e| format!("failed to convert response to jmespath data: {e}"))?;
    let result = expr
        .search(var)
        .map_err(|e| format!("json_path evaluation failed: {e}"))?;

    if result.is_null() {
        Ok(outcome(
            false,
            format!("expression `{}` evaluated to null", params.expression),
            serde_json::Value::Null,
        ))
    } else {
        Ok(outcome(true, "expression evaluated to a non-null value", serde_json::Value::Null))
    }
}
