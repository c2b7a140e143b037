use serde::{Deserialize, Serialize};

/// Every pack file — scenario, provider, prompt, persona, tool — shares
/// this envelope (spec §6). The loader (out of scope here) deserializes
/// YAML/JSON text into `ApiDocument<T>`; the core only ever sees the
/// typed `spec` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDocument<T> {
    pub api_version: String,
    pub kind: Kind,
    pub metadata: Metadata,
    pub spec: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    Arena,
    Scenario,
    Provider,
    Prompt,
    Persona,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub labels: std::collections::HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_roundtrips_through_json() {
        let doc = ApiDocument {
            api_version: "v1".into(),
            kind: Kind::Scenario,
            metadata: Metadata {
                name: "greet".into(),
                labels: Default::default(),
            },
            spec: serde_json::json!({"turns": []}),
        };
        let s = serde_json::to_string(&doc).unwrap();
        let back: ApiDocument<serde_json::Value> = serde_json::from_str(&s).unwrap();
        assert_eq!(back.metadata.name, "greet");
        assert_eq!(back.kind, Kind::Scenario);
    }
}
