//! Provider registry.
//!
//! Constructs and holds all configured provider instances. At startup the
//! registry reads `ArenaConfig::providers`, resolves authentication (env
//! vars), and instantiates the appropriate adapter for each `ProviderSpec`.

use crate::anthropic::AnthropicProvider;
use crate::google::GoogleProvider;
use crate::mock::MockProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;
use arena_domain::model::{ProviderSpec, ProviderType};
use arena_domain::{ArenaError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Startup policy for provider initialization failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupPolicy {
    /// Boot even if zero providers initialize; runs against the missing
    /// provider fail individually with `ProviderPermanent`.
    #[default]
    AllowNone,
    /// Abort startup if no providers successfully initialize.
    RequireOne,
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    init_errors: Vec<ProviderInitError>,
}

#[derive(Debug, Clone)]
pub struct ProviderInitError {
    pub provider_id: String,
    pub kind: String,
    pub error: String,
}

/// Mask substrings that look like API keys or bearer tokens in an error
/// message so raw secrets never leak into logs or `results.json`.
pub fn mask_secrets(msg: &str) -> String {
    let mut result = msg.to_string();
    for word in msg.split(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == ',') {
        let trimmed = word.trim();
        if trimmed.len() >= 20
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            let masked = if trimmed.len() > 8 {
                format!("{}...{}", &trimmed[..4], &trimmed[trimmed.len() - 4..])
            } else {
                "***masked***".to_string()
            };
            result = result.replace(trimmed, &masked);
        }
    }
    result
}

impl ProviderRegistry {
    /// Build the registry from `ArenaConfig::providers`. `force_mock`
    /// corresponds to the `ARENA_MOCK=1` environment variable (spec §6):
    /// when set, every provider is instantiated as a `MockProvider`
    /// regardless of its configured `type`.
    pub fn from_config(
        specs: &[ProviderSpec],
        force_mock: bool,
        policy: StartupPolicy,
    ) -> Result<Self> {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        let mut init_errors: Vec<ProviderInitError> = Vec::new();

        for spec in specs {
            let result: Result<Arc<dyn LlmProvider>> = if force_mock || spec.kind == ProviderType::Mock {
                Ok(Arc::new(MockProvider::from_spec(spec)) as Arc<dyn LlmProvider>)
            } else {
                match spec.kind {
                    ProviderType::Openai => OpenAiCompatProvider::from_spec(spec)
                        .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                    ProviderType::Claude => AnthropicProvider::from_spec(spec)
                        .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                    ProviderType::Gemini => GoogleProvider::from_spec(spec)
                        .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                    ProviderType::Mock => unreachable!("handled above"),
                }
            };

            match result {
                Ok(provider) => {
                    tracing::info!(provider_id = %spec.id, kind = ?spec.kind, "registered provider");
                    providers.insert(spec.id.clone(), provider);
                }
                Err(e) => {
                    let safe_error = mask_secrets(&e.to_string());
                    tracing::warn!(
                        provider_id = %spec.id,
                        kind = ?spec.kind,
                        error = %safe_error,
                        "failed to initialize provider, skipping"
                    );
                    init_errors.push(ProviderInitError {
                        provider_id: spec.id.clone(),
                        kind: format!("{:?}", spec.kind),
                        error: safe_error,
                    });
                }
            }
        }

        if providers.is_empty() && !specs.is_empty() && policy == StartupPolicy::RequireOne {
            return Err(ArenaError::ConfigInvalid(
                "all configured providers failed to initialize (startup policy = require_one)"
                    .into(),
            ));
        }

        Ok(Self {
            providers,
            init_errors,
        })
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(provider_id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn LlmProvider>)> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn list_providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn init_errors(&self) -> &[ProviderInitError] {
        &self.init_errors
    }
}
