//! Shared utility functions for provider adapters.

use arena_domain::{ArenaError, Result};

/// Convert a [`reqwest::Error`] into the domain [`ArenaError`] type.
///
/// Timeout errors map to [`ArenaError::Timeout`]; everything else maps to
/// [`ArenaError::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> ArenaError {
    if e.is_timeout() {
        ArenaError::Timeout(e.to_string())
    } else {
        ArenaError::Http(e.to_string())
    }
}

/// Resolve the API key from a provider spec's `credential_env` field.
///
/// `credential_env` names an environment variable; it is read eagerly at
/// provider-construction time. A missing field or unset variable is a
/// config error.
pub fn resolve_api_key(provider_id: &str, credential_env: &Option<String>) -> Result<String> {
    let env_var = credential_env.as_deref().ok_or_else(|| {
        ArenaError::ConfigInvalid(format!(
            "provider '{provider_id}': 'credential_env' is required for non-mock providers"
        ))
    })?;
    std::env::var(env_var).map_err(|_| {
        ArenaError::ConfigInvalid(format!(
            "provider '{provider_id}': environment variable '{env_var}' not set or not valid UTF-8"
        ))
    })
}

/// Classify an HTTP response as a transient or permanent provider error.
/// 429 (rate limit) and 5xx are retryable; other 4xx are not (spec §4.3).
pub(crate) fn classify_http_error(provider_id: &str, status: u16, body: &str) -> ArenaError {
    let message = format!("HTTP {status} - {body}");
    if status == 429 || (500..600).contains(&status) {
        ArenaError::ProviderTransient {
            provider: provider_id.to_string(),
            message,
        }
    } else {
        ArenaError::ProviderPermanent {
            provider: provider_id.to_string(),
            message,
        }
    }
}
