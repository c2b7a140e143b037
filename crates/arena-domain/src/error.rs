/// Crate-wide error taxonomy (spec §7). Every failure the engine surfaces
/// — in `run_result.error`, in event payloads, in JUnit `<failure>` vs
/// `<error>` — is one of these variants. `retryable()` is the single
/// source of truth the scheduler's retry loop and the provider router
/// consult; no other code should re-derive "is this worth retrying".
#[derive(thiserror::Error, Debug)]
pub enum ArenaError {
    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("provider transient error ({provider}): {message}")]
    ProviderTransient { provider: String, message: String },

    #[error("provider permanent error ({provider}): {message}")]
    ProviderPermanent { provider: String, message: String },

    #[error("tool error ({tool_name}): {message}")]
    ToolError { tool_name: String, message: String },

    #[error("assertion failed: {0}")]
    AssertionFailure(String),

    #[error("duplex session interrupted: {0}")]
    SessionInterrupted(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, ArenaError>;

impl ArenaError {
    /// Whether the scheduler's retry loop (spec §4.3) should retry the
    /// call that produced this error. Only provider-transient errors and
    /// bare timeouts are retryable; everything else fails the run (or the
    /// turn) immediately.
    pub fn retryable(&self) -> bool {
        matches!(self, ArenaError::ProviderTransient { .. } | ArenaError::Timeout(_))
    }

    /// The taxonomy "kind" name used in machine-readable `results.json`
    /// output and JUnit tag selection (`<failure>` for assertion-shaped
    /// errors, `<error>` for everything else).
    pub fn kind(&self) -> &'static str {
        match self {
            ArenaError::ConfigInvalid(_) => "ConfigInvalid",
            ArenaError::ProviderTransient { .. } => "ProviderTransient",
            ArenaError::ProviderPermanent { .. } => "ProviderPermanent",
            ArenaError::ToolError { .. } => "ToolError",
            ArenaError::AssertionFailure(_) => "AssertionFailure",
            ArenaError::SessionInterrupted(_) => "SessionInterrupted",
            ArenaError::Cancelled => "Cancelled",
            ArenaError::Internal(_) => "Internal",
            ArenaError::Io(_) => "Internal",
            ArenaError::Json(_) => "Internal",
            ArenaError::Http(_) => "ProviderTransient",
            ArenaError::Timeout(_) => "ProviderTransient",
        }
    }

    /// Is this an assertion-shaped failure (JUnit `<failure>`) as opposed
    /// to an execution failure (JUnit `<error>`)?
    pub fn is_assertion_failure(&self) -> bool {
        matches!(self, ArenaError::AssertionFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_transient_is_retryable() {
        let e = ArenaError::ProviderTransient {
            provider: "openai".into(),
            message: "429".into(),
        };
        assert!(e.retryable());
    }

    #[test]
    fn provider_permanent_is_not_retryable() {
        let e = ArenaError::ProviderPermanent {
            provider: "openai".into(),
            message: "401".into(),
        };
        assert!(!e.retryable());
    }

    #[test]
    fn cancelled_is_not_retryable() {
        assert!(!ArenaError::Cancelled.retryable());
    }

    #[test]
    fn timeout_is_retryable() {
        assert!(ArenaError::Timeout("deadline exceeded".into()).retryable());
    }

    #[test]
    fn assertion_failure_kind_is_failure_not_error() {
        let e = ArenaError::AssertionFailure("pattern not found".into());
        assert!(e.is_assertion_failure());
        assert_eq!(e.kind(), "AssertionFailure");
    }

    #[test]
    fn tool_error_is_not_retryable_by_default() {
        let e = ArenaError::ToolError {
            tool_name: "search".into(),
            message: "boom".into(),
        };
        assert!(!e.retryable());
    }
}
