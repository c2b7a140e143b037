use serde::Serialize;

/// A tagged union of lifecycle facts fanned out by the Event Bus (spec
/// §4.1). Ephemeral — the bus never persists these; the State Store is
/// where any required derived state lives. Every run-scoped variant
/// carries `run_id` so a subscriber can group a run's events without
/// replaying the whole stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum Event {
    RunQueued {
        run_id: String,
        scenario_id: String,
        provider_id: String,
        region: String,
    },
    RunStarted {
        run_id: String,
    },
    TurnStarted {
        run_id: String,
        turn_index: usize,
    },
    AssistantResponse {
        run_id: String,
        turn_index: usize,
        text_chars: usize,
        tool_call_count: usize,
    },
    ToolCalled {
        run_id: String,
        call_id: String,
        tool_name: String,
    },
    ToolResolved {
        run_id: String,
        call_id: String,
        is_error: bool,
    },
    AssertionEvaluated {
        run_id: String,
        turn_index: Option<usize>,
        assertion_type: String,
        passed: bool,
    },
    RunCompleted {
        run_id: String,
        assertions_total: u32,
        assertions_passed: u32,
        total_cost: f64,
    },
    RunFailed {
        run_id: String,
        error_kind: String,
        message: String,
    },
    LogEmitted {
        run_id: Option<String>,
        level: String,
        message: String,
    },
    /// Emitted on a subscriber's own bounded queue when an overflow forced
    /// drop-oldest eviction (spec §4.1). Never drops silently.
    SubscriberLagged {
        subscriber_id: u64,
        dropped_count: u64,
    },
}

impl Event {
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Event::RunQueued { run_id, .. }
            | Event::RunStarted { run_id }
            | Event::TurnStarted { run_id, .. }
            | Event::AssistantResponse { run_id, .. }
            | Event::ToolCalled { run_id, .. }
            | Event::ToolResolved { run_id, .. }
            | Event::AssertionEvaluated { run_id, .. }
            | Event::RunCompleted { run_id, .. }
            | Event::RunFailed { run_id, .. } => Some(run_id),
            Event::LogEmitted { run_id, .. } => run_id.as_deref(),
            Event::SubscriberLagged { .. } => None,
        }
    }

    pub fn emit_trace(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(event = %json, "arena_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_extracted_for_run_scoped_events() {
        let e = Event::RunStarted {
            run_id: "r1".into(),
        };
        assert_eq!(e.run_id(), Some("r1"));
    }

    #[test]
    fn run_id_none_for_subscriber_lagged() {
        let e = Event::SubscriberLagged {
            subscriber_id: 1,
            dropped_count: 3,
        };
        assert_eq!(e.run_id(), None);
    }

    #[test]
    fn log_emitted_run_id_is_optional() {
        let e = Event::LogEmitted {
            run_id: None,
            level: "info".into(),
            message: "hello".into(),
        };
        assert_eq!(e.run_id(), None);
    }
}
