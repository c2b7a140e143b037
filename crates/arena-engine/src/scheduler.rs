//! Scheduler / Worker Pool (C8, spec §4.3): enumerates the run matrix and
//! dispatches it to a bounded pool of workers.
//!
//! Grounded on the teacher's `TaskStore` (`runtime/tasks.rs`): a
//! `Semaphore`-bounded concurrency gate around each unit of work, terminal
//! status checks before any mutation, in-memory only (runs are the durable
//! record here, held by the `StateStore`, not the scheduler itself).
//! Cancellation follows `runtime/cancel.rs`'s `CancelToken` shape
//! (`Arc<AtomicBool>` plus a `Notify` so waiters resume promptly) rather
//! than its `CancelMap`, since the scheduler only ever needs one token per
//! `run_all` invocation, not per-session group cascade.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arena_domain::config::{ArenaConfig, RunFilters};
use arena_domain::event::Event;
use arena_domain::model::{RunResult, RunSpec, RunStatus, Scenario};
use tokio::sync::{Notify, Semaphore};

use crate::driver::ConversationDriver;
use crate::event_bus::EventBus;
use crate::state_store::StateStore;

/// Cooperative cancellation signal threaded through every worker (spec
/// §5 "a cooperative cancellation token is threaded through every call").
/// Every suspension point in a run is cancelled the same way: the
/// worker's top-level `select!` races the drive future against
/// `cancelled()` and drops the loser, and dropping a future in flight
/// tears down every `.await` nested inside it — the provider call, the
/// tool call, the embedding call — without each of those call sites
/// needing its own cancellation check.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested; cancellation-safe,
    /// so it can race against other futures in a `select!`.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// Deterministically expands `scenarios x providers x regions` into run
/// specs (spec §4.3 "Expansion"): scenarios outer, providers middle,
/// regions inner, filtered multiplicatively by `filters`. `run_id` is a
/// pure function of the triple, so two expansions over identical inputs
/// produce identical ids (spec §8 "Run matrix expansion" + the dry-run
/// idempotence property).
pub fn expand_matrix(
    scenarios: &[Scenario],
    provider_ids: &[String],
    regions: &[String],
    filters: &RunFilters,
) -> Vec<RunSpec> {
    let mut specs = Vec::new();
    for scenario in scenarios {
        if !filters.allows_scenario(&scenario.id) {
            continue;
        }
        for provider_id in provider_ids {
            if !filters.allows_provider(provider_id) {
                continue;
            }
            for region in regions {
                if !filters.allows_region(region) {
                    continue;
                }
                specs.push(RunSpec {
                    run_id: run_id_for(&scenario.id, provider_id, region),
                    scenario_id: scenario.id.clone(),
                    provider_id: provider_id.clone(),
                    region: region.clone(),
                });
            }
        }
    }
    specs
}

fn run_id_for(scenario_id: &str, provider_id: &str, region: &str) -> String {
    let mut hasher = DefaultHasher::new();
    (scenario_id, provider_id, region).hash(&mut hasher);
    format!("{scenario_id}__{provider_id}__{region}-{:016x}", hasher.finish())
}

/// Builds one `ConversationDriver` per run. The scheduler doesn't know how
/// to construct a `Pipeline` itself (that needs the provider registry,
/// tool executor, context engine, and retry policy the CLI wires up) so
/// it takes a factory closure instead — this keeps the scheduler
/// embeddable independent of how those collaborators are assembled.
pub type DriverFactory = Arc<dyn Fn(&RunSpec) -> Result<ConversationDriver, arena_domain::ArenaError> + Send + Sync>;

pub struct Scheduler {
    state: Arc<StateStore>,
    bus: Arc<EventBus>,
    concurrency: usize,
}

impl Scheduler {
    pub fn new(state: Arc<StateStore>, bus: Arc<EventBus>, concurrency: usize) -> Self {
        Self {
            state,
            bus,
            concurrency: concurrency.max(1),
        }
    }

    pub fn from_config(state: Arc<StateStore>, bus: Arc<EventBus>, config: &ArenaConfig) -> Self {
        Self::new(state, bus, config.parallelism)
    }

    /// Runs the full matrix to completion (or until cancelled/deadline),
    /// returning the finalized snapshot (spec §4.2 `Finalize`). `scenarios`
    /// and `provider_ids` are already resolved by the caller (typically
    /// from `ArenaConfig`); `make_driver` builds a fresh `ConversationDriver`
    /// per run so each worker gets its own `Pipeline` instance.
    pub async fn run_all(
        &self,
        scenarios: &[Scenario],
        provider_ids: &[String],
        regions: &[String],
        filters: &RunFilters,
        make_driver: DriverFactory,
        cancel: CancelToken,
        deadline: Option<Duration>,
    ) -> Vec<RunResult> {
        // Concurrency is capped at the matrix size (spec §4.3 "default =
        // min(parallelism, matrix_size)") so an oversized worker count
        // never outlives the work it has to do.
        let specs = expand_matrix(scenarios, provider_ids, regions, filters);
        let worker_count = self.concurrency.min(specs.len().max(1));
        let semaphore = Arc::new(Semaphore::new(worker_count));

        if let Ok(ids) = self.state.create_runs(&specs) {
            debug_assert_eq!(ids.len(), specs.len());
        }
        for spec in &specs {
            self.bus.publish(Event::RunQueued {
                run_id: spec.run_id.clone(),
                scenario_id: spec.scenario_id.clone(),
                provider_id: spec.provider_id.clone(),
                region: spec.region.clone(),
            });
        }

        let scenario_by_id: std::collections::HashMap<&str, &Scenario> =
            scenarios.iter().map(|s| (s.id.as_str(), s)).collect();

        let deadline_fut = async move {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_fut);

        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            if cancel.is_cancelled() {
                self.fail_cancelled(&spec.run_id);
                continue;
            }
            let Some(scenario) = scenario_by_id.get(spec.scenario_id.as_str()).copied().cloned() else {
                self.fail_config_error(&spec.run_id, "no scenario matches this run's scenario_id");
                continue;
            };

            let semaphore = semaphore.clone();
            let state = self.state.clone();
            let bus = self.bus.clone();
            let cancel = cancel.clone();
            let make_driver = make_driver.clone();
            let run_id = spec.run_id.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if cancel.is_cancelled() {
                    fail_run(&state, &bus, &run_id, "cancelled", "run cancelled before dispatch");
                    return;
                }

                let _ = state.update_run(&run_id, |r| r.status = RunStatus::Running);

                let driver = match make_driver(&spec) {
                    Ok(d) => d,
                    Err(e) => {
                        fail_run(&state, &bus, &run_id, e.kind(), &e.to_string());
                        return;
                    }
                };

                tokio::select! {
                    outcome = driver.drive(&run_id, &scenario) => {
                        let _ = state.update_run(&run_id, |r| {
                            r.status = if outcome.error.is_some() { RunStatus::Failed } else { RunStatus::Completed };
                            r.finished_at = Some(chrono::Utc::now());
                            r.duration_ms = (r.finished_at.unwrap() - r.started_at).num_milliseconds().max(0) as u64;
                            r.cost = outcome.cost;
                            r.turn_results = outcome.turn_results;
                            r.assertions_summary = outcome.assertions;
                            r.error = outcome.error;
                        });
                    }
                    _ = cancel.cancelled() => {
                        fail_run(&state, &bus, &run_id, "Cancelled", "run cancelled while in flight");
                    }
                }
            }));
        }

        // Race the whole dispatch loop against the global deadline: once
        // it fires, every remaining/in-flight run is rolled up as
        // cancelled (spec §5 "a global deadline... MUST unblock all
        // workers within bounded time").
        tokio::select! {
            _ = futures_util::future::join_all(handles) => {}
            _ = &mut deadline_fut => {
                cancel.cancel();
            }
        }

        // Anything still pending after the dispatch loop above (filtered
        // out before a worker was ever spawned, or orphaned by a deadline
        // that fired mid-dispatch) is drained here so no run is left
        // non-terminal (spec §8 "no run remains pending or running after
        // scheduler drain").
        for run in self.state.all_runs() {
            if !run.status.is_terminal() {
                self.fail_cancelled(&run.run_id);
            }
        }

        self.state.finalize()
    }

    fn fail_cancelled(&self, run_id: &str) {
        fail_run(&self.state, &self.bus, run_id, "Cancelled", "run cancelled");
    }

    fn fail_config_error(&self, run_id: &str, message: &str) {
        fail_run(&self.state, &self.bus, run_id, "ConfigInvalid", message);
    }
}

fn fail_run(state: &StateStore, bus: &EventBus, run_id: &str, kind: &str, message: &str) {
    let _ = state.update_run(run_id, |r| {
        if r.status == RunStatus::Pending {
            r.status = RunStatus::Running;
        }
    });
    let _ = state.update_run(run_id, |r| {
        r.status = RunStatus::Failed;
        r.finished_at = Some(chrono::Utc::now());
        r.error = Some(arena_domain::model::RunError {
            kind: kind.to_string(),
            message: message.to_string(),
            is_assertion_failure: false,
        });
    });
    bus.publish(Event::RunFailed {
        run_id: run_id.to_string(),
        error_kind: kind.to_string(),
        message: message.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_domain::model::{ContextPolicySpec, ScenarioTurn, TurnContent, TurnRole};
    use arena_domain::tool_descriptor::ToolPolicy;
    use arena_providers::mock::MockProvider;
    use arena_tools::{ToolExecutor, ToolRegistry};
    use std::sync::Arc as StdArc;

    fn scenario(id: &str) -> Scenario {
        Scenario {
            id: id.into(),
            turns: vec![ScenarioTurn {
                role: TurnRole::User,
                content: TurnContent::Text("hi".into()),
                assertions: Vec::new(),
            }],
            context_policy: None::<ContextPolicySpec>,
            duplex: None,
            streaming: false,
            assertions: Vec::new(),
            fixtures: Default::default(),
        }
    }

    fn mock_driver_factory(bus: Arc<EventBus>) -> DriverFactory {
        StdArc::new(move |spec: &RunSpec| {
            let provider_spec = arena_domain::model::ProviderSpec {
                id: spec.provider_id.clone(),
                kind: arena_domain::model::ProviderType::Mock,
                model: "mock-1".into(),
                base_url: None,
                credential_env: None,
                default_params: Default::default(),
                pricing: Default::default(),
                supports_streaming: false,
                tool_dialect: None,
                mock: None,
            };
            let provider = StdArc::new(MockProvider::from_spec(&provider_spec));
            let executor = StdArc::new(ToolExecutor::new(ToolRegistry::new(), None));
            let pipeline = crate::pipeline::Pipeline::new(
                provider,
                executor,
                ToolPolicy::default(),
                StdArc::new(arena_context::ContextPolicyEngine::new()),
            );
            Ok(ConversationDriver::new(pipeline, bus.clone()))
        })
    }

    #[test]
    fn expand_matrix_is_the_cartesian_product() {
        let scenarios = vec![scenario("a"), scenario("b")];
        let providers = vec!["p1".to_string(), "p2".to_string()];
        let regions = vec!["r1".to_string()];
        let specs = expand_matrix(&scenarios, &providers, &regions, &RunFilters::default());
        assert_eq!(specs.len(), 4);
    }

    #[test]
    fn expand_matrix_order_is_scenarios_outer_providers_middle_regions_inner() {
        let scenarios = vec![scenario("a"), scenario("b")];
        let providers = vec!["p1".to_string(), "p2".to_string()];
        let regions = vec!["r1".to_string(), "r2".to_string()];
        let specs = expand_matrix(&scenarios, &providers, &regions, &RunFilters::default());
        let tuples: Vec<(String, String, String)> = specs
            .iter()
            .map(|s| (s.scenario_id.clone(), s.provider_id.clone(), s.region.clone()))
            .collect();
        assert_eq!(
            tuples,
            vec![
                ("a".into(), "p1".into(), "r1".into()),
                ("a".into(), "p1".into(), "r2".into()),
                ("a".into(), "p2".into(), "r1".into()),
                ("a".into(), "p2".into(), "r2".into()),
                ("b".into(), "p1".into(), "r1".into()),
                ("b".into(), "p1".into(), "r2".into()),
                ("b".into(), "p2".into(), "r1".into()),
                ("b".into(), "p2".into(), "r2".into()),
            ]
        );
    }

    #[test]
    fn run_id_is_deterministic_across_expansions() {
        let scenarios = vec![scenario("a")];
        let providers = vec!["p1".to_string()];
        let regions = vec!["r1".to_string()];
        let first = expand_matrix(&scenarios, &providers, &regions, &RunFilters::default());
        let second = expand_matrix(&scenarios, &providers, &regions, &RunFilters::default());
        assert_eq!(first[0].run_id, second[0].run_id);
    }

    #[test]
    fn filters_restrict_the_expansion_multiplicatively() {
        let scenarios = vec![scenario("a"), scenario("b")];
        let providers = vec!["p1".to_string(), "p2".to_string()];
        let regions = vec!["r1".to_string()];
        let filters = RunFilters {
            scenarios: vec!["a".into()],
            providers: vec![],
            regions: vec![],
        };
        let specs = expand_matrix(&scenarios, &providers, &regions, &filters);
        assert_eq!(specs.len(), 2);
        assert!(specs.iter().all(|s| s.scenario_id == "a"));
    }

    #[tokio::test]
    async fn run_all_drives_every_run_to_a_terminal_status() {
        let state = Arc::new(StateStore::new());
        let bus = Arc::new(EventBus::new(64));
        let scheduler = Scheduler::new(state.clone(), bus.clone(), 2);
        let scenarios = vec![scenario("greet")];
        let providers = vec!["mock".to_string()];
        let regions = vec!["r1".to_string()];

        let results = scheduler
            .run_all(
                &scenarios,
                &providers,
                &regions,
                &RunFilters::default(),
                mock_driver_factory(bus.clone()),
                CancelToken::new(),
                None,
            )
            .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].status.is_terminal());
    }

    #[tokio::test]
    async fn run_all_with_an_already_cancelled_token_marks_every_run_cancelled() {
        let state = Arc::new(StateStore::new());
        let bus = Arc::new(EventBus::new(64));
        let scheduler = Scheduler::new(state.clone(), bus.clone(), 2);
        let scenarios = vec![scenario("a"), scenario("b")];
        let providers = vec!["mock".to_string()];
        let regions = vec!["r1".to_string()];

        let cancel = CancelToken::new();
        cancel.cancel();

        let results = scheduler
            .run_all(
                &scenarios,
                &providers,
                &regions,
                &RunFilters::default(),
                mock_driver_factory(bus.clone()),
                cancel,
                None,
            )
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == RunStatus::Failed));
        assert!(results
            .iter()
            .all(|r| r.error.as_ref().unwrap().kind == "Cancelled"));
    }

    #[test]
    fn cancel_token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
