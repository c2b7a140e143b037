//! `arena run` (spec §6): loads the config, builds the engine's
//! collaborators (provider registry, tool executor, context engine), runs
//! the full matrix to completion, and writes the requested report
//! artifacts to `output_dir`.

use std::path::PathBuf;
use std::sync::Arc;

use arena_domain::config::ArenaConfig;
use arena_domain::model::RunSpec;
use arena_engine::scheduler::{CancelToken, DriverFactory};
use arena_engine::{aggregator, EventBus, Scheduler, StateStore};
use arena_providers::registry::{ProviderRegistry, StartupPolicy};
use arena_providers::retry::RetryPolicy;
use arena_tools::{ToolExecutor, ToolRegistry};

use super::{load_config, mock_env_override, parallelism_env_override, RunArgs};

pub async fn run(args: RunArgs) -> i32 {
    let mut config = match load_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return 2;
        }
    };

    apply_cli_overrides(&mut config, &args);

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            arena_domain::config::ConfigSeverity::Warning => eprintln!("warn: {issue}"),
            arena_domain::config::ConfigSeverity::Error => eprintln!("error: {issue}"),
        }
    }
    if ArenaConfig::has_errors(&issues) {
        return 2;
    }

    let force_mock = config.mock || mock_env_override();
    let registry = match ProviderRegistry::from_config(&config.providers, force_mock, StartupPolicy::RequireOne) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {e}");
            return 2;
        }
    };
    for init_err in registry.init_errors() {
        eprintln!(
            "warn: provider `{}` ({}) failed to initialize: {}",
            init_err.provider_id, init_err.kind, init_err.error
        );
    }

    let mcp_manager = Arc::new(arena_mcp::McpManager::from_config(&config.mcp).await);
    let tool_registry = ToolRegistry::from_descriptors(config.tools.clone());
    let tool_executor = Arc::new(ToolExecutor::new(
        tool_registry,
        if mcp_manager.is_empty() { None } else { Some(mcp_manager) },
    ));
    let context_engine = Arc::new(arena_context::ContextPolicyEngine::new());
    let retry_policy = RetryPolicy::from(&config.retry);

    let state = Arc::new(StateStore::new());
    let bus = Arc::new(EventBus::new(1024));
    let scheduler = Scheduler::from_config(state.clone(), bus.clone(), &config);

    let progress_rx = (!args.ci).then(|| bus.subscribe(Some(256)));
    let progress_handle = progress_rx.map(spawn_progress_printer);

    // The matrix is expanded over every *configured* provider id, not just
    // the ones that successfully initialized (spec §4.3) — a provider that
    // failed to initialize still produces a run, it just fails that run
    // with `ProviderPermanent` instead of silently shrinking the matrix.
    let provider_ids: Vec<String> = config.providers.iter().map(|p| p.id.clone()).collect();
    let cancel = CancelToken::new();
    let cancel_for_ctrlc = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_for_ctrlc.cancel();
        }
    });

    let make_driver = build_driver_factory(
        config.judge_provider.clone(),
        registry,
        tool_executor,
        config.tool_policy.clone(),
        context_engine,
        retry_policy,
        bus.clone(),
    );

    let results = scheduler
        .run_all(
            &config.scenarios,
            &provider_ids,
            &config.regions,
            &config.filters,
            make_driver,
            cancel,
            None,
        )
        .await;

    if let Some(handle) = progress_handle {
        handle.abort();
    }

    write_reports(&config.output_dir, args.junit_file.clone().or(config.junit_output.clone()), &args.format, &results)
}

fn apply_cli_overrides(config: &mut ArenaConfig, args: &RunArgs) {
    if !args.scenarios.is_empty() {
        config.filters.scenarios = args.scenarios.clone();
    }
    if !args.providers.is_empty() {
        config.filters.providers = args.providers.clone();
    }
    if !args.regions.is_empty() {
        config.filters.regions = args.regions.clone();
    }
    if let Some(out) = &args.out {
        config.output_dir = out.clone();
    }
    if let Some(p) = parallelism_env_override().or(args.parallelism) {
        config.parallelism = p;
    }
}

/// Builds the per-run `ConversationDriver` factory the scheduler calls once
/// per dispatched run spec. Each run gets its own `Pipeline` instance (the
/// provider/context-engine/tool-executor handles are cheaply cloned
/// `Arc`s; only the driver/pipeline wrapper is fresh per run).
#[allow(clippy::too_many_arguments)]
fn build_driver_factory(
    judge_provider_id: Option<String>,
    registry: ProviderRegistry,
    tool_executor: Arc<ToolExecutor>,
    tool_policy: arena_domain::tool_descriptor::ToolPolicy,
    context_engine: Arc<arena_context::ContextPolicyEngine>,
    retry_policy: RetryPolicy,
    bus: Arc<EventBus>,
) -> DriverFactory {
    let registry = Arc::new(registry);

    Arc::new(move |spec: &RunSpec| {
        let provider = registry.get(&spec.provider_id).ok_or_else(|| arena_domain::ArenaError::ProviderPermanent {
            provider: spec.provider_id.clone(),
            message: "no provider registered for this id".into(),
        })?;

        let mut pipeline =
            arena_engine::pipeline::Pipeline::new(provider, tool_executor.clone(), tool_policy.clone(), context_engine.clone())
                .with_retry_policy(retry_policy.clone());

        let judge_id = judge_provider_id.as_deref().unwrap_or(&spec.provider_id);
        if let Some(judge) = registry.get(judge_id) {
            pipeline = pipeline.with_judge_provider(judge);
        }

        // Any provider advertising embedding support can serve relevance
        // truncation; the run's own provider is the natural default since
        // it is already authenticated and live.
        if let Some(embed) = registry.get(&spec.provider_id) {
            pipeline = pipeline.with_embedding_provider(embed);
        }

        let driver = arena_engine::driver::ConversationDriver::new(pipeline, bus.clone());

        // Selfplay turns reuse the same Pipeline machinery with a persona
        // system prompt instead of the assistant-under-test's; built from
        // the same provider since the spec's persona generator is "a
        // second Pipeline instance", not a distinct endpoint (spec §4.7).
        let driver = if let Some(provider) = registry.get(&spec.provider_id) {
            let persona_pipeline = arena_engine::pipeline::Pipeline::new(
                provider,
                tool_executor.clone(),
                tool_policy.clone(),
                context_engine.clone(),
            )
            .with_retry_policy(retry_policy.clone());
            driver.with_persona_pipeline(persona_pipeline)
        } else {
            driver
        };

        Ok(driver)
    })
}

fn spawn_progress_printer(mut rx: arena_engine::EventReceiver) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = rx.recv().await;
            print_progress_line(&event);
        }
    })
}

fn print_progress_line(event: &arena_domain::event::Event) {
    use arena_domain::event::Event as E;
    match event {
        E::RunCompleted { run_id, assertions_passed, assertions_total, total_cost } => {
            eprintln!("ok   {run_id} assertions={assertions_passed}/{assertions_total} cost=${total_cost:.4}");
        }
        E::RunFailed { run_id, error_kind, message } => {
            eprintln!("fail {run_id} [{error_kind}] {message}");
        }
        E::SubscriberLagged { dropped_count, .. } => {
            eprintln!("warn progress stream dropped {dropped_count} event(s)");
        }
        _ => {}
    }
}

fn write_reports(
    output_dir: &std::path::Path,
    junit_file: Option<PathBuf>,
    formats: &str,
    results: &[arena_domain::model::RunResult],
) -> i32 {
    if let Err(e) = std::fs::create_dir_all(output_dir) {
        eprintln!("error: creating output dir {}: {e}", output_dir.display());
        return 2;
    }

    let wants = |name: &str| formats.split(',').map(str::trim).any(|f| f.eq_ignore_ascii_case(name));
    let index = aggregator::ReportIndex::build(results);

    if wants("json") {
        let index_path = output_dir.join("index.json");
        if let Err(e) = write_json(&index_path, &index) {
            eprintln!("error: writing {}: {e}", index_path.display());
            return 2;
        }

        let detail = aggregator::ReportDetail::build(results);
        let detail_path = output_dir.join("results.json");
        if let Err(e) = write_json(&detail_path, &detail) {
            eprintln!("error: writing {}: {e}", detail_path.display());
            return 2;
        }
    }

    if wants("junit") {
        let xml = aggregator::render_junit_xml(results);
        let path = junit_file.unwrap_or_else(|| output_dir.join("junit.xml"));
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&path, xml) {
            eprintln!("error: writing {}: {e}", path.display());
            return 2;
        }
    }

    if wants("html") {
        // `report.html` is an external collaborator's job (spec §1, §6);
        // the engine only guarantees `index.json`/`results.json` are
        // present for it to read.
        eprintln!("note: html report rendering is an external collaborator (spec §1); skipping");
    }

    println!(
        "{} run(s): {} successful, {} errored, total cost ${:.4}",
        index.total_runs, index.successful, index.errors, index.total_cost
    );

    if index.all_passed() {
        0
    } else {
        1
    }
}

fn write_json<T: serde::Serialize>(path: &std::path::Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(value).expect("report types always serialize");
    std::fs::write(path, json)
}
