pub mod config;
pub mod run;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// PromptArena — an LLM test-harness execution engine.
#[derive(Debug, Parser)]
#[command(name = "arena", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scenario matrix against the configured providers.
    Run(RunArgs),
    /// Parse the config file and report validation errors/warnings.
    Validate(ValidateArgs),
}

/// `arena run` (spec §6 CLI surface).
#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Path to the ArenaConfig document (YAML or TOML, by extension).
    #[arg(long)]
    pub config: PathBuf,
    /// Restrict the run matrix to these scenario ids. May be repeated.
    #[arg(long = "scenario")]
    pub scenarios: Vec<String>,
    /// Restrict the run matrix to these provider ids. May be repeated.
    #[arg(long = "provider")]
    pub providers: Vec<String>,
    /// Restrict the run matrix to these region names. May be repeated.
    #[arg(long = "region")]
    pub regions: Vec<String>,
    /// Override the config's `output_dir`.
    #[arg(long = "out")]
    pub out: Option<PathBuf>,
    /// Override the config's `junit_output` path.
    #[arg(long = "junit-file")]
    pub junit_file: Option<PathBuf>,
    /// Comma-separated report formats to write: json, junit, html.
    #[arg(long, default_value = "json,junit")]
    pub format: String,
    /// Override the config's worker-pool concurrency.
    #[arg(long)]
    pub parallelism: Option<usize>,
    /// CI mode: suppress interactive progress output.
    #[arg(long)]
    pub ci: bool,
}

/// `arena validate` — config-only dry run (no providers contacted).
#[derive(Debug, Parser)]
pub struct ValidateArgs {
    #[arg(long)]
    pub config: PathBuf,
}

// ── Config loading ────────────────────────────────────────────────────

/// Load an [`arena_domain::config::ArenaConfig`] from disk. YAML is tried
/// first when the extension doesn't disambiguate, since the loader's own
/// schema validation is out of scope here (spec §1) and this crate only
/// needs a best-effort parse to hand the typed record to the engine.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<arena_domain::config::ArenaConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;

    let is_toml = matches!(path.extension().and_then(|e| e.to_str()), Some("toml"));
    if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {} as toml: {e}", path.display()))
    } else {
        serde_yaml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {} as yaml: {e}", path.display()))
    }
}

/// `ARENA_PARALLELISM` (spec §6 environment variables): overrides the
/// config's `parallelism` when set to a valid positive integer.
pub fn parallelism_env_override() -> Option<usize> {
    std::env::var("ARENA_PARALLELISM").ok().and_then(|v| v.parse::<usize>().ok()).filter(|n| *n > 0)
}

/// `ARENA_MOCK=1` (spec §6): forces every provider to the mock adapter.
pub fn mock_env_override() -> bool {
    std::env::var("ARENA_MOCK").map(|v| v == "1").unwrap_or(false)
}
