//! `arena` — the PromptArena CLI binary: loads a config document, drives
//! the engine to completion, and writes the run artifacts (spec §6).

mod cli;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let exit_code = match cli.command {
        Command::Run(args) => cli::run::run(args).await,
        Command::Validate(args) => cli::config::validate(args),
    };

    std::process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,arena=debug")))
        .json()
        .init();
}
