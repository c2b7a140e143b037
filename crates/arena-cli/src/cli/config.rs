//! `arena validate` — parses the config file and reports issues without
//! contacting any provider.

use super::{load_config, ValidateArgs};

pub fn validate(args: ValidateArgs) -> i32 {
    let config = match load_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return 2;
        }
    };

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            arena_domain::config::ConfigSeverity::Warning => eprintln!("warn: {issue}"),
            arena_domain::config::ConfigSeverity::Error => eprintln!("error: {issue}"),
        }
    }

    if arena_domain::config::ArenaConfig::has_errors(&issues) {
        2
    } else {
        println!("config is valid: {} provider(s), {} scenario(s)", config.providers.len(), config.scenarios.len());
        0
    }
}
