// src/lib.rs

pub mod cli;
pub mod config;
pub mod errors;
pub mod logging;
pub mod supervise;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::info;

use crate::cli::CliArgs;
use crate::config::{load_optional, ConfigFile};
use crate::supervise::{
    default_line_handler, pattern_line_handler, Deadline, DeadlineStatus, ExecutionRequest,
    ExecutionResult, Supervisor, TermSignal,
};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading (optional `Runguard.toml`)
/// - CLI/config merge into an `ExecutionRequest`
/// - the supervisor run itself
///
/// Returns the process exit code the binary should terminate with.
pub async fn run(args: CliArgs) -> Result<i32> {
    let cfg = load_optional(&args.config)?;
    let request = build_request(&args, &cfg)?;

    let supervisor = Supervisor::new();
    let result = match args.match_pattern.as_deref() {
        Some(pattern) => {
            let re = regex::Regex::new(pattern)
                .with_context(|| format!("invalid --match pattern {pattern:?}"))?;
            let mut handler = pattern_line_handler(re);
            supervisor.run(&request, &mut handler).await?
        }
        None => {
            let mut handler = default_line_handler;
            supervisor.run(&request, &mut handler).await?
        }
    };

    print_summary(&result);
    Ok(exit_code_for(&result))
}

/// Merge CLI flags over config-file values into an immutable request.
///
/// Precedence per knob: CLI flag, then `Runguard.toml`, then the built-in
/// default. `[env]` entries from the file apply first, `--env` flags win on
/// conflicting keys.
pub fn build_request(args: &CliArgs, cfg: &ConfigFile) -> Result<ExecutionRequest> {
    let (program, program_args) = args
        .command
        .split_first()
        .ok_or_else(|| anyhow!("no program given"))?;

    let signal: TermSignal = match args.signal.as_deref().or(cfg.defaults.signal.as_deref()) {
        Some(name) => name.parse().map_err(|e: String| anyhow!(e))?,
        None => TermSignal::default(),
    };

    let mut request = ExecutionRequest::new(PathBuf::from(program))
        .args(program_args.iter().cloned())
        .envs(cfg.env.clone())
        .signal(signal);

    for pair in &args.env {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --env entry {pair:?} (expected KEY=VALUE)"))?;
        request = request.env(key, value);
    }

    if let Some(ticks) = args.progressive_timeout.or(cfg.defaults.progressive_timeout) {
        request = request.progressive_timeout(ticks);
    }
    if let Some(secs) = args.deadline.or(cfg.defaults.deadline) {
        request = request.deadline(Deadline::In(Duration::from_secs(secs)));
    }
    if let Some(ticks) = args.grace_period.or(cfg.defaults.grace_period) {
        request = request.grace_period(ticks);
    }
    if let Some(dir) = &args.cwd {
        request = request.working_dir(dir);
    }
    if let Some(id) = &args.id {
        request = request.identifier(id.clone());
    }

    Ok(request)
}

/// Map a finished execution onto a shell-style exit code: the child's own
/// code on a clean run, 124 when any timeout tier killed it, 125 on the
/// fatal OS-error path.
pub fn exit_code_for(result: &ExecutionResult) -> i32 {
    if result.fatal {
        125
    } else if result.timed_out || result.deadline == DeadlineStatus::Expired {
        124
    } else {
        result.exit_code.unwrap_or(1)
    }
}

fn print_summary(result: &ExecutionResult) {
    info!(
        timed_out = result.timed_out,
        deadline = ?result.deadline,
        exit_code = ?result.exit_code,
        matched = result.matched,
        fatal = result.fatal,
        "execution finished"
    );
    for message in &result.messages {
        println!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["runguard"];
        argv.extend_from_slice(extra);
        argv.extend_from_slice(&["--", "echo", "hi"]);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn cli_flags_win_over_config_file() {
        let cfg: ConfigFile = toml::from_str(
            "[defaults]\nprogressive_timeout = 10\ngrace_period = 5\nsignal = \"int\"",
        )
        .unwrap();

        let request = build_request(&args(&["--progressive-timeout", "3"]), &cfg).unwrap();
        assert_eq!(request.progressive_timeout, 3);
        assert_eq!(request.grace_period, 5);
        assert_eq!(request.signal, TermSignal::Int);
        assert_eq!(request.program, PathBuf::from("echo"));
        assert_eq!(request.args, vec!["hi".to_string()]);
    }

    #[test]
    fn env_flags_override_config_env() {
        let cfg: ConfigFile =
            toml::from_str("[env]\nFOO = \"file\"\nKEEP = \"yes\"").unwrap();
        let request = build_request(&args(&["--env", "FOO=flag"]), &cfg).unwrap();
        assert_eq!(request.env.get("FOO").map(String::as_str), Some("flag"));
        assert_eq!(request.env.get("KEEP").map(String::as_str), Some("yes"));
    }

    #[test]
    fn config_path_defaults_to_runguard_toml() {
        assert_eq!(args(&[]).config, crate::config::default_config_path());
    }

    #[test]
    fn malformed_env_entry_is_rejected() {
        let cfg = ConfigFile::default();
        assert!(build_request(&args(&["--env", "NOEQUALS"]), &cfg).is_err());
    }

    #[test]
    fn exit_codes_reflect_the_termination_path() {
        let mut result = ExecutionResult {
            timed_out: false,
            deadline: DeadlineStatus::NotReached,
            exit_code: Some(3),
            matched: false,
            fatal: false,
            messages: Vec::new(),
        };
        assert_eq!(exit_code_for(&result), 3);

        result.timed_out = true;
        assert_eq!(exit_code_for(&result), 124);

        result.timed_out = false;
        result.deadline = DeadlineStatus::Expired;
        assert_eq!(exit_code_for(&result), 124);

        result.fatal = true;
        assert_eq!(exit_code_for(&result), 125);
    }
}
