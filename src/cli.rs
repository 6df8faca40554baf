// src/cli.rs

//! CLI argument parsing using `clap`.
//!
//! NOTE: this expects `clap` to be built with the `derive` feature, e.g.:
//! `clap = { version = "4.5.53", features = ["derive"] }` in `Cargo.toml`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `runguard`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "runguard",
    version,
    about = "Run a command under supervision with inactivity and deadline timeouts.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Runguard.toml` in the current working directory; a missing
    /// file is fine.
    #[arg(long, value_name = "PATH", default_value_os_t = crate::config::default_config_path())]
    pub config: PathBuf,

    /// Idle ticks with no output before the command is assumed stuck and
    /// killed (default 60).
    #[arg(long, value_name = "TICKS")]
    pub progressive_timeout: Option<u64>,

    /// Absolute deadline in seconds from launch; the termination signal is
    /// sent when it is crossed. Defaults to 10x the progressive timeout.
    #[arg(long, value_name = "SECONDS")]
    pub deadline: Option<u64>,

    /// Extra ticks after the deadline before the hard kill (default 180).
    #[arg(long, value_name = "TICKS")]
    pub grace_period: Option<u64>,

    /// Signal sent at the deadline: hup, int, term or kill.
    #[arg(long, value_name = "NAME")]
    pub signal: Option<String>,

    /// Environment override for the child, repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Working directory for the child.
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<String>,

    /// Regex matched against every output line; the summary reports whether
    /// any line matched.
    #[arg(long = "match", value_name = "REGEX")]
    pub match_pattern: Option<String>,

    /// Identifier used in log lines and report messages; generated from the
    /// program name when omitted.
    #[arg(long, value_name = "ID")]
    pub id: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `RUNGUARD_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// The program to run, followed by its arguments.
    #[arg(
        value_name = "PROGRAM [ARGS]...",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
