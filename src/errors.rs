// src/errors.rs

//! Crate-wide error types.
//!
//! Setup failures (a child that cannot be spawned or wired up) are the only
//! faults the supervision core ever raises; every runtime outcome, including
//! timeouts and fatal stream errors, travels through `ExecutionResult`
//! instead. Higher layers use `anyhow` for context-carrying glue errors.

pub use anyhow::{Error, Result};

/// Failures before or during child setup. Once the controller loop is
/// running, nothing escapes through this type anymore.
#[derive(Debug, thiserror::Error)]
pub enum SuperviseError {
    #[error("failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("child process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("child process id unavailable")]
    NoPid,
}
