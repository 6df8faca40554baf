// src/config/validate.rs

use anyhow::{anyhow, Context, Result};

use crate::config::model::ConfigFile;
use crate::supervise::TermSignal;

/// Run basic semantic validation against a loaded configuration.
///
/// This checks:
/// - `progressive_timeout`, `deadline` and `grace_period` are non-zero when
///   given (a zero progressive timeout would kill the child on its first
///   quiet tick; a zero deadline belongs on the CLI for tests, not in a
///   config file)
/// - `signal` names a known signal
pub fn validate_config(cfg: &ConfigFile) -> Result<()> {
    if cfg.defaults.progressive_timeout == Some(0) {
        return Err(anyhow!(
            "[defaults].progressive_timeout must be >= 1 (got 0)"
        ));
    }
    if cfg.defaults.deadline == Some(0) {
        return Err(anyhow!("[defaults].deadline must be >= 1 (got 0)"));
    }
    if cfg.defaults.grace_period == Some(0) {
        return Err(anyhow!("[defaults].grace_period must be >= 1 (got 0)"));
    }

    if let Some(ref signal) = cfg.defaults.signal {
        signal
            .parse::<TermSignal>()
            .map_err(|e| anyhow!(e))
            .context("invalid [defaults].signal")?;
    }

    Ok(())
}
