// src/config/model.rs

use std::collections::BTreeMap;

use serde::Deserialize;

/// Top-level configuration as read from a `Runguard.toml` file:
///
/// ```toml
/// [defaults]
/// progressive_timeout = 60
/// deadline = 900
/// grace_period = 180
/// signal = "term"
///
/// [env]
/// RUST_BACKTRACE = "1"
/// ```
///
/// All sections are optional; command-line flags win over file values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// Timeout knobs from `[defaults]`.
    #[serde(default)]
    pub defaults: DefaultsSection,

    /// Environment overrides applied to every supervised child, from `[env]`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsSection {
    /// Idle ticks with no output before the child is assumed stuck.
    #[serde(default)]
    pub progressive_timeout: Option<u64>,

    /// Absolute deadline in seconds from launch.
    ///
    /// If `None` here and on the CLI, the supervisor falls back to
    /// `10 * progressive_timeout` ticks.
    #[serde(default)]
    pub deadline: Option<u64>,

    /// Grace period (in ticks) between the deadline signal and the hard kill.
    #[serde(default)]
    pub grace_period: Option<u64>,

    /// Signal name sent at the soft deadline (`hup`, `int`, `term`, `kill`).
    #[serde(default)]
    pub signal: Option<String>,
}
