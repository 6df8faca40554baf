// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::model::ConfigFile;
use crate::config::validate::validate_config;

/// Load a configuration file from a given path and return the raw
/// `ConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_optional`] for the full path.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading config file at {:?}", path))?;

    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("parsing TOML config from {:?}", path))?;

    Ok(config)
}

/// Load and validate the config file if it exists; a missing file simply
/// yields the built-in defaults. This is the entry point used by `lib.rs` —
/// the supervisor is fully usable without any config file at all.
pub fn load_optional(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    if !path.exists() {
        debug!(?path, "no config file, using built-in defaults");
        return Ok(ConfigFile::default());
    }
    let config = load_from_path(path)?;
    validate_config(&config)?;
    Ok(config)
}

/// Default config path: `Runguard.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Runguard.toml")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load_optional("/definitely/not/here/Runguard.toml").unwrap();
        assert!(cfg.defaults.progressive_timeout.is_none());
        assert!(cfg.env.is_empty());
    }

    #[test]
    fn file_values_are_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Runguard.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[defaults]\nprogressive_timeout = 5\nsignal = \"int\"\n\n[env]\nFOO = \"bar\""
        )
        .unwrap();

        let cfg = load_optional(&path).unwrap();
        assert_eq!(cfg.defaults.progressive_timeout, Some(5));
        assert_eq!(cfg.defaults.signal.as_deref(), Some("int"));
        assert_eq!(cfg.env.get("FOO").map(String::as_str), Some("bar"));
    }
}
