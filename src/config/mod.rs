// src/config/mod.rs

//! Configuration loading and validation for runguard.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load an optional config file from disk (`loader.rs`).
//! - Validate basic invariants like signal names (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_from_path, load_optional};
pub use model::{ConfigFile, DefaultsSection};
pub use validate::validate_config;
