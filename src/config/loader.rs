// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Read and deserialize a workflow file without semantic validation.
///
/// Use [`load_and_validate`] for the checked [`ConfigFile`].
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;
    debug!(path = %path.display(), steps = config.step.len(), tiers = config.tier.len(), "config loaded");

    Ok(config)
}

/// Load a workflow file and validate it.
///
/// Checks, besides TOML syntax:
/// - at least one step, sane numeric settings,
/// - duration strings,
/// - unknown `after` / `soft_after` references and cycles,
/// - tier references in `escalate`, `[routing]` and `[priority]`,
/// - regex syntax of routing patterns.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// `Tierflow.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Tierflow.toml")
}
