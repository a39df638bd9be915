// src/config/mod.rs

//! Configuration loading and validation for tierflow.
//!
//! - [`model`] maps the TOML workflow file and holds the validated form.
//! - [`loader`] reads a file from disk.
//! - [`validate`] turns the raw file into a [`ConfigFile`].
//! - [`assemble`] builds the runtime objects (workflow, tier registry,
//!   cascades) from a validated config.

pub mod assemble;
pub mod loader;
pub mod model;
pub mod validate;

pub use assemble::{Assembled, assemble, build_registry};
pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{ConfigFile, RawConfigFile, RouteSpec, StepSpec, TierSpec};
