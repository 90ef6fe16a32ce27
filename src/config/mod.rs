// src/config/mod.rs

//! Configuration loading and validation for the engine.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate sizes, durations and command routes (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, load_or_default, parse_str};
pub use model::{
    CommandConfig, ConfigFile, ContainerSection, DatastoreSection, EngineSection, QueueSection,
    RawConfigFile, RepositorySection,
};
pub use validate::parse_duration;
