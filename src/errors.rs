// src/errors.rs

//! Crate-wide error type.

use std::fmt;

use thiserror::Error;

use crate::types::BranchId;

/// Which kind of object a lookup failed to find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFound {
    Viztrail(String),
    Branch(String),
    Snapshot(String),
    Module(String),
    Command { package: String, command: String },
}

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFound::Viztrail(id) => write!(f, "unknown viztrail '{id}'"),
            NotFound::Branch(id) => write!(f, "unknown branch '{id}'"),
            NotFound::Snapshot(id) => write!(f, "unknown workflow snapshot '{id}'"),
            NotFound::Module(id) => write!(f, "unknown module '{id}'"),
            NotFound::Command { package, command } => {
                write!(f, "unknown command '{package}.{command}'")
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum VizError {
    #[error("Not found: {0}")]
    NotFound(NotFound),

    #[error("Concurrent modification: branch {branch} has active work that cannot be preempted; cancel it first")]
    ConcurrentModification { branch: BranchId },

    #[error("Command execution failed: {0}")]
    CommandExecution(String),

    #[error("Execution backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VizError {
    pub fn viztrail_not_found(id: impl fmt::Display) -> Self {
        VizError::NotFound(NotFound::Viztrail(id.to_string()))
    }

    pub fn branch_not_found(id: impl fmt::Display) -> Self {
        VizError::NotFound(NotFound::Branch(id.to_string()))
    }

    pub fn snapshot_not_found(id: impl fmt::Display) -> Self {
        VizError::NotFound(NotFound::Snapshot(id.to_string()))
    }

    pub fn module_not_found(id: impl fmt::Display) -> Self {
        VizError::NotFound(NotFound::Module(id.to_string()))
    }

    /// Whether retrying the same call later can succeed without caller action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VizError::BackendUnavailable(_))
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, VizError>;
