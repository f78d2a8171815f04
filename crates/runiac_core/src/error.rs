//! Error types for the core module.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur during core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Discovery failed at {path:?}: {message}")]
    Discovery { path: PathBuf, message: String },

    #[error("Step initialisation failed for {step}: {message}")]
    StepInit { step: String, message: String },

    #[error("Parameter store error: {0}")]
    Parameters(String),

    #[error("Task failed: {0}")]
    Task(String),

    #[error("Status reporting failed: {0}")]
    Reporting(String),

    #[error("Runner error: {0}")]
    Runner(#[from] runiac_runner::RunnerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Copy error: {0}")]
    Copy(#[from] fs_extra::error::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
