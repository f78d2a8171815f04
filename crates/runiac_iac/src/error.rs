//! Error types for IaC module.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for IaC operations.
pub type IacResult<T> = Result<T, IacError>;

/// Errors that can occur during IaC operations.
#[derive(Error, Debug)]
pub enum IacError {
    #[error("Unknown state backend type: {0}")]
    UnknownBackend(String),

    #[error("Invalid backend block in {file:?}: {message}")]
    BackendParse { file: PathBuf, message: String },

    #[error("Terraform init failed: {0}")]
    InitFailed(String),

    #[error("Terraform plan failed: {0}")]
    PlanFailed(String),

    #[error("Terraform apply failed: {0}")]
    ApplyFailed(String),

    #[error("Terraform output could not be read: {0}")]
    OutputFailed(String),

    #[error("Step tests failed: {0}")]
    TestsFailed(String),

    #[error("Runner error: {0}")]
    Runner(#[from] runiac_runner::RunnerError),

    #[error("Retry error: {0}")]
    Retry(#[from] runiac_runner::RetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
