//! Error types for the runner module.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that can occur while preparing or executing a step.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Step execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Pre-execution failed: {0}")]
    PreExecuteFailed(String),

    #[error("Invalid step configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Credentials unavailable for account {account_id} in {region}: {message}")]
    Credentials {
        account_id: String,
        region: String,
        message: String,
    },

    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the subprocess utility.
#[derive(Error, Debug)]
pub enum ShellError {
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with code {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "<signal>".to_string()))]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("IO error while reading {command} output: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl ShellError {
    /// Exit code of the child process, when it exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ShellError::NonZeroExit { code, .. } => *code,
            _ => None,
        }
    }
}

/// Errors raised by the retry helper.
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("{description}: max retries ({retries}) exceeded after {backoff:?} backoff: {last_error}")]
    MaxRetriesExceeded {
        description: String,
        retries: u32,
        backoff: Duration,
        last_error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_only_for_non_zero_exit() {
        let err = ShellError::NonZeroExit {
            command: "terraform".to_string(),
            code: Some(2),
            output: String::new(),
        };
        assert_eq!(err.exit_code(), Some(2));
        assert_eq!(err.to_string(), "terraform exited with code 2");

        let err = ShellError::Spawn {
            command: "terraform".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(err.exit_code(), None);
    }
}
