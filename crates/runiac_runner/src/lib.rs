//! # runiac_runner
//!
//! Runner contract and execution utilities for runiac.
//!
//! This crate defines what an IaC backend must implement and the plumbing
//! every backend shares.
//!
//! # Features
//!
//! - **Runner Contract**: the [`Stepper`] trait and the per-step values passed across it
//! - **Subprocesses**: [`ShellCommand`] with concurrent stdout/stderr streaming
//! - **Retry**: bounded retry with a fixed backoff
//! - **Output Variables**: [`OutputValue`] sum type and its canonical stringification
//! - **Mock Stepper**: for testing orchestration without an IaC tool
//!
//! # Example
//!
//! ```rust,no_run
//! use runiac_runner::ShellCommand;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let output = ShellCommand::new("terraform")
//!         .dir("./tracks/network/step1_vpc")
//!         .args(["version"])
//!         .run_capture_and_stream()
//!         .await?;
//!     println!("{}", output);
//!     Ok(())
//! }
//! ```

pub mod credentials;
pub mod error;
pub mod mock;
pub mod output;
pub mod retry;
pub mod shell;
pub mod stepper;

pub use credentials::{AmbientCredentials, CredentialsProvider};
pub use error::{RetryError, RunnerError, RunnerResult, ShellError};
pub use mock::{CapturedCall, MockStepper, StepMethod};
pub use output::{stringify_outputs, OutputValue, StepOutputVariables};
pub use retry::retry;
pub use shell::{exit_code, LogStream, ShellCommand, DEFAULT_MAX_BUFFER, VERBOSE_MAX_BUFFER};
pub use stepper::{
    RegionDeployType, RunnerKind, StepExecution, StepOutput, StepStatus, StepTestOutput, Stepper,
};
