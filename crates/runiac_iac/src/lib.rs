//! # runiac_iac
//!
//! Terraform runner and state-backend resolution for runiac.
//!
//! This crate implements the runner contract from `runiac_runner` on top of
//! the `terraform` CLI, and the pieces every step run needs around it.
//!
//! ## Features
//!
//! - State-backend block parsing with engine placeholder substitution
//! - Declared-variable filtering for `TF_VAR_*` injection
//! - Ring-specific override files for apply and destroy
//! - JUnit reports for step test binaries
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use runiac_iac::TerraformStepper;
//! use runiac_runner::AmbientCredentials;
//!
//! let stepper = TerraformStepper::new(Arc::new(AmbientCredentials))
//!     .with_binary("/usr/local/bin/terraform");
//! ```

pub mod backend;
pub mod error;
pub mod junit;
pub mod overrides;
pub mod terraform;
pub mod variables;

pub use backend::{
    backend_from_block, interpolate, parse_backend_block, parse_init_args, resolve_backend,
    BackendBlock, BackendKind, TerraformBackend,
};
pub use error::{IacError, IacResult};
pub use overrides::{apply_overrides, OverridePhase};
pub use terraform::{parse_outputs, TerraformStepper};
pub use variables::{declared_variables, tf_var_env};
