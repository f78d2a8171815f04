//! # runiac_core
//!
//! Discovery and orchestration for runiac.
//!
//! This crate turns a `tracks/` directory into deploy (and optionally
//! destroy) runs against a [`runiac_runner::Stepper`].
//!
//! # Architecture
//!
//! - **Config**: `RUNIAC_*` environment loading and validation
//! - **Discovery**: tracks, steps and progression levels from the filesystem
//! - **Track Executor**: primary-then-regional region workers per track
//! - **Status Sink**: per-region step results aggregated per step deployment
//! - **Engine**: pretrack gating, parallel tracks, self-destroy and the run summary
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runiac_core::{Config, Engine};
//! use runiac_runner::MockStepper;
//!
//! let config = Config::from_env()?;
//! let engine = Engine::new(config, Arc::new(MockStepper::new()));
//! let stage = engine.run().await?;
//! let summary = stage.summary();
//! summary.emit();
//! std::process::exit(summary.exit_code());
//! ```

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod execution;
pub mod params;
pub mod status;
pub mod track;

pub use config::{default_region_groups, Config, Csp, RegionGroups};
pub use discovery::{discover, Step, Track, PRETRACK_NAME};
pub use engine::{Engine, Stage, Summary, SummaryResult};
pub use error::{CoreError, CoreResult};
pub use execution::{Direction, ExecutionOutput, Output, RegionExecution, StepResult, PRETRACK_PREFIX};
pub use params::{
    load_step_parameters, parameter_paths, EmptyParameterStore, ParameterStore, YamlParameterStore,
};
pub use status::{
    EntryResult, RegionalResult, StatusEntry, StatusReporter, StatusSink, StepIdentity, StepStarted,
    TracingReporter, UpdateRegionalStatus, REGIONAL_POST_DEPLOY,
};
pub use track::TrackExecutor;
