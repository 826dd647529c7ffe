//! # segrun-core
//!
//! Experiment-run coordination for segmentation and self-supervised
//! training: layered configuration with derived values, a strategy registry,
//! the agent that drives tuning and fitting, and the callbacks that report
//! back to the tracking service.
//!
//! The network code, the data loading and the training loop itself live in
//! an external runtime reached through [`TrainingRuntime`].

pub mod config;
pub mod error;
pub mod registry;
pub mod reproducibility;
pub mod strategies;
pub mod tracking;
pub mod training;

pub use config::{Composer, Composition, Configuration, Overrides};
pub use error::{Result, SegrunError};
pub use registry::{StrategyKind, StrategyRegistry};
pub use reproducibility::SeedContext;
pub use strategies::{DataModule, Model, StrategyArgs};
pub use tracking::{LocalTracker, RecordingTracker, Tracker};
pub use training::{
    Agent, AgentArgs, AgentState, SubprocessRuntime, TrainingMetrics, TrainingRuntime, TuneOutcome,
};
