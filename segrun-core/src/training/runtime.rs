//! The interface to the training runtime that owns the actual loop.

use super::callbacks::CallbackSet;
use super::metrics::TrainingMetrics;
use crate::config::{Configuration, Precision};
use crate::error::{ConfigError, RuntimeFailure};
use crate::strategies::{DataModule, Model};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of a tuning request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TuneOutcome<T> {
    Suggested(T),
    /// The runtime cannot tune this model/data pair.
    Unsupported,
}

/// Switches passed to the runtime for a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerControls {
    pub max_epochs: u32,
    pub validation_frequency: u32,
    pub accumulation_size: u32,
    pub precision: Precision,
    pub deterministic: bool,
    pub dev_run: bool,
    pub gpus: u32,
    pub seed: u64,
}

impl TrainerControls {
    pub fn from_config(config: &Configuration) -> Result<Self, ConfigError> {
        Ok(Self {
            max_epochs: config.run.max_epochs,
            validation_frequency: config.run.val_freq,
            accumulation_size: config.run.accumulate_size,
            precision: config.precision()?,
            deterministic: true,
            dev_run: config.run.dev_run,
            gpus: config.run.gpu,
            seed: config.seed(),
        })
    }
}

/// Executes training on behalf of an agent.
///
/// The runtime owns the loop; it reports progress by invoking `callbacks`
/// and must stop when an epoch-end directive asks it to.
#[async_trait]
pub trait TrainingRuntime: Send + Sync {
    async fn fit(
        &self,
        model: &dyn Model,
        data: &dyn DataModule,
        controls: &TrainerControls,
        callbacks: &mut CallbackSet,
    ) -> Result<TrainingMetrics, RuntimeFailure>;

    async fn tune_learning_rate(
        &self,
        model: &dyn Model,
        data: &dyn DataModule,
    ) -> Result<TuneOutcome<f64>, RuntimeFailure>;

    async fn tune_batch_size(
        &self,
        model: &dyn Model,
        data: &dyn DataModule,
    ) -> Result<TuneOutcome<u32>, RuntimeFailure>;
}
