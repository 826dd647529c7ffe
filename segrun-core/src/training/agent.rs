//! Run orchestration: the agent that drives tuning and fitting.
//!
//! ```text
//! Constructed -> [Tuning(LearningRate)] -> [Tuning(BatchSize)] -> Fitting -> Finalized
//!                                                                  \-> Failed
//! ```
//!
//! Tuning is best-effort: a failed search is logged and the configured value
//! kept. A failed fit is terminal and is never retried.

use super::callbacks::{CallbackSet, CheckpointCallback, EarlyStoppingCallback, MonitorMode};
use super::metrics::{TrainingMetrics, VAL_LOSS};
use super::runtime::{TrainerControls, TrainingRuntime, TuneOutcome};
use super::visualize::PredictionLogger;
use crate::config::Configuration;
use crate::error::{AgentError, StrategyError};
use crate::registry::StrategyRegistry;
use crate::reproducibility::SeedContext;
use crate::strategies::{DataModule, Model, StrategyArgs};
use crate::tracking::Tracker;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Metric the best checkpoint is selected on.
pub const CHECKPOINT_MONITOR: &str = "val_accuracy";
/// Epochs without `val_loss` improvement before stopping.
pub const EARLY_STOPPING_PATIENCE: usize = 3;

/// Which hyperparameter a tuning pass searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunePhase {
    LearningRate,
    BatchSize,
}

/// Lifecycle of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Constructed,
    Tuning(TunePhase),
    Fitting,
    Finalized,
    Failed,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constructed => write!(f, "constructed"),
            Self::Tuning(TunePhase::LearningRate) => write!(f, "tuning (learning rate)"),
            Self::Tuning(TunePhase::BatchSize) => write!(f, "tuning (batch size)"),
            Self::Fitting => write!(f, "fitting"),
            Self::Finalized => write!(f, "finalized"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A training strategy.
#[async_trait]
pub trait Agent: Send {
    fn name(&self) -> &str;

    fn state(&self) -> AgentState;

    /// Tune (when enabled), then fit. Only valid once, from `Constructed`.
    async fn run(&mut self) -> crate::Result<TrainingMetrics>;

    /// Release the tracking handle. Safe to call in any state, any number
    /// of times; never fails.
    fn finalize(&mut self);
}

/// Everything an agent factory receives.
#[derive(Clone)]
pub struct AgentArgs {
    pub config: Arc<Configuration>,
    pub seeds: SeedContext,
    pub registry: Arc<StrategyRegistry>,
    pub runtime: Arc<dyn TrainingRuntime>,
    pub tracker: Arc<dyn Tracker>,
}

impl fmt::Debug for AgentArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentArgs")
            .field("architecture", &self.config.run.architecture)
            .field("seed", &self.seeds.seed())
            .finish_non_exhaustive()
    }
}

/// The default agent: optional tuning, then one fit with checkpointing,
/// early stopping and prediction logging.
pub struct Trainer {
    config: Arc<Configuration>,
    model: Box<dyn Model>,
    data: Box<dyn DataModule>,
    runtime: Arc<dyn TrainingRuntime>,
    tracker: Arc<dyn Tracker>,
    state: AgentState,
    released: bool,
}

impl Trainer {
    /// Resolve the model (`run.architecture`) and data module
    /// (`run.datamodule`) and start watching the model.
    pub fn construct(args: &AgentArgs) -> crate::Result<Self> {
        let strategy_args = StrategyArgs {
            config: Arc::clone(&args.config),
            seeds: args.seeds.clone(),
        };
        let run = &args.config.run;
        let model = args.registry.models.resolve(&run.architecture, &strategy_args)?;
        let data = args
            .registry
            .data_modules
            .resolve(&run.datamodule, &strategy_args)?;
        args.tracker.watch(model.as_ref())?;

        info!(
            model = model.name(),
            data = data.name(),
            "Trainer constructed"
        );
        Ok(Self {
            config: Arc::clone(&args.config),
            model,
            data,
            runtime: Arc::clone(&args.runtime),
            tracker: Arc::clone(&args.tracker),
            state: AgentState::Constructed,
            released: false,
        })
    }

    fn transition(&mut self, to: AgentState) {
        info!(from = %self.state, to = %to, "Agent state change");
        self.state = to;
    }

    fn log_event(&self, event: &str, payload: Value) {
        if let Err(e) = self.tracker.log(event, payload) {
            warn!(event, error = %e, "Failed to record event");
        }
    }

    async fn tune_learning_rate(&mut self) {
        self.transition(AgentState::Tuning(TunePhase::LearningRate));
        let outcome = self
            .runtime
            .tune_learning_rate(self.model.as_ref(), self.data.as_ref())
            .await;
        match outcome {
            Ok(TuneOutcome::Suggested(lr)) => {
                info!(previous = self.model.learning_rate(), lr, "Applying tuned learning rate");
                self.model.set_learning_rate(lr);
                self.log_event("tune", json!({ "parameter": "lr", "value": lr }));
            }
            Ok(TuneOutcome::Unsupported) => {
                info!("Runtime cannot tune the learning rate, keeping the configured value");
            }
            Err(e) => {
                warn!(error = %e, "Learning-rate tuning failed, keeping the configured value");
            }
        }
    }

    async fn tune_batch_size(&mut self) {
        self.transition(AgentState::Tuning(TunePhase::BatchSize));
        let outcome = self
            .runtime
            .tune_batch_size(self.model.as_ref(), self.data.as_ref())
            .await;
        match outcome {
            Ok(TuneOutcome::Suggested(batch_size)) => {
                info!(
                    previous = self.data.batch_size(),
                    batch_size, "Applying tuned batch size"
                );
                self.data.set_batch_size(batch_size);
                self.log_event(
                    "tune",
                    json!({ "parameter": "batch_size", "value": batch_size }),
                );
            }
            Ok(TuneOutcome::Unsupported) => {
                info!("Runtime cannot tune the batch size, keeping the configured value");
            }
            Err(e) => {
                warn!(error = %e, "Batch-size tuning failed, keeping the configured value");
            }
        }
    }

    fn callbacks(&self) -> CallbackSet {
        CallbackSet::new()
            .with(CheckpointCallback::new(CHECKPOINT_MONITOR, MonitorMode::Max))
            .with(EarlyStoppingCallback::new(
                VAL_LOSS,
                EARLY_STOPPING_PATIENCE,
                0.0,
                MonitorMode::Min,
            ))
            .with(PredictionLogger::new(
                self.config.callbacks.log_pred_freq,
                Arc::clone(&self.tracker),
            ))
    }
}

#[async_trait]
impl Agent for Trainer {
    fn name(&self) -> &str {
        "trainer"
    }

    fn state(&self) -> AgentState {
        self.state
    }

    async fn run(&mut self) -> crate::Result<TrainingMetrics> {
        if self.state != AgentState::Constructed {
            return Err(AgentError::InvalidTransition {
                from: self.state.to_string(),
                to: AgentState::Fitting.to_string(),
            }
            .into());
        }

        let controls = match TrainerControls::from_config(&self.config) {
            Ok(controls) => controls,
            Err(e) => {
                self.transition(AgentState::Failed);
                return Err(e.into());
            }
        };

        if self.config.run.tune_lr {
            self.tune_learning_rate().await;
        }
        if self.config.run.tune_batch_size {
            self.tune_batch_size().await;
        }

        self.transition(AgentState::Fitting);
        let mut callbacks = self.callbacks();
        debug!(callbacks = ?callbacks.names(), "Starting fit");
        let result = self
            .runtime
            .fit(self.model.as_ref(), self.data.as_ref(), &controls, &mut callbacks)
            .await;

        match result {
            Ok(metrics) => {
                match serde_json::to_value(&metrics) {
                    Ok(summary) => self.log_event("fit", summary),
                    Err(e) => warn!(error = %e, "Failed to encode fit summary"),
                }
                info!(
                    epochs = metrics.epochs_completed,
                    best_loss = ?metrics.best_loss,
                    "Fit complete"
                );
                self.transition(AgentState::Finalized);
                Ok(metrics)
            }
            Err(failure) => {
                error!(error = %failure, "Fit failed");
                self.transition(AgentState::Failed);
                Err(failure.into())
            }
        }
    }

    fn finalize(&mut self) {
        if self.released {
            debug!("Agent already finalized");
            return;
        }
        self.released = true;
        if let Err(e) = self.tracker.finish() {
            warn!(error = %e, "Failed to close tracking run");
        }
        info!(state = %self.state, "Agent released");
    }
}

/// Register the built-in agents.
pub fn register_builtins(registry: &mut StrategyRegistry) -> Result<(), StrategyError> {
    registry.agents.register("trainer", |args: &AgentArgs| {
        Ok(Box::new(Trainer::construct(args)?) as Box<dyn Agent>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(
            AgentState::Tuning(TunePhase::BatchSize).to_string(),
            "tuning (batch size)"
        );
        assert_eq!(AgentState::Failed.to_string(), "failed");
    }
}
