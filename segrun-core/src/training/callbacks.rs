//! Training callbacks: the listener contract plus early stopping and
//! checkpoint selection.

use super::batch::BatchEnd;
use crate::error::RuntimeFailure;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Metrics reported by the runtime at the end of an epoch.
pub type EpochMetrics = BTreeMap<String, f64>;

/// Action a callback can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
    Checkpoint,
}

/// Listener invoked by the training runtime.
///
/// Both hooks are optional. Batch-end errors are returned to the runtime,
/// which aborts the fit.
pub trait TrainingCallback: Send {
    fn name(&self) -> &str;

    fn on_batch_end(&mut self, _event: &BatchEnd<'_>) -> crate::Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _epoch: usize, _metrics: &EpochMetrics) -> CallbackAction {
        CallbackAction::Continue
    }
}

/// What the runtime must do after an epoch, folded from every callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directives {
    pub checkpoint: bool,
    pub stop: bool,
}

/// The callbacks attached to one fit, invoked in registration order.
#[derive(Default)]
pub struct CallbackSet {
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl CallbackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.push(callback);
    }

    pub fn with(mut self, callback: impl TrainingCallback + 'static) -> Self {
        self.push(Box::new(callback));
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.callbacks.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Deliver a batch-end event. The first failing callback stops delivery.
    pub fn batch_end(&mut self, event: &BatchEnd<'_>) -> Result<(), RuntimeFailure> {
        for callback in &mut self.callbacks {
            callback
                .on_batch_end(event)
                .map_err(|source| RuntimeFailure::Callback {
                    callback: callback.name().to_string(),
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }

    /// Deliver an epoch-end event to every callback.
    pub fn epoch_end(&mut self, epoch: usize, metrics: &EpochMetrics) -> Directives {
        let mut directives = Directives::default();
        for callback in &mut self.callbacks {
            match callback.on_epoch_end(epoch, metrics) {
                CallbackAction::Continue => {}
                CallbackAction::Stop => {
                    debug!(callback = callback.name(), epoch, "Callback requested stop");
                    directives.stop = true;
                }
                CallbackAction::Checkpoint => directives.checkpoint = true,
            }
        }
        directives
    }
}

impl std::fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSet")
            .field("callbacks", &self.names())
            .finish()
    }
}

/// Whether a monitored metric improves downwards or upwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    Min,
    Max,
}

impl MonitorMode {
    fn improves(self, value: f64, best: f64, min_delta: f64) -> bool {
        match self {
            Self::Min => value < best - min_delta,
            Self::Max => value > best + min_delta,
        }
    }
}

/// Early stopping callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingCallback {
    pub monitor: String,
    pub patience: usize,
    pub min_delta: f64,
    pub mode: MonitorMode,
    #[serde(skip)]
    counter: usize,
    #[serde(skip)]
    best: Option<f64>,
}

impl EarlyStoppingCallback {
    pub fn new(monitor: impl Into<String>, patience: usize, min_delta: f64, mode: MonitorMode) -> Self {
        Self {
            monitor: monitor.into(),
            patience,
            min_delta,
            mode,
            counter: 0,
            best: None,
        }
    }

    /// Feed one observation of the monitored metric.
    pub fn observe(&mut self, value: f64) -> CallbackAction {
        match self.best {
            None => {
                self.best = Some(value);
                CallbackAction::Continue
            }
            Some(best) => {
                if self.mode.improves(value, best, self.min_delta) {
                    self.best = Some(value);
                    self.counter = 0;
                    CallbackAction::Continue
                } else {
                    self.counter += 1;
                    if self.counter >= self.patience {
                        CallbackAction::Stop
                    } else {
                        CallbackAction::Continue
                    }
                }
            }
        }
    }
}

impl TrainingCallback for EarlyStoppingCallback {
    fn name(&self) -> &str {
        "early_stopping"
    }

    fn on_epoch_end(&mut self, _epoch: usize, metrics: &EpochMetrics) -> CallbackAction {
        // Epochs without the metric (no validation run) don't count.
        match metrics.get(&self.monitor) {
            Some(value) => self.observe(*value),
            None => CallbackAction::Continue,
        }
    }
}

/// Requests a checkpoint whenever the monitored metric reaches a new best.
#[derive(Debug, Clone)]
pub struct CheckpointCallback {
    pub monitor: String,
    pub mode: MonitorMode,
    best: Option<f64>,
}

impl CheckpointCallback {
    pub fn new(monitor: impl Into<String>, mode: MonitorMode) -> Self {
        Self {
            monitor: monitor.into(),
            mode,
            best: None,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn observe(&mut self, value: f64) -> CallbackAction {
        let improved = self
            .best
            .is_none_or(|best| self.mode.improves(value, best, 0.0));
        if improved {
            self.best = Some(value);
            CallbackAction::Checkpoint
        } else {
            CallbackAction::Continue
        }
    }
}

impl TrainingCallback for CheckpointCallback {
    fn name(&self) -> &str {
        "checkpoint"
    }

    fn on_epoch_end(&mut self, _epoch: usize, metrics: &EpochMetrics) -> CallbackAction {
        match metrics.get(&self.monitor) {
            Some(value) => self.observe(*value),
            None => CallbackAction::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SegrunError;
    use crate::training::batch::{Phase, SampleBatch};

    #[test]
    fn test_early_stopping() {
        let mut cb = EarlyStoppingCallback::new("val_loss", 3, 0.01, MonitorMode::Min);
        assert_eq!(cb.observe(0.5), CallbackAction::Continue); // sets best=0.5
        assert_eq!(cb.observe(0.4), CallbackAction::Continue); // improves
        assert_eq!(cb.observe(0.4), CallbackAction::Continue); // counter=1
        assert_eq!(cb.observe(0.4), CallbackAction::Continue); // counter=2
        assert_eq!(cb.observe(0.4), CallbackAction::Stop); // counter=3 >= patience
    }

    #[test]
    fn test_early_stopping_ignores_missing_metric() {
        let mut cb = EarlyStoppingCallback::new("val_loss", 1, 0.0, MonitorMode::Min);
        let empty = EpochMetrics::new();
        for epoch in 0..5 {
            assert_eq!(cb.on_epoch_end(epoch, &empty), CallbackAction::Continue);
        }
    }

    #[test]
    fn test_checkpoint_on_new_best() {
        let mut cb = CheckpointCallback::new("val_accuracy", MonitorMode::Max);
        assert_eq!(cb.observe(0.6), CallbackAction::Checkpoint);
        assert_eq!(cb.observe(0.5), CallbackAction::Continue);
        assert_eq!(cb.observe(0.7), CallbackAction::Checkpoint);
        assert_eq!(cb.best(), Some(0.7));
    }

    #[test]
    fn test_directives_are_folded() {
        let mut set = CallbackSet::new()
            .with(CheckpointCallback::new("val_accuracy", MonitorMode::Max))
            .with(EarlyStoppingCallback::new("val_loss", 1, 0.0, MonitorMode::Min));
        let metrics = EpochMetrics::from([
            ("val_accuracy".to_string(), 0.9),
            ("val_loss".to_string(), 0.2),
        ]);
        assert_eq!(
            set.epoch_end(0, &metrics),
            Directives {
                checkpoint: true,
                stop: false
            }
        );
        assert_eq!(
            set.epoch_end(1, &metrics),
            Directives {
                checkpoint: false,
                stop: true
            }
        );
    }

    struct Failing;

    impl TrainingCallback for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_batch_end(&mut self, _event: &BatchEnd<'_>) -> crate::Result<()> {
            Err(SegrunError::invalid_input("boom"))
        }
    }

    #[test]
    fn test_batch_end_error_names_callback() {
        let mut set = CallbackSet::new().with(Failing);
        let batch = SampleBatch::default();
        let event = BatchEnd {
            phase: Phase::Train,
            epoch: 0,
            batch_idx: 0,
            batch: &batch,
        };
        let err = set.batch_end(&event).unwrap_err();
        assert!(matches!(err, RuntimeFailure::Callback { ref callback, .. } if callback == "failing"));
        assert_eq!(set.names(), vec!["failing"]);
    }
}
