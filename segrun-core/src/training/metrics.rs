//! Training metrics tracking.

use super::callbacks::EpochMetrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metric keys holding the training and validation loss.
pub const TRAIN_LOSS: &str = "train_loss";
pub const VAL_LOSS: &str = "val_loss";

/// Summary of a fit, accumulated from the per-epoch metrics the runtime
/// reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs_completed: usize,
    pub loss_history: Vec<f64>,
    pub val_loss_history: Vec<f64>,
    pub custom_metrics: BTreeMap<String, Vec<f64>>,
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
    /// A callback asked the runtime to stop before `max_epochs`.
    pub stopped_early: bool,
    pub checkpoints: usize,
}

impl TrainingMetrics {
    pub fn record_epoch(&mut self, epoch: usize, metrics: &EpochMetrics) {
        let loss = metrics.get(TRAIN_LOSS).copied();
        let val_loss = metrics.get(VAL_LOSS).copied();
        if let Some(loss) = loss {
            self.loss_history.push(loss);
        }
        if let Some(vl) = val_loss {
            self.val_loss_history.push(vl);
        }
        for (name, value) in metrics {
            if name != TRAIN_LOSS && name != VAL_LOSS {
                self.add_custom_metric(name, *value);
            }
        }
        self.epochs_completed += 1;

        if let Some(check_loss) = val_loss.or(loss) {
            if self.best_loss.is_none_or(|best| check_loss < best) {
                self.best_loss = Some(check_loss);
                self.best_epoch = Some(epoch);
            }
        }
    }

    pub fn add_custom_metric(&mut self, name: &str, value: f64) {
        self.custom_metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
    }
}
