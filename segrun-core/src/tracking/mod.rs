//! Experiment tracking: the service a run reports to.
//!
//! [`LocalTracker`] writes an offline run directory; [`RecordingTracker`]
//! keeps everything in memory.

mod local;

pub use local::LocalTracker;

use crate::config::Overrides;
use crate::error::TrackingError;
use crate::strategies::Model;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Handle to one tracked run.
pub trait Tracker: Send + Sync {
    /// Record the model's descriptor (parameters and topology).
    fn watch(&self, model: &dyn Model) -> Result<(), TrackingError>;

    /// Record one named event.
    fn log(&self, event: &str, payload: Value) -> Result<(), TrackingError>;

    /// Overrides pushed by the service, applied before the agent is built.
    fn remote_overrides(&self) -> Result<Overrides, TrackingError>;

    /// Close the run. Calling it again is a no-op.
    fn finish(&self) -> Result<(), TrackingError>;
}

#[derive(Debug, Default)]
struct Recorded {
    events: Vec<(String, Value)>,
    watched: Vec<Value>,
    finish_count: usize,
    finished: bool,
}

/// In-memory tracker.
#[derive(Debug, Default)]
pub struct RecordingTracker {
    state: Mutex<Recorded>,
    overrides: Overrides,
    fail_logs: bool,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `overrides` from [`Tracker::remote_overrides`].
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Make every `log` call fail.
    pub fn failing_logs(mut self) -> Self {
        self.fail_logs = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, Recorded> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.state().events.clone()
    }

    pub fn events_named(&self, name: &str) -> Vec<Value> {
        self.state()
            .events
            .iter()
            .filter(|(event, _)| event == name)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn watched(&self) -> Vec<Value> {
        self.state().watched.clone()
    }

    /// How often `finish` was called, repeats included.
    pub fn finish_count(&self) -> usize {
        self.state().finish_count
    }
}

impl Tracker for RecordingTracker {
    fn watch(&self, model: &dyn Model) -> Result<(), TrackingError> {
        self.state().watched.push(model.descriptor());
        Ok(())
    }

    fn log(&self, event: &str, payload: Value) -> Result<(), TrackingError> {
        if self.fail_logs {
            return Err(TrackingError::Write {
                message: format!("refusing to record '{event}'"),
            });
        }
        let mut state = self.state();
        if state.finished {
            return Err(TrackingError::Finished);
        }
        state.events.push((event.to_string(), payload));
        Ok(())
    }

    fn remote_overrides(&self) -> Result<Overrides, TrackingError> {
        Ok(self.overrides.clone())
    }

    fn finish(&self) -> Result<(), TrackingError> {
        let mut state = self.state();
        state.finish_count += 1;
        state.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recording_tracker_records_events() {
        let tracker = RecordingTracker::new();
        tracker.log("train", json!({"train": []})).unwrap();
        tracker.log("tune", json!({"lr": 0.1})).unwrap();
        assert_eq!(tracker.events().len(), 2);
        assert_eq!(tracker.events_named("tune"), vec![json!({"lr": 0.1})]);
    }

    #[test]
    fn test_log_after_finish_fails() {
        let tracker = RecordingTracker::new();
        tracker.finish().unwrap();
        tracker.finish().unwrap();
        assert_eq!(tracker.finish_count(), 2);
        assert!(matches!(
            tracker.log("train", json!({})),
            Err(TrackingError::Finished)
        ));
    }

    #[test]
    fn test_failing_logs() {
        let tracker = RecordingTracker::new().failing_logs();
        assert!(tracker.log("train", json!({})).is_err());
    }
}
