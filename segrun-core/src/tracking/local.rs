//! Offline tracking store.
//!
//! Layout under the save directory:
//!
//! ```text
//! <save_dir>/
//!   overrides.json          optional, applied to every run
//!   <run_id>/
//!     run.json              ids, project, configuration, environment
//!     events.jsonl          one timestamped event per line
//!     model.json            watched model descriptor
//! ```

use super::Tracker;
use crate::config::{Configuration, Overrides};
use crate::error::TrackingError;
use crate::reproducibility::EnvironmentSnapshot;
use crate::strategies::Model;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

const OVERRIDES_FILE: &str = "overrides.json";

/// Contents of `run.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub project: String,
    pub entity: String,
    pub config: Value,
    pub environment: EnvironmentSnapshot,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct EventLine<'a> {
    timestamp: DateTime<Utc>,
    event: &'a str,
    payload: &'a Value,
}

struct Open {
    record: RunRecord,
    events: Option<BufWriter<File>>,
}

/// Tracker writing one directory per run.
pub struct LocalTracker {
    root: PathBuf,
    run_dir: PathBuf,
    state: Mutex<Open>,
}

fn write_error(context: &str, err: impl std::fmt::Display) -> TrackingError {
    TrackingError::Write {
        message: format!("{context}: {err}"),
    }
}

impl LocalTracker {
    /// Start a run under `root` for `config`.
    pub fn create(root: impl AsRef<Path>, config: &Configuration) -> Result<Self, TrackingError> {
        let root = root.as_ref().to_path_buf();
        let run_id = uuid::Uuid::new_v4().to_string();
        let run_dir = root.join(&run_id);
        fs::create_dir_all(&run_dir)
            .map_err(|e| write_error(&format!("creating {}", run_dir.display()), e))?;

        let record = RunRecord {
            run_id: run_id.clone(),
            project: config.run.tracking_project.clone(),
            entity: config.run.tracking_entity.clone(),
            config: serde_json::to_value(config).map_err(|e| write_error("serializing config", e))?,
            environment: EnvironmentSnapshot::capture(),
            started_at: Utc::now(),
            finished_at: None,
        };
        write_json(&run_dir.join("run.json"), &record)?;

        let events = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("events.jsonl"))
            .map_err(|e| write_error("opening events.jsonl", e))?;

        info!(run_id = %run_id, dir = %run_dir.display(), "Tracking run started");
        Ok(Self {
            root,
            run_dir,
            state: Mutex::new(Open {
                record,
                events: Some(BufWriter::new(events)),
            }),
        })
    }

    pub fn run_id(&self) -> String {
        self.state().record.run_id.clone()
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Replace the configuration in `run.json`, e.g. after remote
    /// overrides were applied.
    pub fn record_config(&self, config: &Configuration) -> Result<(), TrackingError> {
        let mut state = self.state();
        if state.events.is_none() {
            return Err(TrackingError::Finished);
        }
        state.record.config =
            serde_json::to_value(config).map_err(|e| write_error("serializing config", e))?;
        write_json(&self.run_dir.join("run.json"), &state.record)
    }

    fn state(&self) -> MutexGuard<'_, Open> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<(), TrackingError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| write_error(&format!("serializing {}", path.display()), e))?;
    fs::write(path, json).map_err(|e| write_error(&format!("writing {}", path.display()), e))
}

impl Tracker for LocalTracker {
    fn watch(&self, model: &dyn Model) -> Result<(), TrackingError> {
        debug!(model = model.name(), "Watching model");
        write_json(&self.run_dir.join("model.json"), &model.descriptor())
    }

    fn log(&self, event: &str, payload: Value) -> Result<(), TrackingError> {
        let mut state = self.state();
        let writer = state.events.as_mut().ok_or(TrackingError::Finished)?;
        let line = EventLine {
            timestamp: Utc::now(),
            event,
            payload: &payload,
        };
        serde_json::to_writer(&mut *writer, &line).map_err(|e| write_error("encoding event", e))?;
        writer
            .write_all(b"\n")
            .and_then(|_| writer.flush())
            .map_err(|e| write_error("writing events.jsonl", e))
    }

    fn remote_overrides(&self) -> Result<Overrides, TrackingError> {
        let path = self.root.join(OVERRIDES_FILE);
        if !path.exists() {
            return Ok(Overrides::new());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| write_error(&format!("reading {}", path.display()), e))?;
        let fields: serde_json::Map<String, Value> =
            serde_json::from_str(&content).map_err(|e| TrackingError::InvalidOverrides {
                message: format!("{}: {e}", path.display()),
            })?;

        let mut overrides = Overrides::new();
        for (key, value) in fields {
            overrides.set(key, value);
        }
        debug!(count = overrides.len(), "Loaded remote overrides");
        Ok(overrides)
    }

    fn finish(&self) -> Result<(), TrackingError> {
        let mut state = self.state();
        let Some(mut events) = state.events.take() else {
            return Ok(());
        };
        events
            .flush()
            .map_err(|e| write_error("flushing events.jsonl", e))?;
        state.record.finished_at = Some(Utc::now());
        write_json(&self.run_dir.join("run.json"), &state.record)?;
        info!(run_id = %state.record.run_id, "Tracking run finished");
        Ok(())
    }
}
