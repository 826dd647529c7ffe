//! Training runtime backed by an external trainer process.
//!
//! The trainer (usually a Python script) reads one JSON request on stdin and
//! streams JSON-line events on stdout:
//!
//! ```text
//! -> {"op": "fit", "model": {..}, "data": {..}, "controls": {..}, "callbacks": [..]}
//! <- {"event": "batch_end", "phase": "train", "epoch": 0, "batch_idx": 0, "batch": {..}}
//! <- {"event": "epoch_end", "epoch": 0, "metrics": {"val_loss": 0.4}}
//! -> {"checkpoint": true, "stop": false}
//! <- {"event": "done"}
//! ```
//!
//! Tuning requests (`tune_lr`, `tune_batch_size`) answer with `suggestion`,
//! `unsupported` or `failed`. Lines that are not JSON are trainer chatter.

use super::batch::{BatchEnd, Phase, SampleBatch};
use super::callbacks::{CallbackSet, EpochMetrics};
use super::metrics::TrainingMetrics;
use super::runtime::{TrainerControls, TrainingRuntime, TuneOutcome};
use crate::error::RuntimeFailure;
use crate::strategies::{DataModule, Model};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct Request<'a> {
    op: &'a str,
    model: Value,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    controls: Option<&'a TrainerControls>,
    callbacks: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum TrainerEvent {
    BatchEnd {
        phase: Phase,
        epoch: usize,
        batch_idx: usize,
        #[serde(default)]
        batch: SampleBatch,
    },
    EpochEnd {
        epoch: usize,
        #[serde(default)]
        metrics: EpochMetrics,
    },
    Suggestion {
        value: Value,
    },
    Unsupported {
        #[serde(default)]
        reason: Option<String>,
    },
    Done,
    Failed {
        message: String,
    },
}

/// One running trainer process.
struct Session {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
}

impl Session {
    async fn send(&mut self, value: &impl Serialize) -> Result<(), RuntimeFailure> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| RuntimeFailure::protocol("trainer stdin already closed"))?;
        let mut line = serde_json::to_vec(value)
            .map_err(|e| RuntimeFailure::protocol(format!("encoding message: {e}")))?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Next protocol event, or `None` once the trainer closed stdout.
    async fn next_event(&mut self) -> Result<Option<TrainerEvent>, RuntimeFailure> {
        while let Some(line) = self.lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
                debug!(line = trimmed, "trainer");
                continue;
            };
            if !value.is_object() {
                debug!(line = trimmed, "trainer");
                continue;
            }
            let event = serde_json::from_value(value)
                .map_err(|e| RuntimeFailure::protocol(format!("invalid event '{trimmed}': {e}")))?;
            return Ok(Some(event));
        }
        Ok(None)
    }

    /// Close stdin and wait for a clean exit.
    async fn wait(mut self) -> Result<(), RuntimeFailure> {
        drop(self.stdin.take());
        let status = self.child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(RuntimeFailure::Exited {
                status: status.to_string(),
            })
        }
    }

    /// The trainer stopped talking without finishing: report how it exited.
    async fn closed_early(self, op: &str) -> RuntimeFailure {
        match self.wait().await {
            Ok(()) => RuntimeFailure::protocol(format!("trainer closed its output during '{op}'")),
            Err(failure) => failure,
        }
    }

    async fn abort(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "Failed to kill trainer");
        }
    }
}

/// Runs every request in a fresh trainer process.
#[derive(Debug, Clone)]
pub struct SubprocessRuntime {
    program: PathBuf,
    args: Vec<String>,
    workspace: PathBuf,
    tune_timeout: Duration,
}

impl SubprocessRuntime {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            workspace: workspace.into(),
            tune_timeout: Duration::from_secs(300),
        }
    }

    /// `python3 <script>` run from `workspace`.
    pub fn python(script: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Self {
        let script: PathBuf = script.into();
        Self::new("python3", vec![script.display().to_string()], workspace)
    }

    /// Use another interpreter for [`SubprocessRuntime::python`].
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_tune_timeout(mut self, timeout: Duration) -> Self {
        self.tune_timeout = timeout;
        self
    }

    async fn start(&self, request: &Request<'_>) -> Result<Session, RuntimeFailure> {
        debug!(program = %self.program.display(), op = request.op, "Starting trainer");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeFailure::Spawn {
                message: format!("{}: {e}", self.program.display()),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeFailure::protocol("trainer stdout not captured"))?;
        let mut session = Session {
            stdin: child.stdin.take(),
            lines: BufReader::new(stdout).lines(),
            child,
        };
        session.send(request).await?;
        Ok(session)
    }

    async fn tune<T: DeserializeOwned>(
        &self,
        op: &str,
        model: &dyn Model,
        data: &dyn DataModule,
    ) -> Result<TuneOutcome<T>, RuntimeFailure> {
        let request = Request {
            op,
            model: model.descriptor(),
            data: data.descriptor(),
            controls: None,
            callbacks: Vec::new(),
        };

        let exchange = self.tune_exchange(op, &request);
        match tokio::time::timeout(self.tune_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeFailure::Timeout {
                timeout_secs: self.tune_timeout.as_secs(),
            }),
        }
    }

    async fn tune_exchange<T: DeserializeOwned>(
        &self,
        op: &str,
        request: &Request<'_>,
    ) -> Result<TuneOutcome<T>, RuntimeFailure> {
        let mut session = self.start(request).await?;
        loop {
            match session.next_event().await? {
                None => return Err(session.closed_early(op).await),
                Some(TrainerEvent::Suggestion { value }) => {
                    let value = serde_json::from_value(value).map_err(|e| {
                        RuntimeFailure::protocol(format!("invalid '{op}' suggestion: {e}"))
                    })?;
                    session.wait().await?;
                    return Ok(TuneOutcome::Suggested(value));
                }
                Some(TrainerEvent::Unsupported { reason }) => {
                    debug!(op, reason = reason.as_deref().unwrap_or(""), "Tuning unsupported");
                    session.wait().await?;
                    return Ok(TuneOutcome::Unsupported);
                }
                Some(TrainerEvent::Failed { message }) => {
                    session.abort().await;
                    return Err(RuntimeFailure::reported(message));
                }
                Some(TrainerEvent::Done) => {
                    session.abort().await;
                    return Err(RuntimeFailure::protocol(format!(
                        "'{op}' finished without a suggestion"
                    )));
                }
                Some(other) => debug!(op, event = ?other, "Ignoring event during tuning"),
            }
        }
    }
}

#[async_trait]
impl TrainingRuntime for SubprocessRuntime {
    async fn fit(
        &self,
        model: &dyn Model,
        data: &dyn DataModule,
        controls: &TrainerControls,
        callbacks: &mut CallbackSet,
    ) -> Result<TrainingMetrics, RuntimeFailure> {
        let request = Request {
            op: "fit",
            model: model.descriptor(),
            data: data.descriptor(),
            controls: Some(controls),
            callbacks: callbacks.names(),
        };
        let mut session = self.start(&request).await?;
        let mut metrics = TrainingMetrics::default();

        loop {
            match session.next_event().await? {
                None => return Err(session.closed_early("fit").await),
                Some(TrainerEvent::BatchEnd {
                    phase,
                    epoch,
                    batch_idx,
                    batch,
                }) => {
                    let event = BatchEnd {
                        phase,
                        epoch,
                        batch_idx,
                        batch: &batch,
                    };
                    if let Err(failure) = callbacks.batch_end(&event) {
                        session.abort().await;
                        return Err(failure);
                    }
                }
                Some(TrainerEvent::EpochEnd {
                    epoch,
                    metrics: epoch_metrics,
                }) => {
                    metrics.record_epoch(epoch, &epoch_metrics);
                    let directives = callbacks.epoch_end(epoch, &epoch_metrics);
                    if directives.checkpoint {
                        metrics.checkpoints += 1;
                    }
                    if directives.stop {
                        info!(epoch, "Stopping early");
                        metrics.stopped_early = true;
                    }
                    session.send(&directives).await?;
                }
                Some(TrainerEvent::Done) => break,
                Some(TrainerEvent::Failed { message }) => {
                    session.abort().await;
                    return Err(RuntimeFailure::reported(message));
                }
                Some(other) => {
                    session.abort().await;
                    return Err(RuntimeFailure::protocol(format!(
                        "unexpected event during fit: {other:?}"
                    )));
                }
            }
        }

        session.wait().await?;
        Ok(metrics)
    }

    async fn tune_learning_rate(
        &self,
        model: &dyn Model,
        data: &dyn DataModule,
    ) -> Result<TuneOutcome<f64>, RuntimeFailure> {
        self.tune("tune_lr", model, data).await
    }

    async fn tune_batch_size(
        &self,
        model: &dyn Model,
        data: &dyn DataModule,
    ) -> Result<TuneOutcome<u32>, RuntimeFailure> {
        self.tune("tune_batch_size", model, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_parsing() {
        let event: TrainerEvent = serde_json::from_str(
            r#"{"event": "epoch_end", "epoch": 2, "metrics": {"val_loss": 0.25}}"#,
        )
        .unwrap();
        match event {
            TrainerEvent::EpochEnd { epoch, metrics } => {
                assert_eq!(epoch, 2);
                assert_eq!(metrics["val_loss"], 0.25);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let event: TrainerEvent =
            serde_json::from_str(r#"{"event": "batch_end", "phase": "validation", "epoch": 0, "batch_idx": 3}"#)
                .unwrap();
        assert!(matches!(
            event,
            TrainerEvent::BatchEnd { phase: Phase::Validation, batch_idx: 3, ref batch, .. } if batch.is_empty()
        ));
    }

    #[test]
    fn test_request_encoding() {
        let request = Request {
            op: "tune_lr",
            model: serde_json::json!({"name": "SegNet"}),
            data: Value::Null,
            controls: None,
            callbacks: Vec::new(),
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["op"], "tune_lr");
        assert!(encoded.get("controls").is_none());
    }

    #[test]
    fn test_python_runtime_arguments() {
        let runtime = SubprocessRuntime::python("train.py", "/tmp");
        assert_eq!(runtime.program, PathBuf::from("python3"));
        assert_eq!(runtime.args, vec!["train.py".to_string()]);
    }
}
