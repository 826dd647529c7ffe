//! Training orchestration: the agent state machine, the callback contract,
//! and the runtime interface the agent drives.

pub mod agent;
pub mod batch;
pub mod callbacks;
pub mod metrics;
pub mod runtime;
pub mod subprocess;
pub mod visualize;

pub use agent::{Agent, AgentArgs, AgentState, TunePhase, Trainer};
pub use batch::{BatchEnd, ImageTensor, LabelMask, Phase, SampleBatch};
pub use callbacks::{
    CallbackAction, CallbackSet, CheckpointCallback, Directives, EarlyStoppingCallback,
    EpochMetrics, MonitorMode, TrainingCallback,
};
pub use metrics::TrainingMetrics;
pub use runtime::{TrainerControls, TrainingRuntime, TuneOutcome};
pub use subprocess::SubprocessRuntime;
pub use visualize::PredictionLogger;
