//! Configuration types for segrun runs.
//!
//! A run is described by a handful of parameter groups (run metadata,
//! optimizer, dataset, callback cadence, metrics) plus one model-family block
//! chosen from the architecture name. Groups are plain `serde` records with
//! defaults; [`Composer`] layers overrides onto them with `figment` and
//! performs the derivations.

mod compose;
mod family;
mod overrides;

pub use compose::{Composer, Composition, SEED_RANGE};
pub use family::{
    BackboneParameters, BarlowConfig, DinoConfig, FAMILY_RULES, FamilyKind, ModelFamily, Network,
    PARAMETERIZED_BACKBONE, SegConfig, select_family,
};
pub use overrides::{Overrides, ResolvedOverrides, parse_value};

use crate::error::{ConfigError, SchemaError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named, typed, defaulted bundle of configuration fields.
///
/// `PREFIX` is the override namespace (`run.max_epochs`) and `FIELDS` the
/// keys a user may set.
pub trait ParameterGroup: Default + Serialize + DeserializeOwned {
    const PREFIX: &'static str;
    const FIELDS: &'static [&'static str];
}

/// Declares a parameter group: the struct, its `Default`, and its
/// [`ParameterGroup`] metadata, from one list of `field: Type = default`.
macro_rules! parameter_group {
    (
        $(#[$meta:meta])*
        pub struct $name:ident as $prefix:literal {
            $(
                $(#[$fmeta:meta])*
                $field:ident : $ty:ty = $default:expr,
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(default, deny_unknown_fields)]
        pub struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $ty,
            )*
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    $($field: $default,)*
                }
            }
        }

        impl $crate::config::ParameterGroup for $name {
            const PREFIX: &'static str = $prefix;
            const FIELDS: &'static [&'static str] = &[$(stringify!($field)),*];
        }
    };
}

pub(crate) use parameter_group;

parameter_group! {
    /// Run metadata and trainer switches.
    pub struct RunMeta as "run" {
        /// Team the tracking run belongs to.
        tracking_entity: String = "recvis".to_string(),
        /// Tracking project name.
        tracking_project: String = "test-sem-seg".to_string(),
        /// Smoke-test the code before a real run.
        test: bool = true,
        /// Directory receiving tracking output.
        save_dir: String = "runs".to_string(),
        /// Agent strategy driving the run.
        agent: String = "trainer".to_string(),
        /// Architecture name; also selects the model-family block.
        architecture: String = "BarlowTwins".to_string(),
        /// Data module strategy.
        datamodule: String = "BarlowTwins".to_string(),
        /// Dataset handed to the data module.
        #[serde(skip_serializing_if = "Option::is_none")]
        dataset: Option<String> = Some("BarlowTwinsDataset".to_string()),
        /// Where trained weights are written.
        weights_path: String = "weights".to_string(),
        /// Where datasets are downloaded.
        asset_path: String = "assets".to_string(),
        /// Seed for the whole run; drawn at composition when unset.
        #[serde(skip_serializing_if = "Option::is_none")]
        seed: Option<u64> = None,
        /// Run the learning-rate finder before fitting.
        tune_lr: bool = false,
        /// Run the batch-size finder before fitting.
        tune_batch_size: bool = false,
        /// Number of GPUs.
        gpu: u32 = 1,
        /// Numeric precision in bits (16 or 32).
        precision: u32 = 32,
        /// Validate every N epochs.
        val_freq: u32 = 1,
        /// Gradient accumulation size in batches.
        accumulate_size: u32 = 256,
        max_epochs: u32 = 400,
        /// Process a single batch of each split and stop.
        dev_run: bool = false,
    }
}

parameter_group! {
    /// Optimizer and learning-rate schedule.
    pub struct OptimizerParams as "optim" {
        optimizer: String = "Adam".to_string(),
        lr: f64 = 3e-4,
        lr_sched_type: String = "step".to_string(),
        min_lr: f64 = 5e-6,
        betas: Vec<f64> = vec![0.9, 0.999],
        warmup_epochs: u32 = 40,
        max_epochs: u32 = 400,
        scheduler_parameters: BTreeMap<String, f64> = BTreeMap::from([
            ("warmup_start_lr".to_string(), 0.9995),
            ("max_epochs".to_string(), 0.0),
            ("warmup_epochs".to_string(), 40.0),
        ]),
    }
}

parameter_group! {
    /// Dataset and loader parameters.
    pub struct DatasetParams as "data" {
        num_workers: u32 = 20,
        /// Image size as (height, width).
        input_size: (u32, u32) = (32, 32),
        batch_size: u32 = 256,
        asset_path: String = "assets".to_string(),
        /// Number of crops (global + local).
        n_crops: u32 = 5,
        n_global_crops: u32 = 2,
        global_crops_scale: Vec<f64> = vec![0.5, 1.0],
        local_crops_scale: Vec<f64> = vec![0.05, 0.5],
    }
}

parameter_group! {
    /// How often the logging callbacks fire.
    pub struct CallbackParams as "callbacks" {
        /// Effective receptive fields.
        log_erf_freq: Cadence = Cadence(10),
        nb_erf: u32 = 6,
        /// Attention maps.
        log_att_freq: Cadence = Cadence(10),
        /// Prediction overlays.
        log_pred_freq: Cadence = Cadence(10),
        /// Cross-correlation matrix.
        log_ccm_freq: Cadence = Cadence(1),
        log_dino_freq: Cadence = Cadence(1),
        /// Threshold used when fusing attention heads.
        attention_threshold: f64 = 0.5,
        /// Images whose attention gets visualised.
        nb_attention: u32 = 5,
    }
}

parameter_group! {
    /// Segmentation metric settings.
    pub struct MetricsParams as "metrics" {
        num_classes: u32 = 21,
        average: String = "weighted".to_string(),
        mdmc_average: String = "global".to_string(),
        ignore_index: u32 = 21,
        metrics: Vec<String> = ["Accuracy", "Recall", "Precision", "F1", "IoU"]
            .iter()
            .map(|m| m.to_string())
            .collect(),
    }
}

/// An epoch interval; zero means "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cadence(pub u32);

impl Cadence {
    pub const NEVER: Cadence = Cadence(0);

    pub fn every(epochs: u32) -> Self {
        Self(epochs)
    }

    pub fn is_never(self) -> bool {
        self.0 == 0
    }

    /// Whether the periodic action fires during `epoch` (0-indexed).
    pub fn fires_at(self, epoch: usize) -> bool {
        !self.is_never() && epoch % self.0 as usize == 0
    }
}

/// Numeric precision of the fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum Precision {
    Half,
    Full,
}

impl TryFrom<u32> for Precision {
    type Error = ConfigError;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            16 => Ok(Self::Half),
            32 => Ok(Self::Full),
            other => Err(ConfigError::InvalidValue {
                field: "run.precision".into(),
                reason: format!("{other} bits is not supported, use 16 or 32"),
            }),
        }
    }
}

impl From<Precision> for u32 {
    fn from(precision: Precision) -> Self {
        match precision {
            Precision::Half => 16,
            Precision::Full => 32,
        }
    }
}

/// Run fields that feed derivations and cannot change after composition.
const DERIVATION_INPUTS: &[&str] = &["seed", "architecture", "gpu"];

/// Fully derived configuration for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Configuration {
    pub run: RunMeta,
    pub optim: OptimizerParams,
    pub data: DatasetParams,
    pub callbacks: CallbackParams,
    pub metrics: MetricsParams,
    pub network: Network,
}

impl Configuration {
    /// The resolved run seed.
    pub fn seed(&self) -> u64 {
        self.run.seed.unwrap_or_default()
    }

    pub fn precision(&self) -> Result<Precision, ConfigError> {
        Precision::try_from(self.run.precision)
    }

    /// Apply overrides pushed by the tracking service.
    ///
    /// Only run and optimizer fields may change, and never the ones other
    /// values were derived from. Must happen before the agent is built.
    pub fn apply_remote_overrides(&mut self, overrides: &Overrides) -> crate::Result<()> {
        let resolved = overrides.resolve()?;

        for (group, fields) in resolved.iter() {
            for field in fields.keys() {
                let qualified = format!("{group}.{field}");
                match group {
                    g if g == RunMeta::PREFIX => {
                        if DERIVATION_INPUTS.contains(&field.as_str()) {
                            return Err(ConfigError::FrozenField { field: qualified }.into());
                        }
                    }
                    g if g == OptimizerParams::PREFIX => {}
                    _ => return Err(unknown_field(qualified).into()),
                }
            }
        }

        let run = match resolved.group(RunMeta::PREFIX) {
            Some(fields) => compose::merge_group(&self.run, fields)?,
            None => self.run.clone(),
        };
        Precision::try_from(run.precision)?;
        let optim = match resolved.group(OptimizerParams::PREFIX) {
            Some(fields) => compose::merge_group(&self.optim, fields)?,
            None => self.optim.clone(),
        };

        self.run = run;
        self.optim = optim;
        Ok(())
    }

    /// Render as TOML, in the layout a configuration file uses.
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            SchemaError::Source {
                message: format!("rendering configuration: {e}"),
            }
            .into()
        })
    }

    /// Field names per override prefix, network fields included.
    pub fn schema() -> Vec<(&'static str, Vec<&'static str>)> {
        vec![
            (RunMeta::PREFIX, RunMeta::FIELDS.to_vec()),
            (OptimizerParams::PREFIX, OptimizerParams::FIELDS.to_vec()),
            (DatasetParams::PREFIX, DatasetParams::FIELDS.to_vec()),
            (CallbackParams::PREFIX, CallbackParams::FIELDS.to_vec()),
            (MetricsParams::PREFIX, MetricsParams::FIELDS.to_vec()),
            (family::NETWORK_PREFIX, ModelFamily::all_fields()),
        ]
    }
}

pub(crate) fn unknown_field(field: impl Into<String>) -> SchemaError {
    SchemaError::UnknownField {
        field: field.into(),
    }
}
