//! Model and data-module strategies.
//!
//! The core never builds networks or loads data itself. A strategy turns the
//! configuration into a descriptor the training runtime instantiates, and
//! keeps the few values tuning may change.

use crate::config::{
    BackboneParameters, Configuration, DatasetParams, FamilyKind, MetricsParams, ModelFamily,
    OptimizerParams,
};
use crate::error::{ConfigError, StrategyError};
use crate::registry::StrategyRegistry;
use crate::reproducibility::SeedContext;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// A trainable model as seen by the orchestrator.
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    /// Everything the training runtime needs to instantiate the network.
    fn descriptor(&self) -> Value;

    fn learning_rate(&self) -> f64;

    /// Apply a tuned learning rate.
    fn set_learning_rate(&mut self, lr: f64);
}

/// A source of training and validation batches.
pub trait DataModule: Send + Sync {
    fn name(&self) -> &str;

    fn descriptor(&self) -> Value;

    fn batch_size(&self) -> u32;

    /// Apply a tuned batch size.
    fn set_batch_size(&mut self, batch_size: u32);
}

/// Inputs handed to model and data-module factories.
#[derive(Debug, Clone)]
pub struct StrategyArgs {
    pub config: Arc<Configuration>,
    pub seeds: SeedContext,
}

/// Model strategy backed by one of the configured network families.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkModel {
    name: String,
    network: ModelFamily,
    #[serde(skip_serializing_if = "Option::is_none")]
    backbone_parameters: Option<BackboneParameters>,
    input_size: (u32, u32),
    optimizer: OptimizerParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<MetricsParams>,
    init_seed: u64,
}

impl NetworkModel {
    /// Build the model `name`, which requires the `expected` family.
    pub fn new(name: &str, expected: FamilyKind, args: &StrategyArgs) -> crate::Result<Self> {
        let config = &args.config;
        let found = config.network.family.kind();
        if found != expected {
            return Err(ConfigError::FamilyMismatch {
                strategy: name.to_string(),
                expected: expected.to_string(),
                found: found.to_string(),
            }
            .into());
        }

        let metrics = match expected {
            FamilyKind::Segmentation => Some(config.metrics.clone()),
            _ => None,
        };

        Ok(Self {
            name: name.to_string(),
            network: config.network.family.clone(),
            backbone_parameters: config.network.backbone_parameters.clone(),
            input_size: config.data.input_size,
            optimizer: config.optim.clone(),
            metrics,
            init_seed: args.seeds.component_seed("model"),
        })
    }
}

impl Model for NetworkModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn learning_rate(&self) -> f64 {
        self.optimizer.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.lr = lr;
    }
}

/// Data-module strategy describing a dataset and its loader.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetModule {
    name: String,
    dataset: String,
    params: DatasetParams,
    shuffle_seed: u64,
}

impl DatasetModule {
    /// `default_dataset` is used when the run does not name one.
    pub fn new(name: &str, default_dataset: &str, args: &StrategyArgs) -> Self {
        let config = &args.config;
        Self {
            name: name.to_string(),
            dataset: config
                .run
                .dataset
                .clone()
                .unwrap_or_else(|| default_dataset.to_string()),
            params: config.data.clone(),
            shuffle_seed: args.seeds.component_seed("data"),
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }
}

impl DataModule for DatasetModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn batch_size(&self) -> u32 {
        self.params.batch_size
    }

    fn set_batch_size(&mut self, batch_size: u32) {
        self.params.batch_size = batch_size;
    }
}

const BUILTIN_MODELS: &[(&str, FamilyKind)] = &[
    ("BarlowTwins", FamilyKind::BarlowTwins),
    ("Dino", FamilyKind::Dino),
    ("SegNet", FamilyKind::Segmentation),
    ("Deeplabv3", FamilyKind::Segmentation),
];

const BUILTIN_DATA_MODULES: &[(&str, &str)] = &[
    ("BarlowTwins", "BarlowTwinsDataset"),
    ("Dino", "DinoDataset"),
    ("Segmentation", "VOCSegmentation"),
];

/// Register the built-in models and data modules.
pub fn register_builtins(registry: &mut StrategyRegistry) -> Result<(), StrategyError> {
    for &(name, family) in BUILTIN_MODELS {
        registry.models.register(name, move |args: &StrategyArgs| {
            Ok(Box::new(NetworkModel::new(name, family, args)?) as Box<dyn Model>)
        })?;
    }
    for &(name, dataset) in BUILTIN_DATA_MODULES {
        registry.data_modules.register(name, move |args: &StrategyArgs| {
            Ok(Box::new(DatasetModule::new(name, dataset, args)) as Box<dyn DataModule>)
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Composer, Overrides};
    use crate::error::SegrunError;

    fn args(overrides: Overrides) -> StrategyArgs {
        let composition = Composer::new().without_env().compose(&overrides).unwrap();
        StrategyArgs {
            config: Arc::new(composition.config),
            seeds: composition.seeds,
        }
    }

    #[test]
    fn test_segmentation_model_descriptor() {
        let args = args(Overrides::new().with("architecture", "SegNet").with("seed", 5));
        let model = NetworkModel::new("SegNet", FamilyKind::Segmentation, &args).unwrap();
        let descriptor = model.descriptor();
        assert_eq!(descriptor["name"], "SegNet");
        assert_eq!(descriptor["network"]["name"], "segmentation");
        assert_eq!(descriptor["metrics"]["num_classes"], 21);
        assert_eq!(descriptor["init_seed"], args.seeds.component_seed("model"));
    }

    #[test]
    fn test_family_mismatch() {
        let args = args(Overrides::new().with("architecture", "BarlowTwins"));
        let err = NetworkModel::new("SegNet", FamilyKind::Segmentation, &args).unwrap_err();
        assert!(matches!(
            err,
            SegrunError::Config(ConfigError::FamilyMismatch { .. })
        ));
    }

    #[test]
    fn test_learning_rate_update() {
        let args = args(Overrides::new());
        let mut model = NetworkModel::new("BarlowTwins", FamilyKind::BarlowTwins, &args).unwrap();
        assert_eq!(model.learning_rate(), 3e-4);
        model.set_learning_rate(1e-2);
        assert_eq!(model.descriptor()["optimizer"]["lr"], 1e-2);
    }

    #[test]
    fn test_data_module_uses_configured_dataset() {
        let args = args(Overrides::new().with("dataset", "Cityscapes"));
        let mut data = DatasetModule::new("Segmentation", "VOCSegmentation", &args);
        assert_eq!(data.dataset(), "Cityscapes");
        data.set_batch_size(64);
        assert_eq!(data.batch_size(), 64);
        assert_eq!(data.descriptor()["params"]["batch_size"], 64);
    }

    #[test]
    fn test_data_module_default_dataset() {
        let args = args(Overrides::new().with("dataset", serde_json::Value::Null));
        let data = DatasetModule::new("Dino", "DinoDataset", &args);
        assert_eq!(data.dataset(), "DinoDataset");
    }
}
