//! Layered composition and derivation of a run [`Configuration`].
//!
//! Uses `figment` for layering: group defaults -> TOML file -> environment
//! (`SEGRUN_RUN__ARCHITECTURE`, ...) -> explicit overrides. Derivations then
//! run in a fixed order: family selection, seed, backbone parameters, and
//! finally the seeding of every random source.

use super::family::{BackboneParameters, Network, select_family};
use super::{
    CallbackParams, Configuration, DatasetParams, MetricsParams, OptimizerParams, Overrides,
    ParameterGroup, Precision, RunMeta,
};
use crate::error::{ConfigError, SchemaError};
use crate::reproducibility::SeedContext;
use figment::error::Kind;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::PathBuf;
use tracing::{debug, info};

/// Seeds drawn for runs that did not fix one.
pub const SEED_RANGE: Range<u64> = 1..10_000;

/// Every group as one figment document; `network` stays untyped until the
/// family is known.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Layered {
    run: RunMeta,
    optim: OptimizerParams,
    data: DatasetParams,
    callbacks: CallbackParams,
    metrics: MetricsParams,
    network: BTreeMap<String, serde_json::Value>,
}

/// A derived configuration and the seed context established from it.
#[derive(Debug, Clone)]
pub struct Composition {
    pub config: Configuration,
    pub seeds: SeedContext,
}

/// Builds a [`Configuration`] from defaults and override layers.
#[derive(Debug, Clone)]
pub struct Composer {
    file: Option<PathBuf>,
    env_prefix: Option<String>,
}

impl Default for Composer {
    fn default() -> Self {
        Self::new()
    }
}

impl Composer {
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: Some("SEGRUN_".to_string()),
        }
    }

    /// Layer a TOML file between the defaults and the environment.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Ignore `SEGRUN_*` environment variables.
    pub fn without_env(mut self) -> Self {
        self.env_prefix = None;
        self
    }

    /// Compose with a seed drawn from the thread RNG when none is set.
    pub fn compose(&self, overrides: &Overrides) -> crate::Result<Composition> {
        self.compose_with_rng(overrides, &mut rand::thread_rng())
    }

    pub fn compose_with_rng<R: Rng + ?Sized>(
        &self,
        overrides: &Overrides,
        rng: &mut R,
    ) -> crate::Result<Composition> {
        let mut resolved = overrides.resolve()?;
        let network_overrides = resolved.take_group(super::family::NETWORK_PREFIX);

        // 1. Merge layers onto the group defaults.
        let mut figment = Figment::from(Serialized::defaults(Layered::default()));
        if let Some(path) = &self.file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound { path: path.clone() }.into());
            }
            figment = figment.merge(Toml::file(path));
        }
        if let Some(prefix) = &self.env_prefix {
            figment = figment.merge(Env::prefixed(prefix).split("__"));
        }
        figment = figment.merge(Serialized::defaults(resolved.into_layer()));

        let layered: Layered = figment
            .extract()
            .map_err(|e| schema_error(None, &e))?;
        Precision::try_from(layered.run.precision)?;

        // 2. Model family.
        let kind = select_family(&layered.run.architecture)?;
        let mut network_fields = layered.network;
        network_fields.extend(network_overrides);
        let family = kind.default_block().merge_overrides(&network_fields)?;
        debug!(architecture = %layered.run.architecture, family = %kind, "Selected model family");

        // 3. Seed.
        let mut run = layered.run;
        let seed = match run.seed {
            Some(seed) => seed,
            None => rng.gen_range(SEED_RANGE),
        };
        run.seed = Some(seed);

        // 4. Backbone geometry.
        let backbone_parameters =
            BackboneParameters::for_backbone(family.backbone(), layered.data.input_size)?;

        let config = Configuration {
            run,
            optim: layered.optim,
            data: layered.data,
            callbacks: layered.callbacks,
            metrics: layered.metrics,
            network: Network {
                family,
                backbone_parameters,
            },
        };

        // 5. Seed every random source, once.
        let seeds = SeedContext::establish(seed, config.run.gpu);
        info!(
            architecture = %config.run.architecture,
            backbone = %config.network.family.backbone(),
            "Configuration composed"
        );

        Ok(Composition { config, seeds })
    }
}

/// Merge `fields` onto `base`, re-validating every field.
pub(crate) fn merge_group<G: ParameterGroup>(
    base: &G,
    fields: &BTreeMap<String, serde_json::Value>,
) -> Result<G, SchemaError> {
    Figment::from(Serialized::defaults(base))
        .merge(Serialized::defaults(fields))
        .extract()
        .map_err(|e| schema_error(Some(G::PREFIX), &e))
}

/// Translate a figment extraction error into a [`SchemaError`] naming the
/// dotted field path.
fn schema_error(scope: Option<&str>, err: &figment::Error) -> SchemaError {
    let mut path: Vec<String> = scope.map(str::to_string).into_iter().collect();
    path.extend(err.path.iter().cloned());

    match &err.kind {
        Kind::UnknownField(field, _) => {
            if path.last() != Some(field) {
                path.push(field.clone());
            }
            SchemaError::UnknownField {
                field: path.join("."),
            }
        }
        Kind::InvalidType(actual, expected) | Kind::InvalidValue(actual, expected) => {
            SchemaError::TypeMismatch {
                field: path.join("."),
                expected: expected.clone(),
                found: actual.to_string(),
            }
        }
        Kind::InvalidLength(len, expected) => SchemaError::TypeMismatch {
            field: path.join("."),
            expected: expected.clone(),
            found: format!("a sequence of length {len}"),
        },
        _ => SchemaError::Source {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Cadence, FamilyKind, ModelFamily};
    use crate::error::SegrunError;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::io::Write;

    fn compose(overrides: Overrides) -> crate::Result<Composition> {
        Composer::new().without_env().compose(&overrides)
    }

    #[test]
    fn test_defaults_compose() {
        let composed = compose(Overrides::new()).unwrap();
        let config = composed.config;
        assert_eq!(config.network.family.kind(), FamilyKind::BarlowTwins);
        assert_eq!(config.network.family.backbone(), "resnet50");
        assert!(config.network.backbone_parameters.is_none());
        assert!(SEED_RANGE.contains(&config.seed()));
        assert_eq!(composed.seeds.seed(), config.seed());
    }

    #[test]
    fn test_segnet_scenario() {
        let overrides = Overrides::new()
            .with("architecture", "SegNet")
            .with("backbone", "resnet50");
        let config = compose(overrides).unwrap().config;
        assert!(matches!(config.network.family, ModelFamily::Segmentation(_)));
        assert!(config.network.backbone_parameters.is_none());
        assert!(SEED_RANGE.contains(&config.seed()));
    }

    #[test]
    fn test_vit_scenario() {
        let overrides = Overrides::parse(["backbone=vit", "input_size=(32,32)"]).unwrap();
        let config = compose(overrides).unwrap().config;
        let params = config.network.backbone_parameters.unwrap();
        assert_eq!(params.patch_size, 4);
        assert_eq!(params.image_size, 32);
    }

    #[test]
    fn test_dino_defaults_to_vit_parameters() {
        let overrides = Overrides::parse(["architecture=Dino", "input_size=(224,224)"]).unwrap();
        let config = compose(overrides).unwrap().config;
        assert_eq!(config.network.backbone_parameters.unwrap().patch_size, 28);
    }

    #[test]
    fn test_unmatched_architecture_fails() {
        let err = compose(Overrides::new().with("architecture", "ResNet")).unwrap_err();
        assert!(matches!(
            err,
            SegrunError::Config(ConfigError::NoArchitectureFamily { ref architecture })
                if architecture == "ResNet"
        ));
    }

    #[test]
    fn test_type_mismatch_names_field() {
        let err = compose(Overrides::new().with("gpu", "many")).unwrap_err();
        match err {
            SegrunError::Schema(SchemaError::TypeMismatch { field, .. }) => {
                assert_eq!(field, "run.gpu")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_network_type_mismatch_names_field() {
        let err = compose(Overrides::new().with("lmbda", "large")).unwrap_err();
        match err {
            SegrunError::Schema(SchemaError::TypeMismatch { field, .. }) => {
                assert_eq!(field, "network.lmbda")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_field_of_other_family_rejected() {
        // `loss` exists only in the segmentation block.
        let err = compose(Overrides::new().with("loss", "dice")).unwrap_err();
        assert!(matches!(err, SegrunError::Schema(SchemaError::UnknownField { .. })));
    }

    #[test]
    fn test_invalid_precision() {
        let err = compose(Overrides::new().with("precision", 8)).unwrap_err();
        assert!(matches!(
            err,
            SegrunError::Config(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_fixed_seed_is_kept() {
        let config = compose(Overrides::new().with("seed", 1234)).unwrap().config;
        assert_eq!(config.run.seed, Some(1234));
    }

    #[test]
    fn test_seed_drawn_from_rng() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let composer = Composer::new().without_env();
        let first = composer.compose_with_rng(&Overrides::new(), &mut a).unwrap();
        let second = composer.compose_with_rng(&Overrides::new(), &mut b).unwrap();
        assert_eq!(first.config, second.config);
    }

    #[test]
    fn test_zero_cadence_accepted() {
        let config = compose(Overrides::new().with("log_pred_freq", 0))
            .unwrap()
            .config;
        assert_eq!(config.callbacks.log_pred_freq, Cadence::NEVER);
    }

    #[test]
    fn test_toml_file_layer() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[run]\narchitecture = \"SegNet\"\nmax_epochs = 12\n\n[network]\nbackbone = \"vit\"\n"
        )
        .unwrap();

        let composer = Composer::new().without_env().with_file(file.path());
        let config = composer
            .compose(&Overrides::new().with("run.max_epochs", 3))
            .unwrap()
            .config;
        assert_eq!(config.network.family.kind(), FamilyKind::Segmentation);
        assert_eq!(config.network.family.backbone(), "vit");
        // Explicit overrides beat the file.
        assert_eq!(config.run.max_epochs, 3);
    }

    #[test]
    fn test_unknown_field_in_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[run]\ncolour = \"red\"\n").unwrap();
        let err = Composer::new()
            .without_env()
            .with_file(file.path())
            .compose(&Overrides::new())
            .unwrap_err();
        match err {
            SegrunError::Schema(SchemaError::UnknownField { field }) => {
                assert!(field.ends_with("colour"), "field was {field}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_file() {
        let err = Composer::new()
            .without_env()
            .with_file("/nonexistent/segrun.toml")
            .compose(&Overrides::new())
            .unwrap_err();
        assert!(matches!(
            err,
            SegrunError::Config(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_gpu_zero_skips_device_seeding() {
        let composed = compose(Overrides::new().with("gpu", 0)).unwrap();
        assert!(!composed.seeds.device_seeding());
    }
}
