//! Model-family blocks and the rules that pick one from the architecture.

use super::compose::merge_group;
use super::{ParameterGroup, parameter_group};
use crate::error::{ConfigError, SchemaError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub(crate) const NETWORK_PREFIX: &str = "network";

/// Backbone whose geometry has to be spelled out explicitly.
pub const PARAMETERIZED_BACKBONE: &str = "vit";

parameter_group! {
    /// Barlow Twins self-supervised pretraining.
    pub struct BarlowConfig as "network" {
        backbone: String = "resnet50".to_string(),
        /// Projection layers; 3 unless you know better.
        nb_proj_layers: u32 = 3,
        /// Scales the redundancy term so it does not swamp the invariance term.
        lmbda: f64 = 5e-3,
        bt_proj_dim: u32 = 2048,
        pretrained_encoder: bool = false,
        /// Only use backbone features when fine-tuning.
        use_backbone_features: bool = true,
        /// Checkpoint used for classification fine-tuning.
        #[serde(skip_serializing_if = "Option::is_none")]
        weight_checkpoint: Option<String> = None,
    }
}

parameter_group! {
    /// DINO self-distillation.
    pub struct DinoConfig as "network" {
        backbone: String = "vit".to_string(),
        out_dim: u32 = 65536,
        teacher_temp: f64 = 0.04,
        student_temp: f64 = 0.1,
        center_momentum: f64 = 0.9,
        pretrained_encoder: bool = false,
    }
}

parameter_group! {
    /// Supervised semantic segmentation.
    pub struct SegConfig as "network" {
        backbone: String = "resnet50".to_string(),
        pretrained: bool = true,
        loss: String = "cross_entropy".to_string(),
        dropout: f64 = 0.1,
        #[serde(skip_serializing_if = "Option::is_none")]
        weight_checkpoint: Option<String> = None,
    }
}

/// Architecture families with their own parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FamilyKind {
    BarlowTwins,
    Dino,
    Segmentation,
}

impl FamilyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BarlowTwins => "barlow_twins",
            Self::Dino => "dino",
            Self::Segmentation => "segmentation",
        }
    }

    pub fn default_block(self) -> ModelFamily {
        match self {
            Self::BarlowTwins => ModelFamily::BarlowTwins(BarlowConfig::default()),
            Self::Dino => ModelFamily::Dino(DinoConfig::default()),
            Self::Segmentation => ModelFamily::Segmentation(SegConfig::default()),
        }
    }
}

impl fmt::Display for FamilyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Substring rules matched against `run.architecture`, first match wins.
pub const FAMILY_RULES: &[(&str, FamilyKind)] = &[
    ("BarlowTwins", FamilyKind::BarlowTwins),
    ("Dino", FamilyKind::Dino),
    ("Seg", FamilyKind::Segmentation),
    ("Deeplab", FamilyKind::Segmentation),
];

pub fn select_family(architecture: &str) -> Result<FamilyKind, ConfigError> {
    FAMILY_RULES
        .iter()
        .find(|(needle, _)| architecture.contains(needle))
        .map(|(_, kind)| *kind)
        .ok_or_else(|| ConfigError::NoArchitectureFamily {
            architecture: architecture.to_string(),
        })
}

/// The one model-family block of a configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ModelFamily {
    BarlowTwins(BarlowConfig),
    Dino(DinoConfig),
    Segmentation(SegConfig),
}

impl ModelFamily {
    pub fn kind(&self) -> FamilyKind {
        match self {
            Self::BarlowTwins(_) => FamilyKind::BarlowTwins,
            Self::Dino(_) => FamilyKind::Dino,
            Self::Segmentation(_) => FamilyKind::Segmentation,
        }
    }

    pub fn backbone(&self) -> &str {
        match self {
            Self::BarlowTwins(block) => &block.backbone,
            Self::Dino(block) => &block.backbone,
            Self::Segmentation(block) => &block.backbone,
        }
    }

    /// Merge `network.*` overrides onto this block. Fields the family does
    /// not declare are rejected.
    pub fn merge_overrides(
        self,
        fields: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Self, SchemaError> {
        if fields.is_empty() {
            return Ok(self);
        }
        Ok(match self {
            Self::BarlowTwins(block) => Self::BarlowTwins(merge_group(&block, fields)?),
            Self::Dino(block) => Self::Dino(merge_group(&block, fields)?),
            Self::Segmentation(block) => Self::Segmentation(merge_group(&block, fields)?),
        })
    }

    /// Union of every family's fields, in declaration order.
    pub(crate) fn all_fields() -> Vec<&'static str> {
        let mut fields: Vec<&'static str> = Vec::new();
        for field in BarlowConfig::FIELDS
            .iter()
            .chain(DinoConfig::FIELDS)
            .chain(SegConfig::FIELDS)
        {
            if !fields.contains(field) {
                fields.push(*field);
            }
        }
        fields
    }
}

/// Model-family block plus the parameters derived from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Network {
    pub family: ModelFamily,
    /// Only set for [`PARAMETERIZED_BACKBONE`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backbone_parameters: Option<BackboneParameters>,
}

/// Explicit geometry for the patch-based transformer backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneParameters {
    pub image_size: u32,
    pub patch_size: u32,
    pub num_classes: u32,
    pub dim: u32,
    pub depth: u32,
    pub heads: u32,
    pub mlp_dim: u32,
    pub dropout: f64,
    pub emb_dropout: f64,
}

impl BackboneParameters {
    /// Patches per image side.
    pub const PATCHES_PER_SIDE: u32 = 8;

    /// Synthesize parameters for `backbone`, or `None` when it needs none.
    pub fn for_backbone(backbone: &str, input_size: (u32, u32)) -> Result<Option<Self>, ConfigError> {
        if backbone != PARAMETERIZED_BACKBONE {
            return Ok(None);
        }
        let edge = input_size.0;
        let patch_size = edge / Self::PATCHES_PER_SIDE;
        if patch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "data.input_size".into(),
                reason: format!(
                    "an edge of {edge} cannot be cut into {} patches",
                    Self::PATCHES_PER_SIDE
                ),
            });
        }
        Ok(Some(Self {
            image_size: edge,
            patch_size,
            num_classes: 0,
            dim: 768,
            depth: 4,
            heads: 6,
            mlp_dim: 1024,
            dropout: 0.1,
            emb_dropout: 0.1,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_family_by_substring() {
        assert_eq!(select_family("SegNet"), Ok(FamilyKind::Segmentation));
        assert_eq!(select_family("BarlowTwins"), Ok(FamilyKind::BarlowTwins));
        assert_eq!(select_family("DinoV2"), Ok(FamilyKind::Dino));
        assert_eq!(select_family("Deeplabv3"), Ok(FamilyKind::Segmentation));
    }

    #[test]
    fn test_select_family_priority() {
        // Both "BarlowTwins" and "Seg" match; the earlier rule wins.
        assert_eq!(
            select_family("BarlowTwinsSeg"),
            Ok(FamilyKind::BarlowTwins)
        );
    }

    #[test]
    fn test_select_family_no_match() {
        let err = select_family("ResNet").unwrap_err();
        assert_eq!(err.to_string(), "no architecture family for ResNet");
    }

    #[test]
    fn test_vit_patch_size() {
        let params = BackboneParameters::for_backbone("vit", (32, 32))
            .unwrap()
            .unwrap();
        assert_eq!(params.patch_size, 4);
        assert_eq!(params.image_size, 32);
        assert_eq!(params.num_classes, 0);
    }

    #[test]
    fn test_other_backbones_have_no_parameters() {
        assert_eq!(
            BackboneParameters::for_backbone("resnet50", (32, 32)),
            Ok(None)
        );
    }

    #[test]
    fn test_vit_rejects_tiny_inputs() {
        assert!(matches!(
            BackboneParameters::for_backbone("vit", (4, 4)),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_merge_overrides_rejects_foreign_field() {
        let fields = BTreeMap::from([("out_dim".to_string(), serde_json::json!(128))]);
        let err = FamilyKind::Segmentation
            .default_block()
            .merge_overrides(&fields)
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownField { ref field } if field.ends_with("out_dim")));
    }

    #[test]
    fn test_all_fields_is_deduplicated() {
        let fields = ModelFamily::all_fields();
        assert_eq!(fields.iter().filter(|f| **f == "backbone").count(), 1);
        assert!(fields.contains(&"lmbda"));
        assert!(fields.contains(&"loss"));
    }
}
