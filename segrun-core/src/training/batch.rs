//! Batch payloads delivered to batch-end listeners.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which loop a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Train,
    Validation,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Validation => "validation",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized image, channel-major (CHW).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTensor {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl ImageTensor {
    /// Number of values the dimensions call for; `None` on overflow.
    pub fn expected_len(&self) -> Option<usize> {
        self.channels
            .checked_mul(self.height)?
            .checked_mul(self.width)
    }

    pub fn is_well_formed(&self) -> bool {
        self.expected_len() == Some(self.data.len())
    }

    /// Value at channel `c`, row `y`, column `x`. Only valid on a
    /// well-formed image.
    pub fn at(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.height + y) * self.width + x]
    }
}

/// Per-pixel class indices, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelMask {
    pub height: usize,
    pub width: usize,
    pub data: Vec<u32>,
}

impl LabelMask {
    /// Number of values the dimensions call for; `None` on overflow.
    pub fn expected_len(&self) -> Option<usize> {
        self.height.checked_mul(self.width)
    }

    pub fn is_well_formed(&self) -> bool {
        self.expected_len() == Some(self.data.len())
    }
}

/// Inputs, ground truth and predictions of one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    #[serde(default)]
    pub inputs: Vec<ImageTensor>,
    #[serde(default)]
    pub targets: Vec<LabelMask>,
    #[serde(default)]
    pub predictions: Vec<LabelMask>,
}

impl SampleBatch {
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// A batch-end notification.
#[derive(Debug, Clone, Copy)]
pub struct BatchEnd<'a> {
    pub phase: Phase,
    pub epoch: usize,
    pub batch_idx: usize,
    pub batch: &'a SampleBatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_shape() {
        let image = ImageTensor {
            channels: 3,
            height: 2,
            width: 2,
            data: vec![0.0; 12],
        };
        assert_eq!(image.expected_len(), Some(12));
        assert!(image.is_well_formed());
    }

    #[test]
    fn test_overflowing_dimensions_are_malformed() {
        let image = ImageTensor {
            channels: 3,
            height: 1 << 62,
            width: 4,
            data: Vec::new(),
        };
        assert_eq!(image.expected_len(), None);
        assert!(!image.is_well_formed());

        let mask = LabelMask {
            height: 1 << 62,
            width: 4,
            data: Vec::new(),
        };
        assert_eq!(mask.expected_len(), None);
        assert!(!mask.is_well_formed());
    }

    #[test]
    fn test_batch_from_trainer_json() {
        let batch: SampleBatch = serde_json::from_str(
            r#"{"inputs": [{"channels": 3, "height": 4611686018427387904, "width": 4, "data": []}]}"#,
        )
        .unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch.targets.is_empty());
        assert!(!batch.inputs[0].is_well_formed());
    }
}
