//! Prediction overlays sent to the tracking service.

use super::batch::{BatchEnd, ImageTensor, LabelMask};
use super::callbacks::TrainingCallback;
use crate::config::Cadence;
use crate::error::SegrunError;
use crate::tracking::Tracker;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Per-channel normalization the inputs were produced with.
pub const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Samples logged per acting batch.
pub const DEFAULT_SAMPLES: usize = 5;

pub const PASCAL_VOC_CLASSES: [&str; 21] = [
    "background",
    "airplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "table",
    "dog",
    "horse",
    "motorbike",
    "person",
    "potted_plant",
    "sheep",
    "sofa",
    "train",
    "tv",
];

/// Height x width x RGB.
pub type HwcImage = Vec<Vec<[f32; 3]>>;

/// Undo input normalization (`x * std + mean`), clip to [0, 1] and lay out
/// as HWC.
pub fn denormalize(image: &ImageTensor) -> crate::Result<HwcImage> {
    if image.channels != 3 || !image.is_well_formed() {
        return Err(SegrunError::invalid_input(format!(
            "expected a 3-channel {}x{} image, got {} channels and {} values",
            image.height,
            image.width,
            image.channels,
            image.data.len()
        )));
    }
    Ok((0..image.height)
        .map(|y| {
            (0..image.width)
                .map(|x| {
                    let mut pixel = [0.0; 3];
                    for (c, value) in pixel.iter_mut().enumerate() {
                        *value = (image.at(c, y, x) * CHANNEL_STD[c] + CHANNEL_MEAN[c]).clamp(0.0, 1.0);
                    }
                    pixel
                })
                .collect()
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct MaskOverlay {
    pub mask_data: Vec<Vec<u32>>,
    pub class_labels: BTreeMap<u32, &'static str>,
}

impl MaskOverlay {
    fn new(mask: &LabelMask) -> crate::Result<Self> {
        if !mask.is_well_formed() {
            return Err(SegrunError::invalid_input(format!(
                "mask of {}x{} holds {} values",
                mask.height,
                mask.width,
                mask.data.len()
            )));
        }
        let rows = if mask.width == 0 {
            Vec::new()
        } else {
            mask.data.chunks(mask.width).map(<[u32]>::to_vec).collect()
        };
        Ok(Self {
            mask_data: rows,
            class_labels: class_labels(),
        })
    }
}

fn class_labels() -> BTreeMap<u32, &'static str> {
    (0u32..).zip(PASCAL_VOC_CLASSES).collect()
}

/// One image with its predicted and ground-truth masks.
#[derive(Debug, Clone, Serialize)]
pub struct OverlaySample {
    pub image: HwcImage,
    pub masks: BTreeMap<&'static str, MaskOverlay>,
}

/// Logs prediction overlays for the first batch of every `cadence`-th epoch.
pub struct PredictionLogger {
    cadence: Cadence,
    tracker: Arc<dyn Tracker>,
}

impl PredictionLogger {
    pub fn new(cadence: Cadence, tracker: Arc<dyn Tracker>) -> Self {
        Self {
            cadence,
            tracker,
        }
    }

    fn should_log(&self, event: &BatchEnd<'_>) -> bool {
        event.batch_idx == 0 && self.cadence.fires_at(event.epoch)
    }

    fn overlays(&self, event: &BatchEnd<'_>) -> crate::Result<Vec<OverlaySample>> {
        let batch = event.batch;
        let count = DEFAULT_SAMPLES.min(batch.len());
        if batch.predictions.len() < count || batch.targets.len() < count {
            return Err(SegrunError::invalid_input(format!(
                "batch has {} inputs but {} predictions and {} targets",
                batch.len(),
                batch.predictions.len(),
                batch.targets.len()
            )));
        }

        (0..count)
            .map(|i| -> crate::Result<OverlaySample> {
                let masks = BTreeMap::from([
                    ("prediction", MaskOverlay::new(&batch.predictions[i])?),
                    ("ground truth", MaskOverlay::new(&batch.targets[i])?),
                ]);
                Ok(OverlaySample {
                    image: denormalize(&batch.inputs[i])?,
                    masks,
                })
            })
            .collect()
    }
}

impl TrainingCallback for PredictionLogger {
    fn name(&self) -> &str {
        "prediction_logger"
    }

    fn on_batch_end(&mut self, event: &BatchEnd<'_>) -> crate::Result<()> {
        if !self.should_log(event) {
            return Ok(());
        }
        let samples = self.overlays(event)?;
        let phase = event.phase.as_str();
        debug!(phase, epoch = event.epoch, samples = samples.len(), "Logging predictions");

        let mut payload = serde_json::Map::new();
        payload.insert(phase.to_string(), serde_json::to_value(samples)?);
        self.tracker.log(phase, payload.into())?;
        Ok(())
    }
}
