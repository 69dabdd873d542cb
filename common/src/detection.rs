//! Raw model output and the detections derived from it.
//!
use thiserror::Error;

use crate::catalog::ClassCatalog;

/// Minimum score a slot must exceed to become a detection.
pub const DETECTION_THRESHOLD: f32 = 0.75;

/// Slot vectors of a raw prediction disagree in length.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("slot count mismatch: {boxes} boxes, {scores} scores, {classes} classes")]
pub struct SlotCountMismatch {
    pub boxes: usize,
    pub scores: usize,
    pub classes: usize,
}

/// Unfiltered model output for one frame.
///
/// Boxes are normalised `[min_y, min_x, max_y, max_x]` fractions of the frame.
/// Slot `i` of each vector describes the same candidate.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawPrediction {
    boxes: Vec<[f32; 4]>,
    scores: Vec<f32>,
    classes: Vec<i64>,
}

impl RawPrediction {
    pub fn new(
        boxes: Vec<[f32; 4]>,
        scores: Vec<f32>,
        classes: Vec<i64>,
    ) -> Result<Self, SlotCountMismatch> {
        if boxes.len() != scores.len() || scores.len() != classes.len() {
            return Err(SlotCountMismatch {
                boxes: boxes.len(),
                scores: scores.len(),
                classes: classes.len(),
            });
        }

        Ok(Self {
            boxes,
            scores,
            classes,
        })
    }

    pub fn num_slots(&self) -> usize {
        self.scores.len()
    }

    /// Iterate over `(box, score, class)` triples in slot order.
    pub fn slots(&self) -> impl Iterator<Item = (&[f32; 4], f32, i64)> + '_ {
        self.boxes
            .iter()
            .zip(self.scores.iter().copied())
            .zip(self.classes.iter().copied())
            .map(|((bbox, score), class)| (bbox, score, class))
    }
}

/// Size of the displayed frame that detections are mapped onto.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
}

impl DisplaySize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for DisplaySize {
    fn default() -> Self {
        Self::new(600, 500)
    }
}

/// Axis-aligned rectangle in display pixels, anchored at its top-left corner.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    /// Scale a normalised `[min_y, min_x, max_y, max_x]` box to the display.
    pub fn from_normalized(bbox: &[f32; 4], display: DisplaySize) -> Self {
        let (width, height) = (display.width as f32, display.height as f32);
        let min_y = bbox[0] * height;
        let min_x = bbox[1] * width;
        let max_y = bbox[2] * height;
        let max_x = bbox[3] * width;

        Self {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        }
    }
}

/// Labelled, thresholded result in display coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_id: i64,
    pub label: String,
    pub score: f32,
    pub bbox: BBox,
}

impl Detection {
    /// Score with four decimals, e.g. `0.9000`.
    pub fn score_text(&self) -> String {
        format!("{:.4}", self.score)
    }

    /// Text drawn next to the box, e.g. `Kangaroo 90.00%`.
    ///
    /// The percentage is taken from the four-decimal score.
    pub fn caption(&self) -> String {
        let rounded = (self.score as f64 * 10_000.0).round() / 10_000.0;
        format!("{} {:.2}%", self.label, rounded * 100.0)
    }
}

/// Turn a raw prediction into detections.
///
/// Slots scoring strictly above `threshold` are scaled onto `display` and
/// labelled from `catalog`, keeping slot order. Slots whose box is not finite
/// or whose class id is not in the catalog are skipped and reported at warn
/// level.
pub fn build_detections(
    raw: &RawPrediction,
    threshold: f32,
    display: DisplaySize,
    catalog: &ClassCatalog,
) -> Vec<Detection> {
    raw.slots()
        .enumerate()
        .filter(|(_, (_, score, _))| *score > threshold)
        .filter(|(slot, (bbox, score, _))| {
            let finite = bbox.iter().all(|v| v.is_finite());
            if !finite {
                log::warn!(
                    "Skipping slot {} with score {:.4}: box {:?} is not finite",
                    slot,
                    score,
                    bbox
                );
            }
            finite
        })
        .filter_map(|(slot, (bbox, score, class_id))| match catalog.get(class_id) {
            Some(label) => Some(Detection {
                class_id,
                label: label.name.clone(),
                score,
                bbox: BBox::from_normalized(bbox, display),
            }),
            None => {
                log::warn!(
                    "Skipping slot {} with score {:.4}: class id {} is not in the catalog",
                    slot,
                    score,
                    class_id
                );
                None
            }
        })
        .collect()
}
