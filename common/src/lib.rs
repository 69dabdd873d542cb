//! Data model shared between `cam_source` and `detector`.
pub mod catalog;
pub mod detection;

pub use catalog::{ClassCatalog, ClassLabel};
pub use detection::{build_detections, BBox, Detection, DisplaySize, RawPrediction};
