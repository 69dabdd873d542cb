//! Webcam object detection with a live annotated stream.
pub mod app;
pub mod detect_loop;
pub mod endpoints;
pub mod meter;
pub mod nn;
pub mod render;
pub mod scope;
pub mod setup;
pub mod utils;
