//! Camera acquisition for the detection loop.
pub mod sensors;

pub use sensors::{open_capture_session, CaptureConfig, CaptureError, CaptureFn, CaptureSession};
