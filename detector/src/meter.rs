//! Frame rate meter of the detection loop.
//!
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

#[derive(Default)]
pub struct Meter {
    captured_frames: AtomicU64,
    detected_frames: AtomicU64,
    detections: AtomicU64,
    streamed_frames: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            captured_frames: AtomicU64::new(0),
            detected_frames: AtomicU64::new(0),
            detections: AtomicU64::new(0),
            streamed_frames: AtomicU64::new(0),
        }
    }

    pub fn tick_captured(&self) {
        self.captured_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a fully processed frame and the detections drawn on it.
    pub fn tick_detected(&self, num_detections: usize) {
        self.detected_frames.fetch_add(1, Ordering::Relaxed);
        self.detections
            .fetch_add(num_detections as u64, Ordering::Relaxed);
    }

    pub fn tick_streamed(&self) {
        self.streamed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_reset_captured(&self) -> u64 {
        self.captured_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_detected(&self) -> u64 {
        self.detected_frames.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_detections(&self) -> u64 {
        self.detections.swap(0, Ordering::Relaxed)
    }

    pub fn get_reset_streamed(&self) -> u64 {
        self.streamed_frames.swap(0, Ordering::Relaxed)
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let captured_frames = METER.get_reset_captured();
            let detected_frames = METER.get_reset_detected();
            let detections = METER.get_reset_detections();
            let streamed_frames = METER.get_reset_streamed();
            let elapsed = start.elapsed().as_secs_f32();
            let fps_captured = captured_frames as f32 / elapsed;
            let fps_detected = detected_frames as f32 / elapsed;

            if captured_frames > 0 {
                log::info!("Captured frames per second: {fps_captured:.2}")
            }
            if detected_frames > 0 {
                log::info!(
                    "Detected frames per second: {fps_detected:.2} ({:.2} objects per frame)",
                    detections as f32 / detected_frames as f32
                )
            }
            if streamed_frames > 0 {
                log::info!(
                    "Streamed frames per second: {:.2}",
                    streamed_frames as f32 / elapsed
                )
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_reset_on_read() {
        let meter = Meter::new();
        meter.tick_captured();
        meter.tick_captured();
        meter.tick_detected(3);
        meter.tick_streamed();

        assert_eq!(meter.get_reset_captured(), 2);
        assert_eq!(meter.get_reset_detected(), 1);
        assert_eq!(meter.get_reset_detections(), 3);
        assert_eq!(meter.get_reset_streamed(), 1);
        assert_eq!(meter.get_reset_captured(), 0);
    }
}
