//! The per-tick detection cycle.
//!
//! One iteration reads the live frame, runs the model on it, keeps the
//! confident detections and redraws the overlay. Iterations run strictly one
//! after another on a single task, paced by the refresh interval.
use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use cam_source::{CaptureError, CaptureSession};
use common::{
    build_detections, detection::DETECTION_THRESHOLD, ClassCatalog, Detection, DisplaySize,
};
use thiserror::Error;
use tokio::{
    sync::watch,
    task::spawn_blocking,
    task::{JoinError, JoinHandle},
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    meter::METER,
    nn::{ModelContractError, ModelError, ModelHandle},
    render::{compose_frame, encode_jpeg, render_detections, RenderError, Surface},
    scope::{IterationScope, TransientTracker},
};

/// Lifecycle of the detection loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopState {
    WaitingForSetup,
    Running,
    /// Cancelled through its handle.
    Stopped,
    /// Ended by a fatal error.
    Failed(String),
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Stopped | LoopState::Failed(_))
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::WaitingForSetup => f.write_str("waiting for setup"),
            LoopState::Running => f.write_str("running"),
            LoopState::Stopped => f.write_str("stopped"),
            LoopState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("model contract violated: {0}")]
    Contract(#[from] ModelContractError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("blocking task failed: {0}")]
    Blocking(#[from] JoinError),
}

impl LoopError {
    /// Errors that only spoil the current frame.
    pub fn is_transient(&self) -> bool {
        matches!(self, LoopError::Capture(e) if e.is_transient())
    }
}

pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Debug, PartialEq)]
pub struct LoopConfig {
    pub display: DisplaySize,
    /// Scores must be strictly above this value.
    pub threshold: f32,
    pub refresh_interval: Duration,
    pub jpeg_quality: u8,
}

impl LoopConfig {
    /// Ticks per second. The interval is never shorter than one millisecond.
    pub fn with_refresh_rate(mut self, refresh_rate: u32) -> Self {
        self.refresh_interval = Duration::from_secs_f64(1.0 / refresh_rate.max(1) as f64)
            .max(MIN_REFRESH_INTERVAL);
        self
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            display: DisplaySize::default(),
            threshold: DETECTION_THRESHOLD,
            refresh_interval: Duration::from_secs_f64(1.0 / 60.0),
            jpeg_quality: 85,
        }
    }
}

/// Owns everything that lives across iterations.
pub struct DetectionLoop<S> {
    capture: CaptureSession,
    model: ModelHandle,
    catalog: ClassCatalog,
    surface: S,
    config: LoopConfig,
    transients: Arc<TransientTracker>,
    frames_tx: Option<watch::Sender<Bytes>>,
}

impl<S: Surface> DetectionLoop<S> {
    pub fn new(
        capture: CaptureSession,
        model: ModelHandle,
        catalog: ClassCatalog,
        surface: S,
        config: LoopConfig,
    ) -> Self {
        Self {
            capture,
            model,
            catalog,
            surface,
            config,
            transients: Arc::new(TransientTracker::new()),
            frames_tx: None,
        }
    }

    /// Publish every composited frame as JPEG.
    pub fn with_frame_publisher(mut self, frames_tx: watch::Sender<Bytes>) -> Self {
        self.frames_tx = Some(frames_tx);
        self
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn transients(&self) -> Arc<TransientTracker> {
        Arc::clone(&self.transients)
    }

    /// Run one iteration and return the detections drawn.
    pub async fn step(&mut self) -> Result<Vec<Detection>, LoopError> {
        let scope = IterationScope::open(&self.transients);

        let frame = self.capture.capture().await?;
        METER.tick_captured();

        let model = self.model.clone();
        let (frame, input) = spawn_blocking(move || {
            let input = model.encode(&frame);
            (frame, input)
        })
        .await?;
        let frame = scope.hold(frame);
        let input = scope.hold(input?);
        let outputs = scope.hold(self.model.infer(input.release()).await?);
        let raw = self.model.extract(&outputs)?;

        let detections = build_detections(
            &raw,
            self.config.threshold,
            self.config.display,
            &self.catalog,
        );
        render_detections(&mut self.surface, &detections);

        if let Some(frames_tx) = &self.frames_tx {
            let frame = frame.release();
            let overlay = self.surface.overlay().cloned();
            let (display, quality) = (self.config.display, self.config.jpeg_quality);
            let jpeg = spawn_blocking(move || {
                encode_jpeg(&compose_frame(&frame, overlay.as_ref(), display), quality)
            })
            .await??;
            frames_tx.send_replace(Bytes::from(jpeg));
        }

        METER.tick_detected(detections.len());
        log::debug!("Drew {} detections", detections.len());

        Ok(detections)
    }
}

impl<S: Surface + Send + 'static> DetectionLoop<S> {
    /// Move the loop onto its own task.
    pub fn spawn(mut self, state_tx: watch::Sender<LoopState>) -> LoopHandle {
        let cancel = CancellationToken::new();
        let state = state_tx.subscribe();

        let token = cancel.clone();
        let join = tokio::spawn(async move {
            state_tx.send_replace(LoopState::Running);
            let worker = tokio::spawn(async move { self.run(&token).await });
            let final_state = match worker.await {
                Ok(state) => state,
                Err(e) => {
                    log::error!("Detection loop task failed: {}", e);
                    LoopState::Failed(format!("detection loop task failed: {e}"))
                }
            };
            log::info!("Detection loop {}", final_state);
            state_tx.send_replace(final_state.clone());
            final_state
        });

        LoopHandle {
            cancel,
            state,
            join,
        }
    }

    async fn run(&mut self, cancel: &CancellationToken) -> LoopState {
        log::info!(
            "Detection loop running every {:?}",
            self.config.refresh_interval
        );

        let mut ticker = interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return LoopState::Stopped,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return LoopState::Stopped,
                result = self.step() => result,
            };

            match result {
                Ok(_) => {}
                Err(e) if e.is_transient() => log::warn!("Skipping frame: {}", e),
                Err(e) => {
                    log::error!("Detection loop failed: {}", e);
                    return LoopState::Failed(e.to_string());
                }
            }
        }
    }
}

/// Control handle of a spawned detection loop.
pub struct LoopHandle {
    cancel: CancellationToken,
    state: watch::Receiver<LoopState>,
    join: JoinHandle<LoopState>,
}

impl LoopHandle {
    /// Stop before the next tick, dropping any pending inference.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelling the loop, for callers that also want to `join`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    /// Wait for the loop to end and return its final state.
    pub async fn join(self) -> LoopState {
        match self.join.await {
            Ok(state) => state,
            Err(e) => LoopState::Failed(format!("detection loop task failed: {e}")),
        }
    }
}
