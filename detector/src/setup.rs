//! Concurrent setup of the capture source and the model handle.
//!
use std::future::Future;

use cam_source::{open_capture_session, CaptureConfig, CaptureError, CaptureSession};
use thiserror::Error;

use crate::nn::{load_model, ModelConfig, ModelError, ModelHandle};

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("camera setup failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("model setup failed: {0}")]
    Model(#[from] ModelError),
    #[error("camera delivers {camera:?} frames but the model expects {model:?}")]
    FrameSize {
        camera: (u32, u32),
        model: (u32, u32),
    },
}

/// Wait for both setup futures. The first failure cancels the other one.
pub async fn join_setup<C, M>(
    capture: C,
    model: M,
) -> Result<(CaptureSession, ModelHandle), SetupError>
where
    C: Future<Output = Result<CaptureSession, CaptureError>>,
    M: Future<Output = Result<ModelHandle, ModelError>>,
{
    let (capture, model) = tokio::try_join!(
        async { capture.await.map_err(SetupError::from) },
        async { model.await.map_err(SetupError::from) },
    )?;

    if capture.dimensions() != model.input_size() {
        return Err(SetupError::FrameSize {
            camera: capture.dimensions(),
            model: model.input_size(),
        });
    }

    Ok((capture, model))
}

/// Open the camera and load the model concurrently.
pub async fn setup(
    capture_config: &CaptureConfig,
    model_config: &ModelConfig,
) -> Result<(CaptureSession, ModelHandle), SetupError> {
    log::info!(
        "Opening {} and loading {}",
        capture_config.device,
        model_config.location
    );

    let (capture, model) = join_setup(
        open_capture_session(capture_config),
        load_model(model_config),
    )
    .await?;

    log::info!("Setup done, frames are {:?}", capture.dimensions());
    Ok((capture, model))
}
