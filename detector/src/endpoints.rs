//! Endpoints of HTTP server.
//!
use axum::{
    body::StreamBody,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Extension, Router,
};
use bytes::Bytes;
use futures::{future, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::{detect_loop::LoopState, meter::METER};

/// Latest composited frame as JPEG. Empty until the first frame is drawn.
pub type FrameReceiver = watch::Receiver<Bytes>;
pub type StateReceiver = watch::Receiver<LoopState>;

pub fn router(state: StateReceiver, frames: FrameReceiver) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/stream", get(stream))
        .layer(Extension(state))
        .layer(Extension(frames))
}

/// Health check endpoint.
pub async fn healthcheck(Extension(state): Extension<StateReceiver>) -> impl IntoResponse {
    let state = state.borrow().clone();
    match state {
        LoopState::WaitingForSetup | LoopState::Running => (StatusCode::OK, "healthy".to_string()),
        state => (StatusCode::SERVICE_UNAVAILABLE, state.to_string()),
    }
}

// Endpoint of the annotated frame stream.
pub async fn stream(Extension(frames): Extension<FrameReceiver>) -> impl IntoResponse {
    log::info!("Stream requested");

    let stream = WatchStream::new(frames)
        .filter(|frame| future::ready(!frame.is_empty()))
        .map(|frame| {
            METER.tick_streamed();
            Ok::<_, String>(as_jpeg_stream_item(&frame))
        });

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    (headers, body)
}

/// Wrap a JPEG as one part of a `boundary=frame` multipart stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}
