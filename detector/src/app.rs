//! Wiring of the detector: HTTP server, setup and the detection loop.
//!
use std::{future::Future, io, net::SocketAddr, path::PathBuf};

use anyhow::{bail, Result};
use bytes::Bytes;
use cam_source::CaptureConfig;
use common::ClassCatalog;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    detect_loop::{DetectionLoop, LoopConfig, LoopState},
    endpoints::router,
    meter::spawn_meter_logger,
    nn::ModelConfig,
    render::{load_font, RasterSurface},
    setup::setup,
};

/// Everything the detector needs to start.
#[derive(Clone, Debug)]
pub struct Settings {
    pub capture: CaptureConfig,
    pub model: ModelConfig,
    pub loop_config: LoopConfig,
    /// Catalog file, the built-in kangaroo catalog if unset.
    pub labels: Option<PathBuf>,
    pub font_path: PathBuf,
    pub server_address: SocketAddr,
}

fn load_catalog(labels: Option<&PathBuf>) -> Result<ClassCatalog> {
    Ok(match labels {
        Some(path) => ClassCatalog::from_labels_file(path)?,
        None => ClassCatalog::kangaroo(),
    })
}

/// Cancel `cancel` once `signal` fires.
fn spawn_shutdown_watcher<F>(signal: F, cancel: CancellationToken) -> JoinHandle<()>
where
    F: Future<Output = io::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if signal.await.is_ok() {
            log::info!("Received Ctrl-C, stopping detection loop");
            cancel.cancel();
        }
    })
}

/// Run the detector until Ctrl-C or a fatal loop error.
pub async fn start_app(settings: Settings) -> Result<()> {
    let font = load_font(&settings.font_path)?;
    let catalog = load_catalog(settings.labels.as_ref())?;
    log::info!("Using {} class labels", catalog.len());

    let (state_tx, state_rx) = watch::channel(LoopState::WaitingForSetup);
    let (frames_tx, frames_rx) = watch::channel(Bytes::new());

    let app = router(state_rx, frames_rx);
    let server = axum::Server::try_bind(&settings.server_address)?.serve(app.into_make_service());
    log::info!("Serving on http://{}", settings.server_address);
    let server = tokio::spawn(async move {
        if let Err(e) = server.await {
            log::error!("HTTP server failed: {}", e);
        }
    });
    let meter = spawn_meter_logger();

    let (capture, model) = match setup(&settings.capture, &settings.model).await {
        Ok(parts) => parts,
        Err(e) => {
            log::error!("Setup failed: {}", e);
            state_tx.send_replace(LoopState::Failed(e.to_string()));
            server.abort();
            meter.abort();
            return Err(e.into());
        }
    };

    let surface = RasterSurface::new(settings.loop_config.display, font);
    let handle = DetectionLoop::new(capture, model, catalog, surface, settings.loop_config)
        .with_frame_publisher(frames_tx)
        .spawn(state_tx);

    let shutdown = spawn_shutdown_watcher(tokio::signal::ctrl_c(), handle.cancellation_token());

    let final_state = handle.join().await;
    shutdown.abort();
    server.abort();
    meter.abort();

    match final_state {
        LoopState::Failed(reason) => bail!("detection loop failed: {reason}"),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn default_catalog_without_labels_file() -> Result<()> {
        let catalog = load_catalog(None)?;

        assert_eq!(catalog.get(1).map(|l| l.name.as_str()), Some("Kangaroo"));

        Ok(())
    }

    #[tokio::test]
    async fn shutdown_signal_cancels_the_loop() -> Result<()> {
        let cancel = CancellationToken::new();

        spawn_shutdown_watcher(async { Ok(()) }, cancel.clone()).await?;

        assert!(cancel.is_cancelled());

        Ok(())
    }

    #[tokio::test]
    async fn aborted_watcher_leaves_token_alone() {
        let cancel = CancellationToken::new();
        let watcher = spawn_shutdown_watcher(std::future::pending(), cancel.clone());

        watcher.abort();

        assert!(watcher.await.unwrap_err().is_cancelled());
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn catalog_from_labels_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "3,Wombat")?;

        let catalog = load_catalog(Some(&file.path().to_path_buf()))?;

        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get(3).map(|l| l.name.as_str()), Some("Wombat"));

        Ok(())
    }
}
