//! Sensors module.
//!
use std::{
    fmt,
    sync::{Arc, Mutex},
};

use image::RgbImage;
use thiserror::Error;

/// Callback returning the live frame of an opened capture device.
pub type CaptureFn = Box<dyn FnMut() -> Result<RgbImage, CaptureError> + Send>;

/// Errors of the capture source.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("permission to access {device} was denied: {source}")]
    PermissionDenied {
        device: String,
        #[source]
        source: std::io::Error,
    },
    #[error("camera {device} is unavailable: {reason}")]
    Unavailable { device: String, reason: String },
    #[error("failed to start camera {device}: {reason}")]
    Start { device: String, reason: String },
    #[error("failed to read frame: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to decode frame: {0}")]
    Decode(#[from] image::ImageError),
    #[error("frame of {len} bytes does not fit {width}x{height} RGB")]
    FrameSize { len: usize, width: u32, height: u32 },
    #[error("capture callback failed: {0}")]
    Callback(String),
}

impl CaptureError {
    /// Whether only the current frame is affected and the next read may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CaptureError::Read(_) | CaptureError::Decode(_) | CaptureError::FrameSize { .. }
        )
    }
}

/// Camera request parameters.
///
/// Video only. Resolution and frame rate default to the maximum the device
/// offers for `format`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    pub device: String,
    pub format: String,
    pub resolution: Option<(u32, u32)>,
    pub frame_rate: Option<(u32, u32)>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            format: "MJPG".into(),
            resolution: None,
            frame_rate: None,
        }
    }
}

/// Opened camera stream with known frame dimensions.
pub struct CaptureSession {
    capture_fn: Arc<Mutex<CaptureFn>>,
    dimensions: (u32, u32),
}

impl CaptureSession {
    /// Create a session from a capture callback producing frames of `dimensions`.
    pub fn new(capture_fn: CaptureFn, dimensions: (u32, u32)) -> Self {
        Self {
            capture_fn: Arc::new(Mutex::new(capture_fn)),
            dimensions,
        }
    }

    /// Read the frame the device holds right now.
    ///
    /// The device read and decode run on the blocking pool. Dropping the
    /// returned future lets an ongoing read finish in the background; the
    /// next capture waits for it.
    pub async fn capture(&mut self) -> Result<RgbImage, CaptureError> {
        let capture_fn = Arc::clone(&self.capture_fn);

        tokio::task::spawn_blocking(move || {
            let mut capture_fn = capture_fn
                .lock()
                .map_err(|_| CaptureError::Callback("an earlier capture panicked".into()))?;
            (*capture_fn)()
        })
        .await
        .map_err(|e| CaptureError::Callback(e.to_string()))?
    }

    /// Native `(width, height)` of captured frames.
    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }
}

impl fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

/// Open the configured camera.
///
/// Resolves once streaming has started and the frame size is known.
pub async fn open_capture_session(config: &CaptureConfig) -> Result<CaptureSession, CaptureError> {
    let config = config.clone();
    let device = config.device.clone();

    tokio::task::spawn_blocking(move || open_blocking(&config))
        .await
        .map_err(|e| CaptureError::Unavailable {
            device,
            reason: format!("capture setup task failed: {e}"),
        })?
}

#[cfg(not(feature = "v4l2"))]
fn open_blocking(config: &CaptureConfig) -> Result<CaptureSession, CaptureError> {
    Err(CaptureError::Unavailable {
        device: config.device.clone(),
        reason: "built without the `v4l2` feature".into(),
    })
}

#[cfg(feature = "v4l2")]
fn open_blocking(config: &CaptureConfig) -> Result<CaptureSession, CaptureError> {
    linux::open_session(config)
}

/// Decode one raw device frame into an RGB image.
pub fn decode_frame(
    format: &[u8],
    data: &[u8],
    dimensions: (u32, u32),
) -> Result<RgbImage, CaptureError> {
    match format {
        b"MJPG" => {
            Ok(image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?.to_rgb8())
        }
        _ => {
            let (width, height) = dimensions;
            RgbImage::from_raw(width, height, data.to_vec()).ok_or(CaptureError::FrameSize {
                len: data.len(),
                width,
                height,
            })
        }
    }
}

#[cfg(feature = "v4l2")]
mod linux {
    use std::io::ErrorKind;

    use rscam::{Camera, Config};

    use super::{decode_frame, CaptureConfig, CaptureError, CaptureSession};

    const SUPPORTED_FORMATS: [&[u8]; 2] = [b"MJPG", b"RGB3"];

    pub(super) fn open_session(config: &CaptureConfig) -> Result<CaptureSession, CaptureError> {
        let device = config.device.as_str();
        let start_err = |reason: String| CaptureError::Start {
            device: device.to_owned(),
            reason,
        };

        let format: &'static [u8] = SUPPORTED_FORMATS
            .iter()
            .copied()
            .find(|f| *f == config.format.as_bytes())
            .ok_or_else(|| start_err(format!("unsupported format {}", config.format)))?;

        let mut cam = Camera::new(device).map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => CaptureError::PermissionDenied {
                device: device.to_owned(),
                source: e,
            },
            _ => CaptureError::Unavailable {
                device: device.to_owned(),
                reason: e.to_string(),
            },
        })?;
        log_supported_formats(&cam, &config.format);

        log::info!("Using camera {}", device);

        let resolution = match config.resolution {
            Some(resolution) => resolution,
            None => get_max_resolution(&cam, format).map_err(start_err)?,
        };

        let frame_rate = match config.frame_rate {
            Some(frame_rate) => frame_rate,
            None => get_max_frame_rate(&cam, format, resolution).map_err(start_err)?,
        };

        cam.start(&Config {
            interval: frame_rate,
            resolution,
            format,
            ..Default::default()
        })
        .map_err(|e| start_err(e.to_string()))?;

        log::info!(
            "Streaming {}x{} {} at {}/{} s per frame",
            resolution.0,
            resolution.1,
            config.format,
            frame_rate.0,
            frame_rate.1
        );

        let capture_fn = move || {
            let frame = cam.capture().map_err(CaptureError::Read)?;
            decode_frame(format, &frame[..], resolution)
        };

        Ok(CaptureSession::new(Box::new(capture_fn), resolution))
    }

    /// Get the maximum supported resolution for the given format.
    fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32), String> {
        let resolution_info = cam.resolutions(format).map_err(|e| e.to_string())?;
        log::debug!("Found resolutions: {:?}", &resolution_info);
        match resolution_info {
            rscam::ResolutionInfo::Discretes(resolutions) => resolutions
                .iter()
                // Highest resolution in terms of number of pixels
                .max_by_key(|res| res.0 * res.1)
                .copied(),
            rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
        }
        .ok_or_else(|| "no resolution found".to_owned())
    }

    /// Get the maximum supported frame rate for the given format and resolution.
    ///
    /// Intervals are `(numerator, denominator)` seconds per frame.
    fn get_max_frame_rate(
        cam: &Camera,
        format: &[u8],
        resolution: (u32, u32),
    ) -> Result<(u32, u32), String> {
        let interval_info = cam
            .intervals(format, resolution)
            .map_err(|e| e.to_string())?;
        log::debug!("Found frame rates: {:?}", &interval_info);
        match interval_info {
            rscam::IntervalInfo::Discretes(intervals) => intervals
                .iter()
                .filter(|(numerator, _)| *numerator > 0)
                // Shortest interval, compared as d_a / n_a against d_b / n_b
                .max_by(|a, b| (a.1 as u64 * b.0 as u64).cmp(&(b.1 as u64 * a.0 as u64)))
                .copied(),
            rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
        }
        .ok_or_else(|| "no frame rate found".to_owned())
    }

    fn log_supported_formats(cam: &Camera, format: &str) {
        let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
        log::debug!(
            "Supported formats: {:?}, using format {:?}",
            formats,
            format
        );
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn get_cam_info_if_available() -> Result<(), String> {
            let cam_name = "/dev/video0";
            let cam = Camera::new(cam_name);

            match cam {
                Err(err) => println!("Could not initialize camera (maybe non available): {err}"),
                Ok(cam) => {
                    let formats: Vec<_> = cam.formats().collect();
                    println!("Supported formats: {formats:?}");

                    let selected_resolution = get_max_resolution(&cam, b"MJPG")?;
                    let frame_rate = get_max_frame_rate(&cam, b"MJPG", selected_resolution)?;
                    println!("Selected {selected_resolution:?} at {frame_rate:?}");
                }
            }

            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use image::Rgb;

    use super::*;

    #[tokio::test]
    async fn session_reads_live_frames() -> Result<(), CaptureError> {
        let mut counter = 0u8;
        let capture_fn = move || {
            counter += 1;
            Ok(RgbImage::from_pixel(4, 2, Rgb([counter, 0, 0])))
        };
        let mut session = CaptureSession::new(Box::new(capture_fn), (4, 2));

        assert_eq!(session.dimensions(), (4, 2));
        assert_eq!(session.capture().await?.get_pixel(0, 0)[0], 1);
        assert_eq!(session.capture().await?.get_pixel(0, 0)[0], 2);

        Ok(())
    }

    #[tokio::test]
    async fn panicking_callback_is_fatal() {
        let capture_fn = || -> Result<RgbImage, CaptureError> { panic!("driver crashed") };
        let mut session = CaptureSession::new(Box::new(capture_fn), (4, 2));

        let first = session.capture().await.unwrap_err();
        let second = session.capture().await.unwrap_err();

        assert!(matches!(first, CaptureError::Callback(_)));
        assert!(!first.is_transient());
        assert!(matches!(second, CaptureError::Callback(_)));
    }

    #[test]
    fn decode_mjpg_frame() -> Result<(), Box<dyn std::error::Error>> {
        let img = RgbImage::from_pixel(8, 6, Rgb([200, 10, 10]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageOutputFormat::Jpeg(90))?;

        let decoded = decode_frame(b"MJPG", buf.get_ref(), (8, 6))?;

        assert_eq!(decoded.dimensions(), (8, 6));

        Ok(())
    }

    #[test]
    fn decode_raw_rgb_frame() {
        let decoded = decode_frame(b"RGB3", &[1, 2, 3, 4, 5, 6], (2, 1));
        assert!(matches!(decoded, Ok(ref img) if img.get_pixel(1, 0) == &Rgb([4, 5, 6])));

        let short = decode_frame(b"RGB3", &[1, 2, 3], (2, 1));
        assert!(matches!(short, Err(ref e) if e.is_transient()));
    }

    #[test]
    fn broken_jpeg_is_transient() {
        match decode_frame(b"MJPG", b"not a jpeg", (8, 6)) {
            Err(err) => assert!(err.is_transient()),
            Ok(_) => panic!("garbage decoded as a frame"),
        }
    }

    #[cfg(not(feature = "v4l2"))]
    #[tokio::test]
    async fn open_without_camera_support() {
        let result = open_capture_session(&CaptureConfig::default()).await;

        match result {
            Err(err @ CaptureError::Unavailable { .. }) => assert!(!err.is_transient()),
            other => panic!("expected unavailable camera, got {other:?}"),
        }
    }
}
