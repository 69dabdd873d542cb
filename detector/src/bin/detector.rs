//! Detector binary.
//!
use std::{net::SocketAddr, path::PathBuf};

use anyhow::Result;
use cam_source::CaptureConfig;
use clap::Parser;
use common::DisplaySize;
use detector::{
    app::{start_app, Settings},
    detect_loop::LoopConfig,
    nn::{ModelConfig, OutputSelector, OutputSelectors},
};
use env_logger::TimestampPrecision;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Video device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Pixel format requested from the device
    #[clap(long, default_value = "MJPG")]
    format: String,

    /// Width of captured frames, must match the model input
    #[clap(long, default_value_t = 640)]
    frame_width: u32,

    /// Height of captured frames, must match the model input
    #[clap(long, default_value_t = 480)]
    frame_height: u32,

    /// Frames per second requested from the device, the device maximum if unset
    #[clap(long)]
    frame_rate: Option<u32>,

    /// Local path or http(s) URL of the ONNX detection graph
    #[clap(long, default_value = "models/kangaroo-detector.onnx")]
    model_location: String,

    /// Boxes output, by name or index
    #[clap(long, default_value = "4")]
    boxes_output: OutputSelector,

    /// Scores output, by name or index
    #[clap(long, default_value = "5")]
    scores_output: OutputSelector,

    /// Classes output, by name or index
    #[clap(long, default_value = "6")]
    classes_output: OutputSelector,

    /// Number of outputs the graph must have, 0 to skip the check
    #[clap(long, default_value_t = 7)]
    expected_outputs: usize,

    /// Directory for downloaded graphs
    #[clap(long)]
    cache_dir: Option<PathBuf>,

    /// File with one `id,name` class label per line
    #[clap(long)]
    labels: Option<PathBuf>,

    /// TrueType font used for captions
    #[clap(long, default_value = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf")]
    font_path: PathBuf,

    /// Width of the display surface
    #[clap(long, default_value_t = 600)]
    display_width: u32,

    /// Height of the display surface
    #[clap(long, default_value_t = 500)]
    display_height: u32,

    /// Detection iterations per second at most
    #[clap(long, default_value_t = 60, value_parser = clap::value_parser!(u32).range(1..=1000))]
    refresh_rate: u32,

    /// Address of the HTTP server
    #[clap(long, default_value = "127.0.0.1:3000")]
    server_address: SocketAddr,
}

impl From<Args> for Settings {
    fn from(args: Args) -> Self {
        let frame_size = (args.frame_width, args.frame_height);

        Settings {
            capture: CaptureConfig {
                device: args.device,
                format: args.format,
                resolution: Some(frame_size),
                frame_rate: args.frame_rate.map(|fps| (1, fps)),
            },
            model: ModelConfig {
                location: args.model_location,
                input_size: frame_size,
                outputs: OutputSelectors {
                    boxes: args.boxes_output,
                    scores: args.scores_output,
                    classes: args.classes_output,
                },
                expected_outputs: (args.expected_outputs > 0).then_some(args.expected_outputs),
                cache_dir: args.cache_dir,
            },
            loop_config: LoopConfig {
                display: DisplaySize::new(args.display_width, args.display_height),
                ..LoopConfig::default()
            }
            .with_refresh_rate(args.refresh_rate),
            labels: args.labels,
            font_path: args.font_path,
            server_address: args.server_address,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    start_app(args.into()).await
}
