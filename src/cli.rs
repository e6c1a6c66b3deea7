use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use export_bus::BitrateMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// libavcodec through ffmpeg-next
    Ffmpeg,
    /// Deterministic in-process encoder, no FFmpeg needed
    Synthetic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Constant,
    Quantizer,
}

impl From<Mode> for BitrateMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Constant => BitrateMode::Constant,
            Mode::Quantizer => BitrateMode::Quantizer,
        }
    }
}

/// Renders a test pattern and encodes it into an elementary stream
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Output directory for stream.bin, chunks.json and descriptor.bin
    #[arg(short = 'o', long = "out", value_name = "DIR", default_value = "export")]
    pub out_dir: PathBuf,

    #[arg(long, default_value_t = 1920)]
    pub width: u32,

    #[arg(long, default_value_t = 1080)]
    pub height: u32,

    #[arg(long, default_value_t = 60.0)]
    pub fps: f64,

    /// Export length in seconds
    #[arg(short = 'd', long, default_value_t = 5.0, conflicts_with = "frames")]
    pub duration: f64,

    /// Exact number of frames, instead of --duration
    #[arg(short = 'n', long, value_name = "N")]
    pub frames: Option<u64>,

    /// Target bitrate in kbps
    #[arg(short = 'b', long, default_value_t = 10_000)]
    pub bitrate: u64,

    #[arg(short = 'm', long, value_enum, default_value_t = Mode::Quantizer)]
    pub mode: Mode,

    /// Codec string, e.g. avc1.640034, h264, vp9
    #[arg(short = 'c', long)]
    pub codec: Option<String>,

    /// Frames between forced key frames
    #[arg(long, value_name = "N")]
    pub keyframe_interval: Option<u32>,

    #[arg(long, value_enum, default_value_t = Backend::Ffmpeg)]
    pub backend: Backend,

    /// Pause rendering while more frames than this wait for the encoder
    #[arg(long, default_value_t = 8)]
    pub max_pending: usize,

    /// Log every completed chunk
    #[arg(long)]
    pub chunks: bool,

    /// Increase logging verbosity (default: info, -v: debug, -vv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}
