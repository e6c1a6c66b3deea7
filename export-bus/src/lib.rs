/// Registers FFmpeg components. Call once at startup before opening an
/// FFmpeg backed session.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod avcc;
pub mod backend;
pub mod backpressure;
pub mod bus;
pub mod chunk;
pub mod config;
pub mod encoder;
pub mod error;
pub mod exporter;
pub mod ffmpeg;
pub mod frame;
pub mod output;
pub mod scaler;
pub mod store;
pub mod synthetic;

pub use bus::{ExportBus, ExportEvent, Phase};
pub use config::{BitrateMode, ConfigureRequest};
pub use error::ExportError;
pub use frame::{Frame, PixelFormat};
pub use output::ExportOutput;
