use ffmpeg_next::{format::Pixel, frame::Video, software::scaling};

/// Converts frames to the encoder's pixel format and size. The swscale
/// context is rebuilt only when the source layout changes.
pub struct Scaler {
    context: Option<scaling::Context>,
    source: (Pixel, u32, u32),
}

impl Default for Scaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scaler {
    pub fn new() -> Self {
        Self {
            context: None,
            source: (Pixel::None, 0, 0),
        }
    }

    pub fn run(
        &mut self,
        frame: &Video,
        format: Pixel,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Video> {
        let source = (frame.format(), frame.width(), frame.height());
        if self.context.is_none() || self.source != source {
            log::debug!(
                "scaler {:?} {}x{} -> {:?} {}x{}",
                source.0,
                source.1,
                source.2,
                format,
                width,
                height
            );
            self.context = Some(scaling::Context::get(
                source.0,
                source.1,
                source.2,
                format,
                width,
                height,
                scaling::Flags::BILINEAR,
            )?);
            self.source = source;
        }

        let mut converted = Video::empty();
        if let Some(context) = self.context.as_mut() {
            context.run(frame, &mut converted)?;
        }
        converted.set_pts(frame.pts());
        Ok(converted)
    }
}

unsafe impl Send for Scaler {}
