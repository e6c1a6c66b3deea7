//! Caller side of an export: renders frames, feeds them to a session while
//! keeping the encoder queue short, then collects the output.

use anyhow::Context;

use crate::{bus::ExportBus, frame::Frame, output::ExportOutput};

/// Produces the frame shown at a given position of the timeline.
pub trait FrameSource: Send {
    fn render(&mut self, index: u64, timestamp_us: i64) -> anyhow::Result<Frame>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportJob {
    pub total_frames: u64,
    pub frame_rate: f64,
    // submission pauses while more frames than this are pending
    pub max_pending: usize,
}

impl ExportJob {
    pub const DEFAULT_MAX_PENDING: usize = 8;

    pub fn new(total_frames: u64, frame_rate: f64) -> Self {
        Self {
            total_frames,
            frame_rate,
            max_pending: Self::DEFAULT_MAX_PENDING,
        }
    }

    /// Every frame needed to cover `seconds` at `frame_rate`.
    pub fn from_duration(seconds: f64, frame_rate: f64) -> Self {
        let total_frames = (seconds * frame_rate).ceil().max(0.0) as u64;
        Self::new(total_frames, frame_rate)
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn timestamp_us(&self, index: u64) -> i64 {
        (index as f64 / self.frame_rate * 1_000_000.0).round() as i64
    }

    pub fn frame_duration_us(&self) -> i64 {
        (1_000_000.0 / self.frame_rate).round() as i64
    }
}

pub async fn run_export<S: FrameSource>(
    bus: &ExportBus,
    source: &mut S,
    job: ExportJob,
) -> anyhow::Result<ExportOutput> {
    run_export_with_progress(bus, source, job, |_, _| {}).await
}

/// Like [`run_export`], calling `on_progress(submitted, total)` after every
/// submitted frame.
pub async fn run_export_with_progress<S, F>(
    bus: &ExportBus,
    source: &mut S,
    job: ExportJob,
    mut on_progress: F,
) -> anyhow::Result<ExportOutput>
where
    S: FrameSource,
    F: FnMut(u64, u64),
{
    if !job.frame_rate.is_finite() || job.frame_rate <= 0.0 {
        anyhow::bail!("invalid frame rate {}", job.frame_rate);
    }

    let mut depth = bus.depth();
    let duration = job.frame_duration_us();
    log::info!(
        "export {}: {} frames @ {} fps, at most {} pending",
        bus.id(),
        job.total_frames,
        job.frame_rate,
        job.max_pending
    );

    for index in 0..job.total_frames {
        depth.wait_at_most(job.max_pending).await;

        let timestamp = job.timestamp_us(index);
        let frame = source
            .render(index, timestamp)
            .with_context(|| format!("render frame {}", index))?
            .with_duration(duration);
        bus.encode(frame)
            .await
            .with_context(|| format!("encode frame {}", index))?;

        on_progress(index + 1, job.total_frames);
        if (index + 1) % 60 == 0 {
            log::info!(
                "export {}: {}/{} frames submitted, {} pending",
                bus.id(),
                index + 1,
                job.total_frames,
                depth.current()
            );
        }
    }

    log::info!("export {}: all frames submitted, requesting output", bus.id());
    let output = bus.request_output().await.context("request output")?;
    log::info!(
        "export {}: {} chunks, {} bytes",
        bus.id(),
        output.chunks.len(),
        output.total_bytes()
    );
    Ok(output)
}
