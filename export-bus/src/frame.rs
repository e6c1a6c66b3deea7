use std::fmt::{Display, Formatter};

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba,
    Bgra,
    Rgb24,
    Yuv420p,
}

impl PixelFormat {
    /// Byte length of each tightly packed plane for a `width` x `height` image.
    pub fn plane_sizes(&self, width: u32, height: u32) -> Vec<(usize, usize)> {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => vec![(w * 4, h)],
            PixelFormat::Rgb24 => vec![(w * 3, h)],
            PixelFormat::Yuv420p => {
                let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
                vec![(w, h), (cw, ch), (cw, ch)]
            }
        }
    }

    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        self.plane_sizes(width, height)
            .iter()
            .map(|(row, rows)| row * rows)
            .sum()
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// One raw image sample submitted for compression.
///
/// A frame may carry a release hook standing in for an external resource
/// (a GPU surface, a pooled buffer). The hook runs once, when the frame is
/// dropped; the encoder session drops submitted frames right after handing
/// their pixels to the worker.
pub struct Frame {
    data: Bytes,
    width: u32,
    height: u32,
    format: PixelFormat,
    // microseconds
    timestamp: i64,
    duration: Option<i64>,
    release: Option<ReleaseHook>,
}

impl Frame {
    pub fn new(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        timestamp: i64,
    ) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            format,
            timestamp,
            duration: None,
            release: None,
        }
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn on_release<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.release = Some(Box::new(hook));
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn duration(&self) -> Option<i64> {
        self.duration
    }

    /// Detached copy of everything the encoder needs. `Bytes` is immutable,
    /// so the input never observes later changes to the caller's buffer.
    pub(crate) fn to_input(&self) -> FrameInput {
        FrameInput {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
            format: self.format,
            timestamp: self.timestamp,
            duration: self.duration,
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Frame {{ {}x{} {:?}, ts: {}, data: {} }}",
            self.width,
            self.height,
            self.format,
            self.timestamp,
            self.data.len()
        )
    }
}

/// Pixel data handed to an encoder backend.
#[derive(Debug, Clone)]
pub struct FrameInput {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp: i64,
    pub duration: Option<i64>,
}

impl FrameInput {
    pub fn expected_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn test_plane_sizes() {
        assert_eq!(PixelFormat::Rgba.frame_size(4, 2), 32);
        assert_eq!(PixelFormat::Rgb24.frame_size(4, 2), 24);
        // odd sizes round the chroma planes up
        assert_eq!(PixelFormat::Yuv420p.frame_size(3, 3), 9 + 4 + 4);
    }

    #[test]
    fn test_release_runs_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let frame = Frame::new(vec![0u8; 16], 2, 2, PixelFormat::Rgba, 0).on_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let input = frame.to_input();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(frame);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        // the input outlives the frame
        assert_eq!(input.data.len(), 16);
    }
}
