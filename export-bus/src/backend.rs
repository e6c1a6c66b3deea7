use std::sync::Arc;

use bytes::Bytes;

use crate::{
    chunk::EncodedChunk,
    config::{CodecConfig, RateControl},
    error::Result,
    frame::FrameInput,
};

/// One unit produced by a backend. `descriptor` is set when the encoder
/// reports decoder initialisation data alongside this chunk.
#[derive(Debug, Clone)]
pub struct BackendOutput {
    pub chunk: EncodedChunk,
    pub descriptor: Option<Bytes>,
}

/// The underlying encoder resource. Driven from a single worker thread.
///
/// Implementations must not reorder output: chunks come back in the order
/// their frames were sent. Per-frame failures are `ExportError::Encode`;
/// any `ExportError::SessionDead` makes the session unusable.
pub trait EncoderBackend: Send {
    fn send_frame(&mut self, frame: &FrameInput, control: RateControl) -> Result<()>;

    /// Returns `None` when the encoder needs more input (or is drained).
    fn receive_chunk(&mut self) -> Result<Option<BackendOutput>>;

    /// Signals end of input; every pending chunk becomes receivable.
    fn send_eof(&mut self) -> Result<()>;

    /// Called after a drain so encoding can continue.
    fn reset(&mut self) -> Result<()>;
}

pub type BackendFactory =
    Arc<dyn Fn(&CodecConfig) -> Result<Box<dyn EncoderBackend>> + Send + Sync>;
