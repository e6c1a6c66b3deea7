use bytes::Bytes;

use crate::{
    chunk::ChunkMetadata,
    error::{ExportError, Result},
};

/// Response to `request-output`: every chunk so far as one buffer, the
/// metadata index describing it, and the decoder descriptor if one was seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOutput {
    pub buffer: Bytes,
    pub chunks: Vec<ChunkMetadata>,
    pub descriptor: Option<Bytes>,
}

impl ExportOutput {
    pub fn total_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Re-segments the buffer into per-chunk payloads using the metadata
    /// list, which is the authoritative index for the buffer.
    pub fn segments(&self) -> Result<Vec<(ChunkMetadata, Bytes)>> {
        let mut offset: usize = 0;
        let mut segments = Vec::with_capacity(self.chunks.len());
        for meta in &self.chunks {
            let end = offset.checked_add(meta.size).ok_or_else(|| {
                ExportError::Validation(format!(
                    "chunk at {} declares an impossible size {}",
                    meta.timestamp, meta.size
                ))
            })?;
            if end > self.buffer.len() {
                return Err(ExportError::Validation(format!(
                    "chunk at {} ends at byte {}, buffer holds {}",
                    meta.timestamp,
                    end,
                    self.buffer.len()
                )));
            }
            segments.push((*meta, self.buffer.slice(offset..end)));
            offset = end;
        }
        if offset != self.buffer.len() {
            return Err(ExportError::Validation(format!(
                "index covers {} bytes, buffer holds {}",
                offset,
                self.buffer.len()
            )));
        }
        Ok(segments)
    }
}
