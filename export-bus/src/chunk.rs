use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Output of one completed encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub data: Bytes,
    // microseconds, inherited from the source frame
    pub timestamp: i64,
    // microseconds, 0 when unknown
    pub duration: i64,
    pub is_key: bool,
    // declared payload length, checked against `data` on insertion
    pub size: usize,
}

impl EncodedChunk {
    pub fn new(data: impl Into<Bytes>, timestamp: i64, duration: i64, is_key: bool) -> Self {
        let data = data.into();
        let size = data.len();
        Self {
            data,
            timestamp,
            duration,
            is_key,
            size,
        }
    }

    pub fn metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            timestamp: self.timestamp,
            duration: self.duration,
            is_key: self.is_key,
            size: self.size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub timestamp: i64,
    pub duration: i64,
    pub is_key: bool,
    pub size: usize,
}
