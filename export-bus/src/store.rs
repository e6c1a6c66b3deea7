use bytes::{Bytes, BytesMut};

use crate::{
    chunk::{ChunkMetadata, EncodedChunk},
    error::{ExportError, Result},
};

/// Append-only accumulator of encoded chunks.
///
/// Insertion order is encode completion order, which is also the order a
/// decoder needs them in. Nothing is removed or reordered short of `reset`.
#[derive(Debug, Default)]
pub struct ChunkStore {
    chunks: Vec<Bytes>,
    metadata: Vec<ChunkMetadata>,
    total_bytes: usize,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: EncodedChunk) -> Result<()> {
        if chunk.size != chunk.data.len() {
            return Err(ExportError::Validation(format!(
                "chunk at {} declares {} bytes but carries {}",
                chunk.timestamp,
                chunk.size,
                chunk.data.len()
            )));
        }
        if let Some(last) = self.metadata.last() {
            if chunk.timestamp < last.timestamp {
                log::warn!(
                    "chunk timestamp went backwards: {} after {}",
                    chunk.timestamp,
                    last.timestamp
                );
            }
        }

        self.total_bytes += chunk.size;
        self.metadata.push(chunk.metadata());
        self.chunks.push(chunk.data);
        Ok(())
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    pub fn metadata(&self) -> &[ChunkMetadata] {
        &self.metadata
    }

    /// Concatenates every payload in append order. Does not clear anything.
    pub fn materialize(&self) -> (Bytes, Vec<ChunkMetadata>) {
        let mut buffer = BytesMut::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            buffer.extend_from_slice(chunk);
        }
        (buffer.freeze(), self.metadata.clone())
    }

    pub fn reset(&mut self) {
        self.chunks.clear();
        self.metadata.clear();
        self.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_materialize_keeps_order() {
        let mut store = ChunkStore::new();
        store
            .append(EncodedChunk::new(vec![1, 2, 3], 0, 33_333, true))
            .unwrap();
        store
            .append(EncodedChunk::new(vec![4], 33_333, 33_333, false))
            .unwrap();
        store
            .append(EncodedChunk::new(vec![5, 6], 66_667, 0, false))
            .unwrap();

        assert_eq!(store.total_bytes(), 6);
        let (buffer, metadata) = store.materialize();
        assert_eq!(&buffer[..], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(metadata.len(), 3);
        assert_eq!(
            metadata.iter().map(|m| m.timestamp).collect::<Vec<_>>(),
            vec![0, 33_333, 66_667]
        );
        assert!(metadata[0].is_key);
        assert_eq!(metadata.iter().map(|m| m.size).sum::<usize>(), buffer.len());
    }

    #[test]
    fn test_rejects_size_mismatch() {
        let mut store = ChunkStore::new();
        let mut chunk = EncodedChunk::new(vec![1, 2, 3], 0, 0, true);
        chunk.size = 4;

        let err = store.append(chunk).unwrap_err();
        assert!(matches!(err, ExportError::Validation(_)));
        assert!(store.is_empty());
        assert_eq!(store.total_bytes(), 0);
    }

    #[test]
    fn test_materialize_is_repeatable() {
        let mut store = ChunkStore::new();
        store
            .append(EncodedChunk::new(vec![9, 9], 0, 0, true))
            .unwrap();

        let (first, _) = store.materialize();
        let (second, _) = store.materialize();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reset() {
        let mut store = ChunkStore::new();
        store
            .append(EncodedChunk::new(vec![1], 0, 0, true))
            .unwrap();
        store.reset();

        let (buffer, metadata) = store.materialize();
        assert!(buffer.is_empty());
        assert!(metadata.is_empty());
        assert_eq!(store.total_bytes(), 0);
    }
}
