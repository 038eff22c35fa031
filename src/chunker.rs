use bytes::Bytes;

const ONE_KIB: usize = 1024;

/// Same as the GridFS default.
pub const DEFAULT_CHUNK_SIZE: usize = 255 * ONE_KIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingStrategy {
    chunk_size: usize,
}

impl ChunkingStrategy {
    /// A zero `chunk_size` falls back to the default.
    pub fn fixed(chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Splits `payload` without copying. An empty payload has no chunks.
    pub fn split(&self, payload: &Bytes) -> Vec<Bytes> {
        let mut chunks = Vec::with_capacity(payload.len().div_ceil(self.chunk_size));
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + self.chunk_size).min(payload.len());
            chunks.push(payload.slice(offset..end));
            offset = end;
        }
        chunks
    }
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::fixed(DEFAULT_CHUNK_SIZE)
    }
}
