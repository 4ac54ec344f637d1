//! Payload chunking: fixed-size ranges over a file of known length.

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Byte range of one chunk within the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Chunk size to use; zero falls back to [`DEFAULT_CHUNK_SIZE`].
pub fn effective_chunk_size(chunk_size: usize) -> usize {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// Lazily split `total_len` bytes into consecutive ranges of at most `chunk_size`.
pub fn chunk_ranges(total_len: u64, chunk_size: usize) -> impl Iterator<Item = ChunkRange> {
    let size = effective_chunk_size(chunk_size) as u64;
    let mut start = 0u64;
    std::iter::from_fn(move || {
        if start >= total_len {
            return None;
        }
        let end = (start + size).min(total_len);
        let range = ChunkRange { start, end };
        start = end;
        Some(range)
    })
}

/// Fraction of `total` covered by `done`. A zero-length transfer counts as finished.
pub fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        (done.min(total) as f64) / (total as f64)
    }
}
