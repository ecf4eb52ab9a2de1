//! Partitioning of a sequence axis into contiguous chunks.
//!
//! A sequence of length `len` is split into `ceil(len / chunk_size)` spans.
//! Every span but the last holds exactly `chunk_size` rows; the last one holds
//! the remainder, which is always in `[1, chunk_size]`.

use crate::core::AttentionError;

/// One contiguous slice of the sequence axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Position of the chunk in iteration order.
    pub index: usize,
    /// First row covered by the chunk.
    pub start: usize,
    /// Number of rows covered by the chunk.
    pub len: usize,
}

impl ChunkSpan {
    /// One past the last row covered by the chunk.
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Iterator over the chunks of a sequence axis.
#[derive(Debug, Clone)]
pub struct Chunks {
    len: usize,
    chunk_size: usize,
    next: usize,
}

/// Splits `len` rows into spans of `chunk_size`.
pub fn chunk_spans(len: usize, chunk_size: usize) -> Result<Chunks, AttentionError> {
    if chunk_size == 0 {
        return Err(AttentionError::config("chunk_size must be greater than 0"));
    }
    Ok(Chunks {
        len,
        chunk_size,
        next: 0,
    })
}

/// Number of chunks `len` rows split into.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1))
}

impl Iterator for Chunks {
    type Item = ChunkSpan;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next * self.chunk_size;
        if start >= self.len {
            return None;
        }
        let span = ChunkSpan {
            index: self.next,
            start,
            len: self.chunk_size.min(self.len - start),
        };
        self.next += 1;
        Some(span)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = chunk_count(self.len, self.chunk_size) - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Chunks {}
