//! A lazily generated stream of zero bytes.
//!
//! [`ZerofillStream`] stands in for an image when a range of the destination
//! has to be padded or wiped. Chunks are synthesized per pull, so covering a
//! multi-gigabyte range never needs more memory than a single chunk.
use crate::error::{Result, WriteError};
use crate::source::Source;
use std::io::{self, Read};

/// Chunk size used by [`ZerofillStream::next_chunk`].
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A finite, non-restartable producer of zero bytes covering `[start, end)`.
#[derive(Debug)]
pub struct ZerofillStream {
    start: u64,
    end: u64,
    remaining: u64,
    destroyed: bool,
}

impl ZerofillStream {
    /// Creates a stream producing `end - start` zero bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::InvalidRange`] if `end < start`.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if end < start {
            return Err(WriteError::InvalidRange { start, end });
        }

        Ok(Self {
            start,
            end,
            remaining: end - start,
            destroyed: false,
        })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Total number of bytes this stream covers.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes not produced yet.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Bytes produced so far.
    pub fn bytes_read(&self) -> u64 {
        self.len() - self.remaining
    }

    /// Pulls up to `requested` zero bytes.
    ///
    /// Returns `None` once the range is exhausted, and keeps returning `None`
    /// on every later call. A chunk never exceeds `requested` nor the bytes
    /// still remaining.
    pub fn next(&mut self, requested: usize) -> Option<Vec<u8>> {
        if self.remaining == 0 {
            return None;
        }

        let size = clamp_to_remaining(requested, self.remaining);
        self.remaining -= size as u64;
        Some(vec![0u8; size])
    }

    /// Pulls a chunk of [`DEFAULT_CHUNK_SIZE`] bytes (or whatever is left).
    pub fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.next(DEFAULT_CHUNK_SIZE)
    }
}

fn clamp_to_remaining(requested: usize, remaining: u64) -> usize {
    // `remaining` may exceed usize on 32-bit targets.
    usize::try_from(remaining).map_or(requested, |r| requested.min(r))
}

fn destroyed_error() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "zero-fill stream was destroyed")
}

impl Read for ZerofillStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.destroyed {
            return Err(destroyed_error());
        }
        let size = clamp_to_remaining(buf.len(), self.remaining);
        buf[..size].fill(0);
        self.remaining -= size as u64;
        Ok(size)
    }
}

impl Source for ZerofillStream {
    fn pull(&mut self, max: usize) -> io::Result<Option<Vec<u8>>> {
        if self.destroyed {
            return Err(destroyed_error());
        }
        Ok(self.next(max))
    }

    fn bytes_read(&self) -> u64 {
        ZerofillStream::bytes_read(self)
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.len())
    }

    fn destroy(&mut self) {
        self.destroyed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(stream: &mut ZerofillStream, request: usize) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next(request) {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn two_full_chunks_then_end_of_stream() {
        let mut stream = ZerofillStream::new(0, 131_072).unwrap();
        let chunks = drain(&mut stream, 65_536);

        assert_eq!(chunks.len(), 2);
        for chunk in &chunks {
            assert_eq!(chunk.len(), 65_536);
            assert!(chunk.iter().all(|&b| b == 0));
        }
        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn empty_range_ends_immediately() {
        let mut stream = ZerofillStream::new(4096, 4096).unwrap();
        assert!(stream.is_empty());
        assert_eq!(stream.next(65_536), None);
        assert_eq!(stream.bytes_read(), 0);
    }

    #[test]
    fn end_of_stream_is_sticky() {
        let mut stream = ZerofillStream::new(0, 10).unwrap();
        assert_eq!(stream.next(100).map(|c| c.len()), Some(10));
        for _ in 0..3 {
            assert_eq!(stream.next(100), None);
        }
    }

    #[test]
    fn uneven_ranges_sum_exactly_and_respect_request() {
        for (start, end, request) in [(0, 1, 7), (512, 100_000, 4096), (3, 65_539, 65_536)] {
            let mut stream = ZerofillStream::new(start, end).unwrap();
            let chunks = drain(&mut stream, request);
            assert!(chunks.iter().all(|c| c.len() <= request));
            let total: u64 = chunks.iter().map(|c| c.len() as u64).sum();
            assert_eq!(total, end - start);
        }
    }

    #[test]
    fn zero_sized_request_yields_empty_chunk() {
        let mut stream = ZerofillStream::new(0, 8).unwrap();
        assert_eq!(stream.next(0), Some(Vec::new()));
        assert_eq!(stream.remaining(), 8);
    }

    #[test]
    fn default_chunk_size_is_capped() {
        let mut stream = ZerofillStream::new(0, 100_000).unwrap();
        assert_eq!(stream.next_chunk().map(|c| c.len()), Some(DEFAULT_CHUNK_SIZE));
        assert_eq!(stream.next_chunk().map(|c| c.len()), Some(100_000 - DEFAULT_CHUNK_SIZE));
        assert_eq!(stream.next_chunk(), None);
    }

    #[test]
    fn rejects_inverted_range() {
        let err = ZerofillStream::new(10, 5).unwrap_err();
        assert!(matches!(err, WriteError::InvalidRange { start: 10, end: 5 }));
    }

    #[test]
    fn read_impl_zeroes_buffer() {
        let mut stream = ZerofillStream::new(0, 6).unwrap();
        let mut buf = [0xffu8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [0; 4]);
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn destroyed_stream_refuses_pulls() {
        let mut stream = ZerofillStream::new(0, 1024).unwrap();
        stream.destroy();
        let err = stream.pull(512).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn destroyed_stream_refuses_reads() {
        let mut stream = ZerofillStream::new(0, 1024).unwrap();
        stream.destroy();
        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert_eq!(stream.remaining(), 1024);
    }
}
