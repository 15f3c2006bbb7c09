use crate::chunk::{Chunk, CHUNK_SIZE};
use crate::chunkpool::ChunkPool;
use std::cmp::min;
use std::collections::VecDeque;
use std::io;

/// A dynamically sized, chunked FIFO byte queue. Data is appended at the back and read from the
/// front. Unlike a fixed-capacity ring buffer, it grows to hold however much has arrived but not
/// yet been framed into complete packets.
pub struct Buffer {
    chunks: VecDeque<Chunk>,
    pool: ChunkPool,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        let mut chunks = VecDeque::new();
        chunks.push_back(Chunk::new());
        Buffer {
            chunks,
            pool: ChunkPool::new(),
        }
    }

    /// Total buffered, unconsumed bytes.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Chunk::remaining_data).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops everything currently buffered. Used when the read half closes: a partially
    /// buffered packet can never complete.
    pub fn clear(&mut self) {
        let len = self.len();
        if len > 0 {
            self.consume(len);
        }
    }

    /// Read from `reader` into the buffer, stopping once `max_bytes` total have been accepted
    /// this call or the reader would block. Returns the number of bytes actually read.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R, max_bytes: usize) -> io::Result<usize> {
        let mut total = 0usize;

        while total < max_bytes {
            let chunk = self.chunks.back_mut().unwrap();
            let want = min(max_bytes - total, chunk.capacity());

            if want == 0 {
                self.chunks.push_back(self.pool.alloc());
                continue;
            }

            let slice = &mut chunk.writeable_slice()[..want];
            match reader.read(slice) {
                // A `Read` that can still return `WouldBlock` uses `Ok(0)` only to mean EOF,
                // never "try again" -- distinguish that from WouldBlock so callers can close
                // the read half instead of looping forever on a socket that is actually shut.
                Ok(0) => {
                    if total > 0 {
                        return Ok(total);
                    }
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Ok(count) => {
                    chunk.expand(count);
                    total += count;
                    if chunk.capacity() == 0 {
                        self.chunks.push_back(self.pool.alloc());
                    }
                }
                Err(e) => {
                    if e.kind() == io::ErrorKind::WouldBlock {
                        return Ok(total);
                    }
                    return Err(e);
                }
            }
        }

        Ok(total)
    }

    /// Copies the first `n` bytes without consuming them. `None` if fewer than `n` bytes are
    /// buffered.
    pub fn peek(&self, n: usize) -> Option<Vec<u8>> {
        if self.len() < n {
            return None;
        }

        let mut out = Vec::with_capacity(n);
        for chunk in self.chunks.iter() {
            if out.len() == n {
                break;
            }
            let slice = chunk.readable_slice();
            let take = min(n - out.len(), slice.len());
            out.extend_from_slice(&slice[..take]);
        }
        Some(out)
    }

    /// Removes and returns the first `n` bytes. Panics if fewer than `n` bytes are buffered --
    /// callers must `peek`/`len` first.
    pub fn consume(&mut self, n: usize) -> Vec<u8> {
        assert!(self.len() >= n, "Attempted to consume past buffered data");

        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let remaining = n - out.len();
            let front = self.chunks.front_mut().unwrap();
            let take = min(remaining, front.remaining_data());
            out.extend_from_slice(front.read(take));

            if front.remaining_data() == 0 && self.chunks.len() > 1 {
                let drained = self.chunks.pop_front().unwrap();
                self.pool.reclaim(drained);
            }
        }
        out
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}
