//! Fixed-capacity output buffer.
//!
//! Keeps the most recent `capacity` bytes a process wrote so that viewers
//! attaching late can replay what they missed. Older bytes are overwritten
//! silently; appends never block and never allocate.

use std::num::NonZeroUsize;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("ring buffer capacity must be greater than zero")]
    ZeroCapacity,
}

/// Byte ring with overwrite-oldest semantics.
#[derive(Debug)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    /// Position of the oldest retained byte.
    read: usize,
    /// Position the next byte will be written to.
    write: usize,
    /// Number of retained bytes, at most `storage.len()`.
    len: usize,
    total_written: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Result<Self, RingBufferError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(RingBufferError::ZeroCapacity)?;
        Ok(Self::with_capacity(capacity))
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            storage: vec![0u8; capacity.get()].into_boxed_slice(),
            read: 0,
            write: 0,
            len: 0,
            total_written: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total bytes ever appended, including overwritten ones.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Append `data`, discarding the oldest bytes if it does not fit.
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let capacity = self.capacity();
        self.total_written += data.len() as u64;

        // Larger than the whole ring: only the tail survives.
        if data.len() >= capacity {
            self.storage.copy_from_slice(&data[data.len() - capacity..]);
            self.read = 0;
            self.write = 0;
            self.len = capacity;
            return;
        }

        let until_end = capacity - self.write;
        if data.len() <= until_end {
            self.storage[self.write..self.write + data.len()].copy_from_slice(data);
            self.write += data.len();
            if self.write == capacity {
                self.write = 0;
            }
        } else {
            let (tail, head) = data.split_at(until_end);
            self.storage[self.write..].copy_from_slice(tail);
            self.storage[..head.len()].copy_from_slice(head);
            self.write = head.len();
        }

        self.len = (self.len + data.len()).min(capacity);
        self.read = (self.write + capacity - self.len) % capacity;
    }

    /// Copy out the retained bytes, oldest first.
    ///
    /// With `max_len == 0` the whole window is returned. Otherwise at most
    /// `max_len` of the most recent bytes are returned.
    pub fn snapshot(&self, max_len: usize) -> Vec<u8> {
        let take = if max_len == 0 || max_len >= self.len {
            self.len
        } else {
            max_len
        };
        let capacity = self.capacity();
        let start = (self.read + (self.len - take)) % capacity;

        let mut out = Vec::with_capacity(take);
        let first = take.min(capacity - start);
        out.extend_from_slice(&self.storage[start..start + first]);
        out.extend_from_slice(&self.storage[..take - first]);
        out
    }
}
