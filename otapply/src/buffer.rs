// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

/// Sliding window over the byte stream delivered by the transport. Bytes are
/// appended at the tail and consumed from the head once they have been fully
/// processed. Consumed bytes are unrecoverable.
#[derive(Debug, Default)]
pub struct SlidingBuffer {
    data: Vec<u8>,
    head: usize,
}

impl SlidingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes at the tail of the window.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.compact();
        self.data.extend_from_slice(bytes);
    }

    /// Drops `count` bytes from the head of the window.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the number of buffered bytes.
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "Consumed past end of buffer");
        self.head += count;
    }

    /// Currently buffered bytes, oldest first.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Reclaims the consumed prefix once it dominates the allocation. Keeps
    // appends amortized O(1) without shifting on every consume.
    fn compact(&mut self) {
        if self.head > 0 && self.head >= self.data.len() / 2 {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }
}
