//! Bounded byte history replayed to viewers that attach late.
//!
//! [`HistoryBuffer`] keeps the most recent `capacity` bytes of terminal
//! output. When a push overflows the cap the oldest bytes are dropped, then
//! any UTF-8 continuation bytes left at the front are dropped as well so a
//! replay never starts in the middle of a character.

use std::collections::VecDeque;

/// Byte ring with prefix eviction.
#[derive(Debug)]
pub struct HistoryBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    /// Append output, evicting from the front if the cap is exceeded.
    pub fn push(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        let evicted = if data.len() >= self.capacity {
            let dropped = self.bytes.len() + data.len() > self.capacity;
            self.bytes.clear();
            self.bytes.extend(&data[data.len() - self.capacity..]);
            dropped
        } else {
            self.bytes.extend(data);
            let excess = self.bytes.len().saturating_sub(self.capacity);
            self.bytes.drain(..excess);
            excess > 0
        };
        if evicted {
            while self.bytes.front().is_some_and(|b| b & 0xC0 == 0x80) {
                self.bytes.pop_front();
            }
        }
    }

    /// Copy of the retained bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let (a, b) = self.bytes.as_slices();
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
