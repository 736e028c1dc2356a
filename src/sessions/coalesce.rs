//! Output coalescing.
//!
//! Raw reads arrive in whatever sizes the kernel hands out. The coalescer
//! accumulates them and releases one chunk per flush: either when the flush
//! deadline passes or as soon as the pending bytes reach the size threshold.
//! A trailing incomplete UTF-8 sequence is held back for the next flush.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct Coalescer {
    pending: Vec<u8>,
    interval: Duration,
    threshold: usize,
    deadline: Option<Instant>,
}

impl Coalescer {
    pub fn new(interval: Duration, threshold: usize) -> Self {
        Self {
            pending: Vec::new(),
            interval,
            threshold: threshold.max(1),
            deadline: None,
        }
    }

    /// Buffer `data`. Returns `true` when the threshold is reached and the
    /// caller should flush immediately.
    pub fn push(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.interval);
        }
        self.pending.extend_from_slice(data);
        self.pending.len() >= self.threshold
    }

    /// When the pending bytes must be flushed, if any are pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Take every complete character pending. `None` when nothing flushable.
    pub fn take(&mut self) -> Option<String> {
        let tail = incomplete_tail_len(&self.pending);
        let ready = self.pending.len() - tail;
        self.deadline = None;
        if ready == 0 {
            return None;
        }
        let rest = self.pending.split_off(ready);
        let chunk = std::mem::replace(&mut self.pending, rest);
        Some(into_text(chunk))
    }

    /// Take everything, including a dangling partial character.
    pub fn take_all(&mut self) -> Option<String> {
        self.deadline = None;
        if self.pending.is_empty() {
            return None;
        }
        Some(into_text(std::mem::take(&mut self.pending)))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn into_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Length of an incomplete multi-byte sequence at the end of `bytes`.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let b = bytes[i];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let need = match b {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return 0,
        };
        let have = bytes.len() - i;
        return if have < need { have } else { 0 };
    }
    0
}
