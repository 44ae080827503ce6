//! Most recent mono frame window of the audio that is actually being output.
//!
//! The output callback is the single writer; spectrum queries take snapshots.
//! Both sides hold the lock only for a copy, so readers never see a partially
//! written window.

use std::sync::Mutex;

/// Ring of the last `capacity` mono samples pushed by the output stage.
pub struct FrameWindow {
    capacity: usize,
    inner: Mutex<Ring>,
}

struct Ring {
    samples: Vec<f32>,
    /// Next write position.
    head: usize,
    /// Samples written since the last reset, saturating at capacity.
    filled: usize,
}

impl FrameWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Ring {
                samples: vec![0.0; capacity],
                head: 0,
                filled: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append interleaved samples, mixing each frame down to mono.
    pub fn push_interleaved(&self, interleaved: &[f32], channels: usize) {
        let channels = channels.max(1);
        let mut ring = self.inner.lock().unwrap();
        for frame in interleaved.chunks_exact(channels) {
            let mono = frame.iter().sum::<f32>() / channels as f32;
            let head = ring.head;
            ring.samples[head] = mono;
            ring.head = (head + 1) % self.capacity;
            ring.filled = (ring.filled + 1).min(self.capacity);
        }
    }

    /// Forget everything written so far (new session or seek).
    pub fn reset(&self) {
        let mut ring = self.inner.lock().unwrap();
        ring.head = 0;
        ring.filled = 0;
    }

    /// Whether at least one frame has been written since the last reset.
    pub fn has_data(&self) -> bool {
        self.inner.lock().unwrap().filled > 0
    }

    /// Copy of the written samples, oldest first; `None` when nothing was written.
    pub fn snapshot(&self) -> Option<Vec<f32>> {
        let ring = self.inner.lock().unwrap();
        if ring.filled == 0 {
            return None;
        }
        let start = (ring.head + self.capacity - ring.filled) % self.capacity;
        let mut out = Vec::with_capacity(ring.filled);
        for i in 0..ring.filled {
            out.push(ring.samples[(start + i) % self.capacity]);
        }
        Some(out)
    }
}
