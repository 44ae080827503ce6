//! Bounded queue of interleaved `f32` samples shared between pipeline stages.
//!
//! decode thread → queue → (resampler thread → queue) → output callback.
//!
//! The producer closes the queue on EOF; consumers drain what is left and then
//! observe `None`. The output callback only ever uses the non-blocking pop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Thread-safe bounded queue for interleaved `f32` audio samples.
///
/// The `closed` flag lives under the same mutex as the samples so a waiter can
/// never miss the close notification.
pub struct SampleQueue {
    channels: usize,
    capacity_samples: usize,
    inner: Mutex<Inner>,
    cv: Condvar,
}

struct Inner {
    samples: VecDeque<f32>,
    closed: bool,
}

/// How many frames a pop should wait for.
#[derive(Clone, Copy, Debug)]
pub enum Take {
    /// Block until exactly `frames` are available; `None` if closed first.
    Exact { frames: usize },
    /// Block until at least one frame is available, then return up to `max_frames`.
    UpTo { max_frames: usize },
    /// Return immediately with up to `max_frames`, or `None` if currently empty.
    Available { max_frames: usize },
}

/// Capacity in **samples** for `seconds` of audio at `(rate_hz, channels)`.
///
/// Non-finite or non-positive durations fall back to two seconds.
pub fn capacity_for(rate_hz: u32, channels: usize, seconds: f32) -> usize {
    let secs = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        2.0
    };
    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl SampleQueue {
    pub fn new(channels: usize, capacity_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            capacity_samples: capacity_samples.max(channels),
            inner: Mutex::new(Inner {
                samples: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Capacity in frames.
    pub fn max_frames(&self) -> usize {
        self.capacity_samples / self.channels
    }

    /// Buffered frames right now (may change immediately).
    pub fn len_frames(&self) -> usize {
        self.inner.lock().unwrap().samples.len() / self.channels
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Mark the queue finished and wake every waiter. Idempotent.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.cv.notify_all();
    }

    /// Append samples, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was closed before everything was written.
    pub fn push_blocking(&self, samples: &[f32]) -> bool {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.inner.lock().unwrap();
            while g.samples.len() >= self.capacity_samples && !g.closed {
                g = self.cv.wait(g).unwrap();
            }
            if g.closed {
                return false;
            }
            let room = self.capacity_samples - g.samples.len();
            let end = samples.len().min(offset + room);
            g.samples.extend(&samples[offset..end]);
            offset = end;
            drop(g);
            self.cv.notify_all();
        }
        true
    }

    /// Pop whole frames according to `take`.
    pub fn pop(&self, take: Take) -> Option<Vec<f32>> {
        let mut g = self.inner.lock().unwrap();
        let frames = match take {
            Take::Exact { frames } => {
                let want = frames * self.channels;
                while g.samples.len() < want && !g.closed {
                    g = self.cv.wait(g).unwrap();
                }
                if g.samples.len() < want {
                    return None;
                }
                frames
            }
            Take::UpTo { max_frames } => {
                while g.samples.len() < self.channels && !g.closed {
                    g = self.cv.wait(g).unwrap();
                }
                (g.samples.len() / self.channels).min(max_frames)
            }
            Take::Available { max_frames } => (g.samples.len() / self.channels).min(max_frames),
        };
        if frames == 0 {
            return None;
        }
        let out: Vec<f32> = g.samples.drain(..frames * self.channels).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Drop everything buffered without closing the queue.
    pub fn clear(&self) {
        self.inner.lock().unwrap().samples.clear();
        self.cv.notify_all();
    }

    /// Block until the queue is closed and drained, or `cancel` becomes true.
    ///
    /// Returns `true` if the queue drained normally.
    pub fn wait_drained_or_cancel(&self, cancel: &AtomicBool) -> bool {
        let mut g = self.inner.lock().unwrap();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return false;
            }
            if g.closed && g.samples.is_empty() {
                return true;
            }
            let (next, _timeout) = self
                .cv
                .wait_timeout(g, Duration::from_millis(50))
                .unwrap();
            g = next;
        }
    }
}
