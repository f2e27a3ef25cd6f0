//! Bounded sample queue between the blocking device writer and the CPAL callback.
//!
//! The writer side blocks while the queue is full, which paces file reads to the device
//! clock the way a blocking write to a sound device would. The callback side never blocks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Thread-safe bounded queue of interleaved `f32` samples.
///
/// A `closed` flag lives under the same mutex as the samples so a producer blocked on a
/// full queue and a concurrent [`SampleQueue::close`] cannot miss each other.
pub struct SampleQueue {
    channels: usize,
    capacity: usize,
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

struct QueueInner {
    samples: VecDeque<f32>,
    closed: bool,
}

/// Queue capacity in samples for `millis` of audio, never less than one frame.
pub fn capacity_for(rate_hz: u32, channels: usize, millis: u32) -> usize {
    let frames = (u64::from(rate_hz) * u64::from(millis)).div_ceil(1000).max(1);
    usize::try_from(frames)
        .unwrap_or(usize::MAX)
        .saturating_mul(channels.max(1))
}

impl SampleQueue {
    pub fn new(channels: usize, capacity: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            capacity: capacity.max(channels),
            inner: Mutex::new(QueueInner {
                samples: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the queue finished and wake every waiter. Idempotent.
    pub fn close(&self) {
        self.lock().closed = true;
        self.cv.notify_all();
    }

    /// Close the queue and drop everything still buffered.
    pub fn discard(&self) {
        {
            let mut g = self.lock();
            g.closed = true;
            g.samples.clear();
        }
        self.cv.notify_all();
    }

    /// Push samples, blocking while the queue is full.
    ///
    /// Returns how many samples were accepted. Fewer than `samples.len()` means the queue
    /// was closed while the producer waited.
    pub fn push_blocking(&self, samples: &[f32]) -> usize {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.lock();
            while g.samples.len() >= self.capacity && !g.closed {
                g = self.cv.wait(g).unwrap_or_else(|e| e.into_inner());
            }
            if g.closed {
                return offset;
            }
            let room = self.capacity - g.samples.len();
            let take = room.min(samples.len() - offset);
            g.samples.extend(&samples[offset..offset + take]);
            offset += take;
            drop(g);
            self.cv.notify_all();
        }
        offset
    }

    /// Pop up to `max_frames` whole frames without blocking.
    pub fn pop_frames(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.lock();
        let take = (g.samples.len() / self.channels).min(max_frames) * self.channels;
        if take == 0 {
            return None;
        }
        let out: Vec<f32> = g.samples.drain(..take).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Block until the queue is closed and drained, or `cancel` becomes true.
    ///
    /// Returns `true` if the queue drained normally.
    pub fn wait_drained_or_cancel(&self, cancel: &AtomicBool) -> bool {
        let mut g = self.lock();
        loop {
            if cancel.load(Ordering::Acquire) {
                return false;
            }
            if g.closed && g.samples.is_empty() {
                return true;
            }
            let (ng, _timeout) = self
                .cv
                .wait_timeout(g, Duration::from_millis(50))
                .unwrap_or_else(|e| e.into_inner());
            g = ng;
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
