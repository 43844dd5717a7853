//! A single arithmetic sequence: an atomic counter advancing by a fixed step.

use std::sync::atomic::{AtomicU64, Ordering};

/// An atomic monotone 64-bit counter with a fixed positive step.
///
/// `next()` is post-increment-style: it returns the value *before* the
/// increment, so the first call returns `start`. There is no
/// happens-before relationship between calls to `next()` and any other
/// shared state, so relaxed ordering is sufficient; each sequence is
/// only ever driven by the connection that owns it.
#[derive(Debug)]
pub struct Sequence {
    counter: AtomicU64,
    step: u64,
}

impl Sequence {
    /// Creates a sequence starting at `start` and advancing by `step`.
    ///
    /// Both `start` and `step` must be non-zero; callers (`SequenceFactory`)
    /// are expected to validate this before construction.
    pub fn new(start: u64, step: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
            step,
        }
    }

    /// Returns the current value and advances the counter by `step`,
    /// wrapping modulo 2^64.
    pub fn next(&self) -> u64 {
        self.counter.fetch_add(self.step, Ordering::Relaxed)
    }
}
