//! Per-iteration ownership of transient values.
//!
//! Every frame, tensor and raw output allocated while processing one frame is
//! held by the iteration's [`IterationScope`]. A [`Scoped`] value borrows its
//! scope, so it cannot outlive the iteration, and its release is counted by a
//! [`TransientTracker`] on every exit path.
use std::{
    ops::Deref,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Counts transient values that are alive right now.
#[derive(Debug, Default)]
pub struct TransientTracker {
    live: AtomicUsize,
    acquired: AtomicUsize,
}

impl TransientTracker {
    pub const fn new() -> Self {
        Self {
            live: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
        }
    }

    /// Transient values currently held by open scopes.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Transient values acquired since creation.
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Relaxed)
    }

    fn acquire(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Scope around the transient allocations of one loop iteration.
pub struct IterationScope<'t> {
    tracker: &'t TransientTracker,
    baseline: usize,
}

impl<'t> IterationScope<'t> {
    pub fn open(tracker: &'t TransientTracker) -> Self {
        Self {
            tracker,
            baseline: tracker.live(),
        }
    }

    /// Hand a transient value to the scope.
    pub fn hold<T>(&self, value: T) -> Scoped<'_, T> {
        self.tracker.acquire();
        Scoped {
            value: Some(value),
            tracker: self.tracker,
        }
    }
}

impl Drop for IterationScope<'_> {
    fn drop(&mut self) {
        let live = self.tracker.live();
        if live > self.baseline {
            log::warn!(
                "{} transient values outlived their iteration",
                live - self.baseline
            );
        }
    }
}

/// Transient value owned by an [`IterationScope`].
///
/// `value` is `Some` until the value is released or dropped.
pub struct Scoped<'s, T> {
    value: Option<T>,
    tracker: &'s TransientTracker,
}

impl<T> Scoped<'_, T> {
    /// Take the value out of the scope, e.g. to hand it to the runtime.
    pub fn release(mut self) -> T {
        match self.value.take() {
            Some(value) => {
                self.tracker.release();
                value
            }
            None => unreachable!("scoped value taken twice"),
        }
    }
}

impl<T> Deref for Scoped<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("scoped value used after release"),
        }
    }
}

impl<T> Drop for Scoped<'_, T> {
    fn drop(&mut self) {
        if self.value.take().is_some() {
            self.tracker.release();
        }
    }
}
