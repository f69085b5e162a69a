//! Progress reporting and cooperative cancellation.
//!
//! Long-running operations poll a [`ProgressHandler`] between row-level units
//! of work. Cancellation is a normal early-return outcome, never an error.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Polled progress-and-cancel-query interface.
///
/// Implementations are typically UI progress bars; the store only ever calls
/// these methods, it never pushes events.
pub trait ProgressHandler: Send + Sync {
    /// Resets the progress counter to zero.
    fn reset_counter(&self);

    /// Sets the number of ticks the operation expects to report.
    fn set_maximum(&self, max: usize);

    /// Advances the counter by one tick.
    fn increment(&self);

    /// Switches the display between indeterminate and determinate mode.
    fn set_indeterminate(&self, indeterminate: bool);

    /// Returns true if the user asked to cancel the operation.
    fn is_canceled(&self) -> bool;
}

/// An atomic counting [`ProgressHandler`] for tests and headless callers.
///
/// Optionally reports cancellation once a given number of ticks has been
/// observed, which makes cancellation paths testable deterministically.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    value: AtomicUsize,
    max: AtomicUsize,
    indeterminate: AtomicBool,
    canceled: AtomicBool,
    cancel_after: Option<usize>,
}

impl ProgressCounter {
    /// Creates a counter that never cancels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a counter that reports canceled once `ticks` increments have
    /// been counted.
    #[must_use]
    pub fn canceling_after(ticks: usize) -> Self {
        Self {
            cancel_after: Some(ticks),
            ..Self::default()
        }
    }

    /// Flags the operation as canceled.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    /// Returns the current tick count.
    #[must_use]
    pub fn value(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }

    /// Returns the last maximum set by the operation.
    #[must_use]
    pub fn maximum(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    /// Returns whether the display is in indeterminate mode.
    #[must_use]
    pub fn is_indeterminate(&self) -> bool {
        self.indeterminate.load(Ordering::SeqCst)
    }
}

impl ProgressHandler for ProgressCounter {
    fn reset_counter(&self) {
        self.value.store(0, Ordering::SeqCst);
    }

    fn set_maximum(&self, max: usize) {
        self.max.store(max, Ordering::SeqCst);
    }

    fn increment(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
    }

    fn set_indeterminate(&self, indeterminate: bool) {
        self.indeterminate.store(indeterminate, Ordering::SeqCst);
    }

    fn is_canceled(&self) -> bool {
        if self.canceled.load(Ordering::SeqCst) {
            return true;
        }
        match self.cancel_after {
            Some(ticks) => self.value.load(Ordering::SeqCst) >= ticks,
            None => false,
        }
    }
}

/// Returns true if the given optional handle reports cancellation.
pub(crate) fn canceled(progress: Option<&dyn ProgressHandler>) -> bool {
    progress.is_some_and(|p| p.is_canceled())
}
