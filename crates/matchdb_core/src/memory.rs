//! Memory-pressure gauging for the automated eviction policy.
//!
//! The eviction policy never reads a runtime memory API directly; it
//! consults an injected [`MemoryGauge`], so the policy is testable without a
//! real heap and applications can wire in whatever meter they have.

use std::sync::atomic::{AtomicU64, Ordering};

/// Reports the current heap pressure as a fraction.
///
/// `0.0` means no pressure, `1.0` means the heap is exhausted. The automated
/// eviction policy evicts while the reported pressure is at or above the
/// configured memory share.
pub trait MemoryGauge: Send + Sync {
    /// Returns the current used/max heap fraction.
    fn pressure(&self) -> f64;
}

/// A gauge returning a settable constant. Drives eviction tests and callers
/// that meter memory externally.
#[derive(Debug, Default)]
pub struct FixedGauge {
    bits: AtomicU64,
}

impl FixedGauge {
    /// Creates a gauge reporting the given pressure.
    #[must_use]
    pub fn new(pressure: f64) -> Self {
        Self {
            bits: AtomicU64::new(pressure.to_bits()),
        }
    }

    /// Changes the reported pressure.
    pub fn set(&self, pressure: f64) {
        self.bits.store(pressure.to_bits(), Ordering::SeqCst);
    }
}

impl MemoryGauge for FixedGauge {
    fn pressure(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

/// Adapts a closure into a [`MemoryGauge`].
pub struct FnGauge<F>(F);

impl<F> FnGauge<F>
where
    F: Fn() -> f64 + Send + Sync,
{
    /// Wraps the given closure.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> MemoryGauge for FnGauge<F>
where
    F: Fn() -> f64 + Send + Sync,
{
    fn pressure(&self) -> f64 {
        (self.0)()
    }
}

impl<F> std::fmt::Debug for FnGauge<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnGauge").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_gauge_reports_set_value() {
        let gauge = FixedGauge::new(0.25);
        assert!((gauge.pressure() - 0.25).abs() < f64::EPSILON);

        gauge.set(0.9);
        assert!((gauge.pressure() - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn fn_gauge_delegates() {
        let gauge = FnGauge::new(|| 0.5);
        assert!((gauge.pressure() - 0.5).abs() < f64::EPSILON);
    }
}
