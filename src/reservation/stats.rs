//! Per-registry diagnostic gauges.
//!
//! All counters use `Relaxed` ordering. Individual values are eventually
//! consistent; a snapshot taken while other threads reserve or bind may mix
//! before/after values. Good enough for display, never for decisions: the
//! authoritative state lives behind the registry and reservation locks.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention a subtract may land before its matching add and the raw
/// value may dip below zero. Readers go through `get()`, which clamps
/// negative values to zero.
pub(crate) struct Counter(AtomicIsize);

impl Counter {
    pub(crate) fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub(crate) fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

pub(crate) struct RegistryCounters {
    pub(crate) reservations: Counter,
    pub(crate) reserved_bytes: Counter,
    pub(crate) bindings: Counter,
    pub(crate) bound_bytes: Counter,
    /// Ranges whose OS release failed after they were unregistered.
    pub(crate) leaked_bytes: Counter,
}

impl RegistryCounters {
    pub(crate) fn new() -> Self {
        Self {
            reservations: Counter::new(),
            reserved_bytes: Counter::new(),
            bindings: Counter::new(),
            bound_bytes: Counter::new(),
            leaked_bytes: Counter::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> RegistryStats {
        RegistryStats {
            live_reservations: self.reservations.get(),
            reserved_bytes: self.reserved_bytes.get(),
            live_bindings: self.bindings.get(),
            bound_bytes: self.bound_bytes.get(),
            leaked_bytes: self.leaked_bytes.get(),
        }
    }
}

/// Point-in-time view of a registry's gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub live_reservations: usize,
    pub reserved_bytes: usize,
    pub live_bindings: usize,
    pub bound_bytes: usize,
    pub leaked_bytes: usize,
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(5);
        assert_eq!(c.get(), 0);
        c.add(8);
        assert_eq!(c.get(), 3);
    }

    #[test]
    fn test_counter_clamps_huge_delta() {
        let c = Counter::new();
        c.add(usize::MAX);
        assert_eq!(c.get(), isize::MAX.cast_unsigned());
    }

    #[test]
    fn test_snapshot() {
        let counters = RegistryCounters::new();
        counters.reservations.add(2);
        counters.reserved_bytes.add(8192);
        counters.bindings.add(1);
        counters.bound_bytes.add(4096);
        counters.reservations.sub(1);

        let stats = counters.snapshot();
        assert_eq!(
            stats,
            RegistryStats {
                live_reservations: 1,
                reserved_bytes: 8192,
                live_bindings: 1,
                bound_bytes: 4096,
                leaked_bytes: 0,
            }
        );
    }
}
