//! Deterministic in-process stand-in for the OS allocator.
//!
//! `SimulatedVmOps` models a fixed window of address space as a bitmap of
//! granules. Nothing is ever mapped: addresses are plain numbers. It exists
//! so the registry's invariants can be exercised without touching the real
//! address space, including failure paths the OS rarely produces on demand
//! (exhaustion, failed release, an unaligned OS-chosen base).

use super::range::AddressRange;
use super::vm::{OccupancyProbe, VmError, VmOps};
use crate::sync::{lock, Mutex};
use fixedbitset::FixedBitSet;
use std::io;
use std::ops::Range;

/// Where the default simulated window starts. Arbitrary but recognisable.
pub const SIM_DEFAULT_BASE: usize = 0x1000_0000;
/// Default simulated granularity.
pub const SIM_DEFAULT_GRANULARITY: usize = 4096;

pub struct SimulatedVmOps {
    window: AddressRange,
    granularity: usize,
    state: Mutex<SimState>,
}

struct SimState {
    /// Granules held through `reserve_at` / `reserve_anywhere`.
    reserved: FixedBitSet,
    /// Granules mapped by "someone else" (see [`SimulatedVmOps::occupy`]).
    foreign: FixedBitSet,
    fail_next_reserve: Option<i32>,
    fail_next_release: Option<i32>,
    misalign_next_reserve: bool,
    reserve_calls: usize,
    release_calls: usize,
}

impl SimState {
    fn is_free(&self, granules: Range<usize>) -> bool {
        self.reserved.count_ones(granules.clone()) == 0 && self.foreign.count_ones(granules) == 0
    }

    /// Lowest run of `count` free granules.
    fn first_fit(&self, count: usize) -> Option<usize> {
        let total = self.reserved.len();
        let mut start = 0;
        while start + count <= total {
            match (start..start + count).rev().find(|&i| self.reserved[i] || self.foreign[i]) {
                None => return Some(start),
                // Skip past the highest taken granule in this window.
                Some(taken) => start = taken + 1,
            }
        }
        None
    }
}

impl SimulatedVmOps {
    /// A window of `granules` granules of `granularity` bytes starting at
    /// `base`.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if the granularity is not a
    /// power of two, `base` is not aligned to it, or the window is empty or
    /// wraps the address space.
    pub fn new(base: usize, granules: usize, granularity: usize) -> Result<Self, VmError> {
        if !granularity.is_power_of_two() {
            return Err(VmError::InitializationFailed(format!(
                "simulated granularity {granularity} is not a power of two"
            )));
        }
        if !base.is_multiple_of(granularity) {
            return Err(VmError::InitializationFailed(format!(
                "simulated base {base:#x} is not a multiple of {granularity}"
            )));
        }
        let window = granules
            .checked_mul(granularity)
            .and_then(|len| AddressRange::new(base, len))
            .ok_or_else(|| {
                VmError::InitializationFailed(format!(
                    "simulated window of {granules} x {granularity} bytes at {base:#x} is empty or wraps"
                ))
            })?;

        Ok(Self {
            window,
            granularity,
            state: Mutex::new(SimState {
                reserved: FixedBitSet::with_capacity(granules),
                foreign: FixedBitSet::with_capacity(granules),
                fail_next_reserve: None,
                fail_next_release: None,
                misalign_next_reserve: false,
                reserve_calls: 0,
                release_calls: 0,
            }),
        })
    }

    /// Default window of `granules` 4 KiB granules at [`SIM_DEFAULT_BASE`].
    ///
    /// # Panics
    ///
    /// Panics if `granules` is zero.
    #[must_use]
    pub fn with_granules(granules: usize) -> Self {
        Self::new(SIM_DEFAULT_BASE, granules, SIM_DEFAULT_GRANULARITY)
            .expect("default simulated window must be valid")
    }

    /// The simulated address window.
    #[must_use]
    pub fn window(&self) -> AddressRange {
        self.window
    }

    fn granules(&self, addr: usize, len: usize) -> Option<Range<usize>> {
        let range = AddressRange::new(addr, len)?;
        if !range.is_aligned(self.granularity) || !self.window.contains(&range) {
            return None;
        }
        let first = (addr - self.window.base()) / self.granularity;
        Some(first..first + len / self.granularity)
    }

    /// Pretend an unrelated mapping (heap, stack, a file mapping made
    /// without the registry) now covers `[addr, addr + len)`.
    ///
    /// Returns `false` if the range is unaligned or outside the window.
    pub fn occupy(&self, addr: usize, len: usize) -> bool {
        let Some(granules) = self.granules(addr, len) else {
            return false;
        };
        lock(&self.state).foreign.insert_range(granules);
        true
    }

    /// Undo [`occupy`](Self::occupy).
    pub fn vacate(&self, addr: usize, len: usize) -> bool {
        let Some(granules) = self.granules(addr, len) else {
            return false;
        };
        lock(&self.state).foreign.set_range(granules, false);
        true
    }

    /// Make the next reserve call fail with the raw OS error `code`.
    pub fn fail_next_reserve(&self, code: i32) {
        lock(&self.state).fail_next_reserve = Some(code);
    }

    /// Make the next release fail with the raw OS error `code`. The range
    /// stays reserved, as a real failed `munmap` would leave it.
    pub fn fail_next_release(&self, code: i32) {
        lock(&self.state).fail_next_release = Some(code);
    }

    /// Make the next `reserve_anywhere` hand back a base that violates the
    /// granularity.
    pub fn misalign_next_reserve(&self) {
        lock(&self.state).misalign_next_reserve = true;
    }

    /// True when every granule of the range is held by a reservation.
    #[must_use]
    pub fn is_reserved(&self, addr: usize, len: usize) -> bool {
        let Some(granules) = self.granules(addr, len) else {
            return false;
        };
        let count = granules.len();
        lock(&self.state).reserved.count_ones(granules) == count
    }

    /// Bytes currently held through this backend.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        lock(&self.state).reserved.count_ones(..) * self.granularity
    }

    /// Number of reserve calls that reached the backend, failed ones included.
    #[must_use]
    pub fn reserve_calls(&self) -> usize {
        lock(&self.state).reserve_calls
    }

    #[must_use]
    pub fn release_calls(&self) -> usize {
        lock(&self.state).release_calls
    }
}

fn invalid(msg: &'static str) -> VmError {
    VmError::ReservationFailed(io::Error::new(io::ErrorKind::InvalidInput, msg))
}

impl VmOps for SimulatedVmOps {
    fn granularity(&self) -> usize {
        self.granularity
    }

    fn reserve_at(&self, addr: usize, len: usize) -> Result<usize, VmError> {
        let mut state = lock(&self.state);
        state.reserve_calls += 1;
        if let Some(code) = state.fail_next_reserve.take() {
            return Err(VmError::ReservationFailed(io::Error::from_raw_os_error(code)));
        }
        let granules = self
            .granules(addr, len)
            .ok_or_else(|| invalid("range is unaligned or outside the simulated window"))?;
        if !state.is_free(granules.clone()) {
            return Err(VmError::AddressInUse { addr, length: len });
        }
        state.reserved.insert_range(granules);
        Ok(addr)
    }

    fn reserve_anywhere(&self, len: usize) -> Result<usize, VmError> {
        let mut state = lock(&self.state);
        state.reserve_calls += 1;
        if let Some(code) = state.fail_next_reserve.take() {
            return Err(VmError::ReservationFailed(io::Error::from_raw_os_error(code)));
        }
        if len == 0 || !len.is_multiple_of(self.granularity) {
            return Err(invalid("length is zero or unaligned"));
        }
        let count = len / self.granularity;
        let first = state.first_fit(count).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "simulated address space exhausted",
            ))
        })?;
        state.reserved.insert_range(first..first + count);

        let base = self.window.base() + first * self.granularity;
        if std::mem::take(&mut state.misalign_next_reserve) {
            return Ok(base + self.granularity / 2);
        }
        Ok(base)
    }

    unsafe fn release(&self, addr: usize, len: usize) -> Result<(), VmError> {
        let mut state = lock(&self.state);
        state.release_calls += 1;
        if let Some(code) = state.fail_next_release.take() {
            return Err(VmError::ReleaseFailed(io::Error::from_raw_os_error(code)));
        }
        let granules = self.granules(addr, len).ok_or_else(|| {
            VmError::ReleaseFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range is unaligned or outside the simulated window",
            ))
        })?;
        state.reserved.set_range(granules, false);
        Ok(())
    }
}

impl OccupancyProbe for SimulatedVmOps {
    fn is_range_free(&self, addr: usize, len: usize) -> bool {
        match AddressRange::new(addr, len) {
            // Outside the window nothing exists.
            Some(range) if !self.window.overlaps(&range) => true,
            Some(range) => {
                let lo = range.base().max(self.window.base());
                let hi = range.end().min(self.window.end());
                let first = (lo - self.window.base()) / self.granularity;
                let last = (hi - self.window.base()).div_ceil(self.granularity);
                lock(&self.state).is_free(first..last)
            }
            None => false,
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const G: usize = SIM_DEFAULT_GRANULARITY;

    #[test]
    fn test_new_validates_parameters() {
        assert!(SimulatedVmOps::new(SIM_DEFAULT_BASE, 16, 3000).is_err());
        assert!(SimulatedVmOps::new(SIM_DEFAULT_BASE + 1, 16, G).is_err());
        assert!(SimulatedVmOps::new(SIM_DEFAULT_BASE, 0, G).is_err());
        assert!(SimulatedVmOps::new(usize::MAX - G + 1, 2, G).is_err());

        let sim = SimulatedVmOps::new(0x4000_0000, 8, 64 * 1024).unwrap();
        assert_eq!(sim.granularity(), 64 * 1024);
        assert_eq!(sim.window().len(), 8 * 64 * 1024);
    }

    #[test]
    fn test_reserve_anywhere_is_first_fit() {
        let sim = SimulatedVmOps::with_granules(16);
        let a = sim.reserve_anywhere(2 * G).unwrap();
        let b = sim.reserve_anywhere(G).unwrap();
        assert_eq!(a, SIM_DEFAULT_BASE);
        assert_eq!(b, SIM_DEFAULT_BASE + 2 * G);

        // Safety: Test code.
        unsafe { sim.release(a, 2 * G).unwrap() };
        let c = sim.reserve_anywhere(G).unwrap();
        assert_eq!(c, SIM_DEFAULT_BASE, "freed hole is reused");
    }

    #[test]
    fn test_reserve_anywhere_skips_foreign_and_exhausts() {
        let sim = SimulatedVmOps::with_granules(4);
        assert!(sim.occupy(SIM_DEFAULT_BASE + G, G));

        let a = sim.reserve_anywhere(2 * G).unwrap();
        assert_eq!(a, SIM_DEFAULT_BASE + 2 * G);

        let err = sim.reserve_anywhere(2 * G).unwrap_err();
        match err {
            VmError::ReservationFailed(e) => assert_eq!(e.kind(), io::ErrorKind::OutOfMemory),
            other => panic!("expected ReservationFailed, got {other:?}"),
        }
        assert_eq!(sim.reserve_calls(), 2);
    }

    #[test]
    fn test_reserve_at_collisions() {
        let sim = SimulatedVmOps::with_granules(8);
        let base = SIM_DEFAULT_BASE + 2 * G;
        assert_eq!(sim.reserve_at(base, 2 * G).unwrap(), base);
        assert!(matches!(
            sim.reserve_at(base + G, 2 * G),
            Err(VmError::AddressInUse { .. })
        ));

        assert!(sim.occupy(SIM_DEFAULT_BASE, G));
        assert!(matches!(
            sim.reserve_at(SIM_DEFAULT_BASE, G),
            Err(VmError::AddressInUse { .. })
        ));
        assert!(sim.vacate(SIM_DEFAULT_BASE, G));
        assert!(sim.reserve_at(SIM_DEFAULT_BASE, G).is_ok());

        // Outside the window or unaligned: EINVAL-style failure.
        assert!(matches!(sim.reserve_at(0, G), Err(VmError::ReservationFailed(_))));
        assert!(matches!(
            sim.reserve_at(base + 1, G),
            Err(VmError::ReservationFailed(_))
        ));
    }

    #[test]
    fn test_probe() {
        let sim = SimulatedVmOps::with_granules(8);
        assert!(sim.is_range_free(SIM_DEFAULT_BASE, 8 * G));
        assert!(sim.is_range_free(0x1000, G), "outside the window is free");

        sim.reserve_at(SIM_DEFAULT_BASE + 3 * G, G).unwrap();
        assert!(!sim.is_range_free(SIM_DEFAULT_BASE, 8 * G));
        assert!(sim.is_range_free(SIM_DEFAULT_BASE, 3 * G));
        // Straddling the window start still sees the granule inside.
        assert!(!sim.is_range_free(SIM_DEFAULT_BASE - G, 5 * G));
        assert!(!sim.is_range_free(usize::MAX, 2), "wrapping range is never free");
    }

    #[test]
    fn test_injected_failures() {
        let sim = SimulatedVmOps::with_granules(8);
        sim.fail_next_reserve(12);
        let err = sim.reserve_anywhere(G).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(12));
        // One-shot.
        let base = sim.reserve_anywhere(G).unwrap();

        sim.fail_next_release(22);
        // Safety: Test code.
        let err = unsafe { sim.release(base, G) }.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(22));
        assert!(sim.is_reserved(base, G), "failed release leaks the range");
        assert_eq!(sim.reserved_bytes(), G);
        assert_eq!(sim.release_calls(), 1);

        sim.misalign_next_reserve();
        let odd = sim.reserve_anywhere(G).unwrap();
        assert_ne!(odd % G, 0);
    }
}
