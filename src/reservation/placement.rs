//! Deciding where a new reservation goes.
//!
//! Input validation happens here before any OS call. Fixed requests are
//! then handed to [`VmOps::reserve_at`]; floating requests let the OS pick
//! and, when the registry runs at a coarser granularity than the OS, re-seat
//! the OS pick on an aligned base.

use super::error::ReservationError;
use super::range::{align_up, AddressRange};
use super::vm::{VmError, VmOps};
use std::io;

/// Check a reserve request against `granularity` without touching the OS.
///
/// Returns the exact range for fixed requests, `None` for floating ones.
pub(crate) fn validate_request(
    addr: Option<usize>,
    length: usize,
    granularity: usize,
) -> Result<Option<AddressRange>, ReservationError> {
    if let Some(addr) = addr {
        if !addr.is_multiple_of(granularity) {
            return Err(ReservationError::UnalignedAddress { addr, granularity });
        }
    }
    if length == 0 || !length.is_multiple_of(granularity) {
        return Err(ReservationError::UnalignedLength { length, granularity });
    }
    match addr {
        None => Ok(None),
        Some(addr) => AddressRange::new(addr, length).map(Some).ok_or(
            ReservationError::OutOfRange {
                addr,
                length,
                bounds: None,
            },
        ),
    }
}

/// Range handed back by the OS. An OS that breaks its own granularity
/// guarantee leaves nothing sensible to recover to.
fn os_range(base: usize, length: usize, granularity: usize) -> AddressRange {
    assert!(
        base.is_multiple_of(granularity),
        "OS placed a reservation at {base:#x}, which is not a multiple of its granularity {granularity}"
    );
    match AddressRange::new(base, length) {
        Some(range) => range,
        None => panic!("OS placed a {length}-byte reservation at {base:#x}, which wraps the address space"),
    }
}

/// Reserve exactly `range`. The caller has already ruled out conflicts it
/// knows about; the backend's no-replace semantics catch the rest.
pub(crate) fn place_fixed<V: VmOps>(vm: &V, range: AddressRange) -> Result<AddressRange, ReservationError> {
    match vm.reserve_at(range.base(), range.len()) {
        Ok(base) => {
            debug_assert_eq!(base, range.base(), "reserve_at moved a fixed reservation");
            Ok(range)
        }
        Err(VmError::AddressInUse { addr, length }) => {
            Err(ReservationError::RegionOccupied { addr, length })
        }
        Err(source) => Err(ReservationError::ReservationFailed {
            addr: Some(range.base()),
            length: range.len(),
            source,
        }),
    }
}

/// Reserve `length` bytes wherever the OS likes, aligned to `granularity`.
pub(crate) fn place_anywhere<V: VmOps>(
    vm: &V,
    length: usize,
    granularity: usize,
    retries: u32,
) -> Result<AddressRange, ReservationError> {
    let native = vm.granularity();
    let failed = |source| ReservationError::ReservationFailed {
        addr: None,
        length,
        source,
    };

    if granularity == native {
        let base = vm.reserve_anywhere(length).map_err(failed)?;
        return Ok(os_range(base, length, native));
    }

    // Coarser than the OS: reserve enough slack to contain an aligned
    // window, give it back, and claim the aligned window at a fixed address.
    // Another thread of the process may grab the window in between.
    let padded = length.checked_add(granularity - native).ok_or_else(|| {
        failed(VmError::ReservationFailed(io::Error::new(
            io::ErrorKind::InvalidInput,
            "padded reservation length overflows",
        )))
    })?;

    for attempt in 0..=retries {
        let probe = os_range(vm.reserve_anywhere(padded).map_err(failed)?, padded, native);
        let aligned = align_up(probe.base(), granularity)
            .expect("a non-wrapping padded probe contains an aligned window");
        debug_assert!(aligned - probe.base() + length <= padded);

        // Safety: the probe was reserved above and nothing refers to it.
        unsafe { vm.release(probe.base(), probe.len()) }.map_err(failed)?;

        match vm.reserve_at(aligned, length) {
            Ok(_) => return Ok(os_range(aligned, length, granularity)),
            Err(VmError::AddressInUse { .. }) => {
                tracing::debug!(
                    attempt,
                    addr = format_args!("{aligned:#x}"),
                    length,
                    "aligned window taken before it could be reserved, retrying"
                );
            }
            Err(source) => return Err(failed(source)),
        }
    }

    Err(failed(VmError::ReservationFailed(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("no aligned window of {length} bytes could be claimed after {retries} retries"),
    ))))
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::reservation::sim::{SimulatedVmOps, SIM_DEFAULT_BASE};
    use crate::reservation::ErrorKind;

    const G: usize = 4096;

    #[test]
    fn test_validate_unaligned_address() {
        let err = validate_request(Some(0x12345), G, G).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnalignedAddress);
        assert_eq!(err.addr(), Some(0x12345));
    }

    #[test]
    fn test_validate_unaligned_length() {
        let err = validate_request(Some(G), 12345, G).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnalignedLength);
        assert_eq!(err.length(), Some(12345));

        let err = validate_request(None, 12345, G).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnalignedLength);
    }

    #[test]
    fn test_validate_address_checked_first() {
        let err = validate_request(Some(0x12345), 12345, G).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnalignedAddress);
    }

    #[test]
    fn test_validate_zero_length() {
        assert_eq!(
            validate_request(None, 0, G).unwrap_err().kind(),
            ErrorKind::UnalignedLength
        );
    }

    #[test]
    fn test_validate_wrapping_range() {
        let top = usize::MAX - (G - 1);
        let err = validate_request(Some(top), 2 * G, G).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn test_validate_ok() {
        assert_eq!(validate_request(None, 2 * G, G).unwrap(), None);
        assert_eq!(
            validate_request(Some(4 * G), 2 * G, G).unwrap(),
            AddressRange::new(4 * G, 2 * G)
        );
    }

    #[test]
    fn test_place_fixed_maps_address_in_use() {
        let sim = SimulatedVmOps::with_granules(8);
        let range = AddressRange::new(SIM_DEFAULT_BASE, 2 * G).unwrap();
        place_fixed(&sim, range).unwrap();
        let err = place_fixed(&sim, range).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RegionOccupied);
    }

    #[test]
    fn test_place_fixed_passes_os_error_through() {
        let sim = SimulatedVmOps::with_granules(8);
        sim.fail_next_reserve(12);
        let range = AddressRange::new(SIM_DEFAULT_BASE, G).unwrap();
        let err = place_fixed(&sim, range).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReservationFailed);
        assert_eq!(err.raw_os_error(), Some(12));
        assert_eq!(err.addr(), Some(SIM_DEFAULT_BASE));
    }

    #[test]
    fn test_place_anywhere_native() {
        let sim = SimulatedVmOps::with_granules(8);
        let range = place_anywhere(&sim, 2 * G, G, 0).unwrap();
        assert_eq!(range.base(), SIM_DEFAULT_BASE);
        assert_eq!(range.len(), 2 * G);
    }

    #[test]
    fn test_place_anywhere_coarse_granularity() {
        let sim = SimulatedVmOps::with_granules(64);
        // Push the OS pick off the 16-page boundary.
        sim.reserve_anywhere(G).unwrap();

        let coarse = 16 * G;
        let range = place_anywhere(&sim, coarse, coarse, 2).unwrap();
        assert_eq!(range.base() % coarse, 0);
        assert_eq!(range.len(), coarse);
        assert!(sim.is_reserved(range.base(), range.len()));
        // Only the aligned window plus the first page stay reserved.
        assert_eq!(sim.reserved_bytes(), coarse + G);
    }

    #[test]
    fn test_place_anywhere_exhaustion() {
        let sim = SimulatedVmOps::with_granules(2);
        let err = place_anywhere(&sim, 4 * G, G, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReservationFailed);
        assert_eq!(err.addr(), None);
    }

    #[test]
    #[should_panic(expected = "not a multiple of its granularity")]
    fn test_place_anywhere_unaligned_os_base_is_fatal() {
        let sim = SimulatedVmOps::with_granules(8);
        sim.misalign_next_reserve();
        drop(place_anywhere(&sim, G, G, 0));
    }
}
