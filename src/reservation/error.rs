use super::handle::ReservationId;
use super::range::AddressRange;
use super::vm::VmError;
use std::fmt;

/// Stable classification of a [`ReservationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnalignedAddress,
    UnalignedLength,
    RegionOccupied,
    ReservationFailed,
    OutOfRange,
    SubRangeOccupied,
    ReservationBusy,
    InvalidReservation,
    ReleaseFailed,
}

/// Every failure the registry reports. None of them leaves the registry in
/// an inconsistent state; callers may retry with different parameters.
#[derive(Debug)]
pub enum ReservationError {
    UnalignedAddress { addr: usize, granularity: usize },
    /// Also used for zero-length requests.
    UnalignedLength { length: usize, granularity: usize },
    /// The range collides with another reservation or a foreign mapping.
    RegionOccupied { addr: usize, length: usize },
    /// The OS allocator refused. `addr` is the requested base, if any.
    ReservationFailed { addr: Option<usize>, length: usize, source: VmError },
    /// The range is not inside `bounds` (the parent reservation, or the
    /// whole address space for a request that would wrap).
    OutOfRange { addr: usize, length: usize, bounds: Option<AddressRange> },
    SubRangeOccupied { addr: usize, length: usize },
    ReservationBusy { id: ReservationId, usage: usize },
    InvalidReservation { id: ReservationId },
    /// The registry entry is gone but the OS kept the range.
    ReleaseFailed { id: ReservationId, range: AddressRange, source: VmError },
}

impl ReservationError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReservationError::UnalignedAddress { .. } => ErrorKind::UnalignedAddress,
            ReservationError::UnalignedLength { .. } => ErrorKind::UnalignedLength,
            ReservationError::RegionOccupied { .. } => ErrorKind::RegionOccupied,
            ReservationError::ReservationFailed { .. } => ErrorKind::ReservationFailed,
            ReservationError::OutOfRange { .. } => ErrorKind::OutOfRange,
            ReservationError::SubRangeOccupied { .. } => ErrorKind::SubRangeOccupied,
            ReservationError::ReservationBusy { .. } => ErrorKind::ReservationBusy,
            ReservationError::InvalidReservation { .. } => ErrorKind::InvalidReservation,
            ReservationError::ReleaseFailed { .. } => ErrorKind::ReleaseFailed,
        }
    }

    /// The platform error code behind `ReservationFailed` / `ReleaseFailed`,
    /// unchanged.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ReservationError::ReservationFailed { source, .. }
            | ReservationError::ReleaseFailed { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Offending address, where one applies.
    #[must_use]
    pub fn addr(&self) -> Option<usize> {
        match self {
            ReservationError::UnalignedAddress { addr, .. }
            | ReservationError::RegionOccupied { addr, .. }
            | ReservationError::OutOfRange { addr, .. }
            | ReservationError::SubRangeOccupied { addr, .. } => Some(*addr),
            ReservationError::ReservationFailed { addr, .. } => *addr,
            ReservationError::ReleaseFailed { range, .. } => Some(range.base()),
            ReservationError::UnalignedLength { .. }
            | ReservationError::ReservationBusy { .. }
            | ReservationError::InvalidReservation { .. } => None,
        }
    }

    /// Offending length, where one applies.
    #[must_use]
    pub fn length(&self) -> Option<usize> {
        match self {
            ReservationError::UnalignedLength { length, .. }
            | ReservationError::RegionOccupied { length, .. }
            | ReservationError::ReservationFailed { length, .. }
            | ReservationError::OutOfRange { length, .. }
            | ReservationError::SubRangeOccupied { length, .. } => Some(*length),
            ReservationError::ReleaseFailed { range, .. } => Some(range.len()),
            ReservationError::UnalignedAddress { .. }
            | ReservationError::ReservationBusy { .. }
            | ReservationError::InvalidReservation { .. } => None,
        }
    }
}

impl fmt::Display for ReservationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationError::UnalignedAddress { addr, granularity } => {
                write!(f, "address {addr:#x} is not a multiple of {granularity}")
            }
            ReservationError::UnalignedLength { length, granularity } => {
                write!(f, "length {length} is not a non-zero multiple of {granularity}")
            }
            ReservationError::RegionOccupied { addr, length } => write!(
                f,
                "range at {addr:#x} (+{length:#x}) overlaps an existing mapping"
            ),
            ReservationError::ReservationFailed { addr: Some(addr), length, source } => {
                write!(f, "cannot reserve {length} bytes at {addr:#x}: {source}")
            }
            ReservationError::ReservationFailed { addr: None, length, source } => {
                write!(f, "cannot reserve {length} bytes: {source}")
            }
            ReservationError::OutOfRange { addr, length, bounds: Some(bounds) } => write!(
                f,
                "range at {addr:#x} (+{length:#x}) is not contained in reservation {bounds}"
            ),
            ReservationError::OutOfRange { addr, length, bounds: None } => write!(
                f,
                "range at {addr:#x} (+{length:#x}) wraps the address space"
            ),
            ReservationError::SubRangeOccupied { addr, length } => write!(
                f,
                "sub-range at {addr:#x} (+{length:#x}) overlaps an existing mapping in the reservation"
            ),
            ReservationError::ReservationBusy { id, usage } => {
                write!(f, "reservation {id} still has {usage} mapping(s) bound")
            }
            ReservationError::InvalidReservation { id } => {
                write!(f, "reservation {id} does not exist")
            }
            ReservationError::ReleaseFailed { id, range, source } => write!(
                f,
                "reservation {id} {range} was unregistered but the OS kept it: {source}"
            ),
        }
    }
}

impl std::error::Error for ReservationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReservationError::ReservationFailed { source, .. }
            | ReservationError::ReleaseFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}
