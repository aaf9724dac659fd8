use super::binder::{Binding, Bindings, OwnerToken};
use super::error::ReservationError;
use super::range::AddressRange;
use super::stats::RegistryCounters;
use crate::sync::{lock, Arc, Mutex};
use std::fmt;

/// Identifier of a reservation within its registry. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationId(u64);

impl ReservationId {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One reserved range of address space.
///
/// Cloning a `Reservation` yields another handle to the same reservation.
/// The range is fixed for the reservation's whole life; only its set of
/// bindings changes. Once the registry releases it every handle turns
/// inert and reports [`ReservationError::InvalidReservation`].
#[derive(Clone)]
pub struct Reservation {
    inner: Arc<Inner>,
}

struct Inner {
    id: ReservationId,
    range: AddressRange,
    granularity: usize,
    state: Mutex<State>,
    counters: Arc<RegistryCounters>,
}

struct State {
    released: bool,
    bindings: Bindings,
}

impl Reservation {
    pub(crate) fn new(
        id: ReservationId,
        range: AddressRange,
        granularity: usize,
        counters: Arc<RegistryCounters>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                range,
                granularity,
                state: Mutex::new(State {
                    released: false,
                    bindings: Bindings::default(),
                }),
                counters,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> ReservationId {
        self.inner.id
    }

    #[must_use]
    pub fn range(&self) -> AddressRange {
        self.inner.range
    }

    /// Base address of the reservation.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.inner.range.base()
    }

    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.inner.range.len()
    }

    /// Base address as a pointer. The memory is inaccessible until a
    /// mapping is placed over it.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.range.base() as *mut u8
    }

    /// Granularity every bound sub-range must be aligned to.
    #[must_use]
    pub fn granularity(&self) -> usize {
        self.inner.granularity
    }

    #[must_use]
    pub fn contains(&self, range: &AddressRange) -> bool {
        self.inner.range.contains(range)
    }

    #[must_use]
    pub fn overlaps(&self, range: &AddressRange) -> bool {
        self.inner.range.overlaps(range)
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        lock(&self.inner.state).released
    }

    /// Number of sub-mappings currently bound.
    #[must_use]
    pub fn usage_count(&self) -> usize {
        lock(&self.inner.state).bindings.len()
    }

    /// Snapshot of the current bindings, ordered by address.
    #[must_use]
    pub fn bindings(&self) -> Vec<Binding> {
        lock(&self.inner.state).bindings.iter().copied().collect()
    }

    /// Claim `sub_range` for `owner`.
    ///
    /// # Errors
    ///
    /// - `InvalidReservation` if the reservation was released.
    /// - `UnalignedAddress` / `UnalignedLength` if `sub_range` is not aligned
    ///   to [`granularity`](Self::granularity).
    /// - `OutOfRange` if `sub_range` is not fully inside the reservation.
    /// - `SubRangeOccupied` if it overlaps an existing binding, or `owner`
    ///   already holds one here.
    pub fn bind(&self, sub_range: AddressRange, owner: OwnerToken) -> Result<(), ReservationError> {
        let inner = &*self.inner;
        let mut state = lock(&inner.state);
        if state.released {
            return Err(ReservationError::InvalidReservation { id: inner.id });
        }
        if !sub_range.base().is_multiple_of(inner.granularity) {
            return Err(ReservationError::UnalignedAddress {
                addr: sub_range.base(),
                granularity: inner.granularity,
            });
        }
        if !sub_range.len().is_multiple_of(inner.granularity) {
            return Err(ReservationError::UnalignedLength {
                length: sub_range.len(),
                granularity: inner.granularity,
            });
        }
        if !inner.range.contains(&sub_range) {
            return Err(ReservationError::OutOfRange {
                addr: sub_range.base(),
                length: sub_range.len(),
                bounds: Some(inner.range),
            });
        }

        state.bindings.insert(sub_range, owner)?;
        inner.counters.bindings.add(1);
        inner.counters.bound_bytes.add(sub_range.len());
        tracing::debug!(
            id = %inner.id,
            addr = format_args!("{:#x}", sub_range.base()),
            length = sub_range.len(),
            owner = ?owner,
            usage = state.bindings.len(),
            "bound sub-range"
        );
        Ok(())
    }

    /// [`bind`](Self::bind) by offset from the start of the reservation.
    /// Returns the absolute range that was bound.
    ///
    /// # Errors
    ///
    /// As for `bind`. A zero `len` is `UnalignedLength`; an offset that
    /// cannot be represented is `OutOfRange`.
    pub fn bind_offset(
        &self,
        offset: usize,
        len: usize,
        owner: OwnerToken,
    ) -> Result<AddressRange, ReservationError> {
        let inner = &*self.inner;
        if len == 0 {
            return Err(ReservationError::UnalignedLength {
                length: len,
                granularity: inner.granularity,
            });
        }
        let sub_range = inner
            .range
            .base()
            .checked_add(offset)
            .and_then(|base| AddressRange::new(base, len))
            .ok_or(ReservationError::OutOfRange {
                addr: inner.range.base().wrapping_add(offset),
                length: len,
                bounds: Some(inner.range),
            })?;
        self.bind(sub_range, owner)?;
        Ok(sub_range)
    }

    /// Drop the binding held by `owner` and return it.
    ///
    /// # Panics
    ///
    /// Panics if `owner` holds no binding in this reservation. That means the
    /// mapping layer released the same mapping twice, which is a bug in the
    /// caller rather than a condition to recover from.
    pub fn unbind(&self, owner: OwnerToken) -> Binding {
        let inner = &*self.inner;
        let mut state = lock(&inner.state);
        let Some(binding) = state.bindings.remove(owner) else {
            panic!(
                "reservation {}: {owner:?} holds no binding (double unbind?)",
                inner.id
            );
        };
        inner.counters.bindings.sub(1);
        inner.counters.bound_bytes.sub(binding.range.len());
        tracing::debug!(
            id = %inner.id,
            addr = format_args!("{:#x}", binding.range.base()),
            length = binding.range.len(),
            owner = ?owner,
            usage = state.bindings.len(),
            "unbound sub-range"
        );
        binding
    }

    /// Mark the reservation released if nothing is bound. Returns the usage
    /// count otherwise. Called by the registry with its own lock held.
    pub(crate) fn retire(&self) -> Result<(), usize> {
        let mut state = lock(&self.inner.state);
        let usage = state.bindings.len();
        if usage != 0 {
            return Err(usage);
        }
        state.released = true;
        Ok(())
    }

    /// True when both handles refer to the same reservation.
    #[must_use]
    pub fn same_as(&self, other: &Reservation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.inner.id)
            .field("range", &self.inner.range)
            .field("usage", &self.usage_count())
            .finish()
    }
}
