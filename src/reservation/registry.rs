use super::binder::{Binding, OwnerToken};
use super::error::ReservationError;
use super::handle::{Reservation, ReservationId};
use super::placement;
use super::range::AddressRange;
use super::stats::{RegistryCounters, RegistryStats};
use super::vm::{OccupancyProbe, PlatformVmOps, VmError, VmOps};
use crate::sync::{lock, Arc, Mutex};
use std::collections::{BTreeMap, HashMap};

/// Configuration for `Registry`. All fields have sensible defaults.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Alignment every reservation and binding must satisfy. Must be a power
    /// of two and a multiple of the backend's granularity.
    /// Default: 0 = use the backend's granularity.
    pub granularity: usize,

    /// Ask the backend whether a fixed range is already mapped by something
    /// outside the registry before reserving it. Default: true.
    pub probe_foreign_mappings: bool,

    /// How often a floating reservation at a coarse `granularity` retries
    /// when another allocator takes its aligned window first. Default: 8.
    pub placement_retries: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            granularity: 0,
            probe_foreign_mappings: true,
            placement_retries: 8,
        }
    }
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<ReservationId, Reservation>,
    /// Base address → id. Reservations never overlap, so ordering by base
    /// orders them by end as well.
    by_base: BTreeMap<usize, ReservationId>,
    next_id: u64,
}

impl Entries {
    /// Ids of every reservation intersecting `range`, lowest address first.
    fn overlapping(&self, range: &AddressRange) -> Vec<ReservationId> {
        let mut hits = Vec::new();
        for id in self.by_base.range(..range.end()).rev().map(|(_, id)| *id) {
            if self.by_id[&id].range().end() <= range.base() {
                break;
            }
            hits.push(id);
        }
        hits.reverse();
        hits
    }

    fn get(&self, id: ReservationId) -> Result<&Reservation, ReservationError> {
        self.by_id
            .get(&id)
            .ok_or(ReservationError::InvalidReservation { id })
    }
}

/// Book-keeper for every reservation made through one backend.
///
/// A single lock serializes the conflict check, the OS call and the insert,
/// so two overlapping requests can never both succeed. Binding state lives in
/// each [`Reservation`] behind its own lock; the registry lock is always
/// taken first.
pub struct Registry<V: VmOps + OccupancyProbe = PlatformVmOps> {
    vm: V,
    granularity: usize,
    config: RegistryConfig,
    entries: Mutex<Entries>,
    counters: Arc<RegistryCounters>,
}

impl Registry<PlatformVmOps> {
    /// A registry over the host OS allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(PlatformVmOps)
    }
}

impl Default for Registry<PlatformVmOps> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: VmOps + OccupancyProbe> Registry<V> {
    #[must_use]
    pub fn with_backend(vm: V) -> Self {
        let granularity = vm.granularity();
        Self::build(vm, granularity, RegistryConfig::default())
    }

    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if `config.granularity` is
    /// neither 0 nor a power-of-two multiple of the backend's granularity.
    pub fn with_config(vm: V, config: RegistryConfig) -> Result<Self, VmError> {
        let native = vm.granularity();
        let granularity = match config.granularity {
            0 => native,
            g if g.is_power_of_two() && g >= native => g,
            g => {
                return Err(VmError::InitializationFailed(format!(
                    "granularity {g} must be a power of two no smaller than the OS granularity {native}"
                )));
            }
        };
        Ok(Self::build(vm, granularity, config))
    }

    fn build(vm: V, granularity: usize, config: RegistryConfig) -> Self {
        debug_assert!(granularity.is_power_of_two());
        Self {
            vm,
            granularity,
            config,
            entries: Mutex::new(Entries {
                next_id: 1,
                ..Entries::default()
            }),
            counters: Arc::new(RegistryCounters::new()),
        }
    }

    pub fn backend(&self) -> &V {
        &self.vm
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Alignment every reservation and binding in this registry satisfies.
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// Reserve `length` bytes of address space, at `addr` if given,
    /// otherwise wherever the OS chooses.
    ///
    /// # Errors
    ///
    /// - `UnalignedAddress` / `UnalignedLength` for inputs that do not
    ///   satisfy the granularity (checked before any OS call). Zero length
    ///   counts as unaligned.
    /// - `OutOfRange` if `addr + length` wraps the address space.
    /// - `RegionOccupied` if the fixed range overlaps another reservation or
    ///   any other mapping of the process. Nothing is reserved.
    /// - `ReservationFailed` if the OS refuses; see
    ///   [`ReservationError::raw_os_error`].
    ///
    /// # Panics
    ///
    /// Panics if the OS picks a base that violates its own granularity.
    pub fn reserve(&self, addr: Option<usize>, length: usize) -> Result<Reservation, ReservationError> {
        let request = placement::validate_request(addr, length, self.granularity)?;

        let mut entries = lock(&self.entries);
        let range = match request {
            Some(range) => {
                if let Some(&other) = entries.overlapping(&range).first() {
                    tracing::debug!(
                        addr = format_args!("{:#x}", range.base()),
                        length,
                        conflicts_with = %other,
                        "fixed reservation overlaps an existing reservation"
                    );
                    return Err(ReservationError::RegionOccupied {
                        addr: range.base(),
                        length,
                    });
                }
                if self.config.probe_foreign_mappings
                    && !self.vm.is_range_free(range.base(), range.len())
                {
                    tracing::debug!(
                        addr = format_args!("{:#x}", range.base()),
                        length,
                        "fixed reservation overlaps a foreign mapping"
                    );
                    return Err(ReservationError::RegionOccupied {
                        addr: range.base(),
                        length,
                    });
                }
                placement::place_fixed(&self.vm, range)?
            }
            None => placement::place_anywhere(
                &self.vm,
                length,
                self.granularity,
                self.config.placement_retries,
            )?,
        };
        debug_assert!(
            entries.overlapping(&range).is_empty(),
            "backend handed out {range}, which is already registered"
        );

        let id = ReservationId::from_raw(entries.next_id);
        entries.next_id += 1;
        let reservation = Reservation::new(id, range, self.granularity, self.counters.clone());
        entries.by_base.insert(range.base(), id);
        entries.by_id.insert(id, reservation.clone());

        self.counters.reservations.add(1);
        self.counters.reserved_bytes.add(range.len());
        tracing::debug!(
            id = %id,
            addr = format_args!("{:#x}", range.base()),
            length,
            fixed = addr.is_some(),
            "reserved address range"
        );
        Ok(reservation)
    }

    /// Reserve exactly `[addr, addr + length)`.
    ///
    /// # Errors
    ///
    /// See [`reserve`](Self::reserve).
    pub fn reserve_at(&self, addr: usize, length: usize) -> Result<Reservation, ReservationError> {
        self.reserve(Some(addr), length)
    }

    /// Reserve `length` bytes wherever the OS chooses.
    ///
    /// # Errors
    ///
    /// See [`reserve`](Self::reserve).
    pub fn reserve_anywhere(&self, length: usize) -> Result<Reservation, ReservationError> {
        self.reserve(None, length)
    }

    /// Unregister a reservation and give its range back to the OS.
    ///
    /// # Errors
    ///
    /// - `InvalidReservation` if `id` is unknown or already released.
    /// - `ReservationBusy` while sub-mappings are bound; nothing changes.
    /// - `ReleaseFailed` if the OS refused to release the range. The
    ///   reservation is unregistered regardless and the range is abandoned.
    pub fn release(&self, id: ReservationId) -> Result<(), ReservationError> {
        let mut entries = lock(&self.entries);
        let reservation = entries.get(id)?.clone();
        if let Err(usage) = reservation.retire() {
            return Err(ReservationError::ReservationBusy { id, usage });
        }

        let range = reservation.range();
        entries.by_id.remove(&id);
        entries.by_base.remove(&range.base());
        self.counters.reservations.sub(1);
        self.counters.reserved_bytes.sub(range.len());

        // Safety: the reservation has no bindings left, so by the binder
        // contract no live mapping sits inside the range.
        match unsafe { self.vm.release(range.base(), range.len()) } {
            Ok(()) => {
                tracing::debug!(id = %id, range = %range, "released reservation");
                Ok(())
            }
            Err(source) => {
                self.counters.leaked_bytes.add(range.len());
                tracing::warn!(
                    id = %id,
                    range = %range,
                    error = %source,
                    "OS release failed, abandoning the range"
                );
                Err(ReservationError::ReleaseFailed { id, range, source })
            }
        }
    }

    /// Handle for a live reservation.
    ///
    /// # Errors
    ///
    /// `InvalidReservation` if `id` is unknown or released.
    pub fn get(&self, id: ReservationId) -> Result<Reservation, ReservationError> {
        lock(&self.entries).get(id).cloned()
    }

    /// Live reservations intersecting `range`, lowest address first.
    pub fn find_overlap(&self, range: &AddressRange) -> Vec<ReservationId> {
        lock(&self.entries).overlapping(range)
    }

    /// True when `id` is live and fully contains `range`.
    pub fn contains(&self, id: ReservationId, range: &AddressRange) -> bool {
        lock(&self.entries)
            .by_id
            .get(&id)
            .is_some_and(|r| r.contains(range))
    }

    /// The live reservation covering `addr`, if any.
    pub fn find_containing(&self, addr: usize) -> Option<Reservation> {
        let entries = lock(&self.entries);
        let (_, id) = entries.by_base.range(..=addr).next_back()?;
        let reservation = &entries.by_id[id];
        reservation
            .range()
            .contains_addr(addr)
            .then(|| reservation.clone())
    }

    /// Bind `sub_range` of reservation `id` to `owner`, after checking that
    /// the sub-range touches no other reservation.
    ///
    /// # Errors
    ///
    /// `InvalidReservation` for an unknown id, otherwise as for
    /// [`Reservation::bind`].
    pub fn bind(
        &self,
        id: ReservationId,
        sub_range: AddressRange,
        owner: OwnerToken,
    ) -> Result<Reservation, ReservationError> {
        let entries = lock(&self.entries);
        let reservation = entries.get(id)?;
        if entries.overlapping(&sub_range).iter().any(|&other| other != id) {
            return Err(ReservationError::OutOfRange {
                addr: sub_range.base(),
                length: sub_range.len(),
                bounds: Some(reservation.range()),
            });
        }
        reservation.bind(sub_range, owner)?;
        Ok(reservation.clone())
    }

    /// Drop `owner`'s binding in reservation `id`.
    ///
    /// # Errors
    ///
    /// `InvalidReservation` for an unknown id.
    ///
    /// # Panics
    ///
    /// Panics if `owner` holds no binding there (double unbind).
    pub fn unbind(&self, id: ReservationId, owner: OwnerToken) -> Result<Binding, ReservationError> {
        let reservation = self.get(id)?;
        Ok(reservation.unbind(owner))
    }

    /// Ids of all live reservations, lowest address first.
    pub fn ids(&self) -> Vec<ReservationId> {
        lock(&self.entries).by_base.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        self.counters.snapshot()
    }
}

impl<V: VmOps + OccupancyProbe> Drop for Registry<V> {
    /// Give idle reservations back to the OS. Busy ones are leaked: their
    /// owners may still have mappings inside them.
    fn drop(&mut self) {
        let entries = std::mem::take(&mut *lock(&self.entries));
        for (id, reservation) in entries.by_id {
            let range = reservation.range();
            if let Err(usage) = reservation.retire() {
                tracing::warn!(id = %id, range = %range, usage, "registry dropped with bound sub-mappings, leaking reservation");
                continue;
            }
            // Safety: no bindings, so nothing is mapped inside on behalf of an owner.
            if let Err(e) = unsafe { self.vm.release(range.base(), range.len()) } {
                tracing::warn!(id = %id, range = %range, error = %e, "OS release failed while dropping registry");
            }
        }
    }
}
