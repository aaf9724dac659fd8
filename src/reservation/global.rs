use super::error::ReservationError;
use super::handle::{Reservation, ReservationId};
use super::registry::Registry;
use super::stats::RegistryStats;
use super::vm::PlatformVmOps;
use crate::sync::OnceLock;

static GLOBAL_REGISTRY: OnceLock<Registry<PlatformVmOps>> = OnceLock::new();

/// Process-wide registry over the host OS allocator.
///
/// Subsystems that want their reservations to be checked against each
/// other share this one. It is created on first use and lives until the
/// process exits; reservations still held at exit are left to the OS.
pub struct GlobalRegistry;

impl GlobalRegistry {
    pub fn get() -> &'static Registry<PlatformVmOps> {
        GLOBAL_REGISTRY.get_or_init(Registry::new)
    }

    /// # Errors
    ///
    /// See [`Registry::reserve`].
    pub fn reserve(addr: Option<usize>, length: usize) -> Result<Reservation, ReservationError> {
        Self::get().reserve(addr, length)
    }

    /// # Errors
    ///
    /// See [`Registry::release`].
    pub fn release(id: ReservationId) -> Result<(), ReservationError> {
        Self::get().release(id)
    }

    pub fn granularity() -> usize {
        Self::get().granularity()
    }

    pub fn stats() -> RegistryStats {
        Self::get().stats()
    }
}
