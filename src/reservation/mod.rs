pub(crate) mod binder;
pub(crate) mod error;
pub(crate) mod global;
pub(crate) mod handle;
pub(crate) mod placement;
pub(crate) mod range;
pub(crate) mod registry;
pub(crate) mod sim;
pub(crate) mod stats;
pub(crate) mod vm;

pub use binder::{Binding, OwnerToken};
pub use error::{ErrorKind, ReservationError};
pub use global::GlobalRegistry;
pub use handle::{Reservation, ReservationId};
pub use range::AddressRange;
pub use registry::{Registry, RegistryConfig};
pub use sim::{SimulatedVmOps, SIM_DEFAULT_BASE, SIM_DEFAULT_GRANULARITY};
pub use stats::RegistryStats;
pub use vm::{OccupancyProbe, PlatformVmOps, VmError, VmOps};

// Tests that place reservations at fixed real addresses take the write lock;
// everything else touching the host address space takes the read lock.
#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
