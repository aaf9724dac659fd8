#[cfg(not(target_pointer_width = "64"))]
compile_error!("vmreserve supports only 64-bit targets.");

pub(crate) mod sync;

// public module: implementation details stay pub(crate), TEST_MUTEX is
// public for tests
pub mod reservation;

// registry
pub use reservation::{GlobalRegistry, Registry, RegistryConfig, RegistryStats};

// reservations/bindings
pub use reservation::{AddressRange, Binding, OwnerToken, Reservation, ReservationId};

// backends
pub use reservation::{OccupancyProbe, PlatformVmOps, SimulatedVmOps, VmOps};

// errors
pub use reservation::{ErrorKind, ReservationError, VmError};
