use std::fmt;
use std::io;

#[derive(Debug)]
pub enum VmError {
    /// The OS refused to reserve the range (exhaustion, bad arguments, ...).
    ReservationFailed(io::Error),
    /// The OS refused to release a range.
    ReleaseFailed(io::Error),
    /// A fixed-address reservation hit an existing mapping.
    AddressInUse { addr: usize, length: usize },
    InitializationFailed(String),
}

impl VmError {
    /// Raw platform error code, passed through from the failing OS call.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            VmError::ReservationFailed(e) | VmError::ReleaseFailed(e) => e.raw_os_error(),
            VmError::AddressInUse { .. } | VmError::InitializationFailed(_) => None,
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::AddressInUse { addr, length } => write!(
                f,
                "VM reservation failed: a mapping already exists in [{addr:#x}, +{length:#x})"
            ),
            VmError::InitializationFailed(msg) => write!(f, "VM initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e) | VmError::ReleaseFailed(e) => Some(e),
            VmError::AddressInUse { .. } | VmError::InitializationFailed(_) => None,
        }
    }
}

/// Address-space primitives the registry is built on.
///
/// Reservations are anonymous and inaccessible: no physical memory backs
/// them until something is mapped over them.
pub trait VmOps: Send + Sync {
    /// Mapping granularity: every address and length handed to this backend
    /// is a multiple of it. Always a power of two.
    fn granularity(&self) -> usize;

    /// Reserve exactly `[addr, addr + len)`. Must never replace an existing
    /// mapping; a collision is reported as [`VmError::AddressInUse`].
    fn reserve_at(&self, addr: usize, len: usize) -> Result<usize, VmError>;

    /// Reserve `len` bytes wherever the OS sees fit. Returns the base.
    fn reserve_anywhere(&self, len: usize) -> Result<usize, VmError>;

    /// Release a range previously returned by `reserve_at` / `reserve_anywhere`.
    ///
    /// # Safety
    /// Nothing may still be mapped inside the range on behalf of a live
    /// owner, and no reference into the range may be used afterwards.
    unsafe fn release(&self, addr: usize, len: usize) -> Result<(), VmError>;
}

/// Query for mappings the registry did not create itself.
pub trait OccupancyProbe {
    /// `false` if any byte of `[addr, addr + len)` is currently mapped.
    ///
    /// May report `true` when the platform offers no cheap way to tell; the
    /// no-replace semantics of [`VmOps::reserve_at`] still catch collisions.
    fn is_range_free(&self, addr: usize, len: usize) -> bool;
}

/// The host operating system's virtual memory allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformVmOps;

#[cfg(unix)]
mod unix {
    use super::{OccupancyProbe, PlatformVmOps, VmError, VmOps};
    use std::io;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const NOREPLACE: libc::c_int = libc::MAP_FIXED_NOREPLACE;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const NOREPLACE: libc::c_int = 0;

    /// Anonymous `PROT_NONE` mapping with `addr` as a hint.
    fn map_none(addr: usize, len: usize, extra_flags: libc::c_int) -> Result<usize, io::Error> {
        // Safety: FFI call to mmap. Without MAP_FIXED the kernel never
        // replaces an existing mapping.
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON | extra_flags,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ptr as usize)
    }

    impl VmOps for PlatformVmOps {
        fn granularity(&self) -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }

        fn reserve_at(&self, addr: usize, len: usize) -> Result<usize, VmError> {
            let got = match map_none(addr, len, NOREPLACE) {
                Ok(got) => got,
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    return Err(VmError::AddressInUse { addr, length: len });
                }
                Err(e) => return Err(VmError::ReservationFailed(e)),
            };

            // Kernels without MAP_FIXED_NOREPLACE (and non-Linux systems)
            // treat the address as a hint and place the mapping elsewhere
            // when it is taken.
            if got != addr {
                // Safety: `got` is the mapping we just created.
                unsafe { libc::munmap(got as *mut libc::c_void, len) };
                return Err(VmError::AddressInUse { addr, length: len });
            }
            Ok(got)
        }

        fn reserve_anywhere(&self, len: usize) -> Result<usize, VmError> {
            map_none(0, len, 0).map_err(VmError::ReservationFailed)
        }

        unsafe fn release(&self, addr: usize, len: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap; caller upholds the contract.
            if unsafe { libc::munmap(addr as *mut libc::c_void, len) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }
    }

    impl OccupancyProbe for PlatformVmOps {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        fn is_range_free(&self, addr: usize, len: usize) -> bool {
            let Some(end) = addr.checked_add(len) else {
                return false;
            };
            match std::fs::read_to_string("/proc/self/maps") {
                Ok(maps) => !super::maps_overlap(&maps, addr, end),
                Err(e) => {
                    tracing::debug!(error = %e, "cannot read /proc/self/maps, skipping occupancy probe");
                    true
                }
            }
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        fn is_range_free(&self, _addr: usize, _len: usize) -> bool {
            true
        }
    }
}

/// True when any `lo-hi` range in a `/proc/<pid>/maps` listing intersects
/// `[start, end)`.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
pub(crate) fn maps_overlap(maps: &str, start: usize, end: usize) -> bool {
    maps.lines()
        .filter_map(|line| {
            let (lo, hi) = line.split_whitespace().next()?.split_once('-')?;
            Some((
                usize::from_str_radix(lo, 16).ok()?,
                usize::from_str_radix(hi, 16).ok()?,
            ))
        })
        .any(|(lo, hi)| lo < end && start < hi)
}

#[cfg(windows)]
mod windows {
    use super::{OccupancyProbe, PlatformVmOps, VmError, VmOps};
    use std::ffi::c_void;
    use std::io;

    const MEM_RESERVE: u32 = 0x2000;
    const MEM_RELEASE: u32 = 0x8000;
    const MEM_FREE: u32 = 0x10000;
    const PAGE_NOACCESS: u32 = 0x01;
    const ERROR_INVALID_ADDRESS: i32 = 487;

    #[repr(C)]
    struct SystemInfo {
        processor_architecture: u16,
        reserved: u16,
        page_size: u32,
        minimum_application_address: *mut c_void,
        maximum_application_address: *mut c_void,
        active_processor_mask: usize,
        number_of_processors: u32,
        processor_type: u32,
        allocation_granularity: u32,
        processor_level: u16,
        processor_revision: u16,
    }

    #[repr(C)]
    struct MemoryBasicInformation {
        base_address: *mut c_void,
        allocation_base: *mut c_void,
        allocation_protect: u32,
        #[cfg(target_pointer_width = "64")]
        partition_id: u16,
        region_size: usize,
        state: u32,
        protect: u32,
        kind: u32,
    }

    #[link(name = "kernel32")]
    extern "system" {
        fn VirtualAlloc(addr: *mut c_void, size: usize, kind: u32, protect: u32) -> *mut c_void;
        fn VirtualFree(addr: *mut c_void, size: usize, kind: u32) -> i32;
        fn VirtualQuery(addr: *const c_void, info: *mut MemoryBasicInformation, len: usize) -> usize;
        fn GetSystemInfo(info: *mut SystemInfo);
    }

    impl VmOps for PlatformVmOps {
        fn granularity(&self) -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            // Safety: FFI call to GetSystemInfo on a zeroed out-parameter.
            *CACHED.get_or_init(|| unsafe {
                let mut info: SystemInfo = std::mem::zeroed();
                GetSystemInfo(&mut info);
                info.allocation_granularity as usize
            })
        }

        fn reserve_at(&self, addr: usize, len: usize) -> Result<usize, VmError> {
            // Safety: FFI call to VirtualAlloc. MEM_RESERVE never replaces an
            // existing region.
            let ptr = unsafe { VirtualAlloc(addr as *mut c_void, len, MEM_RESERVE, PAGE_NOACCESS) };
            if ptr.is_null() {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(ERROR_INVALID_ADDRESS) {
                    return Err(VmError::AddressInUse { addr, length: len });
                }
                return Err(VmError::ReservationFailed(err));
            }
            Ok(ptr as usize)
        }

        fn reserve_anywhere(&self, len: usize) -> Result<usize, VmError> {
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe { VirtualAlloc(std::ptr::null_mut(), len, MEM_RESERVE, PAGE_NOACCESS) };
            if ptr.is_null() {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }
            Ok(ptr as usize)
        }

        unsafe fn release(&self, addr: usize, _len: usize) -> Result<(), VmError> {
            // MEM_RELEASE must be given size 0 and the base of the region.
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(addr as *mut c_void, 0, MEM_RELEASE) } == 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }
    }

    impl OccupancyProbe for PlatformVmOps {
        fn is_range_free(&self, addr: usize, len: usize) -> bool {
            let Some(end) = addr.checked_add(len) else {
                return false;
            };
            let mut cursor = addr;
            while cursor < end {
                // Safety: zeroed plain-old-data out-parameter.
                let mut info: MemoryBasicInformation = unsafe { std::mem::zeroed() };
                // Safety: FFI call to VirtualQuery.
                let written = unsafe {
                    VirtualQuery(
                        cursor as *const c_void,
                        &mut info,
                        std::mem::size_of::<MemoryBasicInformation>(),
                    )
                };
                if written == 0 {
                    // Beyond the user address space: nothing can be mapped there.
                    return true;
                }
                if info.state != MEM_FREE {
                    return false;
                }
                let next = (info.base_address as usize).saturating_add(info.region_size);
                if next <= cursor {
                    return true;
                }
                cursor = next;
            }
            true
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn test_granularity_is_power_of_two() {
        let g = PlatformVmOps.granularity();
        assert!(g > 0);
        assert!(g.is_power_of_two(), "granularity {g} is not a power of two");
        // Cached value is stable.
        assert_eq!(g, PlatformVmOps.granularity());
    }

    #[test]
    fn test_reserve_anywhere_release() {
        let _guard = crate::reservation::TEST_MUTEX.read().unwrap();
        let vm = PlatformVmOps;
        let g = vm.granularity();
        let len = 16 * g;

        let base = vm.reserve_anywhere(len).expect("Reserve failed");
        assert_eq!(base % g, 0, "OS returned an unaligned base {base:#x}");
        assert!(!vm.is_range_free(base, len) || cfg!(not(any(target_os = "linux", windows))));

        // Safety: Test code; nothing lives in the range.
        unsafe { vm.release(base, len).expect("Release failed") };
    }

    #[test]
    fn test_reserve_zero_size() {
        // mmap / VirtualAlloc reject zero-length requests.
        let result = PlatformVmOps.reserve_anywhere(0);
        assert!(result.is_err(), "Reserving 0 bytes should fail");
        assert!(result.unwrap_err().raw_os_error().is_some());
    }

    #[test]
    fn test_reserve_at_occupied_reports_address_in_use() {
        let _guard = crate::reservation::TEST_MUTEX.read().unwrap();
        let vm = PlatformVmOps;
        let len = 4 * vm.granularity();

        let base = vm.reserve_anywhere(len).expect("Reserve failed");
        match vm.reserve_at(base, len) {
            Err(VmError::AddressInUse { addr, length }) => {
                assert_eq!(addr, base);
                assert_eq!(length, len);
            }
            other => panic!("expected AddressInUse, got {other:?}"),
        }

        // Safety: Test code.
        unsafe { vm.release(base, len).expect("Release failed") };
    }

    #[test]
    fn test_reserve_at_freed_region() {
        let _guard = crate::reservation::TEST_MUTEX.write().unwrap();
        let vm = PlatformVmOps;
        let len = 16 * vm.granularity();

        let base = vm.reserve_anywhere(len).expect("Reserve failed");
        // Safety: Test code.
        unsafe { vm.release(base, len).expect("Release failed") };

        let again = vm.reserve_at(base, len).expect("Fixed reserve of a freed range failed");
        assert_eq!(again, base);
        // Safety: Test code.
        unsafe { vm.release(again, len).expect("Release failed") };
    }

    #[test]
    fn test_reserve_very_large() {
        let _guard = crate::reservation::TEST_MUTEX.read().unwrap();
        // 1GB of address space is fine on 64-bit systems: nothing is committed.
        #[cfg(target_pointer_width = "64")]
        {
            let vm = PlatformVmOps;
            let size = 1024 * MIB;
            let base = vm.reserve_anywhere(size).expect("Failed to reserve 1GB");
            // Safety: Test code.
            unsafe { vm.release(base, size).expect("Release failed") };
        }
    }

    #[test]
    fn test_multiple_reservations_disjoint() {
        let _guard = crate::reservation::TEST_MUTEX.read().unwrap();
        let vm = PlatformVmOps;
        let len = MIB.max(vm.granularity());

        let a = vm.reserve_anywhere(len).expect("Reserve 1 failed");
        let b = vm.reserve_anywhere(len).expect("Reserve 2 failed");
        assert_ne!(a, b);
        assert!(a + len <= b || b + len <= a, "OS handed out overlapping reservations");

        // Safety: Test code.
        unsafe {
            vm.release(a, len).expect("Release 1 failed");
            vm.release(b, len).expect("Release 2 failed");
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_probe_sees_foreign_mapping() {
        let _guard = crate::reservation::TEST_MUTEX.read().unwrap();
        let vm = PlatformVmOps;
        let g = vm.granularity();

        // A mapping the registry knows nothing about.
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                4 * g,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);
        let base = ptr as usize;

        assert!(!vm.is_range_free(base, 4 * g));
        assert!(!vm.is_range_free(base + g, g), "sub-range of a mapping is occupied");

        // Safety: Test code.
        unsafe { libc::munmap(ptr, 4 * g) };
    }

    #[test]
    fn test_maps_overlap_parsing() {
        let maps = "\
00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon
00651000-00652000 r--p 00051000 08:02 173521      /usr/bin/dbus-daemon
7ffc3a5e2000-7ffc3a603000 rw-p 00000000 00:00 0          [stack]
garbage line
";
        assert!(maps_overlap(maps, 0x0040_0000, 0x0040_1000));
        assert!(maps_overlap(maps, 0x0045_1000, 0x0046_0000), "overlap at the tail");
        assert!(!maps_overlap(maps, 0x0045_2000, 0x0065_1000), "gap between mappings");
        assert!(maps_overlap(maps, 0x7ffc_3a60_2000, 0x7ffc_3a70_0000));
        assert!(!maps_overlap(maps, 0x7ffc_3a60_3000, 0x7ffc_3a70_0000));
    }

    #[test]
    fn test_vm_error_source_and_code() {
        let err = VmError::ReservationFailed(io::Error::from_raw_os_error(12));
        assert_eq!(err.raw_os_error(), Some(12));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().starts_with("VM reservation failed"));

        let in_use = VmError::AddressInUse { addr: 0x1000, length: 0x2000 };
        assert_eq!(in_use.raw_os_error(), None);
        assert!(std::error::Error::source(&in_use).is_none());
    }
}
