use std::fmt;

/// A half-open span of virtual addresses, `[base, base + len)`.
///
/// Construction only guarantees the span is non-empty and does not wrap the
/// address space. Granularity alignment depends on who consumes the range
/// and is checked with [`AddressRange::is_aligned`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressRange {
    base: usize,
    len: usize,
}

impl AddressRange {
    /// Returns `None` when `len` is zero or `base + len` overflows.
    #[must_use]
    pub const fn new(base: usize, len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        match base.checked_add(len) {
            Some(_) => Some(Self { base, len }),
            None => None,
        }
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// One past the last address. Never wraps.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.len
    }

    /// True when both base and length are multiples of `granularity`.
    #[must_use]
    pub const fn is_aligned(&self, granularity: usize) -> bool {
        self.base.is_multiple_of(granularity) && self.len.is_multiple_of(granularity)
    }

    #[must_use]
    pub const fn contains(&self, other: &AddressRange) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }

    #[must_use]
    pub const fn contains_addr(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    #[must_use]
    pub const fn overlaps(&self, other: &AddressRange) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// Byte offset of `other` from the start of `self`, if `self` contains it.
    #[must_use]
    pub const fn offset_of(&self, other: &AddressRange) -> Option<usize> {
        if self.contains(other) {
            Some(other.base - self.base)
        } else {
            None
        }
    }
}

impl fmt::Debug for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.base, self.end())
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}
