//! Contract between reservations and the mapping layer.
//!
//! A mapping subsystem that places a file- or memory-backed mapping inside a
//! reservation must first [`bind`](super::Reservation::bind) the sub-range
//! under an [`OwnerToken`], and [`unbind`](super::Reservation::unbind) the
//! same token once the mapping is gone. While that holds, a reservation with
//! live bindings can never be released and two mappings can never alias the
//! same bytes of one reservation.

use super::error::ReservationError;
use super::range::AddressRange;
use crate::sync::atomic::{AtomicU64, Ordering};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Opaque identity of whoever holds a binding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerToken(u64);

/// Tokens from [`OwnerToken::new`] carry this bit so they never collide
/// with small caller-chosen ids passed to [`OwnerToken::from_raw`].
const GENERATED_BIT: u64 = 1 << 63;

crate::sync::static_atomic! {
    static NEXT_OWNER: AtomicU64 = AtomicU64::new(0);
}

impl OwnerToken {
    /// A process-unique token.
    #[must_use]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(GENERATED_BIT | NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerToken({:#x})", self.0)
    }
}

/// A sub-range claimed by one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub range: AddressRange,
    pub owner: OwnerToken,
}

/// The set of bindings inside one reservation. Ranges never overlap and
/// each owner holds at most one binding.
#[derive(Default)]
pub(crate) struct Bindings {
    by_base: BTreeMap<usize, Binding>,
    by_owner: HashMap<OwnerToken, usize>,
    bound_bytes: usize,
}

impl Bindings {
    /// The binding that intersects `range`, if any.
    ///
    /// Bindings are disjoint, so only the last one starting before
    /// `range.end()` can reach into it.
    pub(crate) fn overlapping(&self, range: &AddressRange) -> Option<&Binding> {
        self.by_base
            .range(..range.end())
            .next_back()
            .map(|(_, b)| b)
            .filter(|b| b.range.overlaps(range))
    }

    pub(crate) fn insert(
        &mut self,
        range: AddressRange,
        owner: OwnerToken,
    ) -> Result<(), ReservationError> {
        if self.overlapping(&range).is_some() || self.by_owner.contains_key(&owner) {
            return Err(ReservationError::SubRangeOccupied {
                addr: range.base(),
                length: range.len(),
            });
        }
        self.by_base.insert(range.base(), Binding { range, owner });
        self.by_owner.insert(owner, range.base());
        self.bound_bytes += range.len();
        Ok(())
    }

    pub(crate) fn remove(&mut self, owner: OwnerToken) -> Option<Binding> {
        let base = self.by_owner.remove(&owner)?;
        let binding = self.by_base.remove(&base)?;
        self.bound_bytes -= binding.range.len();
        Some(binding)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_base.len()
    }

    pub(crate) fn bound_bytes(&self) -> usize {
        self.bound_bytes
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.by_base.values()
    }
}
