//! Identifier newtypes.
//!
//! Peers and nodes carry bus-global identities; handles are per-peer opaque
//! ids. Timestamps are the 64-bit logical-clock values assigned by per-peer
//! queues, with the low bit marking a staging entry.

use std::fmt;
use std::num::NonZeroU64;

/// Bus-global peer identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct PeerId(NonZeroU64);

impl PeerId {
    /// Construct a `PeerId` from a raw value.
    ///
    /// Returns `None` for 0 (no peer has id 0).
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Bus-global node identity.
///
/// A node is the shared object that handles in different peers may refer to.
/// Node ids are allocated from one bus-wide counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct NodeId(NonZeroU64);

impl NodeId {
    /// Construct a `NodeId` from a raw value.
    ///
    /// Returns `None` for 0.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Per-peer opaque handle id.
///
/// Handle ids are only meaningful relative to one peer's handle table. The
/// all-ones value is the invalid sentinel written back to callers when a
/// destination could not be resolved at commit time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct HandleId(u64);

impl HandleId {
    /// The invalid sentinel.
    pub const INVALID: Self = Self(u64::MAX);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is a real handle id rather than the sentinel.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "handle#{}", self.0)
        } else {
            f.write_str("handle#invalid")
        }
    }
}

/// 64-bit logical-clock timestamp.
///
/// The low bit distinguishes a *staging* entry (set) from a *committed* entry
/// (clear). A message staged at `t - 1` and committed at `t` occupies the
/// same queue slot; comparisons are by the full 64-bit value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether the low bit marks this as a staging entry.
    #[inline]
    #[must_use]
    pub const fn is_staging(self) -> bool {
        self.0 & 1 == 1
    }

    /// Whether this is a committed (even) timestamp.
    #[inline]
    #[must_use]
    pub const fn is_committed(self) -> bool {
        self.0 & 1 == 0
    }

    /// The staging slot `t - 1` paired with this committed timestamp.
    #[inline]
    #[must_use]
    pub const fn staging_slot(self) -> Self {
        debug_assert!(self.is_committed());
        Self(self.0 - 1)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_and_node_ids_reject_zero() {
        assert!(PeerId::new(0).is_none());
        assert!(NodeId::new(0).is_none());
        assert_eq!(PeerId::new(7).map(PeerId::get), Some(7));
        assert_eq!(NodeId::new(7).map(NodeId::get), Some(7));
    }

    #[test]
    fn handle_sentinel() {
        assert!(!HandleId::INVALID.is_valid());
        assert!(HandleId::new(0).is_valid());
        assert_eq!(HandleId::INVALID.to_string(), "handle#invalid");
        assert_eq!(HandleId::new(3).to_string(), "handle#3");
    }

    #[test]
    fn timestamp_staging_bit() {
        let commit = Timestamp::new(8);
        assert!(commit.is_committed());
        assert!(!commit.is_staging());
        let staging = commit.staging_slot();
        assert_eq!(staging.get(), 7);
        assert!(staging.is_staging());
        assert!(staging < commit);
    }
}
