//! capbus: a capability-based IPC bus built around a multicast
//! message-transaction core.
//!
//! A sending peer constructs one logical message addressed to any number of
//! destination peers, identified by opaque handle ids. The core delivers it
//! to every reachable destination atomically with respect to a bus-wide
//! causal order: per-peer Lamport-style clocks, a two-phase staged commit,
//! and careful ownership transfer of byte vectors, file references, and
//! handle references across peer boundaries.
//!
//! The [`Bus`] facade owns the peer registry and the file table and drives
//! the construct → link → commit sequence; the underlying
//! [`Transaction`] is usable directly for finer control.

mod bus;

pub use bus::{Bus, Received};

pub use capbus_core::{Message, Transaction};
pub use capbus_error::{BusError, Errno, Result};
pub use capbus_peer::{
    Active, Delivery, FileObject, FileRef, FileTable, HandleDest, HandleTable, InflightSet,
    MessageSeq, Node, Peer, PeerConfig, PeerHandle, PeerInfo, PeerLocked, PeerRegistry, Pool,
    PoolConfig, Queue, ReadyMessage, SliceHeader, SliceId, TransferSet, Waker,
};
pub use capbus_types::{
    Credentials, Gid, HandleId, HeapUserMemory, IoVec, MemFault, NodeId, PeerId, Pid,
    PidNamespace, SendFlags, SendParams, SenderIdentity, Timestamp, TranslatedIdentity, Uid,
    UserAddr, UserMemory, UserNamespace, FD_MAX, OVERFLOW_GID, OVERFLOW_UID, VEC_MAX,
};
