//! Per-peer runtime for the capbus transaction core.
//!
//! Everything a transaction touches on the far side of a destination handle
//! lives here: the active-reference gate that pins peers against teardown,
//! the logical-clock ordering queue, the payload pool, the handle table
//! with its transfer/inflight primitives, and the registry that issues peer
//! references.

pub mod active;
pub mod file;
pub mod handle;
pub mod peer;
pub mod pool;
pub mod queue;

pub use active::Active;
pub use file::{FileObject, FileRef, FileTable};
pub use handle::{HandleDest, HandleTable, InflightSet, Node, TransferSet};
pub use peer::{Peer, PeerConfig, PeerHandle, PeerInfo, PeerLocked, PeerRegistry, Waker};
pub use pool::{Pool, PoolConfig, SliceHeader, SliceId};
pub use queue::{next_message_seq, Delivery, MessageSeq, Queue, ReadyMessage, RemoveOutcome};
