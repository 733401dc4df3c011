//! Per-peer ordering queue and logical clock.
//!
//! Every peer owns a 64-bit logical clock and a queue of message nodes
//! ordered by timestamp. Committed timestamps are even; a node staged at
//! `t - 1` (odd) blocks the queue at the slot it will commit into. Ties are
//! broken by `(sender, node seq)` with node seqs drawn from one bus-global
//! counter, so every queue resolves concurrent commits into the same total
//! order.
//!
//! All operations run under the owning peer's mutex; the queue itself holds
//! no lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use capbus_types::{PeerId, Timestamp};

use crate::file::FileRef;
use crate::handle::InflightSet;
use crate::pool::SliceId;

/// Bus-global sequence number identifying one message instance's queue node.
pub type MessageSeq = u64;

static NEXT_MESSAGE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh node sequence number.
#[must_use]
pub fn next_message_seq() -> MessageSeq {
    NEXT_MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// What a committed node hands to the receiving peer: the payload slice in
/// the receiver's own pool, the duplicated file references, and the
/// installed inflight handles.
#[derive(Debug)]
pub struct Delivery {
    pub slice: SliceId,
    pub files: Vec<FileRef>,
    pub handles: Option<InflightSet>,
}

/// A committed message popped off the queue front.
#[derive(Debug)]
pub struct ReadyMessage {
    pub timestamp: Timestamp,
    pub sender: PeerId,
    pub delivery: Delivery,
}

/// Outcome of removing a node.
#[derive(Debug, Default)]
pub struct RemoveOutcome {
    /// The node was actually linked on the queue.
    pub was_queued: bool,
    /// Removal made the queue head newly readable; the caller wakes the
    /// peer.
    pub newly_ready: bool,
    /// The delivery owned by the node, if it had been committed.
    pub delivery: Option<Delivery>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    ts: Timestamp,
    sender: PeerId,
    seq: MessageSeq,
}

#[derive(Debug)]
struct QueueEntry {
    silent: bool,
    delivery: Option<Delivery>,
}

/// Ordering queue plus logical clock for one peer.
#[derive(Debug, Default)]
pub struct Queue {
    clock: u64,
    order: BTreeMap<QueueKey, QueueEntry>,
    index: HashMap<MessageSeq, QueueKey>,
}

impl Queue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current clock value.
    #[must_use]
    pub fn clock(&self) -> Timestamp {
        Timestamp::new(self.clock)
    }

    /// Advance the clock by one event and return the new value.
    ///
    /// A tick always lands on an even (committed) timestamp; the odd slot
    /// below it is the paired staging slot.
    pub fn tick(&mut self) -> Timestamp {
        self.clock = (self.clock | 1) + 1;
        Timestamp::new(self.clock)
    }

    /// Raise the clock to at least `ts` and return the resulting value.
    pub fn sync(&mut self, ts: Timestamp) -> Timestamp {
        if ts.get() > self.clock {
            self.clock = ts.get();
        }
        Timestamp::new(self.clock)
    }

    /// Link `seq` as a staging entry at the odd timestamp `ts`.
    ///
    /// A staged node blocks readers at its slot until it is committed or
    /// removed. Returns whether the queue head became newly readable, which
    /// staging never causes; the uniform signature keeps call sites
    /// identical across stage/commit/remove.
    pub fn stage(&mut self, seq: MessageSeq, sender: PeerId, silent: bool, ts: Timestamp) -> bool {
        debug_assert!(ts.is_staging(), "staging requires an odd timestamp");
        debug_assert!(!self.index.contains_key(&seq), "node staged twice");
        let before = self.head_wakes();
        let key = QueueKey { ts, sender, seq };
        self.order.insert(
            key,
            QueueEntry {
                silent,
                delivery: None,
            },
        );
        self.index.insert(seq, key);
        trace!(seq, %sender, ts = ts.get(), "staged queue node");
        !before && self.head_wakes()
    }

    /// Commit `seq` at the even timestamp `ts`, attaching its delivery.
    ///
    /// Repositions a staged node, or links a fresh one (the unicast path
    /// never stages). Returns whether the head became newly readable.
    pub fn commit(
        &mut self,
        seq: MessageSeq,
        sender: PeerId,
        silent: bool,
        ts: Timestamp,
        delivery: Delivery,
    ) -> bool {
        debug_assert!(ts.is_committed(), "commit requires an even timestamp");
        let before = self.head_wakes();
        if let Some(old) = self.index.remove(&seq) {
            self.order.remove(&old);
        }
        let key = QueueKey { ts, sender, seq };
        self.order.insert(
            key,
            QueueEntry {
                silent,
                delivery: Some(delivery),
            },
        );
        self.index.insert(seq, key);
        trace!(seq, %sender, ts = ts.get(), "committed queue node");
        !before && self.head_wakes()
    }

    /// Unlink `seq` from the queue.
    pub fn remove(&mut self, seq: MessageSeq) -> RemoveOutcome {
        let Some(key) = self.index.remove(&seq) else {
            return RemoveOutcome::default();
        };
        let before = self.head_wakes();
        let entry = self.order.remove(&key).expect("indexed node in order map");
        RemoveOutcome {
            was_queued: true,
            newly_ready: !before && self.head_wakes(),
            delivery: entry.delivery,
        }
    }

    /// Whether `seq` is currently linked (staged or committed).
    #[must_use]
    pub fn node_is_queued(&self, seq: MessageSeq) -> bool {
        self.index.contains_key(&seq)
    }

    /// Timestamp of a linked node.
    #[must_use]
    pub fn node_timestamp(&self, seq: MessageSeq) -> Option<Timestamp> {
        self.index.get(&seq).map(|key| key.ts)
    }

    /// Dequeue the front entry if it is committed.
    ///
    /// A staged entry at the front blocks: later committed entries stay
    /// invisible until the stager either commits or removes it.
    pub fn pop_ready(&mut self) -> Option<ReadyMessage> {
        let (key, _) = self.order.iter().next()?;
        if key.ts.is_staging() {
            return None;
        }
        let key = *key;
        let entry = self.order.remove(&key).expect("front entry");
        self.index.remove(&key.seq);
        Some(ReadyMessage {
            timestamp: key.ts,
            sender: key.sender,
            delivery: entry.delivery.expect("committed entry owns a delivery"),
        })
    }

    /// Reset: unlink every node, returning the committed deliveries so the
    /// caller can release their resources. Staged nodes simply vanish; their
    /// owners discover the removal at commit time.
    pub fn flush(&mut self) -> Vec<Delivery> {
        self.index.clear();
        let order = std::mem::take(&mut self.order);
        order
            .into_values()
            .filter_map(|entry| entry.delivery)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Whether the current head would justify a wakeup: committed and not
    /// silent. A silent head defers the wake to the next queue transition.
    fn head_wakes(&self) -> bool {
        self.order
            .iter()
            .next()
            .is_some_and(|(key, entry)| key.ts.is_committed() && !entry.silent)
    }
}
