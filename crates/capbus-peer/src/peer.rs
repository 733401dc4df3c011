//! Peers and the peer registry.
//!
//! A peer owns a single mutex guarding its queue and pool, an atomic
//! dropped counter, a wake signal, and its handle table. No operation in
//! the bus ever holds two peer mutexes at once.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::debug;

use capbus_types::{
    Credentials, PeerId, Pid, PidNamespace, SenderIdentity, UserNamespace,
};

use crate::active::Active;
use crate::handle::HandleTable;
use crate::pool::{Pool, PoolConfig};
use crate::queue::Queue;

/// Registration-time description of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerConfig {
    pub cred: Credentials,
    pub pid: Pid,
    pub tid: Pid,
    pub user_ns: UserNamespace,
    pub pid_ns: PidNamespace,
    pub pool: PoolConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            cred: Credentials::default(),
            pid: Pid(1),
            tid: Pid(1),
            user_ns: UserNamespace::default(),
            pid_ns: PidNamespace::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// The state guarded by the peer's single mutex.
#[derive(Debug)]
pub struct PeerLocked {
    pub queue: Queue,
    pub pool: Pool,
}

/// Wake signalling for one peer: a counter tests can observe plus a
/// condvar receivers can block on.
#[derive(Debug, Default)]
pub struct Waker {
    count: Mutex<u64>,
    cond: Condvar,
}

impl Waker {
    pub fn wake(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_all();
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        *self.count.lock()
    }

    /// Block until the wake count passes `seen`, returning the new count.
    pub fn wait_past(&self, seen: u64) -> u64 {
        let mut count = self.count.lock();
        while *count <= seen {
            self.cond.wait(&mut count);
        }
        *count
    }
}

/// Per-peer state reachable from a pinned peer reference.
#[derive(Debug)]
pub struct PeerInfo {
    cred: Credentials,
    pid: Pid,
    tid: Pid,
    user_ns: UserNamespace,
    pid_ns: PidNamespace,
    pub handles: HandleTable,
    locked: Mutex<PeerLocked>,
    n_dropped: AtomicU64,
    waker: Waker,
}

impl PeerInfo {
    fn new(peer: PeerId, config: &PeerConfig) -> Self {
        Self {
            cred: config.cred,
            pid: config.pid,
            tid: config.tid,
            user_ns: config.user_ns,
            pid_ns: config.pid_ns,
            handles: HandleTable::new(peer),
            locked: Mutex::new(PeerLocked {
                queue: Queue::new(),
                pool: Pool::new(config.pool),
            }),
            n_dropped: AtomicU64::new(0),
            waker: Waker::default(),
        }
    }

    /// Take the peer's mutex.
    pub fn lock(&self) -> MutexGuard<'_, PeerLocked> {
        self.locked.lock()
    }

    #[must_use]
    pub fn cred(&self) -> Credentials {
        self.cred
    }

    #[must_use]
    pub fn user_ns(&self) -> UserNamespace {
        self.user_ns
    }

    #[must_use]
    pub fn pid_ns(&self) -> PidNamespace {
        self.pid_ns
    }

    /// Snapshot this peer's identity as a message sender.
    #[must_use]
    pub fn sender_identity(&self) -> SenderIdentity {
        SenderIdentity {
            cred: self.cred,
            pid: self.pid,
            tid: self.tid,
            user_ns: self.user_ns,
            pid_ns: self.pid_ns,
        }
    }

    /// Wake the peer.
    pub fn wake(&self) {
        self.waker.wake()
    }

    /// Record a dropped message. The peer is woken once, on the 0 → 1
    /// transition.
    pub fn note_dropped(&self) -> bool {
        if self.n_dropped.fetch_add(1, Ordering::AcqRel) == 0 {
            self.wake();
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.n_dropped.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn wake_count(&self) -> u64 {
        self.waker.count()
    }

    #[must_use]
    pub fn waker(&self) -> &Waker {
        &self.waker
    }

    /// Reset the queue, releasing every resource the flushed deliveries
    /// owned. Staged nodes vanish; their senders observe the removal at
    /// commit time and count a drop.
    pub fn reset(&self) {
        let flushed = {
            let mut locked = self.lock();
            let deliveries = locked.queue.flush();
            let count = deliveries.len();
            for delivery in deliveries {
                locked.pool.deallocate(delivery.slice);
                // Files and inflight handles release on drop.
            }
            count
        };
        debug!(flushed, "queue reset");
    }
}

/// An endpoint on the bus.
pub struct Peer {
    id: PeerId,
    active: Active,
    info: PeerInfo,
}

impl Peer {
    fn new(id: PeerId, config: &PeerConfig) -> Arc<Self> {
        Arc::new(Self {
            id,
            active: Active::new(),
            info: PeerInfo::new(id, config),
        })
    }

    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Dereference to the peer's state. Callers hold either an active
    /// reference or the registry's own pin.
    #[must_use]
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// Acquire a shared active reference, pinning the peer against
    /// teardown. Fails once teardown has begun.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> Option<PeerHandle> {
        if self.active.try_acquire() {
            Some(PeerHandle {
                peer: Arc::clone(self),
            })
        } else {
            None
        }
    }

    /// Outstanding active references.
    #[must_use]
    pub fn active_holders(&self) -> u64 {
        self.active.holders()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("active_holders", &self.active.holders())
            .finish()
    }
}

/// A pinned peer reference: holds one shared active reference for its
/// lifetime, blocking peer teardown.
pub struct PeerHandle {
    peer: Arc<Peer>,
}

impl PeerHandle {
    #[must_use]
    pub fn peer_arc(&self) -> &Arc<Peer> {
        &self.peer
    }
}

impl Deref for PeerHandle {
    type Target = Peer;

    fn deref(&self) -> &Peer {
        &self.peer
    }
}

impl Clone for PeerHandle {
    fn clone(&self) -> Self {
        self.peer.active.acquire_existing();
        Self {
            peer: Arc::clone(&self.peer),
        }
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.peer.active.release();
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle").field("id", &self.peer.id).finish()
    }
}

/// Issues peer references and owns teardown.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    next_peer: AtomicU64,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
        }
    }

    /// Register a new peer.
    pub fn create_peer(&self, config: PeerConfig) -> Arc<Peer> {
        let raw = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let id = PeerId::new(raw).expect("peer counter starts at 1");
        let peer = Peer::new(id, &config);
        self.peers.write().insert(id, Arc::clone(&peer));
        debug!(%id, "peer registered");
        peer
    }

    #[must_use]
    pub fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(&id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Tear a peer down: unregister it, block until every active reference
    /// drops, then reset its queue. Returns false if the peer was unknown.
    pub fn remove(&self, id: PeerId) -> bool {
        let Some(peer) = self.peers.write().remove(&id) else {
            return false;
        };
        peer.active.drain();
        peer.info.reset();
        debug!(%id, "peer removed");
        true
    }
}
