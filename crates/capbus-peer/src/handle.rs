//! Handle tables and the ownership transfer primitives.
//!
//! A node is a bus-global identity; a handle is one peer's opaque reference
//! to it. A transaction reserves the sender's handles in a *transfer set*,
//! translates that set into a per-destination *inflight set* when a message
//! instance is built, and installs the inflight references (making them
//! visible in the destination's table) at commit. The *destination binding*
//! pins the resolved target peer alive for the life of one message
//! instance.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use capbus_error::{BusError, Result};
use capbus_types::{HandleId, NodeId, PeerId, Timestamp, UserAddr, UserMemory};

use crate::peer::{Peer, PeerHandle, PeerRegistry};

/// The shared identity that handles in different peers refer to.
pub struct Node {
    id: NodeId,
    owner: PeerId,
    owner_handle: HandleId,
    destroyed: AtomicBool,
}

impl Node {
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The peer this node is anchored at; messages addressed to the node
    /// are delivered to this peer's queue.
    #[must_use]
    pub fn owner(&self) -> PeerId {
        self.owner
    }

    /// The owner's local handle id for this node.
    #[must_use]
    pub fn owner_handle(&self) -> HandleId {
        self.owner_handle
    }

    /// Mark the node destroyed. Transactions racing this observe the
    /// destination as unreachable (at instantiate) or as a silent drop (at
    /// commit).
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[derive(Debug)]
struct HandleEntry {
    node: Arc<Node>,
    user_refs: u64,
    exported_at: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct TableInner {
    by_handle: HashMap<HandleId, HandleEntry>,
    by_node: HashMap<NodeId, HandleId>,
    next_handle: u64,
    transfer_refs: usize,
    inflight_refs: usize,
}

/// One peer's handle table.
#[derive(Debug)]
pub struct HandleTable {
    peer: PeerId,
    inner: Mutex<TableInner>,
}

impl HandleTable {
    #[must_use]
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            inner: Mutex::new(TableInner {
                next_handle: 1,
                ..TableInner::default()
            }),
        }
    }

    /// Create a node anchored at this peer and publish its owner handle.
    pub fn create_anchor(&self, node_id: NodeId) -> (Arc<Node>, HandleId) {
        let mut inner = self.inner.lock();
        let handle = HandleId::new(inner.next_handle);
        inner.next_handle += 1;
        let node = Arc::new(Node {
            id: node_id,
            owner: self.peer,
            owner_handle: handle,
            destroyed: AtomicBool::new(false),
        });
        inner.by_handle.insert(
            handle,
            HandleEntry {
                node: Arc::clone(&node),
                user_refs: 1,
                exported_at: None,
            },
        );
        inner.by_node.insert(node_id, handle);
        (node, handle)
    }

    /// Give this peer a handle to `node`, creating or referencing the
    /// existing entry.
    pub fn grant(&self, node: &Arc<Node>) -> HandleId {
        let mut inner = self.inner.lock();
        Self::install_ref(&mut inner, node, None)
    }

    /// Resolve a handle id to its node.
    #[must_use]
    pub fn resolve(&self, id: HandleId) -> Option<Arc<Node>> {
        let inner = self.inner.lock();
        inner.by_handle.get(&id).map(|e| Arc::clone(&e.node))
    }

    /// Release one user reference on `id`, dropping the entry at zero.
    pub fn release_user_ref(&self, id: HandleId) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.by_handle.get_mut(&id) else {
            return;
        };
        debug_assert!(entry.user_refs > 0, "handle reference underflow");
        entry.user_refs -= 1;
        if entry.user_refs == 0 {
            let node_id = entry.node.id();
            inner.by_handle.remove(&id);
            inner.by_node.remove(&node_id);
        }
    }

    /// Export the destination-local id of `node`, allocating on first
    /// export. Returns [`HandleId::INVALID`] if the node was destroyed.
    pub fn export(&self, node: &Arc<Node>, ts: Timestamp) -> HandleId {
        if node.is_destroyed() {
            return HandleId::INVALID;
        }
        let mut inner = self.inner.lock();
        Self::install_ref(&mut inner, node, Some(ts))
    }

    /// User reference count for `id` (0 when absent).
    #[must_use]
    pub fn user_refs(&self, id: HandleId) -> u64 {
        self.inner
            .lock()
            .by_handle
            .get(&id)
            .map_or(0, |e| e.user_refs)
    }

    /// The timestamp at which `id` was first exported to this peer, if it
    /// arrived through a commit rather than a direct grant.
    #[must_use]
    pub fn exported_at(&self, id: HandleId) -> Option<Timestamp> {
        self.inner
            .lock()
            .by_handle
            .get(&id)
            .and_then(|e| e.exported_at)
    }

    /// Outstanding transfer-side reservations against this table.
    #[must_use]
    pub fn transfer_refs(&self) -> usize {
        self.inner.lock().transfer_refs
    }

    /// Inflight references instantiated against this table and not yet
    /// installed or released.
    #[must_use]
    pub fn inflight_refs(&self) -> usize {
        self.inner.lock().inflight_refs
    }

    /// Handles currently present in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().by_handle.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_handle.is_empty()
    }

    fn install_ref(
        inner: &mut TableInner,
        node: &Arc<Node>,
        exported_at: Option<Timestamp>,
    ) -> HandleId {
        if let Some(&handle) = inner.by_node.get(&node.id()) {
            let entry = inner
                .by_handle
                .get_mut(&handle)
                .expect("by_node entry backed by by_handle");
            entry.user_refs += 1;
            if entry.exported_at.is_none() {
                entry.exported_at = exported_at;
            }
            return handle;
        }
        let handle = HandleId::new(inner.next_handle);
        inner.next_handle += 1;
        inner.by_handle.insert(
            handle,
            HandleEntry {
                node: Arc::clone(node),
                user_refs: 1,
                exported_at,
            },
        );
        inner.by_node.insert(node.id(), handle);
        handle
    }

    fn adjust_transfer(&self, delta: isize) {
        let mut inner = self.inner.lock();
        inner.transfer_refs = inner
            .transfer_refs
            .checked_add_signed(delta)
            .expect("transfer gauge underflow");
    }

    fn adjust_inflight(&self, delta: isize) {
        let mut inner = self.inner.lock();
        inner.inflight_refs = inner
            .inflight_refs
            .checked_add_signed(delta)
            .expect("inflight gauge underflow");
    }
}

/// Sender-side reservation of the handles a transaction will carry.
///
/// Frozen between import and commit; released exactly once, either
/// explicitly or on drop.
pub struct TransferSet {
    sender: Arc<Peer>,
    nodes: Vec<Arc<Node>>,
    released: bool,
}

impl TransferSet {
    /// Resolve every id against the sender's handle table and reserve the
    /// referenced nodes. Any unresolvable id fails the whole import.
    pub fn import(sender: &Arc<Peer>, ids: &[HandleId]) -> Result<Self> {
        let table = &sender.info().handles;
        let mut nodes = Vec::with_capacity(ids.len());
        for &id in ids {
            let node = table
                .resolve(id)
                .ok_or(BusError::HandleNotFound { id })?;
            if node.is_destroyed() {
                return Err(BusError::HandleNotFound { id });
            }
            nodes.push(node);
        }
        table.adjust_transfer(isize::try_from(nodes.len()).expect("handle count fits isize"));
        Ok(Self {
            sender: Arc::clone(sender),
            nodes,
            released: false,
        })
    }

    #[must_use]
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Release the reservation.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.sender
            .info()
            .handles
            .adjust_transfer(-isize::try_from(self.nodes.len()).expect("handle count fits isize"));
        self.nodes.clear();
    }
}

impl Drop for TransferSet {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for TransferSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSet")
            .field("sender", &self.sender.id())
            .field("nodes", &self.nodes.len())
            .field("released", &self.released)
            .finish()
    }
}

#[derive(Debug)]
struct InflightEntry {
    node: Arc<Node>,
    assigned: Option<HandleId>,
}

/// Destination-side translation of a transfer set: per-destination handle
/// references that exist but are not visible until installed at commit.
pub struct InflightSet {
    dest: Arc<Peer>,
    entries: Vec<InflightEntry>,
    released: bool,
}

impl InflightSet {
    /// Translate `set` for `dest`. The references count against the
    /// destination's inflight gauge until installed or released.
    #[must_use]
    pub fn instantiate(dest: &Arc<Peer>, set: &TransferSet) -> Self {
        let entries: Vec<_> = set
            .nodes()
            .iter()
            .map(|node| InflightEntry {
                node: Arc::clone(node),
                assigned: None,
            })
            .collect();
        dest.info()
            .handles
            .adjust_inflight(isize::try_from(entries.len()).expect("handle count fits isize"));
        Self {
            dest: Arc::clone(dest),
            entries,
            released: false,
        }
    }

    /// Make the references visible in the destination's table, assigning
    /// destination-local ids. A destroyed node installs as
    /// [`HandleId::INVALID`].
    pub fn install(&mut self) {
        let table = &self.dest.info().handles;
        for entry in &mut self.entries {
            if entry.assigned.is_some() {
                continue;
            }
            let id = if entry.node.is_destroyed() {
                HandleId::INVALID
            } else {
                table.grant(&entry.node)
            };
            entry.assigned = Some(id);
            table.adjust_inflight(-1);
        }
    }

    /// The assigned destination-local ids, in transfer order. Empty until
    /// installed.
    #[must_use]
    pub fn assigned_ids(&self) -> Vec<HandleId> {
        self.entries
            .iter()
            .filter_map(|e| e.assigned)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hand the installed references over to the destination.
    ///
    /// The destination's table keeps the user references; the set is
    /// consumed without releasing them. This is the receive path: once a
    /// delivery is dequeued, the transferred handles belong to the peer.
    #[must_use]
    pub fn take_installed(mut self) -> Vec<HandleId> {
        debug_assert!(
            self.entries.iter().all(|e| e.assigned.is_some()),
            "take_installed before install"
        );
        self.released = true;
        self.entries.drain(..).filter_map(|e| e.assigned).collect()
    }

    /// Release every reference this set still owns: installed entries give
    /// back their user reference, uninstalled ones their inflight
    /// reservation.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let table = &self.dest.info().handles;
        for entry in self.entries.drain(..) {
            match entry.assigned {
                Some(id) if id.is_valid() => table.release_user_ref(id),
                Some(_) => {}
                None => table.adjust_inflight(-1),
            }
        }
    }
}

impl Drop for InflightSet {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for InflightSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InflightSet")
            .field("dest", &self.dest.id())
            .field("entries", &self.entries.len())
            .field("released", &self.released)
            .finish()
    }
}

/// A scoped binding from a caller-supplied handle id to a live destination
/// peer, plus the user-space slot the resolved destination id is written
/// back to.
///
/// The binding holds a shared active reference on the destination through
/// its [`PeerHandle`]; it is consumed into a message instance on successful
/// instantiation and dropped on failure or after commit.
pub struct HandleDest {
    node: Arc<Node>,
    peer: PeerHandle,
    idp: Option<UserAddr>,
}

impl HandleDest {
    /// Read the destination handle id from the user slot at `slot`,
    /// resolve it, and pin the owning peer. The same slot later receives
    /// the exported destination id.
    pub fn import(
        sender: &Arc<Peer>,
        registry: &PeerRegistry,
        slot: UserAddr,
        mem: &dyn UserMemory,
    ) -> Result<Self> {
        let id = HandleId::new(mem.read_u64(slot)?);
        let (node, peer) = Self::resolve(sender, registry, id)?;
        Ok(Self {
            node,
            peer,
            idp: Some(slot),
        })
    }

    /// Resolve a destination by id without a write-back slot
    /// (broadcast-without-reply).
    pub fn import_id(
        sender: &Arc<Peer>,
        registry: &PeerRegistry,
        id: HandleId,
    ) -> Result<Self> {
        let (node, peer) = Self::resolve(sender, registry, id)?;
        Ok(Self {
            node,
            peer,
            idp: None,
        })
    }

    fn resolve(
        sender: &Arc<Peer>,
        registry: &PeerRegistry,
        id: HandleId,
    ) -> Result<(Arc<Node>, PeerHandle)> {
        let node = sender
            .info()
            .handles
            .resolve(id)
            .ok_or(BusError::HandleNotFound { id })?;
        if node.is_destroyed() {
            debug!(%id, node = %node.id(), "destination node destroyed");
            return Err(BusError::PeerUnreachable);
        }
        let peer = registry
            .get(node.owner())
            .ok_or(BusError::PeerUnreachable)?;
        let peer = peer.acquire().ok_or(BusError::PeerUnreachable)?;
        Ok((node, peer))
    }

    /// The pinned destination peer.
    #[must_use]
    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    #[must_use]
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// The write-back slot, absent for broadcast-without-reply.
    #[must_use]
    pub fn idp(&self) -> Option<UserAddr> {
        self.idp
    }

    /// The destination-local id of the target node, allocated on first
    /// export. [`HandleId::INVALID`] if the node was destroyed in the
    /// meantime.
    #[must_use]
    pub fn export(&self, ts: Timestamp) -> HandleId {
        self.peer.info().handles.export(&self.node, ts)
    }
}

impl fmt::Debug for HandleDest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleDest")
            .field("node", &self.node.id())
            .field("peer", &self.peer.id())
            .field("idp", &self.idp)
            .finish()
    }
}
