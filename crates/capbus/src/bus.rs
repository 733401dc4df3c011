//! Bus facade.
//!
//! Owns the peer registry, the file table, and the node id allocator, and
//! drives the construct → link → commit sequence for callers that hand in
//! raw send parameters. The transaction core underneath is usable without
//! this facade; the facade is where the `CONTINUE` skip policy for
//! unresolvable destinations lives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use capbus_core::Transaction;
use capbus_error::{BusError, Result};
use capbus_peer::{
    FileRef, FileTable, Node, Peer, PeerConfig, PeerRegistry, SliceHeader,
};
use capbus_types::{
    HandleId, NodeId, PeerId, SendFlags, SendParams, Timestamp, UserMemory,
};

/// One bus: a registry of peers plus the shared file table.
#[derive(Debug)]
pub struct Bus {
    registry: PeerRegistry,
    files: FileTable,
    next_node: AtomicU64,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// A message as dequeued by a receiving peer: payload copied out of the
/// pool, slice released, attachments and transferred handles handed over.
#[derive(Debug)]
pub struct Received {
    pub timestamp: Timestamp,
    pub sender: PeerId,
    pub payload: Vec<u8>,
    pub header: SliceHeader,
    pub files: Vec<FileRef>,
    pub handles: Vec<HandleId>,
}

impl Bus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: PeerRegistry::new(),
            files: FileTable::new(),
            next_node: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    #[must_use]
    pub fn files(&self) -> &FileTable {
        &self.files
    }

    /// Register a new peer.
    pub fn create_peer(&self, config: PeerConfig) -> Arc<Peer> {
        self.registry.create_peer(config)
    }

    /// Tear a peer down, blocking until its active references drop.
    pub fn remove_peer(&self, id: PeerId) -> bool {
        self.registry.remove(id)
    }

    /// Create a node anchored at `owner`, returning it together with the
    /// owner's handle.
    pub fn create_node(&self, owner: &Arc<Peer>) -> (Arc<Node>, HandleId) {
        let raw = self.next_node.fetch_add(1, Ordering::Relaxed);
        let id = NodeId::new(raw).expect("node counter starts at 1");
        owner.info().handles.create_anchor(id)
    }

    /// Grant `to` a handle referencing `node`.
    pub fn grant(&self, to: &Arc<Peer>, node: &Arc<Node>) -> HandleId {
        to.info().handles.grant(node)
    }

    /// Begin a transaction for `sender` without driving it; the caller
    /// links destinations and commits.
    pub fn begin<'a>(
        &'a self,
        sender: &Arc<Peer>,
        mem: &'a dyn UserMemory,
        params: SendParams,
    ) -> Result<Transaction<'a>> {
        Transaction::new(sender, &self.registry, &self.files, mem, params)
    }

    /// Full send: construct, link every destination in
    /// `params.ptr_destinations`, and commit. A single destination takes
    /// the unicast fast path.
    ///
    /// Under `CONTINUE`, a destination that fails to resolve is skipped
    /// (there is no peer to notify of a drop); pool refusals are degraded
    /// inside the transaction and surface as dropped events.
    pub fn send(
        &self,
        sender: &Arc<Peer>,
        mem: &dyn UserMemory,
        params: SendParams,
    ) -> Result<()> {
        let mut tx = self.begin(sender, mem, params)?;
        let continue_on_target = params.flags.contains(SendFlags::CONTINUE);

        if params.n_destinations == 1 {
            let slot = params
                .destination_slot(0)
                .ok_or(BusError::fault(params.ptr_destinations))?;
            return match tx.commit_for_id(slot) {
                Err(err) if continue_on_target && err.is_target_error() => {
                    debug!(%err, "unicast destination skipped");
                    Ok(())
                }
                other => other,
            };
        }

        for index in 0..params.n_destinations {
            let slot = params
                .destination_slot(index)
                .ok_or(BusError::fault(params.ptr_destinations))?;
            match tx.link(slot) {
                Ok(()) => {}
                Err(err) if continue_on_target && err.is_target_error() => {
                    debug!(index, %err, "destination skipped");
                }
                Err(err) => return Err(err),
            }
        }
        tx.commit()
    }

    /// Dequeue the next ready message for `peer`, releasing its pool slice
    /// and handing over attachments and transferred handles.
    pub fn receive(&self, peer: &Arc<Peer>) -> Option<Received> {
        let info = peer.info();
        let mut locked = info.lock();
        let ready = locked.queue.pop_ready()?;
        let payload = locked
            .pool
            .read(ready.delivery.slice)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        let header = *locked
            .pool
            .header(ready.delivery.slice)
            .expect("delivered slice has a header");
        locked.pool.deallocate(ready.delivery.slice);
        drop(locked);

        let handles = ready
            .delivery
            .handles
            .map(capbus_peer::InflightSet::take_installed)
            .unwrap_or_default();
        Some(Received {
            timestamp: ready.timestamp,
            sender: ready.sender,
            payload,
            header,
            files: ready.delivery.files,
            handles,
        })
    }
}
