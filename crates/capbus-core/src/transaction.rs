//! The message transaction: import, per-destination instantiation, and the
//! two-phase staged commit.
//!
//! A transaction is task-local scratch state for one logical send. It pins
//! the sender, snapshots the sender's identity once, imports the payload
//! (byte vectors, handle transfer set, file references), then instantiates
//! one message per destination. Committing stages every instance on its
//! destination queue, synchronises all the clocks past the final commit
//! timestamp, and only then promotes the staged nodes, so no peer can
//! observe this message out of causal order even through side channels.
//!
//! Every path out of a transaction releases exactly what it still owns:
//! commit drains the entry list, and drop tears down whatever remains.

use std::marker::PhantomData;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use capbus_error::{BusError, Result};
use capbus_peer::{
    Delivery, FileRef, FileTable, HandleDest, InflightSet, Peer, PeerHandle, PeerRegistry,
    TransferSet,
};
use capbus_types::{
    HandleId, IoVec, SendFlags, SendParams, SenderIdentity, Timestamp, UserAddr, UserMemory,
    FD_MAX, VEC_MAX,
};

use crate::message::Message;

/// A single logical send in flight.
///
/// Not shareable across threads: the identity snapshot belongs to the
/// constructing task, and the entry list is scratch state for one call
/// chain.
pub struct Transaction<'a> {
    sender: PeerHandle,
    registry: &'a PeerRegistry,
    mem: &'a dyn UserMemory,
    params: SendParams,
    identity: SenderIdentity,
    vecs: SmallVec<[IoVec; 8]>,
    length_vecs: u64,
    files: SmallVec<[FileRef; 4]>,
    handles: TransferSet,
    entries: Vec<Message>,
    _task_local: PhantomData<*mut ()>,
}

impl<'a> Transaction<'a> {
    /// Construct a transaction from user input.
    ///
    /// Validates the parameters, pins the sender, snapshots its identity,
    /// and imports byte vectors, the handle transfer set, and file
    /// references, in that order. Any failure releases everything imported
    /// so far and leaves no destination touched.
    pub fn new(
        sender: &Arc<Peer>,
        registry: &'a PeerRegistry,
        files: &'a FileTable,
        mem: &'a dyn UserMemory,
        params: SendParams,
    ) -> Result<Self> {
        let unknown = params.flags.unknown_bits();
        if unknown != 0 {
            return Err(BusError::UnknownFlags { flags: unknown });
        }
        if params.n_vecs > VEC_MAX {
            return Err(BusError::TooManyVectors {
                count: params.n_vecs,
                max: VEC_MAX,
            });
        }
        if params.n_fds > FD_MAX {
            return Err(BusError::TooManyFiles {
                count: params.n_fds,
                max: FD_MAX,
            });
        }

        eprintln!("DEBUG Transaction::new start");
        let pinned = sender.acquire().ok_or(BusError::PeerUnreachable)?;
        eprintln!("DEBUG acquired sender");
        let identity = sender.info().sender_identity();

        // Byte vectors: validate and sum before anything touches a peer.
        let mut vecs: SmallVec<[IoVec; 8]> = SmallVec::new();
        let mut length_vecs: u64 = 0;
        for (index, vec) in mem
            .read_iovec_array(params.ptr_vecs, params.n_vecs)?
            .into_iter()
            .enumerate()
        {
            if vec.len > 0 && vec.base.is_null() {
                return Err(BusError::InvalidVector { index });
            }
            length_vecs = length_vecs
                .checked_add(vec.len)
                .ok_or(BusError::LengthOverflow)?;
            vecs.push(vec);
        }

        // Handle transfer set: frozen from here until commit.
        let ids: Vec<HandleId> = mem
            .read_u64_array(params.ptr_handles, params.n_handles)?
            .into_iter()
            .map(HandleId::new)
            .collect();
        eprintln!("DEBUG before TransferSet::import");
        let handles = TransferSet::import(sender, &ids)?;
        eprintln!("DEBUG after TransferSet::import");

        // File references: all-or-nothing, partial imports released on the
        // error path by dropping what was collected.
        let mut imported: SmallVec<[FileRef; 4]> = SmallVec::new();
        for fd in mem.read_fd_array(params.ptr_fds, params.n_fds)? {
            imported.push(files.import_fd(fd)?);
        }

        trace!(
            sender = %sender.id(),
            n_vecs = params.n_vecs,
            n_handles = params.n_handles,
            n_fds = params.n_fds,
            length_vecs,
            "transaction imported"
        );

        eprintln!("DEBUG Transaction::new returning");
        Ok(Self {
            sender: pinned,
            registry,
            mem,
            params,
            identity,
            vecs,
            length_vecs,
            files: imported,
            handles,
            entries: Vec::new(),
            _task_local: PhantomData,
        })
    }

    /// Total payload length in bytes.
    #[must_use]
    pub fn length_vecs(&self) -> u64 {
        self.length_vecs
    }

    /// Instantiated destinations awaiting commit.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Resolve the destination handle id in the user slot at `slot`,
    /// instantiate the message for it, and append the instance to the
    /// transaction. Every intended destination must be linked before
    /// [`commit`](Self::commit).
    pub fn link(&mut self, slot: UserAddr) -> Result<()> {
        eprintln!("DEBUG link start");
        let dest = HandleDest::import(self.sender.peer_arc(), self.registry, slot, self.mem)?;
        eprintln!("DEBUG link dest imported");
        let message = self.instantiate(dest)?;
        eprintln!("DEBUG link instantiated");
        self.entries.push(message);
        eprintln!("DEBUG link done");
        Ok(())
    }

    /// Like [`link`](Self::link), but without a write-back slot
    /// (broadcast-without-reply).
    pub fn link_id(&mut self, id: HandleId) -> Result<()> {
        let dest = HandleDest::import_id(self.sender.peer_arc(), self.registry, id)?;
        let message = self.instantiate(dest)?;
        self.entries.push(message);
        Ok(())
    }

    /// Build one message instance for `dest`: allocate the payload slice in
    /// the destination's pool, copy the sender's vectors into it, record
    /// the translated sender identity, translate the handle transfer set,
    /// and duplicate the file references.
    ///
    /// A pool refusal under `CONTINUE` yields an instance with *no* slice;
    /// it surfaces as a dropped event at commit instead of failing the
    /// transaction, and carries no payload, handles, or files.
    fn instantiate(&self, dest: HandleDest) -> Result<Message> {
        let continue_on_target = self.params.flags.contains(SendFlags::CONTINUE);
        let silent = self.params.flags.contains(SendFlags::SILENT);
        let mut message = Message::new(dest, silent);

        let info = message.dest.peer().info();
        let header = self.identity.translate_to(info.user_ns(), info.pid_ns());
        let size =
            usize::try_from(self.length_vecs).map_err(|_| BusError::OutOfMemory)?;

        eprintln!("DEBUG instantiate before lock");
        {
            let mut locked = info.lock();
            eprintln!("DEBUG instantiate locked");
            let slice = match locked.pool.allocate(size) {
                Ok(slice) => slice,
                Err(err) if continue_on_target && err.is_target_error() => {
                    debug!(
                        dest = %message.dest.peer().id(),
                        "pool refused slice, keeping sliceless instance"
                    );
                    drop(locked);
                    return Ok(message);
                }
                Err(BusError::PoolExhausted { .. }) => {
                    return Err(BusError::PeerUnreachable);
                }
                Err(err) => return Err(err),
            };
            if let Err(err) =
                locked
                    .pool
                    .write_vectors(slice, 0, &self.vecs, self.length_vecs, self.mem)
            {
                locked.pool.deallocate(slice);
                return Err(err);
            }
            locked.pool.header_mut(slice).identity = header;
            message.slice = Some(slice);
        }

        eprintln!("DEBUG instantiate before inflight");
        message.handles = Some(InflightSet::instantiate(
            message.dest.peer().peer_arc(),
            &self.handles,
        ));
        eprintln!("DEBUG instantiate after inflight");
        message.files = self.files.iter().cloned().collect();
        Ok(message)
    }

    /// Commit every linked instance atomically with respect to the global
    /// causal order.
    ///
    /// Phase 0 reserves a tick on the sender's clock. Phase 1 stages each
    /// instance on its destination queue at `t - 1` under a fresh local
    /// tick, raising the running timestamp to the maximum tick taken.
    /// Phase 2 synchronises every destination clock forward to that final
    /// timestamp, closing the window in which a side-channel message could
    /// carry a smaller timestamp than the imminent commit. Phase 3 exports
    /// the destination-local handle id, writes it back, and promotes each
    /// staged node to the shared final timestamp.
    ///
    /// A failed user-space write-back is remembered and returned at the
    /// end; it never stops the remaining destinations. A node unlinked by
    /// its destination in the meantime is silently dropped and counted on
    /// that destination's dropped counter.
    pub fn commit(&mut self) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let list = std::mem::take(&mut self.entries);

        // Phase 0: reserve the sender timestamp.
        let mut ts = self.sender.info().lock().queue.tick();

        // Phase 1: sync each destination clock up, tick it, and stage.
        for message in &list {
            let info = message.dest.peer().info();
            let mut locked = info.lock();
            locked.queue.sync(ts);
            ts = locked.queue.tick();
            let woke =
                locked
                    .queue
                    .stage(message.seq, self.sender.id(), message.silent, ts.staging_slot());
            if woke {
                info.wake();
            }
        }
        let t_final = ts;
        debug!(
            sender = %self.sender.id(),
            destinations = list.len(),
            t_final = t_final.get(),
            "staged on all destinations"
        );

        // The sender's own clock moves past the commit timestamp too, so a
        // later message from this sender can never be ordered below this
        // one anywhere.
        self.sender.info().lock().queue.sync(t_final);

        // Phase 2: close the side-channel window before the first commit.
        for message in &list {
            message.dest.peer().info().lock().queue.sync(t_final);
        }

        // Phase 3: final commit per destination.
        let mut fault: Option<UserAddr> = None;
        for message in list {
            if let Some(addr) = self.consume(message, Some(t_final)) {
                fault = Some(addr);
            }
        }
        match fault {
            Some(addr) => Err(BusError::fault(addr)),
            None => Ok(()),
        }
    }

    /// Unicast fast path: instantiate for the destination id in `slot` and
    /// commit immediately under the destination's own fresh tick. With a
    /// single destination there is no pre-reserved sender timestamp to
    /// agree on; ordering is the multi-destination protocol with one entry.
    pub fn commit_for_id(&mut self, slot: UserAddr) -> Result<()> {
        let dest = HandleDest::import(self.sender.peer_arc(), self.registry, slot, self.mem)?;
        let message = self.instantiate(dest)?;
        match self.consume(message, None) {
            Some(addr) => Err(BusError::fault(addr)),
            None => Ok(()),
        }
    }

    /// Final per-destination commit step. `t_final` is the shared commit
    /// timestamp from the multi-destination protocol, or `None` on the
    /// unicast path, which takes the destination's own tick here.
    ///
    /// Returns the faulting write-back address, if any; every other
    /// outcome, including a node unlinked by a destination reset or a
    /// destroyed target node, resolves to a silent per-destination drop.
    fn consume(&self, message: Message, t_final: Option<Timestamp>) -> Option<UserAddr> {
        let staged = t_final.is_some();
        let Message {
            dest,
            seq,
            silent,
            slice,
            mut handles,
            files,
        } = message;

        // Install the inflight references before taking the destination
        // lock; a dropped instance releases them again below.
        if let Some(set) = handles.as_mut() {
            set.install();
        }

        let info = dest.peer().info();
        let mut faulted: Option<UserAddr> = None;
        let mut id = HandleId::INVALID;

        let mut locked = info.lock();
        // Unicast takes the destination's own fresh tick: with one
        // destination there is no shared timestamp to agree on.
        let ts = match t_final {
            Some(ts) => ts,
            None => locked.queue.tick(),
        };

        if slice.is_none() {
            // Pool refusal under CONTINUE: tell the caller there is no
            // destination id, and notify the target of the drop.
            if let Some(idp) = dest.idp() {
                if self.mem.write_u64(idp, HandleId::INVALID.get()).is_err() {
                    faulted = Some(idp);
                }
            }
            info.note_dropped();
        } else if !staged || locked.queue.node_is_queued(seq) {
            id = dest.export(ts);
            if let Some(idp) = dest.idp() {
                if self.mem.write_u64(idp, id.get()).is_err() {
                    faulted = Some(idp);
                }
            }
        }

        if id.is_valid() {
            let slice = slice.expect("exported id implies a payload slice");
            locked.pool.header_mut(slice).destination = id;
            let woke = locked.queue.commit(
                seq,
                self.sender.id(),
                silent,
                ts,
                Delivery {
                    slice,
                    files,
                    handles,
                },
            );
            if woke {
                info.wake();
            }
            trace!(dest = %dest.peer().id(), ts = ts.get(), "message committed");
        } else {
            // The node was unlinked by the destination, the target node
            // died, or the instance never had a slice. Drop the instance;
            // a lost payload is surfaced on the destination's dropped
            // counter, never as a commit error.
            let outcome = locked.queue.remove(seq);
            if outcome.newly_ready {
                info.wake();
            }
            if let Some(slice) = slice {
                locked.pool.deallocate(slice);
                info.note_dropped();
                debug!(dest = %dest.peer().id(), "message dropped at commit");
            }
            if let Some(mut set) = handles {
                set.release();
            }
            drop(files);
        }
        drop(locked);
        // Sender forward-progress: on the unicast path the commit
        // timestamp came from the destination, so raise the sender's clock
        // to it after the destination lock is gone.
        if !staged {
            self.sender.info().lock().queue.sync(ts);
        }
        drop(dest);
        faulted
    }

    fn rollback(&mut self) {
        eprintln!("DEBUG rollback start, entries={}", self.entries.len());
        for message in self.entries.drain(..) {
            eprintln!("DEBUG rollback loop iter");
            let Message {
                dest,
                seq,
                slice,
                handles,
                files,
                ..
            } = message;
            let info = dest.peer().info();
            eprintln!("DEBUG before lock");
            {
                let mut locked = info.lock();
                eprintln!("DEBUG locked");
                let outcome = locked.queue.remove(seq);
                if outcome.newly_ready {
                    info.wake();
                }
                if let Some(slice) = slice {
                    locked.pool.deallocate(slice);
                }
            }
            eprintln!("DEBUG after unlock, releasing handles");
            if let Some(mut set) = handles {
                set.release();
            }
            eprintln!("DEBUG released handles");
            drop(files);
            eprintln!("DEBUG dropped files");
            drop(dest);
            eprintln!("DEBUG dropped dest");
        }
        eprintln!("DEBUG rollback end");
        // Unconsumed file holders and the transfer set release with the
        // transaction's own fields.
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.rollback();
    }
}

#[cfg(test)]
mod tests {
    use capbus_peer::{PeerConfig, PoolConfig};
    use capbus_types::{HeapUserMemory, NodeId};

    use super::*;

    struct Fixture {
        registry: PeerRegistry,
        files: FileTable,
        mem: HeapUserMemory,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: PeerRegistry::new(),
                files: FileTable::new(),
                mem: HeapUserMemory::new(),
            }
        }

        fn peer(&self, pool_capacity: usize) -> Arc<Peer> {
            self.registry.create_peer(PeerConfig {
                pool: PoolConfig {
                    capacity: pool_capacity,
                },
                ..PeerConfig::default()
            })
        }

        /// Anchor a node at `dest` and grant `sender` a handle to it.
        fn route(&self, sender: &Arc<Peer>, dest: &Arc<Peer>) -> HandleId {
            let node_id = NodeId::new(dest.id().get() * 1000 + 1).expect("nonzero");
            let (node, _anchor) = dest.info().handles.create_anchor(node_id);
            sender.info().handles.grant(&node)
        }

        fn payload_params(&self, payload: &[u8]) -> SendParams {
            let base = self.mem.push_bytes(payload);
            let vecs = [IoVec::new(base, payload.len() as u64)];
            SendParams {
                ptr_vecs: self.mem.push_iovec_array(&vecs),
                n_vecs: 1,
                ..SendParams::default()
            }
        }
    }

    #[test]
    fn empty_transaction_commits_without_destinations() {
        let fx = Fixture::new();
        let sender = fx.peer(1 << 16);
        let params = SendParams::default();

        let mut tx =
            Transaction::new(&sender, &fx.registry, &fx.files, &fx.mem, params).expect("valid");
        assert_eq!(tx.pending(), 0);
        tx.commit().expect("empty commit is a no-op");
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let fx = Fixture::new();
        let sender = fx.peer(1 << 16);
        let params = SendParams {
            flags: SendFlags::from_raw(1 << 9),
            ..SendParams::default()
        };
        let err = Transaction::new(&sender, &fx.registry, &fx.files, &fx.mem, params)
            .err()
            .expect("unknown flags");
        assert_eq!(err, BusError::UnknownFlags { flags: 1 << 9 });
    }

    #[test]
    fn vector_count_limit_is_enforced() {
        let fx = Fixture::new();
        let sender = fx.peer(1 << 16);
        let params = SendParams {
            n_vecs: VEC_MAX + 1,
            ..SendParams::default()
        };
        let err = Transaction::new(&sender, &fx.registry, &fx.files, &fx.mem, params)
            .err()
            .expect("over limit");
        assert_eq!(
            err,
            BusError::TooManyVectors {
                count: VEC_MAX + 1,
                max: VEC_MAX
            }
        );
    }

    #[test]
    fn vector_length_overflow_is_rejected() {
        let fx = Fixture::new();
        let sender = fx.peer(1 << 16);
        let base = fx.mem.push_bytes(&[0]);
        let vecs = [IoVec::new(base, u64::MAX), IoVec::new(base, 2)];
        let params = SendParams {
            ptr_vecs: fx.mem.push_iovec_array(&vecs),
            n_vecs: 2,
            ..SendParams::default()
        };
        let err = Transaction::new(&sender, &fx.registry, &fx.files, &fx.mem, params)
            .err()
            .expect("overflow");
        assert_eq!(err, BusError::LengthOverflow);
    }

    #[test]
    fn failed_import_releases_partial_file_refs() {
        let fx = Fixture::new();
        let sender = fx.peer(1 << 16);
        fx.files.install(3);
        // fd 4 unknown: import fails after fd 3 was acquired.
        let params = SendParams {
            ptr_fds: fx.mem.push_fd_array(&[3, 4]),
            n_fds: 2,
            ..SendParams::default()
        };
        let err = Transaction::new(&sender, &fx.registry, &fx.files, &fx.mem, params)
            .err()
            .expect("fd 4 unknown");
        assert_eq!(err, BusError::BadFileDescriptor { fd: 4 });
        assert_eq!(fx.files.live_refs(), 0);
    }

    #[test]
    fn rollback_of_linked_transaction_releases_everything() {
        let fx = Fixture::new();
        let sender = fx.peer(1 << 16);
        let dest = fx.peer(1 << 16);
        let handle = fx.route(&sender, &dest);

        let params = fx.payload_params(b"abandoned");
        {
            let mut tx = Transaction::new(&sender, &fx.registry, &fx.files, &fx.mem, params)
                .expect("valid");
            let slot = fx.mem.push_u64(handle.get());
            tx.link(slot).expect("linked");
            assert_eq!(tx.pending(), 1);
            assert_eq!(dest.info().lock().pool.slices_in_use(), 1);
            // Dropped without commit.
        }
        let info = dest.info();
        assert_eq!(info.lock().pool.slices_in_use(), 0);
        assert!(info.lock().queue.is_empty());
        assert_eq!(info.dropped(), 0);
        assert_eq!(dest.active_holders(), 0);
    }

    #[test]
    fn sender_pin_blocks_teardown_until_release() {
        let fx = Fixture::new();
        let sender = fx.peer(1 << 16);
        let params = SendParams::default();
        let tx = Transaction::new(&sender, &fx.registry, &fx.files, &fx.mem, params)
            .expect("valid");
        assert_eq!(sender.active_holders(), 1);
        drop(tx);
        assert_eq!(sender.active_holders(), 0);
    }
}
