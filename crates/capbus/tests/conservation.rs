//! Resource conservation across transaction lifecycles.
//!
//! Across any `construct / link* / (commit | abandon)` sequence, pool
//! slices, inflight handle references, transfer reservations, and file
//! references return to their pre-transaction values on every failure
//! path, and delivery happens at most once per destination.

use std::sync::Arc;

use proptest::prelude::*;

use capbus::{
    Bus, BusError, HandleId, HeapUserMemory, IoVec, Peer, PeerConfig, PoolConfig, SendFlags,
    SendParams,
};

fn peer_with_pool(bus: &Bus, capacity: usize) -> Arc<Peer> {
    bus.create_peer(PeerConfig {
        pool: PoolConfig { capacity },
        ..PeerConfig::default()
    })
}

fn route(bus: &Bus, sender: &Arc<Peer>, dest: &Arc<Peer>) -> HandleId {
    let (node, _anchor) = bus.create_node(dest);
    bus.grant(sender, &node)
}

fn payload_params(mem: &HeapUserMemory, payload: &[u8]) -> SendParams {
    if payload.is_empty() {
        return SendParams::default();
    }
    let base = mem.push_bytes(payload);
    let vecs = [IoVec::new(base, payload.len() as u64)];
    SendParams {
        ptr_vecs: mem.push_iovec_array(&vecs),
        n_vecs: 1,
        ..SendParams::default()
    }
}

/// Gauges that must return to baseline on every non-delivering path.
#[derive(Debug, PartialEq, Eq)]
struct Gauges {
    slices: usize,
    inflight: usize,
    queue_len: usize,
}

fn gauges(peer: &Arc<Peer>) -> Gauges {
    let info = peer.info();
    Gauges {
        slices: info.lock().pool.slices_in_use(),
        inflight: info.handles.inflight_refs(),
        queue_len: info.lock().queue.len(),
    }
}

// ---------------------------------------------------------------------------
// Abandonment is observationally equivalent to never linking
// ---------------------------------------------------------------------------

#[test]
fn abandoned_transaction_restores_every_gauge() {
    let bus = Bus::new();
    let mem = HeapUserMemory::new();
    let sender = peer_with_pool(&bus, 1 << 16);
    let dest = peer_with_pool(&bus, 1 << 16);
    let handle = route(&bus, &sender, &dest);

    // Carry a handle and a file so every resource class participates.
    let (_node, carried) = bus.create_node(&sender);
    bus.files().install(7);

    let baseline = gauges(&dest);
    let transfer_baseline = sender.info().handles.transfer_refs();
    let files_baseline = bus.files().live_refs();

    {
        let mut params = payload_params(&mem, b"abandoned");
        params.ptr_handles = mem.push_u64_array(&[carried.get()]);
        params.n_handles = 1;
        params.ptr_fds = mem.push_fd_array(&[7]);
        params.n_fds = 1;

        let mut tx = bus.begin(&sender, &mem, params).expect("valid import");
        let slot = mem.push_u64(handle.get());
        tx.link(slot).expect("linked");

        assert_eq!(gauges(&dest).slices, 1, "slice held while linked");
        assert_eq!(dest.info().handles.inflight_refs(), 1);
        // Transaction dropped here: full rollback.
    }

    assert_eq!(gauges(&dest), baseline);
    assert_eq!(sender.info().handles.transfer_refs(), transfer_baseline);
    assert_eq!(bus.files().live_refs(), files_baseline);
    assert!(bus.receive(&dest).is_none(), "nothing was delivered");
    assert_eq!(dest.info().dropped(), 0, "no drop event from a rollback");
    assert_eq!(dest.active_holders(), 0, "destination unpinned");
}

// ---------------------------------------------------------------------------
// Mid-multicast failure rolls back the already-linked instances
// ---------------------------------------------------------------------------

#[test]
fn failed_link_after_successful_link_leaves_no_trace() {
    let bus = Bus::new();
    let mem = HeapUserMemory::new();
    let sender = peer_with_pool(&bus, 1 << 16);
    let healthy = peer_with_pool(&bus, 1 << 16);
    let doomed = peer_with_pool(&bus, 1 << 16);
    let h_healthy = route(&bus, &sender, &healthy);
    let (doomed_node, _) = bus.create_node(&doomed);
    let h_doomed = bus.grant(&sender, &doomed_node);
    doomed_node.destroy();

    let raw = [h_healthy.get(), h_doomed.get()];
    let params = SendParams {
        ptr_destinations: mem.push_u64_array(&raw),
        n_destinations: 2,
        ..payload_params(&mem, b"partial")
    };

    let err = bus.send(&sender, &mem, params).expect_err("doomed dest");
    assert_eq!(err, BusError::PeerUnreachable);

    assert!(bus.receive(&healthy).is_none(), "no partial delivery");
    assert_eq!(gauges(&healthy).slices, 0);
    assert_eq!(healthy.info().handles.inflight_refs(), 0);
    assert_eq!(healthy.active_holders(), 0);
}

// ---------------------------------------------------------------------------
// At-most-once delivery
// ---------------------------------------------------------------------------

#[test]
fn each_destination_sees_the_message_exactly_once() {
    let bus = Bus::new();
    let mem = HeapUserMemory::new();
    let sender = peer_with_pool(&bus, 1 << 16);
    let d1 = peer_with_pool(&bus, 1 << 16);
    let d2 = peer_with_pool(&bus, 1 << 16);
    let raw = [route(&bus, &sender, &d1).get(), route(&bus, &sender, &d2).get()];

    let params = SendParams {
        ptr_destinations: mem.push_u64_array(&raw),
        n_destinations: 2,
        ..payload_params(&mem, b"once")
    };
    bus.send(&sender, &mem, params).expect("delivers");

    for dest in [&d1, &d2] {
        let first = bus.receive(dest).expect("exactly one message");
        assert_eq!(first.payload, b"once");
        assert!(bus.receive(dest).is_none(), "never a second copy");
    }
}

// ---------------------------------------------------------------------------
// Delivered resources drain back to zero once consumed
// ---------------------------------------------------------------------------

#[test]
fn delivery_then_receive_returns_all_gauges_to_zero() {
    let bus = Bus::new();
    let mem = HeapUserMemory::new();
    let sender = peer_with_pool(&bus, 1 << 16);
    let dest = peer_with_pool(&bus, 1 << 16);
    let handle = route(&bus, &sender, &dest);
    bus.files().install(9);

    let mut params = payload_params(&mem, b"drain");
    params.ptr_fds = mem.push_fd_array(&[9]);
    params.n_fds = 1;
    params.ptr_destinations = mem.push_u64(handle.get());
    params.n_destinations = 1;
    bus.send(&sender, &mem, params).expect("delivers");

    assert_eq!(gauges(&dest).slices, 1, "payload parked in the pool");
    assert_eq!(bus.files().live_refs(), 1, "duplicate held by the delivery");

    let received = bus.receive(&dest).expect("delivered");
    assert_eq!(gauges(&dest).slices, 0, "receive releases the slice");
    drop(received);
    assert_eq!(bus.files().live_refs(), 0);
    assert_eq!(sender.info().handles.transfer_refs(), 0);
    assert_eq!(dest.info().handles.inflight_refs(), 0);
}

// ---------------------------------------------------------------------------
// Teardown of a peer with queued messages
// ---------------------------------------------------------------------------

#[test]
fn peer_removal_releases_parked_deliveries() {
    let bus = Bus::new();
    let mem = HeapUserMemory::new();
    let sender = peer_with_pool(&bus, 1 << 16);
    let dest = peer_with_pool(&bus, 1 << 16);
    let handle = route(&bus, &sender, &dest);
    bus.files().install(5);

    let mut params = payload_params(&mem, b"parked");
    params.ptr_fds = mem.push_fd_array(&[5]);
    params.n_fds = 1;
    params.ptr_destinations = mem.push_u64(handle.get());
    params.n_destinations = 1;
    bus.send(&sender, &mem, params).expect("delivers");
    assert_eq!(bus.files().live_refs(), 1);

    assert!(bus.remove_peer(dest.id()));
    assert_eq!(bus.files().live_refs(), 0, "teardown released the duplicate");
    assert_eq!(dest.info().lock().pool.slices_in_use(), 0);
}

// ---------------------------------------------------------------------------
// Property: random lifecycles conserve resources
// ---------------------------------------------------------------------------

proptest! {
    /// Whatever mix of committed, abandoned, and pool-refused sends runs,
    /// draining the queues afterwards leaves every gauge at zero.
    #[test]
    fn random_lifecycles_conserve_resources(
        actions in proptest::collection::vec(
            (any::<bool>(), 0_usize..96, any::<bool>()),
            1..12,
        ),
    ) {
        let bus = Bus::new();
        let mem = HeapUserMemory::new();
        let sender = peer_with_pool(&bus, 1 << 16);
        // Small pool: payloads above 64 bytes are refused.
        let dest = peer_with_pool(&bus, 64);
        let handle = route(&bus, &sender, &dest);

        for (commit, size, continue_flag) in actions {
            let payload = vec![0xa5_u8; size];
            let mut params = payload_params(&mem, &payload);
            if continue_flag {
                params.flags = SendFlags::CONTINUE;
            }
            let slot = mem.push_u64(handle.get());

            let mut tx = match bus.begin(&sender, &mem, params) {
                Ok(tx) => tx,
                Err(err) => {
                    prop_assert!(err.is_target_error(), "import never fails here: {err}");
                    continue;
                }
            };
            let linked = tx.link(slot);
            if let Err(err) = linked {
                prop_assert!(err.is_target_error(), "only pool refusals expected: {err}");
                continue;
            }
            if commit {
                tx.commit().expect("commit cannot fail here");
            }
            // Otherwise: dropped, rolling the instance back.
            drop(tx);

            // Drain anything delivered so pool occupancy returns to zero.
            while bus.receive(&dest).is_some() {}

            prop_assert_eq!(dest.info().lock().pool.slices_in_use(), 0);
            prop_assert_eq!(dest.info().handles.inflight_refs(), 0);
            prop_assert_eq!(sender.info().handles.transfer_refs(), 0);
            prop_assert_eq!(bus.files().live_refs(), 0);
            prop_assert_eq!(dest.active_holders(), 0);
        }
    }
}
