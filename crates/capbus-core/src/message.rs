//! Per-destination message instances.

use capbus_peer::{FileRef, HandleDest, InflightSet, MessageSeq, SliceId};

/// One instantiation of a transaction's message for a single destination.
///
/// Owns a payload slice in the *destination's* pool (absent when the pool
/// refused under a continue-on-target-error send), the not-yet-visible
/// inflight handle references, an independent set of file references, and a
/// queue node identified by `seq`. The destination binding is consumed from
/// the caller at link time and released when the instance is committed or
/// discarded.
#[derive(Debug)]
pub struct Message {
    pub(crate) dest: HandleDest,
    pub(crate) seq: MessageSeq,
    pub(crate) silent: bool,
    pub(crate) slice: Option<SliceId>,
    pub(crate) handles: Option<InflightSet>,
    pub(crate) files: Vec<FileRef>,
}

impl Message {
    pub(crate) fn new(dest: HandleDest, silent: bool) -> Self {
        Self {
            dest,
            seq: capbus_peer::next_message_seq(),
            silent,
            slice: None,
            handles: None,
            files: Vec::new(),
        }
    }

    /// Whether the destination pool accepted a payload slice. An instance
    /// without one is never committed; it surfaces as a dropped event.
    #[must_use]
    pub fn has_slice(&self) -> bool {
        self.slice.is_some()
    }

    #[must_use]
    pub fn seq(&self) -> MessageSeq {
        self.seq
    }

    #[must_use]
    pub fn is_silent(&self) -> bool {
        self.silent
    }
}
