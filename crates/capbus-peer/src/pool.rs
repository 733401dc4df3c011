//! Per-peer payload pool.
//!
//! Each peer owns an arena that message payload slices are allocated from
//! and sender data is copied into. The pool is guarded by the peer's single
//! mutex; refusal to allocate is the bus's only backpressure signal. Slot
//! handles are recycled through a free list, the same shape as a version
//! arena: occupancy gauges for the conservation checks, and a hard assert
//! on double-free.

use tracing::debug;

use capbus_error::{BusError, Result};
use capbus_types::{HandleId, IoVec, TranslatedIdentity, UserMemory};

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PoolConfig {
    /// Total payload bytes this peer accepts at once.
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 1 << 20,
        }
    }
}

/// Handle to a slice in one peer's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceId(u32);

/// Metadata recorded alongside a payload slice.
///
/// The identity fields are the sender's, translated into this peer's
/// namespaces; the destination id is stamped at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceHeader {
    pub identity: TranslatedIdentity,
    pub destination: HandleId,
}

impl Default for SliceHeader {
    fn default() -> Self {
        Self {
            identity: TranslatedIdentity::default(),
            destination: HandleId::INVALID,
        }
    }
}

#[derive(Debug)]
struct Slice {
    data: Vec<u8>,
    header: SliceHeader,
}

/// Payload arena for one peer.
#[derive(Debug)]
pub struct Pool {
    capacity: usize,
    bytes_in_use: usize,
    slots: Vec<Option<Slice>>,
    free: Vec<u32>,
    high_water: u64,
}

impl Pool {
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            capacity: config.capacity,
            bytes_in_use: 0,
            slots: Vec::new(),
            free: Vec::new(),
            high_water: 0,
        }
    }

    /// Allocate a slice of `size` bytes. Zero-sized slices are valid; an
    /// empty payload still carries a header.
    pub fn allocate(&mut self, size: usize) -> Result<SliceId> {
        let available = self.capacity - self.bytes_in_use;
        if size > available {
            debug!(requested = size, available, "pool refused slice");
            return Err(BusError::PoolExhausted {
                requested: size,
                available,
            });
        }
        self.bytes_in_use += size;
        self.high_water += 1;

        let slice = Slice {
            data: vec![0; size],
            header: SliceHeader::default(),
        };
        let index = if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(slice);
            index
        } else {
            let index =
                u32::try_from(self.slots.len()).map_err(|_| BusError::OutOfMemory)?;
            self.slots.push(Some(slice));
            index
        };
        Ok(SliceId(index))
    }

    /// Gather-copy the sender's byte vectors into the slice at `offset`.
    ///
    /// The slice was sized from the same vector sum, so only a user-memory
    /// fault can fail here.
    pub fn write_vectors(
        &mut self,
        id: SliceId,
        offset: usize,
        vecs: &[IoVec],
        total: u64,
        mem: &dyn UserMemory,
    ) -> Result<()> {
        let slice = self.slot_mut(id);
        let mut cursor = offset;
        debug_assert!(
            offset as u64 + total <= slice.data.len() as u64,
            "write_vectors out of bounds"
        );
        for vec in vecs {
            let len = vec.len as usize;
            mem.read_bytes(vec.base, &mut slice.data[cursor..cursor + len])?;
            cursor += len;
        }
        debug_assert_eq!(cursor as u64, offset as u64 + total);
        Ok(())
    }

    /// Payload bytes of a slice.
    #[must_use]
    pub fn read(&self, id: SliceId) -> Option<&[u8]> {
        self.slots
            .get(id.0 as usize)?
            .as_ref()
            .map(|s| s.data.as_slice())
    }

    #[must_use]
    pub fn header(&self, id: SliceId) -> Option<&SliceHeader> {
        self.slots.get(id.0 as usize)?.as_ref().map(|s| &s.header)
    }

    pub fn header_mut(&mut self, id: SliceId) -> &mut SliceHeader {
        &mut self.slot_mut(id).header
    }

    /// Return a slice to the pool.
    ///
    /// # Panics
    ///
    /// Asserts the slot is occupied (catches double-free).
    pub fn deallocate(&mut self, id: SliceId) {
        let slot = &mut self.slots[id.0 as usize];
        let slice = slot.take();
        assert!(slice.is_some(), "pool double-free of {id:?}");
        self.bytes_in_use -= slice.map_or(0, |s| s.data.len());
        self.free.push(id.0);
    }

    #[must_use]
    pub fn slices_in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total slices ever allocated (including freed).
    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    fn slot_mut(&mut self, id: SliceId) -> &mut Slice {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("stale slice id")
    }
}
