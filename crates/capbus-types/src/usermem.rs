//! User-space memory abstraction.
//!
//! The transaction core never dereferences caller pointers directly; every
//! import and write-back goes through [`UserMemory`]. Embedders supply the
//! real accessor; [`HeapUserMemory`] is the in-memory implementation used by
//! tests, with explicit mapped windows so that access to an unmapped address
//! faults the same way a bad user pointer would.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use crate::params::IoVec;

/// A user-space address. Never dereferenced; only meaningful to the
/// [`UserMemory`] implementation it is presented to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct UserAddr(u64);

impl UserAddr {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset this address, failing on wraparound.
    #[inline]
    #[must_use]
    pub fn checked_add(self, offset: u64) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }
}

impl fmt::Display for UserAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A failed user-memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFault {
    pub addr: UserAddr,
}

impl fmt::Display for MemFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user memory fault at {}", self.addr)
    }
}

impl std::error::Error for MemFault {}

/// Accessor for caller memory.
///
/// Implementations may block (a real one sleeps on page faults); callers
/// treat every method as fallible. Zero-length accesses always succeed.
pub trait UserMemory: Send + Sync {
    /// Copy `out.len()` bytes from user memory at `addr`.
    fn read_bytes(&self, addr: UserAddr, out: &mut [u8]) -> Result<(), MemFault>;

    /// Copy `data` into user memory at `addr`.
    fn write_bytes(&self, addr: UserAddr, data: &[u8]) -> Result<(), MemFault>;

    fn read_u64(&self, addr: UserAddr) -> Result<u64, MemFault> {
        let mut buf = [0_u8; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&self, addr: UserAddr, value: u64) -> Result<(), MemFault> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn read_i32(&self, addr: UserAddr) -> Result<i32, MemFault> {
        let mut buf = [0_u8; 4];
        self.read_bytes(addr, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Read an array of `n` 64-bit values starting at `addr`.
    fn read_u64_array(&self, addr: UserAddr, n: u32) -> Result<Vec<u64>, MemFault> {
        let mut out = Vec::with_capacity(n as usize);
        for i in 0..u64::from(n) {
            let slot = addr.checked_add(i * 8).ok_or(MemFault { addr })?;
            out.push(self.read_u64(slot)?);
        }
        Ok(out)
    }

    /// Read an array of `n` file-descriptor integers starting at `addr`.
    fn read_fd_array(&self, addr: UserAddr, n: u32) -> Result<Vec<i32>, MemFault> {
        let mut out = Vec::with_capacity(n as usize);
        for i in 0..u64::from(n) {
            let slot = addr.checked_add(i * 4).ok_or(MemFault { addr })?;
            out.push(self.read_i32(slot)?);
        }
        Ok(out)
    }

    /// Read an array of `n` iovec descriptors (16 bytes each) at `addr`.
    fn read_iovec_array(&self, addr: UserAddr, n: u32) -> Result<Vec<IoVec>, MemFault> {
        let mut out = Vec::with_capacity(n as usize);
        for i in 0..u64::from(n) {
            let slot = addr.checked_add(i * 16).ok_or(MemFault { addr })?;
            let base = self.read_u64(slot)?;
            let len_slot = slot.checked_add(8).ok_or(MemFault { addr: slot })?;
            let len = self.read_u64(len_slot)?;
            out.push(IoVec::new(UserAddr::new(base), len));
        }
        Ok(out)
    }
}

/// In-memory [`UserMemory`] built from explicitly mapped windows.
///
/// Any access touching an unmapped byte returns [`MemFault`], which lets
/// tests provoke write-back faults by handing out an address that was never
/// mapped.
#[derive(Debug, Default)]
pub struct HeapUserMemory {
    inner: Mutex<HeapInner>,
}

#[derive(Debug)]
struct Region {
    bytes: Vec<u8>,
    readonly: bool,
}

#[derive(Debug)]
struct HeapInner {
    regions: BTreeMap<u64, Region>,
    next: u64,
}

impl Default for HeapInner {
    fn default() -> Self {
        Self {
            regions: BTreeMap::new(),
            next: 0x1000,
        }
    }
}

impl HeapInner {
    /// Locate the region containing `[addr, addr + len)`, returning the
    /// region base and offset. Accesses spanning two regions fault.
    fn locate(&self, addr: UserAddr, len: usize) -> Result<(u64, usize), MemFault> {
        let raw = addr.get();
        let (base, region) = self
            .regions
            .range(..=raw)
            .next_back()
            .ok_or(MemFault { addr })?;
        let offset = (raw - base) as usize;
        let end = offset.checked_add(len).ok_or(MemFault { addr })?;
        if end > region.bytes.len() {
            return Err(MemFault { addr });
        }
        Ok((*base, offset))
    }
}

impl HeapUserMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a zero-filled window of `len` bytes, returning its base address.
    pub fn alloc(&self, len: usize) -> UserAddr {
        self.map_region(vec![0; len], false)
    }

    fn map_region(&self, bytes: Vec<u8>, readonly: bool) -> UserAddr {
        let mut inner = self.inner.lock().expect("usermem poisoned");
        let base = inner.next;
        // Leave a guard gap so adjacent windows never coalesce.
        inner.next = base + bytes.len().max(1) as u64 + 0x1000;
        inner.regions.insert(base, Region { bytes, readonly });
        UserAddr::new(base)
    }

    /// Map `data` into a fresh window, returning its base address.
    pub fn push_bytes(&self, data: &[u8]) -> UserAddr {
        self.map_region(data.to_vec(), false)
    }

    /// Map `data` into a read-only window: reads succeed, writes fault.
    pub fn push_bytes_readonly(&self, data: &[u8]) -> UserAddr {
        self.map_region(data.to_vec(), true)
    }

    /// Map a single 64-bit value into a read-only window.
    pub fn push_u64_readonly(&self, value: u64) -> UserAddr {
        self.push_bytes_readonly(&value.to_le_bytes())
    }

    /// Map a single 64-bit value.
    pub fn push_u64(&self, value: u64) -> UserAddr {
        self.push_bytes(&value.to_le_bytes())
    }

    /// Map an array of 64-bit values.
    pub fn push_u64_array(&self, values: &[u64]) -> UserAddr {
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        self.push_bytes(&bytes)
    }

    /// Map an array of file-descriptor integers.
    pub fn push_fd_array(&self, fds: &[i32]) -> UserAddr {
        let mut bytes = Vec::with_capacity(fds.len() * 4);
        for fd in fds {
            bytes.extend_from_slice(&fd.to_le_bytes());
        }
        self.push_bytes(&bytes)
    }

    /// Map an array of iovec descriptors.
    pub fn push_iovec_array(&self, vecs: &[IoVec]) -> UserAddr {
        let mut bytes = Vec::with_capacity(vecs.len() * 16);
        for v in vecs {
            bytes.extend_from_slice(&v.base.get().to_le_bytes());
            bytes.extend_from_slice(&v.len.to_le_bytes());
        }
        self.push_bytes(&bytes)
    }

    /// An address guaranteed to fault on access.
    #[must_use]
    pub fn unmapped(&self) -> UserAddr {
        UserAddr::new(u64::MAX - 0xfff)
    }
}

impl UserMemory for HeapUserMemory {
    fn read_bytes(&self, addr: UserAddr, out: &mut [u8]) -> Result<(), MemFault> {
        if out.is_empty() {
            return Ok(());
        }
        let inner = self.inner.lock().expect("usermem poisoned");
        let (base, offset) = inner.locate(addr, out.len())?;
        let region = &inner.regions[&base];
        out.copy_from_slice(&region.bytes[offset..offset + out.len()]);
        Ok(())
    }

    fn write_bytes(&self, addr: UserAddr, data: &[u8]) -> Result<(), MemFault> {
        if data.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().expect("usermem poisoned");
        let (base, offset) = inner.locate(addr, data.len())?;
        let region = inner.regions.get_mut(&base).expect("located region");
        if region.readonly {
            return Err(MemFault { addr });
        }
        region.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_u64() {
        let mem = HeapUserMemory::new();
        let addr = mem.push_u64(0xdead_beef);
        assert_eq!(mem.read_u64(addr).unwrap(), 0xdead_beef);
        mem.write_u64(addr, 7).unwrap();
        assert_eq!(mem.read_u64(addr).unwrap(), 7);
    }

    #[test]
    fn unmapped_access_faults() {
        let mem = HeapUserMemory::new();
        let addr = mem.unmapped();
        assert_eq!(mem.read_u64(addr), Err(MemFault { addr }));
        assert_eq!(mem.write_u64(addr, 1), Err(MemFault { addr }));
    }

    #[test]
    fn access_past_region_end_faults() {
        let mem = HeapUserMemory::new();
        let addr = mem.push_bytes(&[1, 2, 3, 4]);
        let mut buf = [0_u8; 4];
        assert!(mem.read_bytes(addr, &mut buf).is_ok());
        let past = addr.checked_add(1).unwrap();
        assert!(mem.read_bytes(past, &mut buf).is_err());
    }

    #[test]
    fn iovec_array_roundtrip() {
        let mem = HeapUserMemory::new();
        let payload = mem.push_bytes(b"PING");
        let vecs = [IoVec::new(payload, 4)];
        let addr = mem.push_iovec_array(&vecs);
        let read = mem.read_iovec_array(addr, 1).unwrap();
        assert_eq!(read, vecs);
    }

    #[test]
    fn readonly_window_reads_but_faults_on_write() {
        let mem = HeapUserMemory::new();
        let addr = mem.push_u64_readonly(99);
        assert_eq!(mem.read_u64(addr).unwrap(), 99);
        assert_eq!(mem.write_u64(addr, 1), Err(MemFault { addr }));
    }

    #[test]
    fn zero_length_access_always_succeeds() {
        let mem = HeapUserMemory::new();
        let addr = mem.unmapped();
        assert!(mem.read_bytes(addr, &mut []).is_ok());
        assert!(mem.write_bytes(addr, &[]).is_ok());
    }
}
