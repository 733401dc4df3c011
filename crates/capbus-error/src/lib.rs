//! Error types for capbus operations.
//!
//! One enum covers the whole transaction surface, with an errno mapping for
//! callers that report results through a syscall-style ABI. The split that
//! matters at the protocol layer is caller-versus-target: target errors are
//! the ones a `CONTINUE` send downgrades to a per-destination dropped event.

use thiserror::Error;

use capbus_types::{HandleId, MemFault, UserAddr};

/// Primary error type for capbus operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    // === Import errors (caller-side) ===
    /// A byte-vector descriptor failed validation.
    #[error("invalid byte vector at index {index}")]
    InvalidVector { index: usize },

    /// Summed vector lengths overflow a u64.
    #[error("byte-vector lengths overflow")]
    LengthOverflow,

    /// More vectors than the import limit allows.
    #[error("too many vectors: {count} (max {max})")]
    TooManyVectors { count: u32, max: u32 },

    /// More file descriptors than the import limit allows.
    #[error("too many file descriptors: {count} (max {max})")]
    TooManyFiles { count: u32, max: u32 },

    /// Unrecognised send flag bits.
    #[error("unknown send flags {flags:#x}")]
    UnknownFlags { flags: u64 },

    /// A file-descriptor integer does not name an open file.
    #[error("bad file descriptor {fd}")]
    BadFileDescriptor { fd: i32 },

    // === Resolution errors (per-destination) ===
    /// A handle id does not resolve in the caller's handle table.
    #[error("handle not found: {id}")]
    HandleNotFound { id: HandleId },

    /// The destination peer is gone, or its pool refused the payload slice
    /// and `CONTINUE` was not set.
    #[error("destination peer unreachable")]
    PeerUnreachable,

    // === Resource errors ===
    /// Allocation of transaction-local storage failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The destination pool refused a slice.
    #[error("pool exhausted: {requested} bytes requested, {available} available")]
    PoolExhausted {
        requested: usize,
        available: usize,
    },

    // === User-memory errors ===
    /// A user-space read of inputs or write of a resolved destination id
    /// failed.
    #[error("user memory fault at {addr}")]
    Fault { addr: UserAddr },
}

/// Errno values for syscall-style reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Errno {
    /// Bad file descriptor.
    Badf = 9,
    /// Out of memory.
    NoMem = 12,
    /// Bad address.
    Fault = 14,
    /// Invalid argument.
    Inval = 22,
    /// No such device or address.
    Nxio = 6,
    /// Exchange full.
    XFull = 54,
    /// No route to host.
    HostUnreach = 113,
}

impl BusError {
    /// Map this error to an errno for ABI reporting.
    pub const fn errno(&self) -> Errno {
        match self {
            Self::InvalidVector { .. }
            | Self::LengthOverflow
            | Self::TooManyVectors { .. }
            | Self::TooManyFiles { .. }
            | Self::UnknownFlags { .. } => Errno::Inval,
            Self::BadFileDescriptor { .. } => Errno::Badf,
            Self::HandleNotFound { .. } => Errno::Nxio,
            Self::PeerUnreachable => Errno::HostUnreach,
            Self::OutOfMemory => Errno::NoMem,
            Self::PoolExhausted { .. } => Errno::XFull,
            Self::Fault { .. } => Errno::Fault,
        }
    }

    /// Whether the error is the target's fault rather than the caller's.
    ///
    /// Target errors are the class a `CONTINUE` send does not propagate:
    /// the destination observes a dropped event (or is skipped) instead of
    /// the transaction failing.
    #[must_use]
    pub const fn is_target_error(&self) -> bool {
        matches!(
            self,
            Self::PeerUnreachable | Self::PoolExhausted { .. } | Self::HandleNotFound { .. }
        )
    }

    /// Whether the caller can fix this without retrying blindly.
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidVector { .. }
                | Self::LengthOverflow
                | Self::TooManyVectors { .. }
                | Self::TooManyFiles { .. }
                | Self::UnknownFlags { .. }
                | Self::BadFileDescriptor { .. }
                | Self::Fault { .. }
        )
    }

    /// Create a fault error for `addr`.
    #[must_use]
    pub const fn fault(addr: UserAddr) -> Self {
        Self::Fault { addr }
    }
}

impl From<MemFault> for BusError {
    fn from(fault: MemFault) -> Self {
        Self::Fault { addr: fault.addr }
    }
}

/// Result type alias using [`BusError`].
pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = BusError::HandleNotFound {
            id: HandleId::new(9),
        };
        assert_eq!(err.to_string(), "handle not found: handle#9");

        let err = BusError::TooManyVectors {
            count: 70_000,
            max: 65_535,
        };
        assert_eq!(err.to_string(), "too many vectors: 70000 (max 65535)");
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(BusError::LengthOverflow.errno(), Errno::Inval);
        assert_eq!(BusError::OutOfMemory.errno(), Errno::NoMem);
        assert_eq!(BusError::PeerUnreachable.errno(), Errno::HostUnreach);
        assert_eq!(
            BusError::HandleNotFound {
                id: HandleId::INVALID
            }
            .errno(),
            Errno::Nxio
        );
        assert_eq!(
            BusError::fault(UserAddr::new(0x10)).errno(),
            Errno::Fault
        );
        assert_eq!(Errno::HostUnreach as i32, 113);
        assert_eq!(Errno::Fault as i32, 14);
    }

    #[test]
    fn target_errors_are_the_continue_class() {
        assert!(BusError::PeerUnreachable.is_target_error());
        assert!(BusError::PoolExhausted {
            requested: 64,
            available: 0
        }
        .is_target_error());
        assert!(BusError::HandleNotFound {
            id: HandleId::new(1)
        }
        .is_target_error());
        assert!(!BusError::LengthOverflow.is_target_error());
        assert!(!BusError::fault(UserAddr::NULL).is_target_error());
    }

    #[test]
    fn mem_fault_conversion() {
        let fault = MemFault {
            addr: UserAddr::new(0x44),
        };
        let err: BusError = fault.into();
        assert_eq!(err, BusError::fault(UserAddr::new(0x44)));
        assert!(err.is_caller_error());
    }
}
