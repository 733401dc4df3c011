//! Cross-cutting types for the capbus message-transaction core.
//!
//! This crate defines the identifier newtypes, wire-level send parameters,
//! credential/namespace types, and the user-memory abstraction shared by the
//! peer runtime and the transaction core. It carries no runtime machinery.

pub mod cred;
pub mod ids;
pub mod params;
pub mod usermem;

pub use cred::{
    Credentials, Gid, Pid, PidNamespace, SenderIdentity, TranslatedIdentity, Uid, UserNamespace,
    OVERFLOW_GID, OVERFLOW_UID,
};
pub use ids::{HandleId, NodeId, PeerId, Timestamp};
pub use params::{IoVec, SendFlags, SendParams, FD_MAX, VEC_MAX};
pub use usermem::{HeapUserMemory, MemFault, UserAddr, UserMemory};
