//! Credentials, process ids, and namespace translation.
//!
//! Peers live in user and PID namespaces. Sender identity is recorded once
//! per transaction and translated into each destination's namespaces when a
//! message instance is built: a value crossing into a foreign user namespace
//! degrades to the overflow uid/gid, a PID crossing into a foreign PID
//! namespace degrades to 0.

use std::fmt;

/// Uid reported for identities that do not map into a user namespace.
pub const OVERFLOW_UID: u32 = 65_534;

/// Gid reported for identities that do not map into a user namespace.
pub const OVERFLOW_GID: u32 = 65_534;

/// Raw user id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Uid(pub u32);

/// Raw group id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Gid(pub u32);

/// Raw process (or thread) id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Pid(pub u32);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid:{}", self.0)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gid:{}", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// User-namespace identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct UserNamespace(pub u64);

/// PID-namespace identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct PidNamespace(pub u64);

/// The credentials a peer registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Credentials {
    pub uid: Uid,
    pub gid: Gid,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            uid: Uid(0),
            gid: Gid(0),
        }
    }
}

/// Sender identity snapshot, captured once at transaction construction so
/// every instantiated message sees the same values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SenderIdentity {
    pub cred: Credentials,
    pub pid: Pid,
    pub tid: Pid,
    pub user_ns: UserNamespace,
    pub pid_ns: PidNamespace,
}

impl SenderIdentity {
    /// Translate this identity into a destination's namespaces.
    #[must_use]
    pub fn translate_to(
        &self,
        user_ns: UserNamespace,
        pid_ns: PidNamespace,
    ) -> TranslatedIdentity {
        let (uid, gid) = if self.user_ns == user_ns {
            (self.cred.uid.0, self.cred.gid.0)
        } else {
            (OVERFLOW_UID, OVERFLOW_GID)
        };
        let (pid, tid) = if self.pid_ns == pid_ns {
            (self.pid.0, self.tid.0)
        } else {
            (0, 0)
        };
        TranslatedIdentity { uid, gid, pid, tid }
    }
}

/// Sender identity as seen from one destination's namespaces. This is what
/// the slice header records.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize,
)]
pub struct TranslatedIdentity {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub tid: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(user_ns: u64, pid_ns: u64) -> SenderIdentity {
        SenderIdentity {
            cred: Credentials {
                uid: Uid(1000),
                gid: Gid(1000),
            },
            pid: Pid(42),
            tid: Pid(43),
            user_ns: UserNamespace(user_ns),
            pid_ns: PidNamespace(pid_ns),
        }
    }

    #[test]
    fn same_namespace_is_identity() {
        let t = identity(1, 1).translate_to(UserNamespace(1), PidNamespace(1));
        assert_eq!(
            t,
            TranslatedIdentity {
                uid: 1000,
                gid: 1000,
                pid: 42,
                tid: 43
            }
        );
    }

    #[test]
    fn foreign_user_namespace_degrades_to_overflow() {
        let t = identity(1, 1).translate_to(UserNamespace(2), PidNamespace(1));
        assert_eq!(t.uid, OVERFLOW_UID);
        assert_eq!(t.gid, OVERFLOW_GID);
        assert_eq!(t.pid, 42);
    }

    #[test]
    fn foreign_pid_namespace_degrades_to_zero() {
        let t = identity(1, 1).translate_to(UserNamespace(1), PidNamespace(9));
        assert_eq!(t.uid, 1000);
        assert_eq!(t.pid, 0);
        assert_eq!(t.tid, 0);
    }
}
