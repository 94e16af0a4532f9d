// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

/// Uniform error taxonomy shared by the storage layers and the VM adapter.
///
/// Every native engine return code is funnelled through exactly one
/// translation table per backend into one of these kinds, so callers never
/// see engine-specific codes. Successful-but-approximate seeks are not
/// errors; they are reported through [`crate::encoding`]-level result types
/// by the cursor layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The requested key or row does not exist.
    #[error("not found")]
    NotFound,

    /// The backend resolved a deadlock or refused a lock. The caller may
    /// roll back the current write transaction and retry.
    #[error("lock contention: {0}")]
    Locked(String),

    /// The backend is temporarily unavailable; no rollback is implied.
    #[error("busy: {0}")]
    Busy(String),

    /// Out of space, or a logical counter overflowed.
    #[error("storage full: {0}")]
    Full(String),

    /// Allocation failed, including backend-internal caches.
    #[error("out of memory: {0}")]
    NoMem(String),

    /// A write was attempted on a read-only store.
    #[error("read-only: {0}")]
    ReadOnly(String),

    /// Uniqueness or deferred-constraint violation.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Decoding stored bytes yielded an impossible structure.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// A cursor direction opcode is incompatible with the last seek.
    #[error("cursor direction mismatch")]
    Mismatch,

    /// The API contract was violated by the caller.
    #[error("misuse: {0}")]
    Misuse(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub fn misuse(msg: impl Into<String>) -> Self {
        Error::Misuse(msg.into())
    }

    /// True for the contention kinds a caller is allowed to retry after
    /// rolling back to the enclosing savepoint.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Locked(_) | Error::Busy(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
