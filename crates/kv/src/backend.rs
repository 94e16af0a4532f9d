// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

//! The native surface the store abstraction consumes from a backend.
//!
//! Backends translate every native return code into the shared error
//! taxonomy through exactly one table inside their own crate, so the layers
//! above never see engine-specific codes drifting between call sites.

use std::sync::Arc;

use latticedb_core::Result;

/// Handle of a native transaction. Zero is never issued.
pub type TxnId = u64;

/// Handle of a native cursor.
pub type NativeCursorId = u64;

/// Where a native range search positioned the cursor, relative to the
/// probe. Btree-style engines only ever report `Exact` or `After`;
/// search-near engines may also land `Before` the probe, in which case the
/// cursor layer walks forward itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePos {
    Exact,
    After,
    Before,
}

/// Flags supplied when a connection opens a named store.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Keep all state in memory; nothing survives the environment.
    pub in_memory: bool,
    /// Private scratch store: skips the resource directory entirely, so
    /// the environment is never shared and dies with the connection.
    pub temporary: bool,
    /// Reject writes at the store layer.
    pub read_only: bool,
    /// Override the connection's initial cursor key-buffer capacity.
    pub cursor_key_capacity: Option<usize>,
    /// Override the connection's initial cursor value-buffer capacity.
    pub cursor_value_capacity: Option<usize>,
}

/// A per-connection session against an open environment.
///
/// Sessions are not internally synchronised; each belongs to exactly one
/// connection and is driven from one thread at a time. Aborting a
/// transaction handle that the engine has already torn down (for example
/// because a sibling logical handle of the same physical transaction was
/// aborted first) is a no-op, as is closing a cursor of such a
/// transaction.
pub trait Session: Send {
    /// Begin a transaction nested inside `parent`.
    fn txn_begin(&mut self, parent: Option<TxnId>) -> Result<TxnId>;
    /// First phase of two-phase commit. `gid` is the caller-supplied
    /// global identifier; when absent the engine derives its own.
    fn txn_prepare(&mut self, txn: TxnId, gid: Option<&[u8]>) -> Result<()>;
    /// Commit `txn` together with any transactions nested inside it.
    fn txn_commit(&mut self, txn: TxnId) -> Result<()>;
    fn txn_abort(&mut self, txn: TxnId) -> Result<()>;

    /// Open a cursor reading through `txn`, or at committed state when
    /// `txn` is `None`.
    fn cursor_open(&mut self, txn: Option<TxnId>) -> Result<NativeCursorId>;
    fn cursor_close(&mut self, cursor: NativeCursorId) -> Result<()>;
    /// Drop the cursor's position and any row locks it holds, without
    /// closing it.
    fn cursor_reset(&mut self, cursor: NativeCursorId) -> Result<()>;
    /// Exact search.
    fn cursor_search(&mut self, cursor: NativeCursorId, key: &[u8]) -> Result<()>;
    /// Range search positioning at the nearest feasible entry.
    fn cursor_search_range(&mut self, cursor: NativeCursorId, key: &[u8]) -> Result<RangePos>;
    fn cursor_next(&mut self, cursor: NativeCursorId) -> Result<()>;
    fn cursor_prev(&mut self, cursor: NativeCursorId) -> Result<()>;
    fn cursor_last(&mut self, cursor: NativeCursorId) -> Result<()>;
    /// Fill `buf` with the current key. The buffer is caller-owned; the
    /// engine must treat it as write-only scratch.
    fn cursor_key(&mut self, cursor: NativeCursorId, buf: &mut Vec<u8>) -> Result<()>;
    fn cursor_value(&mut self, cursor: NativeCursorId, buf: &mut Vec<u8>) -> Result<()>;
    /// Delete the entry under the cursor. The cursor keeps a ghost
    /// position so that a following next/prev lands on the neighbour.
    fn cursor_remove(&mut self, cursor: NativeCursorId) -> Result<()>;

    /// Insert or overwrite `key` through the write transaction `txn`.
    fn replace(&mut self, txn: TxnId, key: &[u8], value: &[u8]) -> Result<()>;

    /// Read the 32-bit schema cookie slot.
    fn get_meta(&mut self) -> Result<u32>;
    /// Write the 32-bit schema cookie slot.
    fn put_meta(&mut self, value: u32) -> Result<()>;
}

/// A native environment shared by every connection naming the same store.
pub trait Environment: Send + Sync {
    fn open_session(&self) -> Result<Box<dyn Session>>;
    /// Called once, when the directory entry's refcount reaches zero.
    fn close(&self) -> Result<()>;
}

/// Creates environments for a particular engine.
pub trait BackendFactory: Send + Sync {
    fn open_env(&self, name: &str, opts: &OpenOptions) -> Result<Arc<dyn Environment>>;
}
