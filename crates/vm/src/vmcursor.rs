// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use latticedb_core::KeyInfo;
use latticedb_kv::KvCursorId;

/// One slot of the VM's cursor table.
pub(crate) struct VmCursor {
    pub db: usize,
    pub root: u64,
    pub key_info: KeyInfo,
    pub kv: KvCursorId,
    /// Monotonic within the cursor's lifetime; appended to keys that need
    /// sort uniqueness.
    pub seq_count: u64,
    /// Set when the cursor points at no row; column reads yield NULL.
    pub null_row: bool,
    pub writable: bool,
}

impl VmCursor {
    pub fn new(db: usize, root: u64, key_info: KeyInfo, kv: KvCursorId, writable: bool) -> Self {
        Self { db, root, key_info, kv, seq_count: 0, null_row: true, writable }
    }
}
