// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::backend::Environment;

/// Mutable state of one directory entry, guarded by the entry lock.
pub struct EntryState {
    /// The shared native environment, populated by the first connection
    /// that opens the name while holding the entry lock.
    pub env: Option<Arc<dyn Environment>>,
    /// Number of live connections whose name matches this entry.
    pub refcount: u32,
}

/// One named store known to the directory. The entry outlives the lock on
/// the directory map, so connections can open backends under the entry
/// lock without stalling unrelated names.
pub struct DirectoryEntry {
    name: String,
    state: Mutex<EntryState>,
}

impl DirectoryEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the entry lock. Lock order is always directory map first (and
    /// released), then entry; never the reverse.
    pub fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock()
    }
}

/// Per-context mapping from store name to the shared environment handle.
pub struct Directory {
    entries: Mutex<HashMap<String, Arc<DirectoryEntry>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Return the entry for `name`, creating it if absent. The map lock is
    /// dropped before this returns; the caller locks the entry itself.
    pub fn acquire(&self, name: &str) -> Arc<DirectoryEntry> {
        let mut map = self.entries.lock();
        map.entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(DirectoryEntry {
                    name: name.to_owned(),
                    state: Mutex::new(EntryState { env: None, refcount: 0 }),
                })
            })
            .clone()
    }

    /// Like [`Directory::acquire`] but never creates.
    pub fn try_get(&self, name: &str) -> Option<Arc<DirectoryEntry>> {
        self.entries.lock().get(name).cloned()
    }

    /// Drop the entry for `name` if it no longer has an environment or any
    /// live connections. Takes the map lock and then the entry lock, in
    /// that order.
    pub fn evict_if_dead(&self, name: &str) {
        let mut map = self.entries.lock();
        if let Some(entry) = map.get(name) {
            let state = entry.lock();
            if state.refcount == 0 && state.env.is_none() {
                drop(state);
                map.remove(name);
            }
        }
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}
