// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::directory::Directory;

const DEFAULT_CURSOR_BUFFER_CAPACITY: usize = 16 * 1024;

/// Cross-connection engine state: the store directory and the process
/// defaults that freshly opened connections inherit. A process normally
/// creates one context, but tests may create several for isolation.
pub struct EngineContext {
    directory: Directory,
    default_key_capacity: AtomicUsize,
    default_value_capacity: AtomicUsize,
    mutexes: AtomicBool,
}

impl EngineContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            directory: Directory::new(),
            default_key_capacity: AtomicUsize::new(DEFAULT_CURSOR_BUFFER_CAPACITY),
            default_value_capacity: AtomicUsize::new(DEFAULT_CURSOR_BUFFER_CAPACITY),
            mutexes: AtomicBool::new(false),
        })
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Initial key-buffer capacity for cursors of connections opened after
    /// this call, unless the connection overrides it.
    pub fn set_default_initial_cursor_key_capacity(&self, bytes: usize) {
        self.default_key_capacity.store(bytes.max(1), Ordering::Relaxed);
    }

    pub fn default_initial_cursor_key_capacity(&self) -> usize {
        self.default_key_capacity.load(Ordering::Relaxed)
    }

    pub fn set_default_initial_cursor_value_capacity(&self, bytes: usize) {
        self.default_value_capacity.store(bytes.max(1), Ordering::Relaxed);
    }

    pub fn default_initial_cursor_value_capacity(&self) -> usize {
        self.default_value_capacity.load(Ordering::Relaxed)
    }

    /// Declare that this context will be used from multiple threads.
    /// Directory and entry locks are always real locks in this
    /// implementation; the flag is kept for API parity with callers that
    /// configure it before first open.
    pub fn enable_mutexes(&self) {
        self.mutexes.store(true, Ordering::Relaxed);
    }

    pub fn mutexes_enabled(&self) -> bool {
        self.mutexes.load(Ordering::Relaxed)
    }
}
