// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

//! Log-structured storage backend.
//!
//! Each named store is a directory holding an append-only log and a
//! sidecar meta file. Live keys are kept in an in-memory ordered key
//! directory pointing at value positions in the log; deletes append
//! tombstones, and the log is rewritten without garbage on every open.
//!
//! The engine runs a single physical write transaction at a time. Nested
//! transaction levels are logical handles over that one transaction:
//! nested commits retire their handle and keep the writes buffered, while
//! an abort of any handle discards the buffer whole. Timestamps for
//! begin/prepare/commit are drawn from a per-environment monotonic counter
//! starting at 1; zero is reserved as "unused".

mod engine;
mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use latticedb_core::Result;
use latticedb_kv::{BackendFactory, Environment, OpenOptions, Session};
use parking_lot::Mutex;
use tracing::debug;

use engine::{Engine, translate};
use session::LogSession;

const DEFAULT_CACHE_LIMIT: usize = 64 << 20;

/// Factory handed to [`latticedb_kv::KvStore::open`] to select this
/// backend.
pub struct LogBackend {
    /// Upper bound on a transaction's buffered writes before the engine
    /// reports its cache as full.
    pub cache_limit: usize,
}

impl Default for LogBackend {
    fn default() -> Self {
        Self { cache_limit: DEFAULT_CACHE_LIMIT }
    }
}

impl BackendFactory for LogBackend {
    fn open_env(&self, name: &str, opts: &OpenOptions) -> Result<Arc<dyn Environment>> {
        let engine = if opts.temporary || opts.in_memory {
            Engine::memory(self.cache_limit)
        } else {
            Engine::file(&PathBuf::from(name), self.cache_limit).map_err(translate)?
        };
        debug!(name, in_memory = opts.temporary || opts.in_memory, "log environment ready");
        Ok(Arc::new(LogEnvironment {
            shared: Arc::new(Shared { engine: Mutex::new(engine), counter: AtomicU64::new(1) }),
            next_session: AtomicU64::new(1),
        }))
    }
}

/// Engine state shared by every session of one environment.
pub(crate) struct Shared {
    pub engine: Mutex<Engine>,
    /// Monotonic transaction timestamp counter; 1 is the first timestamp.
    pub counter: AtomicU64,
}

pub struct LogEnvironment {
    shared: Arc<Shared>,
    next_session: AtomicU64,
}

impl Environment for LogEnvironment {
    fn open_session(&self) -> Result<Box<dyn Session>> {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(LogSession::new(self.shared.clone(), id)))
    }

    fn close(&self) -> Result<()> {
        // Dropping the engine closes the log file and releases its lock;
        // there is nothing else to tear down.
        Ok(())
    }
}
