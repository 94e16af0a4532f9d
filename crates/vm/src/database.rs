// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use latticedb_core::{Error, Result};
use latticedb_kv::{EngineContext, KvStore, METHOD_SET_VERSION, OpenOptions};
use latticedb_store_btree::BtreeBackend;
use latticedb_store_log::LogBackend;
use tracing::instrument;

/// Which native engine backs a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Btree,
    Log,
}

/// One open savepoint. The anonymous root transaction has no name.
pub struct Savepoint {
    pub name: Option<String>,
    /// Deferred-constraint counter at the time the savepoint was opened,
    /// restored on rollback.
    pub deferred_cons: i64,
}

pub(crate) struct DbStore {
    pub kv: KvStore,
    /// In-memory schema generation, compared by VerifyCookie.
    pub generation: u32,
    pub cookie_cache: u32,
}

/// The SQL connection as the VM adapter sees it: the attached stores, the
/// savepoint stack and the deferred-constraint counter.
pub struct Database {
    ctx: Arc<EngineContext>,
    pub(crate) stores: Vec<DbStore>,
    pub(crate) savepoints: Vec<Savepoint>,
    pub(crate) n_deferred_cons: i64,
    /// Set between opcodes by any thread; the next dispatch observes it
    /// and halts the running program.
    interrupted: AtomicBool,
}

impl Database {
    /// Open a connection whose main store is `name`.
    pub fn open(
        ctx: &Arc<EngineContext>,
        name: &str,
        backend: BackendKind,
        opts: OpenOptions,
    ) -> Result<Database> {
        let mut db = Database {
            ctx: ctx.clone(),
            stores: Vec::new(),
            savepoints: Vec::new(),
            n_deferred_cons: 0,
            interrupted: AtomicBool::new(false),
        };
        db.attach(name, backend, opts)?;
        Ok(db)
    }

    /// Attach a further store; returns its database index.
    pub fn attach(
        &mut self,
        name: &str,
        backend: BackendKind,
        opts: OpenOptions,
    ) -> Result<usize> {
        let stamp = KvStore::method_set_stamp();
        if stamp.version != METHOD_SET_VERSION {
            return Err(Error::misuse(format!(
                "store method set v{} does not match the VM's v{METHOD_SET_VERSION}",
                stamp.version
            )));
        }
        let kv = match backend {
            BackendKind::Btree => KvStore::open(&self.ctx, &BtreeBackend, name, opts)?,
            BackendKind::Log => KvStore::open(&self.ctx, &LogBackend::default(), name, opts)?,
        };
        self.stores.push(DbStore { kv, generation: 0, cookie_cache: 0 });
        Ok(self.stores.len() - 1)
    }

    /// Ask the running program to stop at the next opcode boundary. Safe
    /// to call from another thread through a shared reference.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    pub fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn kv(&mut self, db: usize) -> Result<&mut KvStore> {
        self.stores
            .get_mut(db)
            .map(|s| &mut s.kv)
            .ok_or_else(|| Error::misuse("no such database"))
    }

    pub fn n_savepoint(&self) -> usize {
        self.savepoints.len()
    }

    pub fn savepoints(&self) -> &[Savepoint] {
        &self.savepoints
    }

    /// Last schema cookie this connection observed for database `db`.
    pub fn schema_cookie_cache(&self, db: usize) -> Option<u32> {
        self.stores.get(db).map(|s| s.cookie_cache)
    }

    /// Bump the in-memory schema generation of database `db`; prepared
    /// programs verifying against the old generation will expire.
    pub fn bump_generation(&mut self, db: usize) -> Result<u32> {
        let store = self.stores.get_mut(db).ok_or_else(|| Error::misuse("no such database"))?;
        store.generation += 1;
        Ok(store.generation)
    }

    /// Commit every attached store down to `level`: phase one everywhere
    /// before phase two anywhere, which is what makes the split matter
    /// when more than one store is attached.
    #[instrument(level = "trace", skip(self))]
    pub fn commit_to(&mut self, level: usize) -> Result<()> {
        for store in &mut self.stores {
            store.kv.commit_phase_one(level)?;
        }
        for store in &mut self.stores {
            store.kv.commit_phase_two(level)?;
        }
        Ok(())
    }

    /// Roll every attached store back to `level`, recording the first
    /// failure but completing the sweep.
    #[instrument(level = "trace", skip(self))]
    pub fn rollback_to(&mut self, level: usize) -> Result<()> {
        let mut first_err = None;
        for store in &mut self.stores {
            if let Err(e) = store.kv.rollback(level) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close a statement sub-transaction that was opened at `level`. On
    /// success its effects merge into the surrounding transaction; on
    /// failure they are discarded, leaving the enclosing transaction
    /// intact.
    pub(crate) fn close_statement(&mut self, db: usize, level: usize, success: bool) -> Result<()> {
        let store = self.kv(db)?;
        if !success {
            store.rollback(level)?;
        }
        store.commit(level - 1)
    }
}
