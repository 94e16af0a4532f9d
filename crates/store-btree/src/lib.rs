// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

//! Btree storage backend over SQLite.
//!
//! Each named store is one SQLite database (a file, or a shared in-memory
//! database for the in-memory open mode) holding a single `kv` table whose
//! BLOB primary key realises the ordered key space — SQLite compares BLOBs
//! by memcmp, which is exactly the order the key codec guarantees.
//! Transactions nest as one `SAVEPOINT` per level, so releasing the
//! outermost savepoint commits the whole subtree in one step. The 32-bit
//! schema cookie lives in SQLite's native `user_version` slot.

mod session;
mod translate;

use std::path::PathBuf;
use std::sync::Arc;

use latticedb_core::Result;
use latticedb_kv::{BackendFactory, Environment, OpenOptions, Session};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use session::BtreeSession;
use translate::translate;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (\
     key BLOB PRIMARY KEY, value BLOB NOT NULL) WITHOUT ROWID";

/// Factory handed to [`latticedb_kv::KvStore::open`] to select this
/// backend.
pub struct BtreeBackend;

impl BackendFactory for BtreeBackend {
    fn open_env(&self, name: &str, opts: &OpenOptions) -> Result<Arc<dyn Environment>> {
        Ok(Arc::new(BtreeEnvironment::create(name, opts)?))
    }
}

enum Target {
    /// Database file named after the store.
    File(PathBuf),
    /// Shared in-memory database; alive while the keeper connection is.
    SharedMemory(String),
    /// Private in-memory database per session (temporary stores).
    Private,
}

pub struct BtreeEnvironment {
    target: Target,
    /// Holds the shared in-memory database open between sessions, and
    /// pins the WAL file for file-backed stores.
    keeper: Mutex<Option<Connection>>,
}

impl BtreeEnvironment {
    fn create(name: &str, opts: &OpenOptions) -> Result<Self> {
        let target = if opts.temporary {
            Target::Private
        } else if opts.in_memory {
            Target::SharedMemory(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            Target::File(PathBuf::from(name))
        };
        let env = Self { target, keeper: Mutex::new(None) };
        if !matches!(env.target, Target::Private) {
            let conn = env.connect()?;
            conn.execute(SCHEMA, [])
                .map_err(|e| translate("create schema", e))?;
            *env.keeper.lock() = Some(conn);
            debug!(name, "btree environment ready");
        }
        Ok(env)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = match &self.target {
            Target::File(path) => {
                let conn = Connection::open(path).map_err(|e| translate("open", e))?;
                // WAL keeps readers unblocked by the writer; contention
                // still surfaces as SQLITE_BUSY after the timeout.
                let _: String = conn
                    .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
                    .map_err(|e| translate("journal mode", e))?;
                conn.execute_batch("PRAGMA synchronous=NORMAL")
                    .map_err(|e| translate("synchronous", e))?;
                conn
            }
            Target::SharedMemory(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| translate("open", e))?,
            Target::Private => {
                let conn = Connection::open_in_memory().map_err(|e| translate("open", e))?;
                conn.execute(SCHEMA, []).map_err(|e| translate("create schema", e))?;
                conn
            }
        };
        conn.busy_timeout(std::time::Duration::from_millis(2000))
            .map_err(|e| translate("busy timeout", e))?;
        Ok(conn)
    }
}

impl Environment for BtreeEnvironment {
    fn open_session(&self) -> Result<Box<dyn Session>> {
        let conn = self.connect()?;
        if matches!(self.target, Target::SharedMemory(_)) {
            conn.execute(SCHEMA, []).map_err(|e| translate("create schema", e))?;
        }
        Ok(Box::new(BtreeSession::new(conn)))
    }

    fn close(&self) -> Result<()> {
        let keeper = self.keeper.lock().take();
        if let Some(conn) = keeper {
            conn.close()
                .map_err(|(_, e)| translate("close", e))?;
        }
        Ok(())
    }
}

impl Drop for BtreeEnvironment {
    fn drop(&mut self) {
        let _ = self.keeper.get_mut().take();
    }
}
