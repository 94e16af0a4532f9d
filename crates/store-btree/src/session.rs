// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use latticedb_core::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::trace;

use latticedb_kv::{NativeCursorId, RangePos, Session, TxnId};

use crate::translate::translate;

/// Size of a generated global transaction identifier.
const GID_SIZE: usize = 128;

struct Txn {
    savepoint: String,
    prepared: Option<Vec<u8>>,
}

// A cursor is a remembered position key. After a remove, the position
// survives as a ghost so next/prev still land on the right neighbour,
// while key/value reads report the entry as gone.
struct Cursor {
    pos: Option<Vec<u8>>,
    ghost: bool,
}

pub(crate) struct BtreeSession {
    conn: Connection,
    txns: HashMap<TxnId, Txn>,
    cursors: HashMap<NativeCursorId, Cursor>,
    next_id: u64,
}

impl BtreeSession {
    pub(crate) fn new(conn: Connection) -> Self {
        Self { conn, txns: HashMap::new(), cursors: HashMap::new(), next_id: 1 }
    }

    fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn cursor(&self, id: NativeCursorId) -> Result<&Cursor> {
        self.cursors.get(&id).ok_or_else(|| Error::misuse("unknown native cursor"))
    }

    fn positioned(&self, id: NativeCursorId) -> Result<&[u8]> {
        let cur = self.cursor(id)?;
        cur.pos.as_deref().ok_or_else(|| Error::misuse("cursor is not positioned"))
    }

    fn derive_gid(&self) -> Vec<u8> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut gid = format!("{:p}:{}.{:09}", &self.conn, now.as_secs(), now.subsec_nanos())
            .into_bytes();
        gid.resize(GID_SIZE, 0);
        gid
    }
}

impl Session for BtreeSession {
    fn txn_begin(&mut self, parent: Option<TxnId>) -> Result<TxnId> {
        if let Some(parent) = parent {
            if !self.txns.contains_key(&parent) {
                return Err(Error::misuse("parent transaction is not open"));
            }
        }
        let id = self.fresh_id();
        let savepoint = format!("sp_{id}");
        self.conn
            .execute(&format!("SAVEPOINT {savepoint}"), [])
            .map_err(|e| translate("savepoint", e))?;
        trace!(txn = id, parent, "btree txn begin");
        self.txns.insert(id, Txn { savepoint, prepared: None });
        Ok(id)
    }

    fn txn_prepare(&mut self, txn: TxnId, gid: Option<&[u8]>) -> Result<()> {
        let gid = gid.map(<[u8]>::to_vec).unwrap_or_else(|| self.derive_gid());
        let rec = self
            .txns
            .get_mut(&txn)
            .ok_or_else(|| Error::misuse("transaction is not open"))?;
        if rec.prepared.is_some() {
            return Err(Error::misuse("transaction is already prepared"));
        }
        // SQLite has no distinct prepare step; the gid is recorded and the
        // durable work happens at commit, which cannot fail after this
        // point short of I/O errors.
        rec.prepared = Some(gid);
        Ok(())
    }

    fn txn_commit(&mut self, txn: TxnId) -> Result<()> {
        let Some(rec) = self.txns.remove(&txn) else {
            return Ok(()); // subtree already released by an ancestor
        };
        self.conn
            .execute(&format!("RELEASE {}", rec.savepoint), [])
            .map_err(|e| translate("release", e))?;
        // Releasing a savepoint releases everything nested inside it.
        self.txns.retain(|&id, _| id < txn);
        trace!(txn, "btree txn commit");
        Ok(())
    }

    fn txn_abort(&mut self, txn: TxnId) -> Result<()> {
        let Some(rec) = self.txns.remove(&txn) else {
            return Ok(());
        };
        let sql = format!("ROLLBACK TO {0}; RELEASE {0}", rec.savepoint);
        self.conn.execute_batch(&sql).map_err(|e| translate("rollback", e))?;
        self.txns.retain(|&id, _| id < txn);
        trace!(txn, "btree txn abort");
        Ok(())
    }

    fn cursor_open(&mut self, _txn: Option<TxnId>) -> Result<NativeCursorId> {
        // All statements on this connection read through the current
        // savepoint stack, so the cursor only needs a position.
        let id = self.fresh_id();
        self.cursors.insert(id, Cursor { pos: None, ghost: false });
        Ok(id)
    }

    fn cursor_close(&mut self, cursor: NativeCursorId) -> Result<()> {
        self.cursors.remove(&cursor);
        Ok(())
    }

    fn cursor_reset(&mut self, cursor: NativeCursorId) -> Result<()> {
        let cur = self
            .cursors
            .get_mut(&cursor)
            .ok_or_else(|| Error::misuse("unknown native cursor"))?;
        cur.pos = None;
        cur.ghost = false;
        Ok(())
    }

    fn cursor_search(&mut self, cursor: NativeCursorId, key: &[u8]) -> Result<()> {
        self.cursor(cursor)?;
        let hit: Option<Vec<u8>> = self
            .conn
            .query_row("SELECT key FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(|e| translate("search", e))?;
        let cur = self.cursors.get_mut(&cursor).expect("checked above");
        match hit {
            Some(k) => {
                cur.pos = Some(k);
                cur.ghost = false;
                Ok(())
            }
            None => {
                cur.pos = None;
                cur.ghost = false;
                Err(Error::NotFound)
            }
        }
    }

    fn cursor_search_range(&mut self, cursor: NativeCursorId, key: &[u8]) -> Result<RangePos> {
        self.cursor(cursor)?;
        let hit: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT key FROM kv WHERE key >= ?1 ORDER BY key LIMIT 1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| translate("search range", e))?;
        let cur = self.cursors.get_mut(&cursor).expect("checked above");
        match hit {
            Some(k) => {
                let pos = if k == key { RangePos::Exact } else { RangePos::After };
                cur.pos = Some(k);
                cur.ghost = false;
                Ok(pos)
            }
            None => {
                cur.pos = None;
                cur.ghost = false;
                Err(Error::NotFound)
            }
        }
    }

    fn cursor_next(&mut self, cursor: NativeCursorId) -> Result<()> {
        let pos = self.positioned(cursor)?.to_vec();
        let hit: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT key FROM kv WHERE key > ?1 ORDER BY key LIMIT 1",
                params![pos],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| translate("next", e))?;
        match hit {
            Some(k) => {
                let cur = self.cursors.get_mut(&cursor).expect("checked above");
                cur.pos = Some(k);
                cur.ghost = false;
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn cursor_prev(&mut self, cursor: NativeCursorId) -> Result<()> {
        let pos = self.positioned(cursor)?.to_vec();
        let hit: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT key FROM kv WHERE key < ?1 ORDER BY key DESC LIMIT 1",
                params![pos],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| translate("prev", e))?;
        match hit {
            Some(k) => {
                let cur = self.cursors.get_mut(&cursor).expect("checked above");
                cur.pos = Some(k);
                cur.ghost = false;
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn cursor_last(&mut self, cursor: NativeCursorId) -> Result<()> {
        self.cursor(cursor)?;
        let hit: Option<Vec<u8>> = self
            .conn
            .query_row("SELECT key FROM kv ORDER BY key DESC LIMIT 1", [], |row| row.get(0))
            .optional()
            .map_err(|e| translate("last", e))?;
        match hit {
            Some(k) => {
                let cur = self.cursors.get_mut(&cursor).expect("checked above");
                cur.pos = Some(k);
                cur.ghost = false;
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn cursor_key(&mut self, cursor: NativeCursorId, buf: &mut Vec<u8>) -> Result<()> {
        let cur = self.cursor(cursor)?;
        if cur.ghost {
            return Err(Error::NotFound);
        }
        let pos = cur.pos.as_deref().ok_or_else(|| Error::misuse("cursor is not positioned"))?;
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM kv WHERE key = ?1", params![pos], |row| row.get(0))
            .optional()
            .map_err(|e| translate("key", e))?;
        if exists.is_none() {
            return Err(Error::NotFound);
        }
        buf.clear();
        buf.extend_from_slice(pos);
        Ok(())
    }

    fn cursor_value(&mut self, cursor: NativeCursorId, buf: &mut Vec<u8>) -> Result<()> {
        let cur = self.cursor(cursor)?;
        if cur.ghost {
            return Err(Error::NotFound);
        }
        let pos = cur.pos.as_deref().ok_or_else(|| Error::misuse("cursor is not positioned"))?;
        let value: Option<Vec<u8>> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![pos], |row| row.get(0))
            .optional()
            .map_err(|e| translate("value", e))?;
        match value {
            Some(v) => {
                buf.clear();
                buf.extend_from_slice(&v);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn cursor_remove(&mut self, cursor: NativeCursorId) -> Result<()> {
        let pos = {
            let cur = self.cursor(cursor)?;
            if cur.ghost {
                return Err(Error::misuse("entry already deleted"));
            }
            cur.pos
                .as_deref()
                .ok_or_else(|| Error::misuse("cursor is not positioned"))?
                .to_vec()
        };
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![pos])
            .map_err(|e| translate("remove", e))?;
        let cur = self.cursors.get_mut(&cursor).expect("checked above");
        cur.ghost = true;
        Ok(())
    }

    fn replace(&mut self, txn: TxnId, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.txns.contains_key(&txn) {
            return Err(Error::misuse("transaction is not open"));
        }
        self.conn
            .execute("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)", params![key, value])
            .map_err(|e| translate("replace", e))?;
        Ok(())
    }

    fn get_meta(&mut self) -> Result<u32> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|e| translate("get meta", e))?;
        Ok(version as u32)
    }

    fn put_meta(&mut self, value: u32) -> Result<()> {
        self.conn
            .execute_batch(&format!("PRAGMA user_version = {value}"))
            .map_err(|e| translate("put meta", e))?;
        Ok(())
    }
}
