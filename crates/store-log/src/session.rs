// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use latticedb_core::{Error, Result};
use tracing::trace;

use latticedb_kv::{NativeCursorId, RangePos, Session, TxnId};

use crate::Shared;
use crate::engine::{Engine, EngineCode, WriteTxn, live_value, translate};

// One cursor: the transaction it reads through, its position key, and
// whether that position is a ghost left behind by a remove.
struct Cursor {
    txn: Option<TxnId>,
    pos: Option<Vec<u8>>,
    ghost: bool,
}

pub(crate) struct LogSession {
    shared: Arc<Shared>,
    id: u64,
    cursors: HashMap<NativeCursorId, Cursor>,
    next_cursor: u64,
}

impl LogSession {
    pub(crate) fn new(shared: Arc<Shared>, id: u64) -> Self {
        Self { shared, id, cursors: HashMap::new(), next_cursor: 1 }
    }

    fn cursor(&self, id: NativeCursorId) -> Result<&Cursor> {
        self.cursors.get(&id).ok_or_else(|| Error::misuse("unknown native cursor"))
    }

    fn next_ts(&self) -> u64 {
        self.shared.counter.fetch_add(1, Ordering::Relaxed)
    }

    // The write buffer is visible to a cursor when the cursor reads
    // through a live handle of this session's physical transaction.
    fn overlay_visible(&self, engine: &Engine, txn: Option<TxnId>) -> bool {
        match (txn, &engine.writer) {
            (Some(handle), Some(writer)) => {
                writer.session == self.id && writer.handles.contains(&handle)
            }
            _ => false,
        }
    }

    fn reposition(&mut self, cursor: NativeCursorId, pos: Option<Vec<u8>>) -> Result<()> {
        let cur = self
            .cursors
            .get_mut(&cursor)
            .ok_or_else(|| Error::misuse("unknown native cursor"))?;
        cur.pos = pos;
        cur.ghost = false;
        Ok(())
    }

    fn buffer_write(&mut self, txn: TxnId, key: Vec<u8>, value: Option<Vec<u8>>) -> Result<()> {
        let shared = self.shared.clone();
        let mut engine = shared.engine.lock();
        let cache_limit = engine.cache_limit;
        let Some(writer) = engine.writer.as_mut() else {
            return Err(Error::misuse("no write transaction is open"));
        };
        if writer.session != self.id || !writer.handles.contains(&txn) {
            return Err(Error::misuse("transaction handle is not open"));
        }
        let added = key.len() + value.as_ref().map(Vec::len).unwrap_or(0);
        if writer.buffered + added > cache_limit {
            return Err(translate(EngineCode::CacheFull(
                "write transaction exceeds the engine cache".into(),
            )));
        }
        writer.buffered += added;
        writer.writes.insert(key, value);
        Ok(())
    }
}

impl Session for LogSession {
    fn txn_begin(&mut self, parent: Option<TxnId>) -> Result<TxnId> {
        let shared = self.shared.clone();
        let mut engine = shared.engine.lock();
        let id = engine.alloc_txn_id();

        if let Some(writer) = &engine.writer {
            if writer.session != self.id {
                return Err(translate(EngineCode::Rollback(
                    "another connection holds the write transaction".into(),
                )));
            }
        }
        if let Some(writer) = engine.writer.as_mut() {
            // All levels share the session's single physical transaction:
            // a live parent handle nests, and a stale handle left over
            // from a rollback aliases back in so the restart keeps
            // working.
            writer.handles.push(id);
            trace!(txn = id, parent, "log txn handle nested");
            return Ok(id);
        }
        let read_ts = self.next_ts();
        engine.writer = Some(WriteTxn {
            session: self.id,
            handles: vec![id],
            writes: BTreeMap::new(),
            buffered: 0,
            prepared: None,
            read_ts,
        });
        trace!(txn = id, read_ts, "log txn begin");
        Ok(id)
    }

    fn txn_prepare(&mut self, txn: TxnId, _gid: Option<&[u8]>) -> Result<()> {
        let shared = self.shared.clone();
        let mut engine = shared.engine.lock();
        let Some(writer) = engine.writer.as_mut() else {
            return Ok(()); // physical transaction already gone
        };
        if writer.session != self.id {
            return Err(Error::misuse("transaction belongs to another session"));
        }
        if writer.prepared.is_some() {
            return Err(translate(EngineCode::PrepareConflict(
                "transaction is already prepared".into(),
            )));
        }
        let ts = self.next_ts();
        let writer = engine.writer.as_mut().expect("checked above");
        writer.prepared = Some(ts);
        trace!(txn, prepare_ts = ts, "log txn prepared");
        Ok(())
    }

    fn txn_commit(&mut self, txn: TxnId) -> Result<()> {
        let shared = self.shared.clone();
        let mut engine = shared.engine.lock();
        let Some(writer) = engine.writer.as_ref() else {
            return Ok(());
        };
        if writer.session != self.id {
            return Ok(());
        }
        let outermost = writer.handles.first() == Some(&txn);
        let live = writer.handles.contains(&txn);
        if live && !outermost {
            // Committing a nested handle just retires it; its writes stay
            // buffered in the physical transaction.
            let writer = engine.writer.as_mut().expect("checked above");
            let at = writer.handles.iter().position(|&h| h == txn).expect("live handle");
            writer.handles.truncate(at);
            trace!(txn, "log nested handle committed");
            return Ok(());
        }
        // Outermost or stale handle: apply the physical transaction.
        let writer = engine.writer.take().expect("checked above");
        engine.commit_physical(writer).map_err(translate)?;
        let ts = self.next_ts();
        trace!(txn, commit_ts = ts, "log txn committed");
        Ok(())
    }

    fn txn_abort(&mut self, txn: TxnId) -> Result<()> {
        let shared = self.shared.clone();
        let mut engine = shared.engine.lock();
        let Some(writer) = engine.writer.as_ref() else {
            return Ok(());
        };
        if writer.session != self.id {
            return Ok(());
        }
        // Nested aborts are not isolated here: any handle of the physical
        // transaction discards the whole write buffer.
        engine.writer = None;
        let ts = self.next_ts();
        trace!(txn, abort_ts = ts, "log txn aborted");
        Ok(())
    }

    fn cursor_open(&mut self, txn: Option<TxnId>) -> Result<NativeCursorId> {
        let id = self.next_cursor;
        self.next_cursor += 1;
        self.cursors.insert(id, Cursor { txn, pos: None, ghost: false });
        Ok(id)
    }

    fn cursor_close(&mut self, cursor: NativeCursorId) -> Result<()> {
        self.cursors.remove(&cursor);
        Ok(())
    }

    fn cursor_reset(&mut self, cursor: NativeCursorId) -> Result<()> {
        self.reposition(cursor, None)
    }

    fn cursor_search(&mut self, cursor: NativeCursorId, key: &[u8]) -> Result<()> {
        let txn = self.cursor(cursor)?.txn;
        let shared = self.shared.clone();
        let mut guard = shared.engine.lock();
        let visible = self.overlay_visible(&guard, txn);
        let engine = &mut *guard;
        let overlay = if visible { engine.writer.as_ref().map(|w| &w.writes) } else { None };
        let hit = live_value(&mut engine.backing, &engine.keydir, overlay, key)
            .map_err(translate)?;
        drop(guard);
        match hit {
            Some(_) => self.reposition(cursor, Some(key.to_vec())),
            None => {
                self.reposition(cursor, None)?;
                Err(Error::NotFound)
            }
        }
    }

    fn cursor_search_range(&mut self, cursor: NativeCursorId, key: &[u8]) -> Result<RangePos> {
        let txn = self.cursor(cursor)?.txn;
        let shared = self.shared.clone();
        let guard = shared.engine.lock();
        let visible = self.overlay_visible(&guard, txn);
        let overlay = if visible { guard.writer.as_ref().map(|w| &w.writes) } else { None };
        let ceiling =
            guard.first_live(overlay, (Bound::Included(key.to_vec()), Bound::Unbounded), false);
        if let Some(found) = ceiling {
            let pos = if found == key { RangePos::Exact } else { RangePos::After };
            drop(guard);
            self.reposition(cursor, Some(found))?;
            return Ok(pos);
        }
        // Nothing at or above the probe; land on the nearest entry below,
        // the way a search-near engine does.
        let floor =
            guard.first_live(overlay, (Bound::Unbounded, Bound::Excluded(key.to_vec())), true);
        drop(guard);
        match floor {
            Some(found) => {
                self.reposition(cursor, Some(found))?;
                Ok(RangePos::Before)
            }
            None => {
                self.reposition(cursor, None)?;
                Err(Error::NotFound)
            }
        }
    }

    fn cursor_next(&mut self, cursor: NativeCursorId) -> Result<()> {
        let (txn, pos) = {
            let cur = self.cursor(cursor)?;
            let pos =
                cur.pos.clone().ok_or_else(|| Error::misuse("cursor is not positioned"))?;
            (cur.txn, pos)
        };
        let shared = self.shared.clone();
        let guard = shared.engine.lock();
        let visible = self.overlay_visible(&guard, txn);
        let overlay = if visible { guard.writer.as_ref().map(|w| &w.writes) } else { None };
        let next = guard.first_live(overlay, (Bound::Excluded(pos), Bound::Unbounded), false);
        drop(guard);
        match next {
            Some(found) => self.reposition(cursor, Some(found)),
            None => Err(Error::NotFound),
        }
    }

    fn cursor_prev(&mut self, cursor: NativeCursorId) -> Result<()> {
        let (txn, pos) = {
            let cur = self.cursor(cursor)?;
            let pos =
                cur.pos.clone().ok_or_else(|| Error::misuse("cursor is not positioned"))?;
            (cur.txn, pos)
        };
        let shared = self.shared.clone();
        let guard = shared.engine.lock();
        let visible = self.overlay_visible(&guard, txn);
        let overlay = if visible { guard.writer.as_ref().map(|w| &w.writes) } else { None };
        let prev = guard.first_live(overlay, (Bound::Unbounded, Bound::Excluded(pos)), true);
        drop(guard);
        match prev {
            Some(found) => self.reposition(cursor, Some(found)),
            None => Err(Error::NotFound),
        }
    }

    fn cursor_last(&mut self, cursor: NativeCursorId) -> Result<()> {
        let txn = self.cursor(cursor)?.txn;
        let shared = self.shared.clone();
        let guard = shared.engine.lock();
        let visible = self.overlay_visible(&guard, txn);
        let overlay = if visible { guard.writer.as_ref().map(|w| &w.writes) } else { None };
        let last = guard.first_live(overlay, (Bound::Unbounded, Bound::Unbounded), true);
        drop(guard);
        match last {
            Some(found) => self.reposition(cursor, Some(found)),
            None => Err(Error::NotFound),
        }
    }

    fn cursor_key(&mut self, cursor: NativeCursorId, buf: &mut Vec<u8>) -> Result<()> {
        let (txn, pos, ghost) = {
            let cur = self.cursor(cursor)?;
            (cur.txn, cur.pos.clone(), cur.ghost)
        };
        if ghost {
            return Err(Error::NotFound);
        }
        let pos = pos.ok_or_else(|| Error::misuse("cursor is not positioned"))?;
        let shared = self.shared.clone();
        let mut guard = shared.engine.lock();
        let visible = self.overlay_visible(&guard, txn);
        let engine = &mut *guard;
        let overlay = if visible { engine.writer.as_ref().map(|w| &w.writes) } else { None };
        let value =
            live_value(&mut engine.backing, &engine.keydir, overlay, &pos).map_err(translate)?;
        if value.is_none() {
            return Err(Error::NotFound);
        }
        buf.clear();
        buf.extend_from_slice(&pos);
        Ok(())
    }

    fn cursor_value(&mut self, cursor: NativeCursorId, buf: &mut Vec<u8>) -> Result<()> {
        let (txn, pos, ghost) = {
            let cur = self.cursor(cursor)?;
            (cur.txn, cur.pos.clone(), cur.ghost)
        };
        if ghost {
            return Err(Error::NotFound);
        }
        let pos = pos.ok_or_else(|| Error::misuse("cursor is not positioned"))?;
        let shared = self.shared.clone();
        let mut guard = shared.engine.lock();
        let visible = self.overlay_visible(&guard, txn);
        let engine = &mut *guard;
        let overlay = if visible { engine.writer.as_ref().map(|w| &w.writes) } else { None };
        let value =
            live_value(&mut engine.backing, &engine.keydir, overlay, &pos).map_err(translate)?;
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
        let (txn, pos, ghost) = {
            let cur = self.cursor(cursor)?;
            (cur.txn, cur.pos.clone(), cur.ghost)
        };
        if ghost {
            return Err(Error::misuse("entry already deleted"));
        }
        let pos = pos.ok_or_else(|| Error::misuse("cursor is not positioned"))?;
        // An unbound cursor deletes through the session's open physical
        // transaction, the way a cursor opened before the write began
        // still writes through it.
        let txn = match txn {
            Some(txn) => txn,
            None => {
                let guard = self.shared.engine.lock();
                match &guard.writer {
                    Some(w) if w.session == self.id => {
                        *w.handles.last().expect("writer keeps at least one handle")
                    }
                    _ => {
                        return Err(Error::misuse(
                            "cursor is not bound to a write transaction",
                        ));
                    }
                }
            }
        };
        self.buffer_write(txn, pos, None)?;
        if let Some(cur) = self.cursors.get_mut(&cursor) {
            cur.ghost = true;
        }
        Ok(())
    }

    fn replace(&mut self, txn: TxnId, key: &[u8], value: &[u8]) -> Result<()> {
        self.buffer_write(txn, key.to_vec(), Some(value.to_vec()))
    }

    fn get_meta(&mut self) -> Result<u32> {
        Ok(self.shared.engine.lock().meta)
    }

    fn put_meta(&mut self, value: u32) -> Result<()> {
        self.shared.engine.lock().persist_meta(value).map_err(translate)
    }
}
