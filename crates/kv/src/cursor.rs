// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use latticedb_core::{Error, Result};

use crate::backend::{NativeCursorId, RangePos};
use crate::store::KvStore;

/// Opaque handle of an open KV cursor. All operations go through the
/// owning [`KvStore`], which resolves the handle to the right native
/// cursor slot; closing a handle therefore releases exactly the slot it
/// references and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KvCursorId(pub(crate) u64);

/// Requested seek direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDir {
    /// Exact match only.
    Eq,
    /// Largest entry at or below the target.
    Le,
    /// Smallest entry at or above the target.
    Ge,
}

/// How a successful seek landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekResult {
    /// The cursor sits on the target key itself.
    Exact,
    /// The cursor sits on the nearest feasible entry in the requested
    /// direction.
    Inexact,
}

/// Last-seek memory. Only EQ/GE/LE are ever produced by `seek` itself;
/// GT/LT exist because the legality sets of `next`/`prev` are defined over
/// the full direction alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LastSeek {
    None,
    Eq,
    #[allow(dead_code)]
    Gt,
    Ge,
    #[allow(dead_code)]
    Lt,
    Le,
}

/// Which native cursor a KV cursor handle reads through: the connection's
/// shared read cursor while no write transaction is open, or the per-level
/// transaction cursor otherwise.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Slot {
    Read,
    Level(usize),
}

pub(crate) struct CursorState {
    pub slot: Slot,
    pub key_buf: Vec<u8>,
    pub value_buf: Vec<u8>,
    pub has_cache: bool,
    pub is_eof: bool,
    pub last_seek: LastSeek,
}

impl CursorState {
    fn new(slot: Slot, key_capacity: usize, value_capacity: usize) -> Self {
        Self {
            slot,
            key_buf: Vec::with_capacity(key_capacity),
            value_buf: Vec::with_capacity(value_capacity),
            has_cache: false,
            is_eof: false,
            last_seek: LastSeek::None,
        }
    }

    fn invalidate_cache(&mut self) {
        self.has_cache = false;
        self.key_buf.clear();
        self.value_buf.clear();
    }
}

impl KvStore {
    /// Open a cursor. At transaction level 0 or 1 the handle shares the
    /// connection's read cursor (created lazily); at write levels it is
    /// bound to the current level's transaction cursor.
    pub fn open_cursor(&mut self) -> Result<KvCursorId> {
        let slot = if self.trans_level <= 1 {
            if self.read_cursor.is_none() {
                let c = self.session.cursor_open(None)?;
                self.read_cursor = Some(c);
            }
            Slot::Read
        } else {
            if self.levels[self.trans_level].is_none() {
                return Err(Error::misuse("no transaction cursor at the current level"));
            }
            Slot::Level(self.trans_level)
        };
        let id = self.next_cursor_id;
        self.next_cursor_id += 1;
        self.cursors
            .insert(id, CursorState::new(slot, self.key_capacity, self.value_capacity));
        Ok(KvCursorId(id))
    }

    /// Close a cursor handle. If the handle references the connection's
    /// read cursor, the underlying native cursor is closed and the slot
    /// cleared; per-level native cursors stay with their transaction.
    pub fn close_cursor(&mut self, cursor: KvCursorId) -> Result<()> {
        let state = self
            .cursors
            .remove(&cursor.0)
            .ok_or_else(|| Error::misuse("cursor is already closed"))?;
        match state.slot {
            Slot::Read => {
                if let Some(c) = self.read_cursor.take() {
                    self.session.cursor_close(c)?;
                }
                Ok(())
            }
            Slot::Level(_) => Ok(()),
        }
    }

    /// Clear cached state and ask the backend to release row locks; the
    /// cursor stays open and unpositioned.
    pub fn reset_cursor(&mut self, cursor: KvCursorId) -> Result<()> {
        let slot = self.state(cursor)?.slot;
        let st = self.state_mut(cursor)?;
        st.invalidate_cache();
        st.is_eof = false;
        st.last_seek = LastSeek::None;
        if let Ok(native) = self.native_of(slot) {
            self.session.cursor_reset(native)?;
        }
        Ok(())
    }

    /// Position the cursor at `key` (EQ), or at the nearest entry at-or-
    /// after (GE) / at-or-before (LE) it. A miss leaves the cursor at EOF
    /// with no seek memory.
    pub fn seek(&mut self, cursor: KvCursorId, key: &[u8], dir: SeekDir) -> Result<SeekResult> {
        let slot = self.state(cursor)?.slot;
        let native = self.native_of(slot)?;
        {
            let st = self.state_mut(cursor)?;
            st.invalidate_cache();
            st.is_eof = true;
            st.last_seek = LastSeek::None;
        }
        let outcome = match dir {
            SeekDir::Eq => self.session.cursor_search(native, key).map(|_| SeekResult::Exact),
            SeekDir::Ge => self.seek_ge(native, key),
            SeekDir::Le => self.seek_le(native, key),
        };
        if outcome.is_ok() {
            let st = self.state_mut(cursor)?;
            st.is_eof = false;
            st.last_seek = match dir {
                SeekDir::Eq => LastSeek::Eq,
                SeekDir::Ge => LastSeek::Ge,
                SeekDir::Le => LastSeek::Le,
            };
        }
        outcome
    }

    fn seek_ge(&mut self, native: NativeCursorId, key: &[u8]) -> Result<SeekResult> {
        match self.session.cursor_search_range(native, key)? {
            RangePos::Exact => Ok(SeekResult::Exact),
            RangePos::After => Ok(SeekResult::Inexact),
            RangePos::Before => {
                // The engine landed below the target; walk forward until
                // at or past it.
                let mut current = Vec::new();
                loop {
                    self.session.cursor_next(native)?;
                    current.clear();
                    self.session.cursor_key(native, &mut current)?;
                    if current.as_slice() >= key {
                        return Ok(SeekResult::Inexact);
                    }
                }
            }
        }
    }

    fn seek_le(&mut self, native: NativeCursorId, key: &[u8]) -> Result<SeekResult> {
        match self.session.cursor_search_range(native, key) {
            Ok(RangePos::Exact) => Ok(SeekResult::Exact),
            Ok(RangePos::Before) => Ok(SeekResult::Inexact),
            Ok(RangePos::After) => {
                // Landed above the target; walk backwards until at or
                // below it.
                let mut current = Vec::new();
                loop {
                    self.session.cursor_prev(native)?;
                    current.clear();
                    self.session.cursor_key(native, &mut current)?;
                    if current.as_slice() <= key {
                        return Ok(SeekResult::Inexact);
                    }
                }
            }
            Err(Error::NotFound) => {
                // Nothing at or above the target. The last entry, if any,
                // is the nearest below.
                self.session.cursor_last(native)?;
                let mut current = Vec::new();
                self.session.cursor_key(native, &mut current)?;
                if current.as_slice() <= key {
                    Ok(SeekResult::Inexact)
                } else {
                    Err(Error::NotFound)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Step to the next entry. Legal only after an EQ/GE-family seek and
    /// while not at EOF.
    pub fn next(&mut self, cursor: KvCursorId) -> Result<()> {
        let slot = {
            let st = self.state(cursor)?;
            if !matches!(st.last_seek, LastSeek::Eq | LastSeek::Gt | LastSeek::Ge) {
                return Err(Error::Mismatch);
            }
            if st.is_eof {
                return Err(Error::misuse("cursor is at end"));
            }
            st.slot
        };
        let native = self.native_of(slot)?;
        let res = self.session.cursor_next(native);
        let st = self.state_mut(cursor)?;
        st.invalidate_cache();
        match res {
            Ok(()) => {
                st.is_eof = false;
                Ok(())
            }
            Err(e) => {
                st.is_eof = true;
                Err(e)
            }
        }
    }

    /// Step to the previous entry. Legal only after an EQ/LE-family seek
    /// and while not at EOF.
    pub fn prev(&mut self, cursor: KvCursorId) -> Result<()> {
        let slot = {
            let st = self.state(cursor)?;
            if !matches!(st.last_seek, LastSeek::Eq | LastSeek::Lt | LastSeek::Le) {
                return Err(Error::Mismatch);
            }
            if st.is_eof {
                return Err(Error::misuse("cursor is at end"));
            }
            st.slot
        };
        let native = self.native_of(slot)?;
        let res = self.session.cursor_prev(native);
        let st = self.state_mut(cursor)?;
        st.invalidate_cache();
        match res {
            Ok(()) => {
                st.is_eof = false;
                Ok(())
            }
            Err(e) => {
                st.is_eof = true;
                Err(e)
            }
        }
    }

    /// Current key, served from the cursor's cache (populated together
    /// with the value on first access).
    pub fn key(&mut self, cursor: KvCursorId) -> Result<&[u8]> {
        self.load_cache(cursor)?;
        Ok(&self.cursors[&cursor.0].key_buf)
    }

    /// Current value.
    pub fn value(&mut self, cursor: KvCursorId) -> Result<&[u8]> {
        self.load_cache(cursor)?;
        Ok(&self.cursors[&cursor.0].value_buf)
    }

    /// Slice `[offset, offset + len)` of the current value, clipped to the
    /// value's size. A negative `len` means the whole value.
    pub fn value_range(&mut self, cursor: KvCursorId, offset: usize, len: i64) -> Result<&[u8]> {
        self.load_cache(cursor)?;
        let value = &self.cursors[&cursor.0].value_buf;
        if len < 0 {
            return Ok(&value[..]);
        }
        let start = offset.min(value.len());
        let end = offset.saturating_add(len as usize).min(value.len());
        Ok(&value[start..end])
    }

    /// Delete the entry under the cursor. The backend keeps a ghost
    /// position, so the next `next`/`prev` lands on the neighbour in that
    /// direction.
    pub fn delete(&mut self, cursor: KvCursorId) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnly(format!("store {} is read-only", self.name())));
        }
        let slot = self.state(cursor)?.slot;
        let native = self.native_of(slot)?;
        let res = self.session.cursor_remove(native);
        let st = self.state_mut(cursor)?;
        st.invalidate_cache();
        res
    }

    /// True once the cursor has stepped past either end.
    pub fn is_eof(&self, cursor: KvCursorId) -> bool {
        self.cursors.get(&cursor.0).map(|st| st.is_eof).unwrap_or(true)
    }

    fn load_cache(&mut self, cursor: KvCursorId) -> Result<()> {
        let (slot, cached) = {
            let st = self.state(cursor)?;
            (st.slot, st.has_cache)
        };
        if cached {
            return Ok(());
        }
        let native = self.native_of(slot)?;
        let st = self
            .cursors
            .get_mut(&cursor.0)
            .expect("cursor state checked above");
        st.key_buf.clear();
        st.value_buf.clear();
        if let Err(e) = self.session.cursor_key(native, &mut st.key_buf) {
            st.has_cache = false;
            if matches!(e, Error::NotFound) {
                st.is_eof = true;
            }
            return Err(e);
        }
        if let Err(e) = self.session.cursor_value(native, &mut st.value_buf) {
            st.has_cache = false;
            if matches!(e, Error::NotFound) {
                st.is_eof = true;
            }
            return Err(e);
        }
        st.has_cache = true;
        st.is_eof = false;
        Ok(())
    }

    fn state(&self, cursor: KvCursorId) -> Result<&CursorState> {
        self.cursors
            .get(&cursor.0)
            .ok_or_else(|| Error::misuse("cursor is closed"))
    }

    fn state_mut(&mut self, cursor: KvCursorId) -> Result<&mut CursorState> {
        self.cursors
            .get_mut(&cursor.0)
            .ok_or_else(|| Error::misuse("cursor is closed"))
    }

    fn native_of(&self, slot: Slot) -> Result<NativeCursorId> {
        match slot {
            Slot::Read => self
                .read_cursor
                .ok_or_else(|| Error::misuse("read cursor is closed")),
            Slot::Level(level) => self.levels[level]
                .map(|lt| lt.cursor)
                .ok_or_else(|| Error::misuse("transaction cursor is closed")),
        }
    }
}
