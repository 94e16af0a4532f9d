// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use std::collections::HashMap;
use std::sync::Arc;

use latticedb_core::{Error, Result};
use tracing::{debug, instrument, warn};

use crate::backend::{BackendFactory, Environment, NativeCursorId, OpenOptions, Session, TxnId};
use crate::context::EngineContext;
use crate::cursor::CursorState;
use crate::directory::DirectoryEntry;

/// Deepest transaction nesting a connection supports.
pub const MAX_TXN_DEPTH: usize = 16;

/// Version of the operation set [`KvStore`] exposes to the VM layer.
/// Bumped whenever the method contract changes shape.
pub const METHOD_SET_VERSION: u32 = 1;

/// ABI stamp of the store's method set: a version number plus the size of
/// the store object itself, so a caller compiled against a different
/// contract can detect the mismatch before using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSetStamp {
    pub version: u32,
    pub size: usize,
}

/// A native transaction open at one nesting level, together with the
/// cursor used for every access at that level.
#[derive(Clone, Copy)]
pub(crate) struct LevelTxn {
    pub txn: TxnId,
    pub cursor: NativeCursorId,
}

/// Connection-level control operations.
#[derive(Debug, Clone, Copy)]
pub enum ControlOp {
    /// Initial key-buffer capacity for cursors opened after this call.
    SetCursorKeyCapacity(usize),
    /// Initial value-buffer capacity for cursors opened after this call.
    SetCursorValueCapacity(usize),
}

/// One connection to a named store.
///
/// Level semantics: 0 = no transaction, 1 = read transaction (the shared
/// read cursor is sufficient), 2 and up = nested write transactions.
/// Invariants kept by every public operation: `levels[0]` and `levels[1]`
/// are always `None`; `levels[i]` for `2 <= i <= trans_level` is `Some`;
/// everything above `trans_level` is `None`; the read cursor is not used
/// for access while a write transaction is open.
pub struct KvStore {
    name: String,
    ctx: Arc<EngineContext>,
    /// `None` for temporary stores, which bypass the directory.
    entry: Option<Arc<DirectoryEntry>>,
    env: Arc<dyn Environment>,
    pub(crate) session: Box<dyn Session>,
    pub(crate) trans_level: usize,
    pub(crate) levels: [Option<LevelTxn>; MAX_TXN_DEPTH + 1],
    pub(crate) read_cursor: Option<NativeCursorId>,
    pub(crate) cursors: HashMap<u64, CursorState>,
    pub(crate) next_cursor_id: u64,
    pub(crate) key_capacity: usize,
    pub(crate) value_capacity: usize,
    read_only: bool,
    closed: bool,
}

impl KvStore {
    /// Open a connection to the store `name`, sharing the native
    /// environment with every other live connection using the same name in
    /// this context.
    pub fn open(
        ctx: &Arc<EngineContext>,
        factory: &dyn BackendFactory,
        name: &str,
        opts: OpenOptions,
    ) -> Result<KvStore> {
        if opts.temporary {
            let env = factory.open_env(name, &opts)?;
            let session = env.open_session()?;
            debug!(name, "opened temporary store");
            return Ok(Self::assemble(ctx, None, env, session, name, &opts));
        }

        let entry = ctx.directory().acquire(name);
        let mut state = entry.lock();
        if state.env.is_none() {
            match factory.open_env(name, &opts) {
                Ok(env) => state.env = Some(env),
                Err(e) => {
                    drop(state);
                    ctx.directory().evict_if_dead(name);
                    return Err(e);
                }
            }
        }
        let env = state.env.clone().expect("entry env populated above");
        state.refcount += 1;
        drop(state);

        let session = match env.open_session() {
            Ok(session) => session,
            Err(e) => {
                Self::release_entry(ctx, &entry, &env, name);
                return Err(e);
            }
        };
        debug!(name, "opened store connection");
        Ok(Self::assemble(ctx, Some(entry), env, session, name, &opts))
    }

    fn assemble(
        ctx: &Arc<EngineContext>,
        entry: Option<Arc<DirectoryEntry>>,
        env: Arc<dyn Environment>,
        session: Box<dyn Session>,
        name: &str,
        opts: &OpenOptions,
    ) -> KvStore {
        KvStore {
            name: name.to_owned(),
            ctx: ctx.clone(),
            entry,
            env,
            session,
            trans_level: 0,
            levels: [None; MAX_TXN_DEPTH + 1],
            read_cursor: None,
            cursors: HashMap::new(),
            next_cursor_id: 1,
            key_capacity: opts
                .cursor_key_capacity
                .unwrap_or_else(|| ctx.default_initial_cursor_key_capacity()),
            value_capacity: opts
                .cursor_value_capacity
                .unwrap_or_else(|| ctx.default_initial_cursor_value_capacity()),
            read_only: opts.read_only,
            closed: false,
        }
    }

    // Decrement the entry refcount; tear the environment down when this
    // was the last connection. Native errors on this path are logged and
    // swallowed so the close always completes.
    fn release_entry(
        ctx: &Arc<EngineContext>,
        entry: &Arc<DirectoryEntry>,
        env: &Arc<dyn Environment>,
        name: &str,
    ) {
        let mut state = entry.lock();
        state.refcount -= 1;
        let dead = state.refcount == 0;
        if dead {
            state.env = None;
        }
        drop(state);
        if dead {
            if let Err(e) = env.close() {
                warn!(name, error = %e, "environment close failed");
            }
            ctx.directory().evict_if_dead(name);
        }
    }

    /// Stamp callers check before driving the store through an opcode
    /// table compiled elsewhere.
    pub fn method_set_stamp() -> MethodSetStamp {
        MethodSetStamp { version: METHOD_SET_VERSION, size: std::mem::size_of::<KvStore>() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Current transaction nesting depth.
    pub fn trans_level(&self) -> usize {
        self.trans_level
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True while the shared read cursor is open. Exposed for invariant
    /// checks in tests and for the VM's cookie verification path.
    pub fn has_read_cursor(&self) -> bool {
        self.read_cursor.is_some()
    }

    /// True when a native transaction (and its per-level cursor) is open
    /// at `level`.
    pub fn level_is_open(&self, level: usize) -> bool {
        level <= MAX_TXN_DEPTH && self.levels[level].is_some()
    }

    pub fn control(&mut self, op: ControlOp) -> Result<()> {
        match op {
            ControlOp::SetCursorKeyCapacity(bytes) => self.key_capacity = bytes.max(1),
            ControlOp::SetCursorValueCapacity(bytes) => self.value_capacity = bytes.max(1),
        }
        Ok(())
    }

    /// Enter transaction level `level`, opening a native write transaction
    /// per new level at and above 2. Re-entry at the current level with an
    /// open transaction is idempotent.
    #[instrument(level = "trace", skip(self), fields(store = %self.name))]
    pub fn begin(&mut self, level: usize) -> Result<()> {
        if level > MAX_TXN_DEPTH {
            return Err(Error::misuse("transaction nesting too deep"));
        }
        if self.read_cursor.is_none() {
            match self.session.cursor_open(None) {
                Ok(c) => self.read_cursor = Some(c),
                Err(e) => return Err(e),
            }
        }
        if level >= 2
            && (level > self.trans_level
                || (level == self.trans_level && self.levels[level].is_none()))
        {
            // Parent is the nearest open transaction at or below the
            // current level; with no write transaction open the new one is
            // parentless.
            let parent = (0..=self.trans_level.min(MAX_TXN_DEPTH))
                .rev()
                .find_map(|i| self.levels[i].map(|lt| lt.txn));
            let txn = match self.session.txn_begin(parent) {
                Ok(txn) => txn,
                Err(e) => {
                    self.drop_read_cursor_on_begin_failure();
                    return Err(e);
                }
            };
            let cursor = match self.session.cursor_open(Some(txn)) {
                Ok(cursor) => cursor,
                Err(e) => {
                    if let Err(abort) = self.session.txn_abort(txn) {
                        warn!(store = %self.name, error = %abort, "abort after failed cursor open");
                    }
                    self.drop_read_cursor_on_begin_failure();
                    return Err(e);
                }
            };
            self.levels[level] = Some(LevelTxn { txn, cursor });
        }
        self.trans_level = self.trans_level.max(level);
        Ok(())
    }

    fn drop_read_cursor_on_begin_failure(&mut self) {
        if self.trans_level == 0 {
            if let Some(c) = self.read_cursor.take() {
                if let Err(e) = self.session.cursor_close(c) {
                    warn!(store = %self.name, error = %e, "read cursor close failed");
                }
            }
        }
    }

    /// Phase one of two-phase commit: prepare the lowest open transaction
    /// above `level`, but only when it has no surviving ancestor — a
    /// nested candidate's fate belongs to its outermost parent and phase
    /// one is a no-op for it.
    #[instrument(level = "trace", skip(self), fields(store = %self.name))]
    pub fn commit_phase_one(&mut self, level: usize) -> Result<()> {
        self.phase_one(level, None)
    }

    /// Like [`KvStore::commit_phase_one`] with a caller-supplied global
    /// transaction identifier.
    pub fn commit_phase_one_with_xid(&mut self, level: usize, xid: &[u8]) -> Result<()> {
        self.phase_one(level, Some(xid))
    }

    fn phase_one(&mut self, level: usize, xid: Option<&[u8]>) -> Result<()> {
        if self.trans_level > level && self.trans_level >= 2 {
            if let Some(candidate) = self.candidate_above(level) {
                let nested = (0..=level).rev().any(|i| self.levels[i].is_some());
                if !nested {
                    self.session.txn_prepare(candidate.txn, xid)?;
                }
            }
        }
        Ok(())
    }

    // The prepare/commit candidate is the lowest open transaction above
    // `level`; committing it commits everything nested inside it.
    fn candidate_above(&self, level: usize) -> Option<LevelTxn> {
        ((level + 1)..=self.trans_level.min(MAX_TXN_DEPTH)).find_map(|i| self.levels[i])
    }

    /// Phase two: commit the candidate above `level` (the backend commits
    /// its whole nested subtree atomically), close every per-level cursor
    /// above `level`, and land on `level`.
    #[instrument(level = "trace", skip(self), fields(store = %self.name))]
    pub fn commit_phase_two(&mut self, level: usize) -> Result<()> {
        if self.trans_level > level && self.trans_level >= 2 {
            if let Some(candidate) = self.candidate_above(level) {
                self.session.txn_commit(candidate.txn)?;
            }
            for i in (level + 1)..=self.trans_level.min(MAX_TXN_DEPTH) {
                if let Some(lt) = self.levels[i].take() {
                    if let Err(e) = self.session.cursor_close(lt.cursor) {
                        warn!(store = %self.name, level = i, error = %e, "level cursor close failed");
                    }
                }
            }
        }
        if level == 0 {
            self.close_read_cursor();
        }
        if level < self.trans_level {
            self.trans_level = level;
        }
        Ok(())
    }

    /// Both commit phases in order.
    pub fn commit(&mut self, level: usize) -> Result<()> {
        self.commit_phase_one(level)?;
        self.commit_phase_two(level)
    }

    /// Abort every transaction at `level` and above, then immediately
    /// re-open a transaction at `level` so the caller continues inside a
    /// fresh savepoint at the same logical depth. Per-level abort failures
    /// are recorded but do not stop the teardown.
    #[instrument(level = "trace", skip(self), fields(store = %self.name))]
    pub fn rollback(&mut self, level: usize) -> Result<()> {
        if self.trans_level < level {
            return Ok(());
        }
        let mut first_err: Option<Error> = None;
        if self.trans_level >= 2 {
            for i in (level..=self.trans_level.min(MAX_TXN_DEPTH)).rev() {
                if let Some(lt) = self.levels[i].take() {
                    if let Err(e) = self.session.cursor_close(lt.cursor) {
                        warn!(store = %self.name, level = i, error = %e, "level cursor close failed");
                    }
                    if let Err(e) = self.session.txn_abort(lt.txn) {
                        warn!(store = %self.name, level = i, error = %e, "transaction abort failed");
                        first_err.get_or_insert(e);
                    }
                }
            }
        }
        if level == 0 {
            self.close_read_cursor();
        }
        self.trans_level = level.saturating_sub(1);
        let restart = self.begin(level);
        match first_err {
            Some(e) => Err(e),
            None => restart,
        }
    }

    /// Discard all effects down to the parent savepoint, then re-open a
    /// transaction at `level`: the savepoint itself stays alive while
    /// everything after it is undone.
    pub fn revert(&mut self, level: usize) -> Result<()> {
        if level < 1 {
            return Err(Error::misuse("revert needs an enclosing savepoint"));
        }
        self.rollback(level - 1)?;
        self.begin(level)
    }

    /// Insert or overwrite one entry through the current write
    /// transaction.
    pub fn replace(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly(format!("store {} is read-only", self.name)));
        }
        let lt = if self.trans_level >= 2 { self.levels[self.trans_level] } else { None };
        let lt = lt.ok_or_else(|| Error::misuse("replace requires an open write transaction"))?;
        self.session.replace(lt.txn, key, value)
    }

    /// Read the schema cookie.
    pub fn get_meta(&mut self) -> Result<u32> {
        self.session.get_meta()
    }

    /// Write the schema cookie.
    pub fn put_meta(&mut self, value: u32) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly(format!("store {} is read-only", self.name)));
        }
        self.session.put_meta(value)
    }

    pub(crate) fn close_read_cursor(&mut self) {
        if let Some(c) = self.read_cursor.take() {
            if let Err(e) = self.session.cursor_close(c) {
                warn!(store = %self.name, error = %e, "read cursor close failed");
            }
        }
    }

    fn close_impl(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Cursor handles first, then open transactions, then the session's
        // read cursor: the reverse of construction order, so no native
        // cursor outlives its transaction.
        self.cursors.clear();
        if self.trans_level >= 2 {
            for i in (2..=self.trans_level.min(MAX_TXN_DEPTH)).rev() {
                if let Some(lt) = self.levels[i].take() {
                    if let Err(e) = self.session.cursor_close(lt.cursor) {
                        warn!(store = %self.name, level = i, error = %e, "level cursor close failed");
                    }
                    if let Err(e) = self.session.txn_abort(lt.txn) {
                        warn!(store = %self.name, level = i, error = %e, "abort on close failed");
                    }
                }
            }
        }
        self.trans_level = 0;
        self.close_read_cursor();
        match self.entry.take() {
            Some(entry) => Self::release_entry(&self.ctx, &entry, &self.env, &self.name),
            None => {
                if let Err(e) = self.env.close() {
                    warn!(store = %self.name, error = %e, "temporary environment close failed");
                }
            }
        }
        debug!(store = %self.name, "closed store connection");
    }

    /// Close the connection. Uncommitted work is rolled back; native
    /// errors on the close path are logged, never returned.
    pub fn close(mut self) {
        self.close_impl();
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        self.close_impl();
    }
}
