// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use latticedb_core::encoding::{
    decode_column, decode_int, decode_root, encode_key, encode_record, get_varint, put_varint,
    varint_len,
};
use latticedb_core::{Error, KeyInfo, Result, Value};
use latticedb_kv::{KvCursorId, KvStore, SeekDir, SeekResult};
use tracing::trace;

use crate::affinity::{Affinity, apply_affinity};
use crate::database::Database;
use crate::program::{Op, ProbeSrc, SavepointOp};
use crate::vmcursor::VmCursor;

enum Flow {
    Step,
    Jump(usize),
    Halt,
}

/// One prepared program over a connection. Registers and the cursor table
/// are owned by the program; the savepoint stack lives on the connection.
pub struct Vm<'db> {
    db: &'db mut Database,
    ops: Vec<Op>,
    pub regs: Vec<Value>,
    cursors: Vec<Option<VmCursor>>,
    /// Statement sub-transactions opened by Transaction opcodes, resolved
    /// when the program halts.
    stmt: Vec<(usize, usize)>,
    pub n_change: i64,
    /// Set when cookie verification failed; the program must be
    /// re-prepared.
    pub expired: bool,
}

impl<'db> Vm<'db> {
    pub fn new(db: &'db mut Database, ops: Vec<Op>, n_regs: usize, n_cursors: usize) -> Self {
        Vm {
            db,
            ops,
            regs: vec![Value::Null; n_regs],
            cursors: (0..n_cursors).map(|_| None).collect(),
            stmt: Vec::new(),
            n_change: 0,
            expired: false,
        }
    }

    /// Run to completion. Statement sub-transactions commit into their
    /// surroundings on success and are discarded on failure; the failure
    /// itself is returned either way.
    pub fn run(&mut self) -> Result<()> {
        let mut result = self.dispatch_loop();
        let stmt = std::mem::take(&mut self.stmt);
        for (db, level) in stmt.into_iter().rev() {
            let closed = self.db.close_statement(db, level, result.is_ok());
            if result.is_ok() {
                result = closed;
            }
        }
        result
    }

    fn dispatch_loop(&mut self) -> Result<()> {
        let mut pc = 0usize;
        while pc < self.ops.len() {
            // Interruption is only observed between opcodes; a single KV
            // call always runs to completion.
            if self.db.is_interrupted() {
                return Err(Error::Other("interrupted".into()));
            }
            let op = self.ops[pc].clone();
            trace!(pc, ?op, "dispatch");
            match self.step(pc, op)? {
                Flow::Step => pc += 1,
                Flow::Jump(target) => pc = target,
                Flow::Halt => break,
            }
        }
        Ok(())
    }

    fn step(&mut self, pc: usize, op: Op) -> Result<Flow> {
        match op {
            Op::Null { dest } => {
                self.regs[dest] = Value::Null;
                Ok(Flow::Step)
            }
            Op::Integer { value, dest } => {
                self.regs[dest] = Value::Int(value);
                Ok(Flow::Step)
            }
            Op::Real { value, dest } => {
                self.regs[dest] = Value::Real(value);
                Ok(Flow::Step)
            }
            Op::String { value, dest } => {
                self.regs[dest] = Value::Text(value);
                Ok(Flow::Step)
            }
            Op::Blob { value, dest } => {
                self.regs[dest] = Value::Blob(value);
                Ok(Flow::Step)
            }
            Op::Goto { target } => Ok(Flow::Jump(target)),
            Op::Halt => Ok(Flow::Halt),

            Op::Transaction { db, write, needs_stmt } => self.op_transaction(db, write, needs_stmt),
            Op::Savepoint { op, name } => self.op_savepoint(op, name),
            Op::FkCounter { delta } => {
                self.db.n_deferred_cons += delta;
                Ok(Flow::Step)
            }

            Op::OpenRead { cursor, db, root, root_reg, key_info } => {
                self.op_open(cursor, db, root, root_reg, key_info, false)
            }
            Op::OpenWrite { cursor, db, root, root_reg, key_info } => {
                self.op_open(cursor, db, root, root_reg, key_info, true)
            }
            Op::Close { cursor } => {
                if let Some(c) = self.cursors.get_mut(cursor).and_then(Option::take) {
                    self.db.kv(c.db)?.close_cursor(c.kv)?;
                }
                Ok(Flow::Step)
            }

            Op::MakeKey { first, count, dest, cursor, seq, affinities } => {
                self.op_make_key(pc, first, count, dest, cursor, seq, affinities)
            }
            Op::MakeRecord { first, count, dest, affinities, permutation } => {
                self.op_make_record(first, count, dest, affinities, permutation)?;
                Ok(Flow::Step)
            }

            Op::Insert { cursor, key_reg, data_reg, count_change } => {
                self.op_insert(cursor, key_reg, data_reg, count_change)
            }
            Op::Delete { cursor, count_change } => {
                let c = self.cursor(cursor)?;
                if !c.writable {
                    return Err(Error::ReadOnly("cursor was opened read-only".into()));
                }
                let (db, kv) = (c.db, c.kv);
                self.db.kv(db)?.delete(kv)?;
                if count_change {
                    self.n_change += 1;
                }
                Ok(Flow::Step)
            }
            Op::IdxDelete { cursor, key_reg } => {
                let c = self.cursor(cursor)?;
                let (db, kv) = (c.db, c.kv);
                let key = blob_of(&self.regs, key_reg)?.to_vec();
                let store = self.db.kv(db)?;
                match store.seek(kv, &key, SeekDir::Eq) {
                    Ok(_) => store.delete(kv)?,
                    Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
                Ok(Flow::Step)
            }
            Op::Clear { db, root, count_change } => self.op_clear(db, root, count_change),

            Op::SeekLt { cursor, target, first, count } => {
                self.op_seek(cursor, target, first, count, Comparison::Lt)
            }
            Op::SeekLe { cursor, target, first, count } => {
                self.op_seek(cursor, target, first, count, Comparison::Le)
            }
            Op::SeekGe { cursor, target, first, count } => {
                self.op_seek(cursor, target, first, count, Comparison::Ge)
            }
            Op::SeekGt { cursor, target, first, count } => {
                self.op_seek(cursor, target, first, count, Comparison::Gt)
            }

            Op::Found { cursor, target, probe } => {
                let exists = self.probe_exists(cursor, probe)?;
                Ok(if exists { Flow::Jump(target) } else { Flow::Step })
            }
            Op::NotFound { cursor, target, probe } => {
                let exists = self.probe_exists(cursor, probe)?;
                Ok(if exists { Flow::Step } else { Flow::Jump(target) })
            }
            Op::NotExists { cursor, target, reg } => {
                let exists = self.probe_exists(cursor, ProbeSrc::Fields { first: reg, count: 1 })?;
                Ok(if exists { Flow::Step } else { Flow::Jump(target) })
            }
            Op::IsUnique { cursor, target, probe_reg, out_reg } => {
                self.op_is_unique(cursor, target, probe_reg, out_reg)
            }

            Op::IdxLt { cursor, target, probe_reg } => {
                self.op_idx_compare(cursor, target, probe_reg, Comparison::Lt)
            }
            Op::IdxLe { cursor, target, probe_reg } => {
                self.op_idx_compare(cursor, target, probe_reg, Comparison::Le)
            }
            Op::IdxGe { cursor, target, probe_reg } => {
                self.op_idx_compare(cursor, target, probe_reg, Comparison::Ge)
            }
            Op::IdxGt { cursor, target, probe_reg } => {
                self.op_idx_compare(cursor, target, probe_reg, Comparison::Gt)
            }

            Op::Next { cursor, target } => self.op_step_cursor(cursor, target, true),
            Op::Prev { cursor, target } => self.op_step_cursor(cursor, target, false),
            Op::Rewind { cursor, target } => self.op_edge(cursor, target, true),
            Op::Last { cursor, target } => self.op_edge(cursor, target, false),

            Op::RowKey { cursor, dest } => {
                let c = self.cursor(cursor)?;
                if c.null_row {
                    return Err(Error::misuse("cursor points at no row"));
                }
                let (db, kv) = (c.db, c.kv);
                let key = self.db.kv(db)?.key(kv)?.to_vec();
                self.regs[dest] = Value::Blob(key);
                Ok(Flow::Step)
            }
            Op::RowData { cursor, dest } => {
                let c = self.cursor(cursor)?;
                if c.null_row {
                    return Err(Error::misuse("cursor points at no row"));
                }
                let (db, kv) = (c.db, c.kv);
                let value = self.db.kv(db)?.value(kv)?.to_vec();
                self.regs[dest] = Value::Blob(value);
                Ok(Flow::Step)
            }
            Op::Column { cursor, column, dest, default } => {
                let c = self.cursor(cursor)?;
                if c.null_row {
                    self.regs[dest] = default.unwrap_or(Value::Null);
                    return Ok(Flow::Step);
                }
                let (db, kv) = (c.db, c.kv);
                let value = self.db.kv(db)?.value(kv)?.to_vec();
                self.regs[dest] = decode_column(&value, column, default.as_ref())?;
                Ok(Flow::Step)
            }
            Op::Rowid { cursor, dest } => {
                let c = self.cursor(cursor)?;
                if c.null_row {
                    self.regs[dest] = Value::Null;
                    return Ok(Flow::Step);
                }
                let (db, kv) = (c.db, c.kv);
                let key = self.db.kv(db)?.key(kv)?.to_vec();
                let (_, consumed) = decode_root(&key)?;
                let (rowid, _) = decode_int(&key[consumed..])?;
                self.regs[dest] = Value::Int(rowid);
                Ok(Flow::Step)
            }

            Op::NewRowid { cursor, dest, min_reg } => self.op_new_rowid(cursor, dest, min_reg),
            Op::NewIdxid { db, reg } => self.op_new_idxid(db, reg),

            Op::ReadCookie { db, dest } => {
                let meta = self.db.kv(db)?.get_meta()?;
                self.regs[dest] = Value::Int(meta as i64);
                Ok(Flow::Step)
            }
            Op::SetCookie { db, value_reg } => {
                let value = int_of(&self.regs, value_reg)? as u32;
                self.db.kv(db)?.put_meta(value)?;
                self.db.stores[db].cookie_cache = value;
                Ok(Flow::Step)
            }
            Op::VerifyCookie { db, cookie, generation } => {
                let meta = self.db.kv(db)?.get_meta()?;
                let current = self.db.stores[db].generation;
                self.db.stores[db].cookie_cache = meta;
                if meta != cookie || current != generation {
                    self.expired = true;
                    return Err(Error::Other("database schema has changed".into()));
                }
                Ok(Flow::Step)
            }
        }
    }

    fn cursor(&self, i: usize) -> Result<&VmCursor> {
        self.cursors
            .get(i)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::misuse("cursor is not open"))
    }

    fn cursor_mut(&mut self, i: usize) -> Result<&mut VmCursor> {
        self.cursors
            .get_mut(i)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::misuse("cursor is not open"))
    }

    fn op_transaction(&mut self, db: usize, write: bool, needs_stmt: bool) -> Result<Flow> {
        if !write {
            let store = self.db.kv(db)?;
            if store.trans_level() == 0 {
                store.begin(1)?;
            }
            return Ok(Flow::Step);
        }
        let level = self.db.n_savepoint().max(1) + 1;
        let level = level.max(2);
        let open_stmt = needs_stmt && self.db.n_savepoint() > 0;
        let store = self.db.kv(db)?;
        if store.trans_level() < level {
            store.begin(level)?;
        }
        if open_stmt {
            let stmt_level = store.trans_level() + 1;
            store.begin(stmt_level)?;
            self.stmt.push((db, stmt_level));
        }
        Ok(Flow::Step)
    }

    fn op_savepoint(&mut self, op: SavepointOp, name: Option<String>) -> Result<Flow> {
        match op {
            SavepointOp::Begin => {
                if name.is_none() && !self.db.savepoints.is_empty() {
                    return Err(Error::Other(
                        "cannot start a transaction within a transaction".into(),
                    ));
                }
                self.db.savepoints.push(crate::database::Savepoint {
                    name,
                    deferred_cons: self.db.n_deferred_cons,
                });
                Ok(Flow::Step)
            }
            SavepointOp::Release | SavepointOp::Rollback => {
                let anonymous = name.is_none();
                let idx = match &name {
                    Some(n) => self
                        .db
                        .savepoints
                        .iter()
                        .rposition(|s| s.name.as_deref() == Some(n.as_str())),
                    None => (!self.db.savepoints.is_empty()).then_some(0),
                };
                let Some(idx) = idx else {
                    return Err(match (&name, op) {
                        (Some(n), _) => Error::Other(format!("no such savepoint: {n}")),
                        (None, SavepointOp::Release) => {
                            Error::Other("cannot commit - no transaction is active".into())
                        }
                        (None, _) => {
                            Error::Other("cannot rollback - no transaction is active".into())
                        }
                    });
                };
                let depth = idx + 2;
                if op == SavepointOp::Release {
                    if depth == 2 && self.db.n_deferred_cons > 0 {
                        return Err(Error::Constraint(
                            "deferred foreign key constraints are outstanding".into(),
                        ));
                    }
                    self.db.commit_to(depth - 1)?;
                    self.db.savepoints.truncate(idx);
                } else {
                    let level = if anonymous { depth - 1 } else { depth };
                    self.db.rollback_to(level)?;
                    self.db.n_deferred_cons = self.db.savepoints[idx].deferred_cons;
                    if anonymous {
                        self.db.savepoints.clear();
                    } else {
                        self.db.savepoints.truncate(idx + 1);
                    }
                }
                Ok(Flow::Step)
            }
        }
    }

    fn op_open(
        &mut self,
        cursor: usize,
        db: usize,
        root: u64,
        root_reg: Option<usize>,
        key_info: KeyInfo,
        writable: bool,
    ) -> Result<Flow> {
        if self.expired {
            return Err(Error::Other("prepared program is expired".into()));
        }
        let root = match root_reg {
            Some(reg) => {
                let v = int_of(&self.regs, reg)?;
                // Register roots come from NewIdxid, which never yields
                // less than 2; anything else is stored corruption.
                if v < 2 {
                    return Err(Error::corrupt("root register holds an invalid root"));
                }
                v as u64
            }
            None => root,
        };
        if cursor >= self.cursors.len() {
            return Err(Error::misuse("cursor index out of range"));
        }
        if let Some(old) = self.cursors[cursor].take() {
            self.db.kv(old.db)?.close_cursor(old.kv)?;
        }
        let kv = self.db.kv(db)?.open_cursor()?;
        self.cursors[cursor] = Some(VmCursor::new(db, root, key_info, kv, writable));
        Ok(Flow::Step)
    }

    fn op_make_key(
        &mut self,
        pc: usize,
        first: usize,
        count: usize,
        dest: usize,
        cursor: usize,
        seq: bool,
        affinities: Option<Vec<Affinity>>,
    ) -> Result<Flow> {
        if let Some(affs) = &affinities {
            for (i, aff) in affs.iter().enumerate().take(count) {
                apply_affinity(&mut self.regs[first + i], *aff);
            }
        }
        let (root, key_info, seq_no) = {
            let c = self.cursor_mut(cursor)?;
            let seq_no = seq.then(|| {
                let s = c.seq_count;
                c.seq_count += 1;
                s
            });
            (c.root, c.key_info.clone(), seq_no)
        };
        let key = encode_key(root, &self.regs[first..first + count], &key_info, seq_no)?;
        self.regs[dest] = Value::Blob(key);
        // A MakeRecord directly behind a MakeKey is part of the same
        // logical encoding step; handle the pair in one dispatch.
        if let Some(Op::MakeRecord { first, count, dest, affinities, permutation }) =
            self.ops.get(pc + 1).cloned()
        {
            self.op_make_record(first, count, dest, affinities, permutation)?;
            return Ok(Flow::Jump(pc + 2));
        }
        Ok(Flow::Step)
    }

    fn op_make_record(
        &mut self,
        first: usize,
        count: usize,
        dest: usize,
        affinities: Option<Vec<Affinity>>,
        permutation: Option<Vec<usize>>,
    ) -> Result<()> {
        if let Some(affs) = &affinities {
            for (i, aff) in affs.iter().enumerate().take(count) {
                apply_affinity(&mut self.regs[first + i], *aff);
            }
        }
        let record =
            encode_record(&self.regs[first..first + count], permutation.as_deref())?;
        self.regs[dest] = Value::Blob(record);
        Ok(())
    }

    fn op_insert(
        &mut self,
        cursor: usize,
        key_reg: usize,
        data_reg: Option<usize>,
        count_change: bool,
    ) -> Result<Flow> {
        let (db, root) = {
            let c = self.cursor(cursor)?;
            if !c.writable {
                return Err(Error::ReadOnly("cursor was opened read-only".into()));
            }
            (c.db, c.root)
        };
        let key: Vec<u8> = match &self.regs[key_reg] {
            Value::Int(rowid) => {
                let mut key = Vec::with_capacity(varint_len(root) + 9);
                put_varint(&mut key, root);
                latticedb_core::encoding::encode_int_field(&mut key, *rowid);
                key
            }
            Value::Blob(b) => b.clone(),
            _ => return Err(Error::misuse("insert key register must be integer or blob")),
        };
        let data = match data_reg {
            Some(reg) => blob_of(&self.regs, reg)?.to_vec(),
            None => Vec::new(),
        };
        self.db.kv(db)?.replace(&key, &data)?;
        let c = self.cursor_mut(cursor)?;
        c.null_row = false;
        if count_change {
            self.n_change += 1;
        }
        Ok(Flow::Step)
    }

    fn op_clear(&mut self, db: usize, root: u64, count_change: bool) -> Result<Flow> {
        let mut probe = Vec::new();
        put_varint(&mut probe, root);
        let store = self.db.kv(db)?;
        let cur = store.open_cursor()?;
        let result = clear_root(store, cur, &probe, count_change.then_some(&mut self.n_change));
        store.close_cursor(cur)?;
        result?;
        Ok(Flow::Step)
    }

    fn op_seek(
        &mut self,
        cursor: usize,
        target: usize,
        first: usize,
        count: usize,
        cmp: Comparison,
    ) -> Result<Flow> {
        let (db, kv, root, key_info) = {
            let c = self.cursor_mut(cursor)?;
            c.null_row = false;
            (c.db, c.kv, c.root, c.key_info.clone())
        };
        let mut probe = encode_key(root, &self.regs[first..first + count], &key_info, None)?;
        // The 0xFF sentinel turns at-or-after into strictly-after and
        // at-or-before into at-or-before-with-equals, so the four opcodes
        // share two native directions.
        if matches!(cmp, Comparison::Le | Comparison::Gt) {
            probe.push(0xff);
        }
        let dir = match cmp {
            Comparison::Lt | Comparison::Le => SeekDir::Le,
            Comparison::Ge | Comparison::Gt => SeekDir::Ge,
        };
        let store = self.db.kv(db)?;
        let mut outcome = store.seek(kv, &probe, dir);
        if matches!(outcome, Ok(SeekResult::Exact)) {
            // An exact landing on the sentinel-free probe still needs a
            // step for the strict comparisons.
            match cmp {
                Comparison::Lt => outcome = store.prev(kv).map(|_| SeekResult::Inexact),
                Comparison::Gt => outcome = store.next(kv).map(|_| SeekResult::Inexact),
                _ => {}
            }
        }
        match outcome {
            Ok(_) => {
                // A probe can overshoot into a neighbouring storage unit;
                // that counts as not found for this cursor.
                let n = varint_len(root);
                let key = store.key(kv)?;
                if key.len() < n || key[..n] != probe[..n] {
                    let c = self.cursor_mut(cursor)?;
                    c.null_row = true;
                    return Ok(Flow::Jump(target));
                }
                Ok(Flow::Step)
            }
            Err(Error::NotFound) => {
                let c = self.cursor_mut(cursor)?;
                c.null_row = true;
                Ok(Flow::Jump(target))
            }
            Err(e) => Err(e),
        }
    }

    fn probe_exists(&mut self, cursor: usize, probe: ProbeSrc) -> Result<bool> {
        let (db, kv, root, key_info) = {
            let c = self.cursor(cursor)?;
            (c.db, c.kv, c.root, c.key_info.clone())
        };
        let probe: Vec<u8> = match probe {
            ProbeSrc::Reg(reg) => blob_of(&self.regs, reg)?.to_vec(),
            ProbeSrc::Fields { first, count } => {
                encode_key(root, &self.regs[first..first + count], &key_info, None)?
            }
        };
        let store = self.db.kv(db)?;
        let exists = match store.seek(kv, &probe, SeekDir::Ge) {
            Ok(_) => {
                let key = store.key(kv)?;
                key.len() >= probe.len() && key[..probe.len()] == probe[..]
            }
            Err(Error::NotFound) => false,
            Err(e) => return Err(e),
        };
        if exists {
            self.cursor_mut(cursor)?.null_row = false;
        }
        Ok(exists)
    }

    fn op_is_unique(
        &mut self,
        cursor: usize,
        target: usize,
        probe_reg: usize,
        out_reg: Option<usize>,
    ) -> Result<Flow> {
        let (db, kv, key_info) = {
            let c = self.cursor(cursor)?;
            (c.db, c.kv, c.key_info.clone())
        };
        let probe = blob_of(&self.regs, probe_reg)?.to_vec();
        let pk_only = key_info.n_pk() == 0;
        let n_short = if pk_only {
            probe.len()
        } else {
            latticedb_core::encoding::short_key_len(&probe, key_info.n_short())?.0
        };
        let dir = if pk_only { SeekDir::Eq } else { SeekDir::Ge };
        let store = self.db.kv(db)?;
        match store.seek(kv, &probe[..n_short], dir) {
            Ok(SeekResult::Exact) => {
                if let Some(out) = out_reg {
                    self.regs[out] = self.regs[probe_reg].clone();
                }
                Ok(Flow::Step)
            }
            Ok(SeekResult::Inexact) => {
                let key = store.key(kv)?.to_vec();
                if key.len() < n_short || key[..n_short] != probe[..n_short] {
                    return Ok(Flow::Jump(target));
                }
                // The short prefix collides. Rewrite the out register to
                // the PK-index key of the conflicting row: its existing
                // root varint followed by the stored PK suffix.
                if let Some(out) = out_reg {
                    let blob = blob_of(&self.regs, out)?;
                    let (_, varint) = get_varint(blob)
                        .ok_or_else(|| Error::corrupt("output register holds no root"))?;
                    let mut rewritten = blob[..varint].to_vec();
                    rewritten.extend_from_slice(&key[n_short..]);
                    self.regs[out] = Value::Blob(rewritten);
                }
                Ok(Flow::Step)
            }
            Err(Error::NotFound) => Ok(Flow::Jump(target)),
            Err(e) => Err(e),
        }
    }

    fn op_idx_compare(
        &mut self,
        cursor: usize,
        target: usize,
        probe_reg: usize,
        cmp: Comparison,
    ) -> Result<Flow> {
        let (db, kv) = {
            let c = self.cursor(cursor)?;
            (c.db, c.kv)
        };
        let key = self.db.kv(db)?.key(kv)?.to_vec();
        let probe = blob_of(&self.regs, probe_reg)?;
        let n = key.len().min(probe.len());
        let ordering = match key[..n].cmp(&probe[..n]) {
            std::cmp::Ordering::Equal => key.len().cmp(&probe.len()),
            other => other,
        };
        let jump = match cmp {
            Comparison::Lt => ordering.is_lt(),
            Comparison::Le => ordering.is_le(),
            Comparison::Ge => ordering.is_ge(),
            Comparison::Gt => ordering.is_gt(),
        };
        Ok(if jump { Flow::Jump(target) } else { Flow::Step })
    }

    fn op_step_cursor(&mut self, cursor: usize, target: usize, forward: bool) -> Result<Flow> {
        let (db, kv) = {
            let c = self.cursor(cursor)?;
            (c.db, c.kv)
        };
        let store = self.db.kv(db)?;
        let moved = if forward { store.next(kv) } else { store.prev(kv) };
        match moved {
            Ok(()) => {
                self.cursor_mut(cursor)?.null_row = false;
                Ok(Flow::Jump(target))
            }
            Err(Error::NotFound) => {
                self.cursor_mut(cursor)?.null_row = true;
                Ok(Flow::Step)
            }
            Err(e) => Err(e),
        }
    }

    fn op_edge(&mut self, cursor: usize, target: usize, forward: bool) -> Result<Flow> {
        let (db, kv, root) = {
            let c = self.cursor(cursor)?;
            (c.db, c.kv, c.root)
        };
        let found = seek_end(self.db.kv(db)?, kv, root, forward)?;
        self.cursor_mut(cursor)?.null_row = !found;
        Ok(if found { Flow::Step } else { Flow::Jump(target) })
    }

    fn op_new_rowid(
        &mut self,
        cursor: usize,
        dest: usize,
        min_reg: Option<usize>,
    ) -> Result<Flow> {
        let (db, kv, root) = {
            let c = self.cursor(cursor)?;
            (c.db, c.kv, c.root)
        };
        let store = self.db.kv(db)?;
        let mut max_rowid = 0i64;
        if seek_end(store, kv, root, false)? {
            let key = store.key(kv)?.to_vec();
            let (_, consumed) = decode_root(&key)?;
            let (rowid, _) = decode_int(&key[consumed..])?;
            if rowid == i64::MAX {
                return Err(Error::Full("rowid space is exhausted".into()));
            }
            max_rowid = rowid;
        }
        if let Some(reg) = min_reg {
            let floor = int_of(&self.regs, reg)?;
            if floor == i64::MAX {
                return Err(Error::Full("rowid space is exhausted".into()));
            }
            max_rowid = max_rowid.max(floor);
        }
        self.regs[dest] = Value::Int(max_rowid + 1);
        Ok(Flow::Step)
    }

    fn op_new_idxid(&mut self, db: usize, reg: usize) -> Result<Flow> {
        let store = self.db.kv(db)?;
        let cur = store.open_cursor()?;
        let upper = [0xffu8, 0xff];
        let max_root = match store.seek(cur, &upper, SeekDir::Le) {
            Ok(_) => {
                let key = store.key(cur)?;
                get_varint(key).map(|(root, _)| root).unwrap_or(0)
            }
            Err(Error::NotFound) => 0,
            Err(e) => {
                store.close_cursor(cur)?;
                return Err(e);
            }
        };
        store.close_cursor(cur)?;
        let current = int_of(&self.regs, reg)?;
        let next = if current >= max_root as i64 { current + 1 } else { max_root as i64 + 1 };
        self.regs[reg] = Value::Int(next);
        Ok(Flow::Step)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Lt,
    Le,
    Ge,
    Gt,
}

/// Position at the first (`forward`) or last entry of `root`, reporting
/// whether the storage unit holds any entry at all.
fn seek_end(store: &mut KvStore, kv: KvCursorId, root: u64, forward: bool) -> Result<bool> {
    let mut probe = Vec::new();
    if forward {
        put_varint(&mut probe, root);
        match store.seek(kv, &probe, SeekDir::Ge) {
            Ok(_) => {
                let key = store.key(kv)?;
                Ok(key.len() >= probe.len() && key[..probe.len()] == probe[..])
            }
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    } else {
        // Everything in this root orders strictly below the bare varint
        // of the next root.
        put_varint(&mut probe, root + 1);
        match store.seek(kv, &probe, SeekDir::Le) {
            Ok(_) => {
                let key = store.key(kv)?;
                let (found_root, _) = decode_root(key)?;
                Ok(found_root == root)
            }
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn clear_root(
    store: &mut KvStore,
    cur: KvCursorId,
    probe: &[u8],
    mut n_change: Option<&mut i64>,
) -> Result<()> {
    let mut outcome = store.seek(cur, probe, SeekDir::Ge).map(|_| ());
    loop {
        match outcome {
            Ok(()) => {}
            Err(Error::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        }
        let key = store.key(cur)?;
        if key.len() < probe.len() {
            return Err(Error::corrupt("key shorter than its root prefix"));
        }
        if key[..probe.len()] != probe[..] {
            return Ok(());
        }
        store.delete(cur)?;
        if let Some(count) = n_change.as_deref_mut() {
            *count += 1;
        }
        outcome = store.next(cur);
    }
}

fn int_of(regs: &[Value], i: usize) -> Result<i64> {
    regs.get(i)
        .and_then(Value::as_int)
        .ok_or_else(|| Error::misuse("register does not hold an integer"))
}

fn blob_of(regs: &[Value], i: usize) -> Result<&[u8]> {
    match regs.get(i) {
        Some(Value::Blob(b)) => Ok(b),
        _ => Err(Error::misuse("register does not hold a blob")),
    }
}
