// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use latticedb_core::{Error, KeyInfo, Value};
use latticedb_kv::{EngineContext, OpenOptions, SeekDir};
use latticedb_testing::tempdir::temp_store;
use latticedb_vm::{BackendKind, Database, Op, SavepointOp, Vm};

fn open_db(path: &str, backend: BackendKind) -> Database {
    let ctx = EngineContext::new();
    Database::open(&ctx, path, backend, OpenOptions::default()).unwrap()
}

fn run(db: &mut Database, ops: Vec<Op>) -> latticedb_core::Result<Vec<Value>> {
    let mut vm = Vm::new(db, ops, 16, 4);
    vm.run()?;
    Ok(vm.regs.clone())
}

fn rowid_key(root: u64, rowid: i64) -> Vec<u8> {
    latticedb_core::encoding::encode_key(root, &[Value::Int(rowid)], &KeyInfo::new(1), None)
        .unwrap()
}

fn assert_present(db: &mut Database, key: &[u8], present: bool) {
    let store = db.kv(0).unwrap();
    store.begin(1).unwrap();
    let cur = store.open_cursor().unwrap();
    let found = store.seek(cur, key, SeekDir::Eq).is_ok();
    store.close_cursor(cur).unwrap();
    assert_eq!(found, present, "key {key:02x?}");
}

#[test]
fn named_savepoint_rollback_keeps_outer_writes() {
    let (_guard, path) = temp_store("btree.db");
    let mut db = open_db(&path, BackendKind::Btree);

    let ops = vec![
        Op::Savepoint { op: SavepointOp::Begin, name: None },
        Op::Transaction { db: 0, write: true, needs_stmt: false },
        Op::OpenWrite { cursor: 0, db: 0, root: 1, root_reg: None, key_info: KeyInfo::new(1) },
        Op::Integer { value: 1, dest: 1 },
        Op::Insert { cursor: 0, key_reg: 1, data_reg: None, count_change: false },
        Op::Savepoint { op: SavepointOp::Begin, name: Some("one".into()) },
        Op::Transaction { db: 0, write: true, needs_stmt: false },
        Op::Integer { value: 2, dest: 2 },
        Op::Insert { cursor: 0, key_reg: 2, data_reg: None, count_change: false },
        Op::Savepoint { op: SavepointOp::Rollback, name: Some("one".into()) },
        Op::Savepoint { op: SavepointOp::Release, name: None },
        Op::Halt,
    ];
    run(&mut db, ops).unwrap();

    assert_present(&mut db, &rowid_key(1, 1), true);
    assert_present(&mut db, &rowid_key(1, 2), false);
}

#[test]
fn named_savepoint_survives_its_own_rollback() {
    let (_guard, path) = temp_store("btree.db");
    let mut db = open_db(&path, BackendKind::Btree);

    // Rolling back to a savepoint keeps the savepoint itself usable:
    // a second write and release after the rollback must succeed.
    let ops = vec![
        Op::Savepoint { op: SavepointOp::Begin, name: None },
        Op::Transaction { db: 0, write: true, needs_stmt: false },
        Op::OpenWrite { cursor: 0, db: 0, root: 1, root_reg: None, key_info: KeyInfo::new(1) },
        Op::Savepoint { op: SavepointOp::Begin, name: Some("sp".into()) },
        Op::Transaction { db: 0, write: true, needs_stmt: false },
        Op::Integer { value: 10, dest: 1 },
        Op::Insert { cursor: 0, key_reg: 1, data_reg: None, count_change: false },
        Op::Savepoint { op: SavepointOp::Rollback, name: Some("sp".into()) },
        Op::Transaction { db: 0, write: true, needs_stmt: false },
        Op::Integer { value: 11, dest: 2 },
        Op::Insert { cursor: 0, key_reg: 2, data_reg: None, count_change: false },
        Op::Savepoint { op: SavepointOp::Release, name: Some("sp".into()) },
        Op::Savepoint { op: SavepointOp::Release, name: None },
        Op::Halt,
    ];
    run(&mut db, ops).unwrap();

    assert_present(&mut db, &rowid_key(1, 10), false);
    assert_present(&mut db, &rowid_key(1, 11), true);
    assert_eq!(db.n_savepoint(), 0);
}

#[test]
fn anonymous_rollback_discards_the_whole_transaction() {
    let (_guard, path) = temp_store("btree.db");
    let mut db = open_db(&path, BackendKind::Btree);

    let ops = vec![
        Op::Savepoint { op: SavepointOp::Begin, name: None },
        Op::Transaction { db: 0, write: true, needs_stmt: false },
        Op::OpenWrite { cursor: 0, db: 0, root: 1, root_reg: None, key_info: KeyInfo::new(1) },
        Op::Integer { value: 1, dest: 1 },
        Op::Insert { cursor: 0, key_reg: 1, data_reg: None, count_change: false },
        Op::Savepoint { op: SavepointOp::Rollback, name: None },
        Op::Halt,
    ];
    run(&mut db, ops).unwrap();

    assert_eq!(db.n_savepoint(), 0);
    assert_present(&mut db, &rowid_key(1, 1), false);
}

#[test]
fn nested_begin_inside_transaction_requires_a_name() {
    let (_guard, path) = temp_store("btree.db");
    let mut db = open_db(&path, BackendKind::Btree);

    let ops = vec![
        Op::Savepoint { op: SavepointOp::Begin, name: None },
        Op::Savepoint { op: SavepointOp::Begin, name: None },
        Op::Halt,
    ];
    let err = run(&mut db, ops).unwrap_err();
    assert!(matches!(err, Error::Other(ref m) if m.contains("within a transaction")));
}

#[test]
fn release_without_transaction_fails() {
    let (_guard, path) = temp_store("btree.db");
    let mut db = open_db(&path, BackendKind::Btree);

    let ops = vec![Op::Savepoint { op: SavepointOp::Release, name: None }, Op::Halt];
    let err = run(&mut db, ops).unwrap_err();
    assert!(matches!(err, Error::Other(ref m) if m.contains("cannot commit")));

    let ops =
        vec![Op::Savepoint { op: SavepointOp::Rollback, name: Some("ghost".into()) }, Op::Halt];
    let err = run(&mut db, ops).unwrap_err();
    assert!(matches!(err, Error::Other(ref m) if m.contains("no such savepoint")));
}

#[test]
fn deferred_constraints_block_the_outermost_release() {
    let (_guard, path) = temp_store("btree.db");
    let mut db = open_db(&path, BackendKind::Btree);

    let ops = vec![
        Op::Savepoint { op: SavepointOp::Begin, name: None },
        Op::Transaction { db: 0, write: true, needs_stmt: false },
        Op::OpenWrite { cursor: 0, db: 0, root: 1, root_reg: None, key_info: KeyInfo::new(1) },
        Op::Integer { value: 1, dest: 1 },
        Op::Insert { cursor: 0, key_reg: 1, data_reg: None, count_change: false },
        Op::FkCounter { delta: 1 },
        Op::Savepoint { op: SavepointOp::Release, name: None },
        Op::Halt,
    ];
    let err = run(&mut db, ops).unwrap_err();
    assert!(matches!(err, Error::Constraint(_)));

    // Settling the constraint lets the release through.
    let ops = vec![
        Op::FkCounter { delta: -1 },
        Op::Savepoint { op: SavepointOp::Release, name: None },
        Op::Halt,
    ];
    run(&mut db, ops).unwrap();
    assert_present(&mut db, &rowid_key(1, 1), true);
}

#[test]
fn named_rollback_restores_deferred_counter() {
    let (_guard, path) = temp_store("btree.db");
    let mut db = open_db(&path, BackendKind::Btree);

    let ops = vec![
        Op::Savepoint { op: SavepointOp::Begin, name: None },
        Op::Transaction { db: 0, write: true, needs_stmt: false },
        Op::Savepoint { op: SavepointOp::Begin, name: Some("sp".into()) },
        Op::FkCounter { delta: 3 },
        Op::Savepoint { op: SavepointOp::Rollback, name: Some("sp".into()) },
        // The counter reverted with the savepoint, so the commit goes
        // through.
        Op::Savepoint { op: SavepointOp::Release, name: None },
        Op::Halt,
    ];
    run(&mut db, ops).unwrap();
}

#[test]
fn interrupt_halts_between_opcodes() {
    let (_guard, path) = temp_store("btree.db");
    let mut db = open_db(&path, BackendKind::Btree);

    db.interrupt();
    let ops = vec![
        Op::Savepoint { op: SavepointOp::Begin, name: None },
        Op::Transaction { db: 0, write: true, needs_stmt: false },
        Op::Halt,
    ];
    let err = run(&mut db, ops).unwrap_err();
    assert!(matches!(err, Error::Other(ref m) if m == "interrupted"));
    assert_eq!(db.n_savepoint(), 0, "the first opcode never ran");

    db.clear_interrupt();
    let ops = vec![
        Op::Savepoint { op: SavepointOp::Begin, name: None },
        Op::Savepoint { op: SavepointOp::Release, name: None },
        Op::Halt,
    ];
    run(&mut db, ops).unwrap();
}

#[test]
fn statement_subtransaction_commits_on_success() {
    let (_guard, path) = temp_store("btree.db");
    let mut db = open_db(&path, BackendKind::Btree);

    let ops = vec![
        Op::Savepoint { op: SavepointOp::Begin, name: None },
        Op::Transaction { db: 0, write: true, needs_stmt: true },
        Op::OpenWrite { cursor: 0, db: 0, root: 1, root_reg: None, key_info: KeyInfo::new(1) },
        Op::Integer { value: 21, dest: 1 },
        Op::Insert { cursor: 0, key_reg: 1, data_reg: None, count_change: false },
        Op::Halt,
    ];
    run(&mut db, ops).unwrap();

    // The statement level is resolved; the user transaction is still
    // open and can commit.
    let ops = vec![Op::Savepoint { op: SavepointOp::Release, name: None }, Op::Halt];
    run(&mut db, ops).unwrap();
    assert_present(&mut db, &rowid_key(1, 21), true);
}

#[test]
fn statement_subtransaction_rolls_back_on_error() {
    let (_guard, path) = temp_store("btree.db");
    let mut db = open_db(&path, BackendKind::Btree);

    // Seed one committed row.
    let ops = vec![
        Op::Savepoint { op: SavepointOp::Begin, name: None },
        Op::Transaction { db: 0, write: true, needs_stmt: false },
        Op::OpenWrite { cursor: 0, db: 0, root: 1, root_reg: None, key_info: KeyInfo::new(1) },
        Op::Integer { value: 1, dest: 1 },
        Op::Insert { cursor: 0, key_reg: 1, data_reg: None, count_change: false },
        Op::Savepoint { op: SavepointOp::Release, name: None },
        Op::Halt,
    ];
    run(&mut db, ops).unwrap();

    // A failing statement discards only its own write.
    let ops = vec![
        Op::Savepoint { op: SavepointOp::Begin, name: None },
        Op::Transaction { db: 0, write: true, needs_stmt: true },
        Op::OpenWrite { cursor: 0, db: 0, root: 1, root_reg: None, key_info: KeyInfo::new(1) },
        Op::Integer { value: 2, dest: 1 },
        Op::Insert { cursor: 0, key_reg: 1, data_reg: None, count_change: false },
        // Deleting through an unpositioned cursor fails the program.
        Op::Delete { cursor: 0, count_change: false },
        Op::Halt,
    ];
    let err = run(&mut db, ops).unwrap_err();
    assert!(matches!(err, Error::Misuse(_) | Error::NotFound));

    // The enclosing transaction survives and commits without the failed
    // statement's row.
    let ops = vec![Op::Savepoint { op: SavepointOp::Release, name: None }, Op::Halt];
    run(&mut db, ops).unwrap();
    assert_present(&mut db, &rowid_key(1, 1), true);
    assert_present(&mut db, &rowid_key(1, 2), false);
}
