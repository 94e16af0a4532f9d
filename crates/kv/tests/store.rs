// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use latticedb_core::Error;
use latticedb_kv::{
    BackendFactory, EngineContext, KvStore, OpenOptions, SeekDir, SeekResult,
};
use latticedb_store_btree::BtreeBackend;
use latticedb_store_log::LogBackend;
use latticedb_testing::tempdir::temp_store;

fn for_each_backend(test: impl Fn(&dyn BackendFactory, &str)) {
    let (_guard, path) = temp_store("btree.db");
    test(&BtreeBackend, &path);
    let (_guard, path) = temp_store("logdb");
    test(&LogBackend::default(), &path);
}

#[test]
fn insert_seek_delete_round_trip() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();

        let mut store = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();
        store.begin(2).unwrap();
        store.replace(&[0x01, 0x61, 0x00], &[0xff]).unwrap();
        store.commit_phase_one(0).unwrap();
        store.commit_phase_two(0).unwrap();
        store.close();

        let mut store = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();
        store.begin(1).unwrap();
        let cur = store.open_cursor().unwrap();
        assert_eq!(store.seek(cur, &[0x01, 0x61, 0x00], SeekDir::Eq).unwrap(), SeekResult::Exact);
        assert_eq!(store.value(cur).unwrap(), &[0xff]);

        store.begin(2).unwrap();
        store.delete(cur).unwrap();
        store.commit_phase_one(0).unwrap();
        store.commit_phase_two(0).unwrap();

        store.begin(1).unwrap();
        let cur = store.open_cursor().unwrap();
        assert!(matches!(
            store.seek(cur, &[0x01, 0x61, 0x00], SeekDir::Eq),
            Err(Error::NotFound)
        ));
    });
}

#[test]
fn inexact_seek_walks_forward_and_guards_direction() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();
        store.begin(2).unwrap();
        for key in [[0x01, 0x10], [0x01, 0x20], [0x01, 0x30]] {
            store.replace(&key, &[0x00]).unwrap();
        }
        store.commit(0).unwrap();

        store.begin(1).unwrap();
        let cur = store.open_cursor().unwrap();
        assert_eq!(store.seek(cur, &[0x01, 0x15], SeekDir::Ge).unwrap(), SeekResult::Inexact);
        assert_eq!(store.key(cur).unwrap(), &[0x01, 0x20]);

        store.next(cur).unwrap();
        assert_eq!(store.key(cur).unwrap(), &[0x01, 0x30]);

        assert!(matches!(store.next(cur), Err(Error::NotFound)));
        assert!(store.is_eof(cur));

        // The last seek was GE; stepping backwards is a direction
        // mismatch regardless of EOF.
        assert!(matches!(store.prev(cur), Err(Error::Mismatch)));
    });
}

#[test]
fn seek_le_lands_on_nearest_below() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();
        store.begin(2).unwrap();
        store.replace(&[0x01, 0x10], &[0x00]).unwrap();
        store.replace(&[0x01, 0x30], &[0x00]).unwrap();
        store.commit(0).unwrap();

        store.begin(1).unwrap();
        let cur = store.open_cursor().unwrap();
        assert_eq!(store.seek(cur, &[0x01, 0x20], SeekDir::Le).unwrap(), SeekResult::Inexact);
        assert_eq!(store.key(cur).unwrap(), &[0x01, 0x10]);

        // Above everything: LE falls back to the last entry.
        assert_eq!(store.seek(cur, &[0x02], SeekDir::Le).unwrap(), SeekResult::Inexact);
        assert_eq!(store.key(cur).unwrap(), &[0x01, 0x30]);

        // Below everything: nothing qualifies.
        assert!(matches!(store.seek(cur, &[0x00], SeekDir::Le), Err(Error::NotFound)));

        // Exact hit.
        assert_eq!(store.seek(cur, &[0x01, 0x30], SeekDir::Le).unwrap(), SeekResult::Exact);
        store.prev(cur).unwrap();
        assert_eq!(store.key(cur).unwrap(), &[0x01, 0x10]);
    });
}

#[test]
fn nested_savepoint_rollback_keeps_outer_writes() {
    // True nested rollback is a btree-backend property; the log backend
    // simulates nesting over one physical transaction and pins its own
    // behaviour in its crate tests.
    let (_guard, path) = temp_store("btree.db");
    let ctx = EngineContext::new();
    let mut store = KvStore::open(&ctx, &BtreeBackend, &path, OpenOptions::default()).unwrap();

    store.begin(2).unwrap();
    store.replace(&[0x01, 0x01], &[0xaa]).unwrap();
    store.begin(3).unwrap();
    store.replace(&[0x01, 0x02], &[0xbb]).unwrap();

    store.rollback(3).unwrap();
    // The restart invariant leaves a live savepoint at the same depth.
    assert_eq!(store.trans_level(), 3);
    assert!(store.level_is_open(3));

    let cur = store.open_cursor().unwrap();
    assert!(matches!(store.seek(cur, &[0x01, 0x02], SeekDir::Eq), Err(Error::NotFound)));
    assert_eq!(store.seek(cur, &[0x01, 0x01], SeekDir::Eq).unwrap(), SeekResult::Exact);

    store.commit(0).unwrap();

    store.begin(1).unwrap();
    let cur = store.open_cursor().unwrap();
    assert_eq!(store.seek(cur, &[0x01, 0x01], SeekDir::Eq).unwrap(), SeekResult::Exact);
    assert!(matches!(store.seek(cur, &[0x01, 0x02], SeekDir::Eq), Err(Error::NotFound)));
}

#[test]
fn two_phase_commit_prepares_outermost_only() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();

        store.begin(2).unwrap();
        store.replace(&[0x01, 0x01], &[0x01]).unwrap();
        store.begin(3).unwrap();
        store.replace(&[0x01, 0x02], &[0x02]).unwrap();

        // The level-3 candidate has a surviving ancestor at level 2, so
        // phase one prepares only the outermost transaction; running it
        // twice would otherwise double-prepare and fail.
        store.commit_phase_one(0).unwrap();
        store.commit_phase_two(0).unwrap();

        assert_eq!(store.trans_level(), 0);
        assert!(!store.level_is_open(2));
        assert!(!store.level_is_open(3));
        assert!(!store.has_read_cursor());

        store.begin(1).unwrap();
        let cur = store.open_cursor().unwrap();
        assert_eq!(store.seek(cur, &[0x01, 0x01], SeekDir::Eq).unwrap(), SeekResult::Exact);
        assert_eq!(store.seek(cur, &[0x01, 0x02], SeekDir::Eq).unwrap(), SeekResult::Exact);
    });
}

#[test]
fn commit_phase_one_with_caller_gid() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();
        store.begin(2).unwrap();
        store.replace(&[0x01, 0x01], &[0x01]).unwrap();
        store.commit_phase_one_with_xid(0, b"gid-0001").unwrap();
        store.commit_phase_two(0).unwrap();
        assert_eq!(store.trans_level(), 0);
    });
}

#[test]
fn revert_restores_savepoint_but_discards_changes() {
    let (_guard, path) = temp_store("btree.db");
    let ctx = EngineContext::new();
    let mut store = KvStore::open(&ctx, &BtreeBackend, &path, OpenOptions::default()).unwrap();

    store.begin(2).unwrap();
    store.replace(&[0x01, 0x01], &[0x01]).unwrap();
    store.begin(3).unwrap();
    store.replace(&[0x01, 0x02], &[0x02]).unwrap();

    // Undo everything after the level-3 savepoint while keeping the
    // savepoint itself alive.
    store.revert(3).unwrap();
    assert_eq!(store.trans_level(), 3);

    let cur = store.open_cursor().unwrap();
    assert!(matches!(store.seek(cur, &[0x01, 0x02], SeekDir::Eq), Err(Error::NotFound)));
    assert_eq!(store.seek(cur, &[0x01, 0x01], SeekDir::Eq).unwrap(), SeekResult::Exact);

    store.replace(&[0x01, 0x03], &[0x03]).unwrap();
    store.commit(0).unwrap();

    store.begin(1).unwrap();
    let cur = store.open_cursor().unwrap();
    assert_eq!(store.seek(cur, &[0x01, 0x03], SeekDir::Eq).unwrap(), SeekResult::Exact);
}

#[test]
fn rollback_to_zero_restarts_read_level() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();
        store.begin(2).unwrap();
        store.replace(&[0x01, 0x01], &[0x01]).unwrap();
        store.rollback(0).unwrap();

        // Level drops out of the write transaction entirely, but the
        // restart leaves a usable read cursor behind.
        assert_eq!(store.trans_level(), 0);
        assert!(store.has_read_cursor());

        let cur = store.open_cursor().unwrap();
        assert!(matches!(store.seek(cur, &[0x01, 0x01], SeekDir::Eq), Err(Error::NotFound)));
    });
}

#[test]
fn begin_is_idempotent_at_current_level() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();
        store.begin(2).unwrap();
        store.begin(2).unwrap();
        assert_eq!(store.trans_level(), 2);
        store.replace(&[0x01], &[0x01]).unwrap();
        store.commit(0).unwrap();
    });
}

#[test]
fn replace_outside_write_transaction_is_misuse() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();
        assert!(matches!(store.replace(&[0x01], &[0x01]), Err(Error::Misuse(_))));
        store.begin(1).unwrap();
        assert!(matches!(store.replace(&[0x01], &[0x01]), Err(Error::Misuse(_))));
    });
}

#[test]
fn per_level_cursor_array_invariants() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();
        assert!(!store.level_is_open(0));
        assert!(!store.level_is_open(1));

        store.begin(2).unwrap();
        store.begin(3).unwrap();
        store.begin(4).unwrap();
        for level in [0, 1] {
            assert!(!store.level_is_open(level));
        }
        for level in [2, 3, 4] {
            assert!(store.level_is_open(level));
        }
        assert!(!store.level_is_open(5));

        store.commit(2).unwrap();
        assert_eq!(store.trans_level(), 2);
        assert!(store.level_is_open(2));
        assert!(!store.level_is_open(3));
        assert!(!store.level_is_open(4));

        store.commit(0).unwrap();
        assert_eq!(store.trans_level(), 0);
        assert!(!store.level_is_open(2));
    });
}

#[test]
fn schema_cookie_round_trip() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();
        assert_eq!(store.get_meta().unwrap(), 0);
        store.put_meta(1234).unwrap();
        store.close();

        let mut store = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();
        assert_eq!(store.get_meta().unwrap(), 1234);
    });
}

#[test]
fn log_backend_reports_contention_as_locked() {
    let (_guard, path) = temp_store("logdb");
    let ctx = EngineContext::new();
    let factory = LogBackend::default();
    let mut a = KvStore::open(&ctx, &factory, &path, OpenOptions::default()).unwrap();
    let mut b = KvStore::open(&ctx, &factory, &path, OpenOptions::default()).unwrap();

    a.begin(2).unwrap();
    let err = b.begin(2).unwrap_err();
    assert!(matches!(err, Error::Locked(_)));
    assert!(err.is_transient());

    // Once the writer commits, the blocked connection can retry.
    a.replace(&[0x01], &[0x01]).unwrap();
    a.commit(0).unwrap();
    b.begin(2).unwrap();
    b.replace(&[0x02], &[0x02]).unwrap();
    b.commit(0).unwrap();
}

#[test]
fn committed_writes_visible_to_other_connection_after_new_read() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut writer = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();
        let mut reader = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();

        writer.begin(2).unwrap();
        writer.replace(&[0x01, 0x07], &[0x07]).unwrap();
        writer.commit(0).unwrap();

        reader.begin(1).unwrap();
        let cur = reader.open_cursor().unwrap();
        assert_eq!(reader.seek(cur, &[0x01, 0x07], SeekDir::Eq).unwrap(), SeekResult::Exact);
    });
}
