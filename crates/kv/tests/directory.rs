// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use latticedb_kv::{EngineContext, KvStore, OpenOptions};
use latticedb_store_btree::BtreeBackend;
use latticedb_store_log::LogBackend;
use latticedb_testing::tempdir::temp_store;

#[test]
fn refcount_tracks_live_connections() {
    let (_guard, path) = temp_store("btree.db");
    let ctx = EngineContext::new();

    let a = KvStore::open(&ctx, &BtreeBackend, &path, OpenOptions::default()).unwrap();
    let b = KvStore::open(&ctx, &BtreeBackend, &path, OpenOptions::default()).unwrap();

    let entry = ctx.directory().try_get(&path).expect("entry exists");
    assert_eq!(entry.lock().refcount, 2);
    drop(entry);

    a.close();
    let entry = ctx.directory().try_get(&path).expect("entry still exists");
    assert_eq!(entry.lock().refcount, 1);
    drop(entry);

    b.close();
    assert!(ctx.directory().try_get(&path).is_none());
}

#[test]
fn same_name_shares_one_environment() {
    let (_guard, path) = temp_store("logdb");
    let ctx = EngineContext::new();

    // The log engine takes an exclusive file lock, so two connections can
    // only coexist by sharing the environment through the directory.
    let _a = KvStore::open(&ctx, &LogBackend::default(), &path, OpenOptions::default()).unwrap();
    let _b = KvStore::open(&ctx, &LogBackend::default(), &path, OpenOptions::default()).unwrap();
    assert_eq!(ctx.directory().len(), 1);
}

#[test]
fn distinct_names_get_distinct_entries() {
    let (_guard_a, path_a) = temp_store("a.db");
    let (_guard_b, path_b) = temp_store("b.db");
    let ctx = EngineContext::new();

    let _a = KvStore::open(&ctx, &BtreeBackend, &path_a, OpenOptions::default()).unwrap();
    let _b = KvStore::open(&ctx, &BtreeBackend, &path_b, OpenOptions::default()).unwrap();
    assert_eq!(ctx.directory().len(), 2);
}

#[test]
fn temporary_stores_skip_the_directory() {
    let ctx = EngineContext::new();
    let opts = OpenOptions { temporary: true, ..Default::default() };
    let mut store = KvStore::open(&ctx, &BtreeBackend, "scratch", opts).unwrap();
    assert_eq!(ctx.directory().len(), 0);

    store.begin(2).unwrap();
    store.replace(&[0x01], &[0x01]).unwrap();
    store.commit(0).unwrap();
    store.close();
    assert_eq!(ctx.directory().len(), 0);
}

#[test]
fn in_memory_store_is_shared_while_open_and_dies_with_the_entry() {
    let ctx = EngineContext::new();
    let opts = OpenOptions { in_memory: true, ..Default::default() };

    let mut writer = KvStore::open(&ctx, &BtreeBackend, "shared-mem", opts.clone()).unwrap();
    let mut reader = KvStore::open(&ctx, &BtreeBackend, "shared-mem", opts.clone()).unwrap();

    writer.begin(2).unwrap();
    writer.replace(&[0x01, 0x01], &[0x2a]).unwrap();
    writer.commit(0).unwrap();

    reader.begin(1).unwrap();
    let cur = reader.open_cursor().unwrap();
    assert!(reader.seek(cur, &[0x01, 0x01], latticedb_kv::SeekDir::Eq).is_ok());

    writer.close();
    reader.close();

    // Refcount hit zero, so the shared in-memory database is gone.
    let mut fresh = KvStore::open(&ctx, &BtreeBackend, "shared-mem", opts).unwrap();
    fresh.begin(1).unwrap();
    let cur = fresh.open_cursor().unwrap();
    assert!(fresh.seek(cur, &[0x01, 0x01], latticedb_kv::SeekDir::Eq).is_err());
}

#[test]
fn method_set_stamp_is_versioned() {
    let stamp = KvStore::method_set_stamp();
    assert_eq!(stamp.version, latticedb_kv::METHOD_SET_VERSION);
    assert!(stamp.size > 0);
}

#[test]
fn contexts_are_isolated() {
    let (_guard, path) = temp_store("btree.db");
    let ctx_a = EngineContext::new();
    let ctx_b = EngineContext::new();
    ctx_b.enable_mutexes();

    let _a = KvStore::open(&ctx_a, &BtreeBackend, &path, OpenOptions::default()).unwrap();
    assert_eq!(ctx_a.directory().len(), 1);
    assert_eq!(ctx_b.directory().len(), 0);
    assert!(ctx_b.mutexes_enabled());
    assert!(!ctx_a.mutexes_enabled());
}
