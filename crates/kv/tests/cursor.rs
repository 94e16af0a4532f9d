// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use latticedb_core::Error;
use latticedb_kv::{
    BackendFactory, ControlOp, EngineContext, KvStore, OpenOptions, SeekDir, SeekResult,
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

fn populated(ctx: &std::sync::Arc<EngineContext>, factory: &dyn BackendFactory, path: &str) -> KvStore {
    let mut store = KvStore::open(ctx, factory, path, OpenOptions::default()).unwrap();
    store.begin(2).unwrap();
    store.replace(&[0x01, 0x10], b"ten").unwrap();
    store.replace(&[0x01, 0x20], b"twenty").unwrap();
    store.replace(&[0x01, 0x30], b"thirty").unwrap();
    store.commit(0).unwrap();
    store.begin(1).unwrap();
    store
}

#[test]
fn value_range_clips_to_cached_size() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = populated(&ctx, factory, path);
        let cur = store.open_cursor().unwrap();
        store.seek(cur, &[0x01, 0x20], SeekDir::Eq).unwrap();

        assert_eq!(store.value(cur).unwrap(), b"twenty");
        assert_eq!(store.value_range(cur, 0, -1).unwrap(), b"twenty");
        assert_eq!(store.value_range(cur, 2, 3).unwrap(), b"ent");
        assert_eq!(store.value_range(cur, 2, 100).unwrap(), b"enty");
        // Offset past the end clips to an empty slice, never underflows.
        assert_eq!(store.value_range(cur, 100, 3).unwrap(), b"");
    });
}

#[test]
fn cache_survives_repeated_reads_and_dies_on_movement() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = populated(&ctx, factory, path);
        let cur = store.open_cursor().unwrap();
        store.seek(cur, &[0x01, 0x10], SeekDir::Eq).unwrap();

        // Both reads serve from one cache fill.
        assert_eq!(store.key(cur).unwrap(), &[0x01, 0x10]);
        assert_eq!(store.value(cur).unwrap(), b"ten");
        assert_eq!(store.key(cur).unwrap(), &[0x01, 0x10]);

        store.next(cur).unwrap();
        assert_eq!(store.key(cur).unwrap(), &[0x01, 0x20]);
        assert_eq!(store.value(cur).unwrap(), b"twenty");
    });
}

#[test]
fn reset_clears_position_and_direction() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = populated(&ctx, factory, path);
        let cur = store.open_cursor().unwrap();
        store.seek(cur, &[0x01, 0x10], SeekDir::Eq).unwrap();

        store.reset_cursor(cur).unwrap();
        // No seek memory: stepping is a mismatch, and the position is
        // gone.
        assert!(matches!(store.next(cur), Err(Error::Mismatch)));
        assert!(matches!(store.key(cur), Err(Error::Misuse(_))));

        // The cursor is still usable after a fresh seek.
        assert_eq!(store.seek(cur, &[0x01, 0x10], SeekDir::Eq).unwrap(), SeekResult::Exact);
    });
}

#[test]
fn closing_a_handle_twice_is_misuse() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = populated(&ctx, factory, path);
        let cur = store.open_cursor().unwrap();
        store.close_cursor(cur).unwrap();
        assert!(matches!(store.close_cursor(cur), Err(Error::Misuse(_))));
        assert!(matches!(store.seek(cur, &[0x01], SeekDir::Eq), Err(Error::Misuse(_))));
    });
}

#[test]
fn ghost_position_resumes_iteration_after_delete() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = populated(&ctx, factory, path);
        store.begin(2).unwrap();
        let cur = store.open_cursor().unwrap();

        store.seek(cur, &[0x01, 0x20], SeekDir::Eq).unwrap();
        store.delete(cur).unwrap();
        // Key and value of the deleted entry are gone...
        assert!(matches!(store.key(cur), Err(Error::NotFound)));
        // ...but the ghost position still anchors the next step.
        store.next(cur).unwrap();
        assert_eq!(store.key(cur).unwrap(), &[0x01, 0x30]);
        store.commit(0).unwrap();
    });
}

#[test]
fn large_values_grow_the_cursor_buffer() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        // Tiny initial buffers force growth on the first big read.
        ctx.set_default_initial_cursor_key_capacity(8);
        ctx.set_default_initial_cursor_value_capacity(8);

        let mut store = KvStore::open(&ctx, factory, path, OpenOptions::default()).unwrap();
        let big = vec![0xabu8; 100_000];
        store.begin(2).unwrap();
        store.replace(&[0x01, 0x01], &big).unwrap();
        store.commit(0).unwrap();

        store.begin(1).unwrap();
        let cur = store.open_cursor().unwrap();
        store.seek(cur, &[0x01, 0x01], SeekDir::Eq).unwrap();
        assert_eq!(store.value(cur).unwrap().len(), big.len());
    });
}

#[test]
fn connection_buffer_capacity_override() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let opts = OpenOptions {
            cursor_key_capacity: Some(32),
            cursor_value_capacity: Some(32),
            ..Default::default()
        };
        let mut store = KvStore::open(&ctx, factory, path, opts).unwrap();
        store.control(ControlOp::SetCursorValueCapacity(64)).unwrap();

        store.begin(2).unwrap();
        store.replace(&[0x01, 0x01], &vec![0x11u8; 4096]).unwrap();
        store.commit(0).unwrap();

        store.begin(1).unwrap();
        let cur = store.open_cursor().unwrap();
        store.seek(cur, &[0x01, 0x01], SeekDir::Eq).unwrap();
        assert_eq!(store.value(cur).unwrap().len(), 4096);
    });
}

#[test]
fn eof_advance_is_misuse_when_direction_matches() {
    for_each_backend(|factory, path| {
        let ctx = EngineContext::new();
        let mut store = populated(&ctx, factory, path);
        let cur = store.open_cursor().unwrap();
        store.seek(cur, &[0x01, 0x30], SeekDir::Eq).unwrap();

        assert!(matches!(store.next(cur), Err(Error::NotFound)));
        // Still pointed the right way, but the cursor is at end.
        assert!(matches!(store.next(cur), Err(Error::Misuse(_))));
    });
}
