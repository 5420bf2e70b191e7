//! Crash recovery around the two-phase header rewrite.
//!
//! The commit protocol writes the record-manager header twice: first
//! with the `previous*` offsets still naming the pre-transaction
//! internal trees, then, once the shadowed pages joined the free
//! list, with those fields cleared. These tests reproduce on-disk
//! states from the crash windows of that protocol and verify that
//! reopening lands on a committed state, never in between.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use vellum_store::{BytesCodec, RecordManager, StoreConfig, TreeOptions, U64Codec};

const PAGE_SIZE: usize = 64;

fn config() -> StoreConfig {
    StoreConfig { page_size: PAGE_SIZE, sync_on_commit: true }
}

fn open(path: &Path) -> RecordManager {
    RecordManager::open_with_config(path, config()).unwrap()
}

fn add_tiny_tree<'rm>(
    rm: &'rm RecordManager,
) -> vellum_store::Tree<'rm, u64, Vec<u8>, vellum_store::FileBackend> {
    rm.add_tree_with("T", U64Codec, BytesCodec, TreeOptions { fanout: 4, allow_duplicates: false })
        .unwrap()
}

fn read_header(path: &Path) -> Vec<u8> {
    let mut file = std::fs::File::open(path).unwrap();
    let mut buf = vec![0u8; PAGE_SIZE];
    file.read_exact(&mut buf).unwrap();
    buf
}

fn write_header(path: &Path, header: &[u8]) {
    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(header).unwrap();
    file.sync_all().unwrap();
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_be_bytes());
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_be_bytes(buf[at..at + 8].try_into().unwrap())
}

/// Plain close-and-reopen: committed data survives.
#[test]
fn data_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.vlm");

    {
        let rm = open(&path);
        let tree = add_tiny_tree(&rm);
        for i in 0..20u64 {
            tree.insert(&i, &format!("value-{i}").into_bytes()).unwrap();
        }
        rm.close().unwrap();
    }

    let rm = open(&path);
    let tree = rm.tree::<u64, Vec<u8>>("T", U64Codec, BytesCodec).unwrap();
    for i in 0..20u64 {
        assert_eq!(
            tree.get(&i).unwrap(),
            Some(format!("value-{i}").into_bytes()),
            "key {i} lost across reopen"
        );
    }
    rm.check().unwrap();
}

/// Opening a directory creates the default file name inside it.
#[test]
fn directory_path_uses_default_file_name() {
    let dir = tempfile::tempdir().unwrap();

    {
        let rm = RecordManager::open_with_config(dir.path(), config()).unwrap();
        let tree = add_tiny_tree(&rm);
        tree.insert(&1, &b"x".to_vec()).unwrap();
        rm.close().unwrap();
    }

    assert!(dir.path().join("vellum.db").is_file());
    let rm = RecordManager::open_with_config(dir.path(), config()).unwrap();
    let tree = rm.tree::<u64, Vec<u8>>("T", U64Codec, BytesCodec).unwrap();
    assert_eq!(tree.get(&1).unwrap(), Some(b"x".to_vec()));
}

/// Crash window between the two header writes: the header names a
/// broken current offset but carries the previous one. The loader
/// falls back and serves the prior committed state.
#[test]
fn malformed_current_offsets_fall_back_to_previous() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.vlm");

    {
        let rm = open(&path);
        let tree = add_tiny_tree(&rm);
        tree.insert(&1, &b"one".to_vec()).unwrap();
        rm.close().unwrap();
    }

    // Rewrite the header as the first commit phase would have left it
    // after a crash that also mangled the new current offsets: current
    // unaligned (invalid), previous pointing at the valid trees.
    let mut header = read_header(&path);
    let valid_bob = get_u64(&header, 16);
    let valid_cpb = get_u64(&header, 32);
    put_u64(&mut header, 16, 0x33); // current BoB: unaligned garbage
    put_u64(&mut header, 24, valid_bob); // previous BoB: the good one
    put_u64(&mut header, 32, 0x55); // current CPB: unaligned garbage
    put_u64(&mut header, 40, valid_cpb); // previous CPB: the good one
    write_header(&path, &header);

    let rm = open(&path);
    let tree = rm.tree::<u64, Vec<u8>>("T", U64Codec, BytesCodec).unwrap();
    assert_eq!(tree.get(&1).unwrap(), Some(b"one".to_vec()));

    // Recovery normalized the header: current offsets valid again.
    drop(tree);
    rm.close().unwrap();
    let header = read_header(&path);
    assert_eq!(get_u64(&header, 24), u64::MAX, "previous BoB not cleared");
    assert_eq!(get_u64(&header, 40), u64::MAX, "previous CPB not cleared");
}

/// Crash before the first header write of a commit: the transaction's
/// pages are flushed but the header still describes the previous
/// state, and nothing has touched the free list yet. Dropping the
/// record manager mid-transaction reproduces that file exactly.
/// Reopening serves the old state and keeps accepting writes.
#[test]
fn crash_before_header_write_keeps_old_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.vlm");

    let header_after_a;
    {
        let rm = open(&path);
        let tree = add_tiny_tree(&rm);
        tree.insert(&1, &b"one".to_vec()).unwrap();
        rm.close().unwrap();
        header_after_a = read_header(&path);
    }

    // Transaction B writes its pages but dies before its commit ever
    // rewrites the header.
    {
        let rm = open(&path);
        let tree = rm.tree::<u64, Vec<u8>>("T", U64Codec, BytesCodec).unwrap();
        rm.begin_transaction();
        tree.insert(&2, &b"two".to_vec()).unwrap();
        // Neither commit nor rollback: the handle just goes away.
    }

    assert_eq!(read_header(&path), header_after_a, "header must still describe state A");

    let rm = open(&path);
    let tree = rm.tree::<u64, Vec<u8>>("T", U64Codec, BytesCodec).unwrap();
    assert_eq!(tree.get(&1).unwrap(), Some(b"one".to_vec()), "state A must be readable");
    assert_eq!(tree.get(&2).unwrap(), None, "the unfinished write must be invisible");

    // The store keeps working.
    tree.insert(&3, &b"three".to_vec()).unwrap();
    assert_eq!(tree.get(&3).unwrap(), Some(b"three".to_vec()));
}

/// A torn page at the end of the file (incomplete append during a
/// crash) is ignored on reopen.
#[test]
fn torn_tail_page_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.vlm");

    {
        let rm = open(&path);
        let tree = add_tiny_tree(&rm);
        tree.insert(&1, &b"one".to_vec()).unwrap();
        rm.close().unwrap();
    }

    // Append 13 bytes of garbage: a partially flushed page.
    {
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xAB; 13]).unwrap();
        file.sync_all().unwrap();
    }

    let rm = open(&path);
    let tree = rm.tree::<u64, Vec<u8>>("T", U64Codec, BytesCodec).unwrap();
    assert_eq!(tree.get(&1).unwrap(), Some(b"one".to_vec()));
    tree.insert(&2, &b"two".to_vec()).unwrap();
    rm.check().unwrap();
}

/// An aborted transaction followed by a reopen leaves the committed
/// state and a clean page accounting.
#[test]
fn rollback_then_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.vlm");

    {
        let rm = open(&path);
        let tree = add_tiny_tree(&rm);
        tree.insert(&1, &b"keep".to_vec()).unwrap();

        rm.begin_transaction();
        tree.insert(&2, &b"discard".to_vec()).unwrap();
        rm.rollback().unwrap();
        rm.close().unwrap();
    }

    let rm = open(&path);
    let tree = rm.tree::<u64, Vec<u8>>("T", U64Codec, BytesCodec).unwrap();
    assert_eq!(tree.get(&1).unwrap(), Some(b"keep".to_vec()));
    assert_eq!(tree.get(&2).unwrap(), None);
    rm.check().unwrap();
}

/// Reopening with a different configured page size keeps the size the
/// file was created with.
#[test]
fn file_page_size_wins_over_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.vlm");

    {
        let rm = open(&path);
        let tree = add_tiny_tree(&rm);
        tree.insert(&1, &b"x".to_vec()).unwrap();
        rm.close().unwrap();
    }

    let rm = RecordManager::open_with_config(
        &path,
        StoreConfig { page_size: 4096, sync_on_commit: true },
    )
    .unwrap();
    assert_eq!(rm.stats().unwrap().page_size, PAGE_SIZE);
    let tree = rm.tree::<u64, Vec<u8>>("T", U64Codec, BytesCodec).unwrap();
    assert_eq!(tree.get(&1).unwrap(), Some(b"x".to_vec()));
}

/// Page sizes below the minimum or off a power of two are rejected at
/// creation.
#[test]
fn invalid_page_sizes_are_rejected() {
    let dir = tempfile::tempdir().unwrap();

    for page_size in [0usize, 32, 63, 100] {
        let path = dir.path().join(format!("bad-{page_size}.vlm"));
        let result =
            RecordManager::open_with_config(&path, StoreConfig { page_size, sync_on_commit: true });
        assert!(
            matches!(result, Err(vellum_store::Error::InvalidPageSize { .. })),
            "page size {page_size} accepted"
        );
    }
}
