//! Duplicate-value trees: inline arrays, the sub-tree spill past the
//! inline threshold, and the cleanup when a spilled key is dropped.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use vellum_store::{
    BytesCodec, InMemoryBackend, RecordManager, StoreConfig, StrCodec, TreeOptions, U64Codec,
};

fn small_store() -> RecordManager<InMemoryBackend> {
    RecordManager::in_memory_with_config(StoreConfig { page_size: 64, sync_on_commit: false })
        .unwrap()
}

fn dup_tree<'rm>(
    rm: &'rm RecordManager<InMemoryBackend>,
) -> vellum_store::Tree<'rm, u64, Vec<u8>, InMemoryBackend> {
    rm.add_tree_with("D", U64Codec, BytesCodec, TreeOptions { fanout: 4, allow_duplicates: true })
        .unwrap()
}

#[test]
fn few_values_stay_inline() {
    let rm = small_store();
    let tree = dup_tree(&rm);

    assert_eq!(tree.insert(&7, &b"b".to_vec()).unwrap(), None);
    assert_eq!(tree.insert(&7, &b"a".to_vec()).unwrap(), None);
    assert_eq!(tree.insert(&7, &b"c".to_vec()).unwrap(), None);
    assert_eq!(tree.count(), 3);

    // get returns the smallest value; browse expands them in order.
    assert_eq!(tree.get(&7).unwrap(), Some(b"a".to_vec()));
    let values: Vec<Vec<u8>> =
        tree.browse().unwrap().map(|entry| entry.unwrap().1).collect();
    assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    rm.check().unwrap();
}

#[test]
fn reinserting_an_existing_value_is_reported() {
    let rm = small_store();
    let tree = dup_tree(&rm);

    tree.insert(&7, &b"x".to_vec()).unwrap();
    let revision = tree.revision();
    assert_eq!(tree.insert(&7, &b"x".to_vec()).unwrap(), Some(b"x".to_vec()));
    assert_eq!(tree.revision(), revision, "duplicate value must not create a revision");
}

/// Past the inline threshold the values spill into a sub-tree; reads,
/// browse order and counts stay the same.
#[test]
fn values_spill_into_a_sub_tree() {
    let rm = small_store();
    let tree = dup_tree(&rm);

    // Well past the inline threshold of eight.
    for i in 0..20u8 {
        tree.insert(&7, &vec![i]).unwrap();
    }
    tree.insert(&1, &b"solo".to_vec()).unwrap();

    assert_eq!(tree.count(), 21);
    assert_eq!(tree.get(&7).unwrap(), Some(vec![0u8]));

    let pairs: Vec<(u64, Vec<u8>)> =
        tree.browse().unwrap().collect::<Result<_, _>>().unwrap();
    assert_eq!(pairs.len(), 21);
    assert_eq!(pairs[0], (1, b"solo".to_vec()));
    for (i, pair) in pairs[1..].iter().enumerate() {
        assert_eq!(pair, &(7, vec![i as u8]), "value {i} out of order");
    }
    rm.check().unwrap();
}

/// Deleting a spilled key removes the key, all of its values, and the
/// sub-tree's pages (the checker would flag a leak otherwise).
#[test]
fn deleting_a_spilled_key_releases_the_sub_tree() {
    let rm = small_store();
    let tree = dup_tree(&rm);

    for i in 0..20u8 {
        tree.insert(&7, &vec![i]).unwrap();
    }
    tree.insert(&1, &b"solo".to_vec()).unwrap();

    let removed = tree.delete(&7).unwrap();
    assert_eq!(removed, Some((7, vec![0u8])));
    assert_eq!(tree.count(), 1);
    assert_eq!(tree.get(&7).unwrap(), None);
    rm.check().unwrap();
}

/// Spilled keys survive a keep-revisions snapshot: the old revision
/// still reads the sub-tree.
#[test]
fn spilled_values_respect_retained_revisions() {
    let rm = small_store();
    let tree = dup_tree(&rm);

    for i in 0..12u8 {
        tree.insert(&7, &vec![i]).unwrap();
    }
    rm.set_keep_revisions(true);
    let snapshot = {
        tree.insert(&7, &vec![100]).unwrap();
        tree.revision()
    };

    tree.insert(&7, &vec![101]).unwrap();
    tree.delete(&7).unwrap();
    assert_eq!(tree.get(&7).unwrap(), None);

    let old: Vec<Vec<u8>> =
        tree.browse_at(snapshot).unwrap().map(|entry| entry.unwrap().1).collect();
    assert_eq!(old.len(), 13);
    assert_eq!(old[12], vec![100]);
    rm.check().unwrap();
}

/// Duplicate values under string keys: the value comparator orders
/// the array, not the insertion sequence.
#[test]
fn string_keyed_duplicates() {
    let rm = small_store();
    let tree = rm
        .add_tree_with(
            "tags",
            StrCodec,
            StrCodec,
            TreeOptions { fanout: 4, allow_duplicates: true },
        )
        .unwrap();

    for tag in ["zebra", "alpha", "monk"] {
        tree.insert(&"k".to_string(), &tag.to_string()).unwrap();
    }
    let values: Vec<String> = tree.browse().unwrap().map(|e| e.unwrap().1).collect();
    assert_eq!(values, vec!["alpha", "monk", "zebra"]);
}
