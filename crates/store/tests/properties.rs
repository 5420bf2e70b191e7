//! Randomized properties: whatever goes in comes back out, sorted and
//! exactly once, across splits, merges and reopen cycles.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;

use proptest::prelude::*;
use vellum_store::{
    BytesCodec, InMemoryBackend, RecordManager, StoreConfig, TreeOptions, U64Codec,
};

fn small_store() -> RecordManager<InMemoryBackend> {
    RecordManager::in_memory_with_config(StoreConfig { page_size: 64, sync_on_commit: false })
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Insert a random key set, browse it back: sorted, unique, equal
    /// to the model.
    #[test]
    fn browse_matches_model(keys in proptest::collection::vec(0u64..1000, 1..120)) {
        let rm = small_store();
        let tree = rm
            .add_tree_with("T", U64Codec, BytesCodec,
                TreeOptions { fanout: 4, allow_duplicates: false })
            .unwrap();

        let mut model = BTreeMap::new();
        for key in &keys {
            let value = key.to_string().into_bytes();
            tree.insert(key, &value).unwrap();
            model.insert(*key, value);
        }

        let stored: Vec<(u64, Vec<u8>)> =
            tree.browse().unwrap().collect::<Result<_, _>>().unwrap();
        let expected: Vec<(u64, Vec<u8>)> =
            model.iter().map(|(k, v)| (*k, v.clone())).collect();
        prop_assert_eq!(stored, expected);
        prop_assert_eq!(tree.count(), model.len() as u64);

        rm.check().unwrap();
    }

    /// Random interleaving of inserts and deletes agrees with a
    /// BTreeMap model at every step's end state.
    #[test]
    fn mixed_workload_matches_model(
        ops in proptest::collection::vec((any::<bool>(), 0u64..200), 1..150)
    ) {
        let rm = small_store();
        let tree = rm
            .add_tree_with("T", U64Codec, BytesCodec,
                TreeOptions { fanout: 4, allow_duplicates: false })
            .unwrap();

        let mut model: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        for (is_insert, key) in ops {
            if is_insert {
                let value = format!("v{key}").into_bytes();
                let old = tree.insert(&key, &value).unwrap();
                let model_old = model.insert(key, value);
                prop_assert_eq!(old, model_old);
            } else {
                let removed = tree.delete(&key).unwrap().map(|(_, v)| v);
                let model_removed = model.remove(&key);
                prop_assert_eq!(removed, model_removed);
            }
        }

        for (key, value) in &model {
            let got = tree.get(key).unwrap();
            prop_assert_eq!(got.as_ref(), Some(value));
        }
        let stored: Vec<u64> = tree.browse().unwrap().map(|e| e.unwrap().0).collect();
        let expected: Vec<u64> = model.keys().copied().collect();
        prop_assert_eq!(stored, expected);

        rm.check().unwrap();
    }

    /// Every committed state survives a close-and-reopen cycle.
    #[test]
    fn reopen_round_trip(keys in proptest::collection::vec(0u64..500, 1..60)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prop.vlm");
        let config = StoreConfig { page_size: 64, sync_on_commit: false };

        let mut model = BTreeMap::new();
        {
            let rm = RecordManager::open_with_config(&path, config.clone()).unwrap();
            let tree = rm
                .add_tree_with("T", U64Codec, BytesCodec,
                    TreeOptions { fanout: 4, allow_duplicates: false })
                .unwrap();
            for key in &keys {
                let value = key.to_string().into_bytes();
                tree.insert(key, &value).unwrap();
                model.insert(*key, value);
            }
            drop(tree);
            rm.close().unwrap();
        }

        let reopened = RecordManager::open_with_config(&path, config).unwrap();
        let tree = reopened.tree::<u64, Vec<u8>>("T", U64Codec, BytesCodec).unwrap();

        for (key, value) in &model {
            let got = tree.get(key).unwrap();
            prop_assert_eq!(got.as_ref(), Some(value));
        }
        let stored: Vec<u64> = tree.browse().unwrap().map(|e| e.unwrap().0).collect();
        let expected: Vec<u64> = model.keys().copied().collect();
        prop_assert_eq!(stored, expected);
        reopened.check().unwrap();
    }
}
