//! Property tests for the persistence substructures.

use proptest::collection::vec;
use proptest::prelude::*;
use tempfile::TempDir;
use vicinity::format::{Packer, Unpacker};
use vicinity::storage::Storage;
use vicinity::store::{DeltaStore, PersistHashMap};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_hash_map_matches_model(ops in vec((0u64..64, any::<u64>(), any::<bool>()), 1..200)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.id");
        let mut model = std::collections::HashMap::new();

        {
            let storage = Storage::open(&path, true, true).unwrap();
            let map: PersistHashMap<u64, u64> = PersistHashMap::mount(storage.clone()).unwrap();
            for (key, value, erase) in &ops {
                if *erase {
                    map.erase(key).unwrap();
                    model.remove(key);
                } else {
                    map.emplace_or_assign(key, value).unwrap();
                    model.insert(*key, *value);
                }
            }
            for (key, value) in &model {
                prop_assert_eq!(map.get(key).unwrap(), Some(*value));
            }
            prop_assert_eq!(map.size(), model.len() as u64);
            storage.close().unwrap();
        }

        // Every live entry survives an unmount/mount cycle.
        let storage = Storage::open(&path, true, false).unwrap();
        let map: PersistHashMap<u64, u64> = PersistHashMap::mount(storage).unwrap();
        for (key, value) in &model {
            prop_assert_eq!(map.get(key).unwrap(), Some(*value));
        }
        prop_assert_eq!(map.size(), model.len() as u64);
    }

    #[test]
    fn prop_delta_store_appends_survive_remount(values in vec(any::<u64>(), 1..300)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.del");

        {
            let storage = Storage::open(&path, true, true).unwrap();
            let delta: DeltaStore<u64> = DeltaStore::mount(storage.clone()).unwrap();
            for value in &values {
                delta.append(value).unwrap();
            }
            prop_assert_eq!(delta.at(values.len() as u64 - 1), values.last().copied());
            storage.close().unwrap();
        }

        let storage = Storage::open(&path, true, false).unwrap();
        let delta: DeltaStore<u64> = DeltaStore::mount(storage).unwrap();
        prop_assert_eq!(delta.count(), values.len() as u64);
        for (pos, value) in values.iter().enumerate() {
            prop_assert_eq!(delta.at(pos as u64), Some(*value));
        }
    }

    #[test]
    fn prop_container_roundtrip(blocks in vec((("[a-z]{1,12}"), vec(any::<u8>(), 0..512)), 1..8)) {
        // Distinct names only; the packer rejects nothing but the table maps
        // by name.
        let mut seen = std::collections::HashSet::new();
        let blocks: Vec<_> = blocks.into_iter().filter(|(n, _)| seen.insert(n.clone())).collect();

        let mut packer = Packer::new(Vec::new());
        packer.setup().unwrap();
        for (name, data) in &blocks {
            packer.pack_segment(name, data).unwrap();
        }
        let image = packer.finish(1).unwrap();

        let unpacker = Unpacker::unpack(&image, true).unwrap();
        for (name, data) in &blocks {
            let segment = unpacker.segment(name).unwrap();
            let start = segment.data_offset as usize;
            prop_assert_eq!(&image[start..start + data.len()], data.as_slice());
        }
    }
}
