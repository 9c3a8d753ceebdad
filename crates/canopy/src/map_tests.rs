//! End-to-end invariant tests for the map container.

use crate::array::Array;
use crate::digest::{DefaultDigesterBuilder, DigesterBuilder};
use crate::map::Map;
use crate::storable::{Storable, Value};
use crate::storage::SlabStorage;
use crate::test_values::{
    string_value, test_storage, uint64_value, BucketDigesterBuilder, CollidingDigesterBuilder,
    ShallowDigesterBuilder, OTHER_ADDRESS, TEST_ADDRESS,
};
use crate::validate::{validate_map, TreeStats};
use canopy_error::CanopyError;
use canopy_store::MemBlobStore;
use canopy_types::{StorageConfig, TypeInfo};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::rc::Rc;

fn default_builder(storage: &SlabStorage<MemBlobStore>) -> Rc<dyn DigesterBuilder> {
    Rc::new(storage.default_digester_builder())
}

fn key(text: &str) -> Vec<u8> {
    string_value(text)
}

fn reopen_storage(storage: &SlabStorage<MemBlobStore>, target: u32) -> SlabStorage<MemBlobStore> {
    let config = StorageConfig::new(target, 0).expect("valid test threshold");
    SlabStorage::new(
        MemBlobStore::with_blobs(storage.base().blobs().clone()),
        config,
    )
}

#[test]
fn test_set_get_remove_roundtrip() {
    let mut storage = test_storage(1024);
    let builder = default_builder(&storage);
    let mut map = Map::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(9), builder).unwrap();

    assert_eq!(map.get(&mut storage, &key("absent")).unwrap(), None);

    let old = map
        .set(&mut storage, key("alpha"), Value::Bytes(uint64_value(1)))
        .unwrap();
    assert_eq!(old, None);
    let old = map
        .set(&mut storage, key("alpha"), Value::Bytes(uint64_value(2)))
        .unwrap();
    assert_eq!(old, Some(Storable::Value(uint64_value(1))));
    assert_eq!(map.count(&mut storage).unwrap(), 1);

    let got = map.get(&mut storage, &key("alpha")).unwrap();
    assert_eq!(got, Some(Storable::Value(uint64_value(2))));

    let removed = map.remove(&mut storage, &key("alpha")).unwrap();
    assert_eq!(
        removed,
        Some((
            Storable::Value(key("alpha")),
            Storable::Value(uint64_value(2))
        ))
    );
    assert_eq!(map.count(&mut storage).unwrap(), 0);
    // Removing an absent key is not an error.
    assert_eq!(map.remove(&mut storage, &key("alpha")).unwrap(), None);
    validate_map(&mut storage, &map).unwrap();
}

#[test]
fn test_first_level_collision_stays_inline() {
    let mut storage = test_storage(1024);
    let mut map = Map::new(
        &mut storage,
        TEST_ADDRESS,
        TypeInfo::from_u64(9),
        Rc::new(CollidingDigesterBuilder),
    )
    .unwrap();

    map.set(&mut storage, key("k1"), Value::Bytes(uint64_value(1)))
        .unwrap();
    map.set(&mut storage, key("k2"), Value::Bytes(uint64_value(2)))
        .unwrap();

    assert_eq!(
        map.get(&mut storage, &key("k1")).unwrap(),
        Some(Storable::Value(uint64_value(1)))
    );
    assert_eq!(
        map.get(&mut storage, &key("k2")).unwrap(),
        Some(Storable::Value(uint64_value(2)))
    );
    assert_eq!(map.count(&mut storage).unwrap(), 2);

    // Two colliding entries nest one level deeper but stay in the one
    // root slab.
    let stats = validate_map(&mut storage, &map).unwrap();
    assert_eq!(
        stats,
        TreeStats {
            data_slab_count: 1,
            meta_slab_count: 0,
            storable_slab_count: 0,
            collision_slab_count: 0,
            depth: 1,
        }
    );
    assert_eq!(storage.count(), 1);
}

#[test]
fn test_collision_group_externalizes_and_reinlines() {
    let mut storage = test_storage(1024);
    let mut map = Map::new(
        &mut storage,
        TEST_ADDRESS,
        TypeInfo::from_u64(9),
        Rc::new(CollidingDigesterBuilder),
    )
    .unwrap();

    // Everything collides at level 0; enough entries push the group
    // past the cap and out into its own slab.
    let count = 40u64;
    for i in 0..count {
        map.set(
            &mut storage,
            key(&format!("key-{i:04}")),
            Value::Bytes(uint64_value(i)),
        )
        .unwrap();
    }
    let stats = validate_map(&mut storage, &map).unwrap();
    assert_eq!(stats.collision_slab_count, 1);
    assert_eq!(map.count(&mut storage).unwrap(), count);

    for i in 0..count {
        assert_eq!(
            map.get(&mut storage, &key(&format!("key-{i:04}"))).unwrap(),
            Some(Storable::Value(uint64_value(i))),
            "key {i}"
        );
    }

    // Draining the group back down to one entry re-inlines it and
    // frees the collision slab.
    for i in 1..count {
        map.remove(&mut storage, &key(&format!("key-{i:04}")))
            .unwrap();
    }
    let stats = validate_map(&mut storage, &map).unwrap();
    assert_eq!(stats.collision_slab_count, 0);
    assert_eq!(map.count(&mut storage).unwrap(), 1);
    assert_eq!(
        map.get(&mut storage, &key("key-0000")).unwrap(),
        Some(Storable::Value(uint64_value(0)))
    );
    assert_eq!(storage.count(), 1);
}

#[test]
fn test_linear_bucket_at_digester_exhaustion() {
    let mut storage = test_storage(1024);
    let mut map = Map::new(
        &mut storage,
        TEST_ADDRESS,
        TypeInfo::from_u64(9),
        Rc::new(BucketDigesterBuilder),
    )
    .unwrap();

    for i in 0..10u64 {
        map.set(
            &mut storage,
            key(&format!("bucket-{i}")),
            Value::Bytes(uint64_value(i)),
        )
        .unwrap();
    }
    assert_eq!(map.count(&mut storage).unwrap(), 10);
    validate_map(&mut storage, &map).unwrap();

    for i in 0..10u64 {
        assert_eq!(
            map.get(&mut storage, &key(&format!("bucket-{i}"))).unwrap(),
            Some(Storable::Value(uint64_value(i)))
        );
    }

    // Bucket iteration is ordered by encoded key bytes.
    let mut visited = Vec::new();
    map.iterate(&mut storage, |k, _| {
        visited.push(k.as_value_bytes().unwrap().to_vec());
        Ok(true)
    })
    .unwrap();
    let mut sorted = visited.clone();
    sorted.sort();
    assert_eq!(visited, sorted);

    let removed = map.remove(&mut storage, &key("bucket-3")).unwrap();
    assert!(removed.is_some());
    assert_eq!(map.count(&mut storage).unwrap(), 9);
    validate_map(&mut storage, &map).unwrap();
}

#[test]
fn test_large_map_grows_and_iterates_once() {
    let mut storage = test_storage(512);
    let builder = default_builder(&storage);
    let mut map = Map::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(9), builder).unwrap();

    let count = 2000u64;
    for i in 0..count {
        map.set(
            &mut storage,
            key(&format!("entry-{i:05}")),
            Value::Bytes(uint64_value(i)),
        )
        .unwrap();
    }
    assert_eq!(map.count(&mut storage).unwrap(), count);

    let stats = validate_map(&mut storage, &map).unwrap();
    assert!(stats.depth >= 2);
    assert!(stats.meta_slab_count > 0);
    assert_eq!(
        map.slab_count(&mut storage).unwrap(),
        storage.count() as u64
    );

    // Every key exactly once, in level-0 digest order.
    let digester_builder = storage.default_digester_builder();
    let mut seen = BTreeMap::new();
    let mut last_digest = 0u64;
    map.iterate(&mut storage, |k, v| {
        let key_bytes = k.as_value_bytes().unwrap().to_vec();
        let digest = digester_builder.digest(&key_bytes).digest_at(0)?;
        assert!(digest >= last_digest, "iteration left digest order");
        last_digest = digest;
        assert!(seen.insert(key_bytes, v.clone()).is_none(), "key repeated");
        Ok(true)
    })
    .unwrap();
    assert_eq!(seen.len() as u64, count);
    for i in 0..count {
        assert_eq!(
            seen.get(&key(&format!("entry-{i:05}"))),
            Some(&Storable::Value(uint64_value(i)))
        );
    }
}

#[test]
fn test_map_root_id_stable_through_drain() {
    let mut storage = test_storage(512);
    let builder = default_builder(&storage);
    let mut map = Map::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(9), builder).unwrap();
    let root_id = map.root_id();

    for i in 0..1000u64 {
        map.set(
            &mut storage,
            key(&format!("entry-{i:05}")),
            Value::Bytes(uint64_value(i)),
        )
        .unwrap();
    }
    validate_map(&mut storage, &map).unwrap();

    for i in 0..1000u64 {
        let removed = map
            .remove(&mut storage, &key(&format!("entry-{i:05}")))
            .unwrap();
        assert!(removed.is_some(), "entry {i} vanished early");
    }
    assert_eq!(map.root_id(), root_id);
    assert_eq!(map.count(&mut storage).unwrap(), 0);
    assert_eq!(storage.count(), 1);
    validate_map(&mut storage, &map).unwrap();
}

#[test]
fn test_map_round_trip_through_commit() {
    let mut storage = test_storage(512);
    let builder = default_builder(&storage);
    let mut map = Map::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(9), builder).unwrap();
    for i in 0..800u64 {
        map.set(
            &mut storage,
            key(&format!("entry-{i:05}")),
            Value::Bytes(uint64_value(i)),
        )
        .unwrap();
    }
    storage.commit().unwrap();

    let mut storage2 = reopen_storage(&storage, 512);
    let builder2 = default_builder(&storage2);
    let map2 = Map::open(&mut storage2, map.root_id(), builder2).unwrap();
    assert_eq!(map2.count(&mut storage2).unwrap(), 800);
    for i in 0..800u64 {
        assert_eq!(
            map2.get(&mut storage2, &key(&format!("entry-{i:05}")))
                .unwrap(),
            Some(Storable::Value(uint64_value(i)))
        );
    }
    validate_map(&mut storage2, &map2).unwrap();
}

#[test]
fn test_map_deterministic_layout() {
    fn build(seed: u64) -> SlabStorage<MemBlobStore> {
        let mut storage = test_storage(512);
        let builder = default_builder(&storage);
        let mut map =
            Map::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(9), builder).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..1500 {
            let k = key(&format!("entry-{:04}", rng.gen_range(0..600)));
            if rng.gen_bool(0.3) {
                map.remove(&mut storage, &k).unwrap();
            } else {
                map.set(&mut storage, k, Value::Bytes(uint64_value(rng.gen())))
                    .unwrap();
            }
        }
        validate_map(&mut storage, &map).unwrap();
        storage.commit().unwrap();
        storage
    }

    let a = build(3);
    let b = build(3);
    assert_eq!(a.base().blobs(), b.base().blobs());
}

#[test]
fn test_map_batch_matches_incremental_content() {
    let mut rng = StdRng::seed_from_u64(31);
    let pairs: Vec<(Vec<u8>, u64)> = (0..1200)
        .map(|i| (key(&format!("entry-{i:05}")), rng.gen()))
        .collect();

    let mut incremental_storage = test_storage(512);
    let builder = default_builder(&incremental_storage);
    let mut incremental = Map::new(
        &mut incremental_storage,
        TEST_ADDRESS,
        TypeInfo::from_u64(9),
        builder,
    )
    .unwrap();
    for (k, v) in &pairs {
        incremental
            .set(
                &mut incremental_storage,
                k.clone(),
                Value::Bytes(uint64_value(*v)),
            )
            .unwrap();
    }

    let mut batch_storage = test_storage(512);
    let builder = default_builder(&batch_storage);
    let batch = Map::from_batch(
        &mut batch_storage,
        TEST_ADDRESS,
        TypeInfo::from_u64(9),
        builder,
        pairs
            .iter()
            .map(|(k, v)| (k.clone(), Value::Bytes(uint64_value(*v)))),
    )
    .unwrap();

    validate_map(&mut incremental_storage, &incremental).unwrap();
    validate_map(&mut batch_storage, &batch).unwrap();
    assert_eq!(
        batch.count(&mut batch_storage).unwrap(),
        incremental.count(&mut incremental_storage).unwrap()
    );
    for (k, v) in &pairs {
        assert_eq!(
            batch.get(&mut batch_storage, k).unwrap(),
            Some(Storable::Value(uint64_value(*v))),
        );
    }

    // Bulk construction is deterministic.
    let mut batch_storage2 = test_storage(512);
    let builder = default_builder(&batch_storage2);
    let _ = Map::from_batch(
        &mut batch_storage2,
        TEST_ADDRESS,
        TypeInfo::from_u64(9),
        builder,
        pairs
            .iter()
            .map(|(k, v)| (k.clone(), Value::Bytes(uint64_value(*v)))),
    )
    .unwrap();
    batch_storage.commit().unwrap();
    batch_storage2.commit().unwrap();
    assert_eq!(batch_storage.base().blobs(), batch_storage2.base().blobs());
}

#[test]
fn test_map_batch_collisions_and_duplicates() {
    let mut storage = test_storage(1024);
    let pairs: Vec<(Vec<u8>, Value)> = (0..30u64)
        .map(|i| {
            (
                key(&format!("key-{:02}", i % 20)),
                Value::Bytes(uint64_value(i)),
            )
        })
        .collect();
    let map = Map::from_batch(
        &mut storage,
        TEST_ADDRESS,
        TypeInfo::from_u64(9),
        Rc::new(CollidingDigesterBuilder),
        pairs,
    )
    .unwrap();

    // 20 distinct keys; duplicates resolved to the last occurrence.
    assert_eq!(map.count(&mut storage).unwrap(), 20);
    for i in 0..10u64 {
        assert_eq!(
            map.get(&mut storage, &key(&format!("key-{i:02}"))).unwrap(),
            Some(Storable::Value(uint64_value(i + 20))),
        );
    }
    for i in 10..20u64 {
        assert_eq!(
            map.get(&mut storage, &key(&format!("key-{i:02}"))).unwrap(),
            Some(Storable::Value(uint64_value(i))),
        );
    }
    validate_map(&mut storage, &map).unwrap();
}

#[test]
fn test_map_value_spill_and_nested_container() {
    let mut storage = test_storage(1024);
    let builder = default_builder(&storage);
    let mut map = Map::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(9), builder).unwrap();

    let big = string_value(&"v".repeat(800));
    map.set(&mut storage, key("big"), Value::Bytes(big.clone()))
        .unwrap();
    let got = map.get(&mut storage, &key("big")).unwrap().unwrap();
    let spill_id = got.as_pointer().expect("oversized value spills");
    assert_eq!(
        storage
            .storable_payload(spill_id)
            .unwrap()
            .as_value_bytes()
            .unwrap(),
        &big[..]
    );

    let mut nested = Array::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(10)).unwrap();
    nested
        .append(&mut storage, Value::Bytes(uint64_value(5)))
        .unwrap();
    map.set(
        &mut storage,
        key("nested"),
        Value::Container(nested.root_id()),
    )
    .unwrap();
    assert_eq!(
        map.get(&mut storage, &key("nested")).unwrap(),
        Some(Storable::Pointer(nested.root_id()))
    );

    let stats = validate_map(&mut storage, &map).unwrap();
    assert_eq!(stats.storable_slab_count, 1);
    assert_eq!(
        map.slab_count(&mut storage).unwrap(),
        storage.count() as u64
    );
}

#[test]
fn test_map_deep_copy_and_remove() {
    let mut storage = test_storage(512);
    let builder = default_builder(&storage);
    let mut map = Map::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(9), builder).unwrap();
    for i in 0..300u64 {
        map.set(
            &mut storage,
            key(&format!("entry-{i:05}")),
            Value::Bytes(uint64_value(i)),
        )
        .unwrap();
    }

    let copy = map.deep_copy(&mut storage, OTHER_ADDRESS).unwrap();
    assert_ne!(copy.root_id(), map.root_id());
    assert_eq!(copy.root_id().address, OTHER_ADDRESS);
    assert_eq!(copy.count(&mut storage).unwrap(), 300);
    for i in 0..300u64 {
        assert_eq!(
            copy.get(&mut storage, &key(&format!("entry-{i:05}")))
                .unwrap(),
            Some(Storable::Value(uint64_value(i)))
        );
    }
    validate_map(&mut storage, &copy).unwrap();

    let before = storage.count();
    copy.deep_remove(&mut storage).unwrap();
    assert!(storage.count() < before);
    map.deep_remove(&mut storage).unwrap();
    assert_eq!(storage.count(), 0);
}

#[test]
fn test_map_key_too_large() {
    let mut storage = test_storage(1024);
    let builder = default_builder(&storage);
    let mut map = Map::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(9), builder).unwrap();
    let err = map
        .set(
            &mut storage,
            key(&"k".repeat(600)),
            Value::Bytes(uint64_value(0)),
        )
        .unwrap_err();
    assert!(matches!(err, CanopyError::OverLimit { .. }));
}

#[test]
fn test_shallow_digester_rejected() {
    let mut storage = test_storage(1024);
    let err = Map::new(
        &mut storage,
        TEST_ADDRESS,
        TypeInfo::from_u64(9),
        Rc::new(ShallowDigesterBuilder),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        CanopyError::TooFewDigestLevels { got: 2, min: 5 }
    ));
}

#[test]
fn test_open_with_wrong_container_kind() {
    let mut storage = test_storage(1024);
    let array = Array::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(1)).unwrap();
    let builder: Rc<dyn DigesterBuilder> = Rc::new(DefaultDigesterBuilder::new(0));
    let err = Map::open(&mut storage, array.root_id(), builder).unwrap_err();
    assert!(matches!(err, CanopyError::TypeInfoMismatch { .. }));

    let builder: Rc<dyn DigesterBuilder> = Rc::new(DefaultDigesterBuilder::new(0));
    let map = Map::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(2), builder).unwrap();
    let err = Array::open(&mut storage, map.root_id()).unwrap_err();
    assert!(matches!(err, CanopyError::TypeInfoMismatch { .. }));
}

#[test]
fn test_iterate_stops_cleanly() {
    let mut storage = test_storage(512);
    let builder = default_builder(&storage);
    let mut map = Map::new(&mut storage, TEST_ADDRESS, TypeInfo::from_u64(9), builder).unwrap();
    for i in 0..100u64 {
        map.set(
            &mut storage,
            key(&format!("entry-{i:03}")),
            Value::Bytes(uint64_value(i)),
        )
        .unwrap();
    }
    let mut seen = 0;
    map.iterate(&mut storage, |_, _| {
        seen += 1;
        Ok(seen < 7)
    })
    .unwrap();
    assert_eq!(seen, 7);
}
