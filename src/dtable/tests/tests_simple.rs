#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::dtable::tests::helpers::{collect, collect_keys, init_tracing, seeded_memory};
    use crate::dtable::{
        Dtable, array::ArrayDtable, fixed::FixedDtable, memory::MemoryDtable,
        simple::SimpleDtable,
    };
    use crate::value::{Blob, Dtype, KeyType};

    #[test]
    fn test_create_lookup_iterate() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("table");
        let source = seeded_memory(&[(1, b"one"), (5, b"five"), (9, b"nine")]);
        let mut iter = source.iterate().unwrap();
        SimpleDtable::create(&path, iter.as_mut(), None, None).unwrap();

        let table = SimpleDtable::open(&path).unwrap();
        assert_eq!(table.key_type(), KeyType::U32);
        assert_eq!(table.entry_count().unwrap(), 3);
        assert_eq!(
            table.get(&Dtype::U32(5)).unwrap(),
            Some(Blob::from(&b"five"[..]))
        );
        assert_eq!(table.get(&Dtype::U32(4)).unwrap(), None);

        let mut iter = table.iterate().unwrap();
        assert_eq!(collect_keys(iter.as_mut()), vec![1, 5, 9]);
    }

    #[test]
    fn test_two_iterators_agree() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("table");
        let source = seeded_memory(&[(2, b"b"), (4, b"d"), (6, b"f")]);
        let mut iter = source.iterate().unwrap();
        SimpleDtable::create(&path, iter.as_mut(), None, None).unwrap();

        let table = SimpleDtable::open(&path).unwrap();
        let mut first = table.iterate().unwrap();
        let mut second = table.iterate().unwrap();
        assert_eq!(collect(first.as_mut()), collect(second.as_mut()));
    }

    #[test]
    fn test_tombstones_dropped_without_shadow() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("table");
        let source = seeded_memory(&[(1, b"a"), (2, b"b")]);
        source.remove(&Dtype::U32(2)).unwrap();

        let mut iter = source.iterate().unwrap();
        SimpleDtable::create(&path, iter.as_mut(), None, None).unwrap();

        // No shadow: nothing for the tombstone to hide, so it is elided.
        let table = SimpleDtable::open(&path).unwrap();
        assert_eq!(table.entry_count().unwrap(), 1);
        assert_eq!(table.lookup(&Dtype::U32(2)).unwrap(), None);
    }

    #[test]
    fn test_tombstones_kept_under_shadow() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("table");
        let source = seeded_memory(&[(1, b"a")]);
        source.remove(&Dtype::U32(2)).unwrap();

        // The shadow still has key 2, so the tombstone must survive.
        let shadow = seeded_memory(&[(2, b"old")]);
        let mut iter = source.iterate().unwrap();
        SimpleDtable::create(&path, iter.as_mut(), Some(&shadow), None).unwrap();

        let table = SimpleDtable::open(&path).unwrap();
        assert_eq!(table.entry_count().unwrap(), 2);
        let stored = table.lookup(&Dtype::U32(2)).unwrap().unwrap();
        assert!(!stored.exists());
        assert!(!table.contains_index(1).unwrap());
        assert!(table.contains_index(0).unwrap());
    }

    #[test]
    fn test_string_keys_roundtrip() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("table");
        let source = MemoryDtable::new(KeyType::Str, false);
        for name in ["cedar", "aspen", "birch"] {
            source
                .insert(&Dtype::str(name), Blob::from(name.as_bytes()))
                .unwrap();
        }
        let mut iter = source.iterate().unwrap();
        SimpleDtable::create(&path, iter.as_mut(), None, None).unwrap();

        let table = SimpleDtable::open(&path).unwrap();
        assert_eq!(
            table.get(&Dtype::str("aspen")).unwrap(),
            Some(Blob::from(&b"aspen"[..]))
        );
        let mut iter = table.iterate().unwrap();
        let keys: Vec<String> = collect(iter.as_mut())
            .into_iter()
            .map(|(key, _)| match key {
                Dtype::Str(s) => s.to_string(),
                other => panic!("unexpected key {other:?}"),
            })
            .collect();
        assert_eq!(keys, vec!["aspen", "birch", "cedar"]);
    }

    #[test]
    fn test_indexed_access() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("table");
        let source = seeded_memory(&[(10, b"x"), (20, b"y")]);
        let mut iter = source.iterate().unwrap();
        SimpleDtable::create(&path, iter.as_mut(), None, None).unwrap();

        let table = SimpleDtable::open(&path).unwrap();
        assert_eq!(table.index_value(0).unwrap(), Blob::from(&b"x"[..]));
        assert_eq!(table.index_value(1).unwrap(), Blob::from(&b"y"[..]));
        assert!(table.index_value(2).is_err());

        let mut iter = table.iterate().unwrap();
        assert!(iter.seek_index(1).unwrap());
        assert_eq!(iter.get_index().unwrap(), 1);
        assert_eq!(iter.key().map(|k| k.flatten()), Some(Blob::from_u32(20)));
    }

    #[test]
    fn test_fixed_dtable_uniform_values() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("table");
        let source = seeded_memory(&[(1, b"aa"), (2, b"bb"), (3, b"cc")]);
        let mut iter = source.iterate().unwrap();
        FixedDtable::create(&path, iter.as_mut(), None, None, None).unwrap();

        let table = FixedDtable::open(&path).unwrap();
        assert_eq!(table.entry_count().unwrap(), 3);
        assert_eq!(
            table.get(&Dtype::U32(2)).unwrap(),
            Some(Blob::from(&b"bb"[..]))
        );
        let mut iter = table.iterate().unwrap();
        assert_eq!(collect_keys(iter.as_mut()), vec![1, 2, 3]);
    }

    #[test]
    fn test_fixed_dtable_rejects_mixed_sizes() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("table");
        let source = seeded_memory(&[(1, b"aa"), (2, b"b")]);
        let mut iter = source.iterate().unwrap();
        assert!(FixedDtable::create(&path, iter.as_mut(), None, None, None).is_err());
    }

    #[test]
    fn test_array_dtable_dense_slots_and_holes() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("table");
        // Keys 10, 11, 14 leave holes at 12 and 13.
        let source = seeded_memory(&[(10, b"aa"), (11, b"bb"), (14, b"cc")]);
        let mut iter = source.iterate().unwrap();
        ArrayDtable::create(&path, iter.as_mut(), None, None).unwrap();

        let table = ArrayDtable::open(&path).unwrap();
        assert_eq!(
            table.get(&Dtype::U32(11)).unwrap(),
            Some(Blob::from(&b"bb"[..]))
        );
        // A hole is not an entry at all.
        assert_eq!(table.lookup(&Dtype::U32(12)).unwrap(), None);
        assert_eq!(table.lookup(&Dtype::U32(9)).unwrap(), None);
        assert_eq!(table.lookup(&Dtype::U32(15)).unwrap(), None);

        let mut iter = table.iterate().unwrap();
        assert_eq!(collect_keys(iter.as_mut()), vec![10, 11, 14]);
    }
}
