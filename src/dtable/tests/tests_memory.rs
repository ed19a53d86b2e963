#[cfg(test)]
mod tests {
    use crate::dtable::tests::helpers::{collect_keys, init_tracing, seeded_memory};
    use crate::dtable::{Dtable, DtableError, memory::MemoryDtable};
    use crate::value::{Blob, Dtype, KeyType};

    #[test]
    fn test_insert_lookup_iterate() {
        init_tracing();

        let table = seeded_memory(&[(3, b"c"), (1, b"a"), (2, b"b")]);
        assert_eq!(
            table.get(&Dtype::U32(2)).unwrap(),
            Some(Blob::from(&b"b"[..]))
        );
        assert_eq!(table.get(&Dtype::U32(9)).unwrap(), None);

        let mut iter = table.iterate().unwrap();
        assert_eq!(collect_keys(iter.as_mut()), vec![1, 2, 3]);
    }

    #[test]
    fn test_remove_writes_tombstone() {
        init_tracing();

        let table = seeded_memory(&[(1, b"a")]);
        table.remove(&Dtype::U32(1)).unwrap();

        // The entry still exists, as a tombstone.
        let stored = table.lookup(&Dtype::U32(1)).unwrap().unwrap();
        assert!(!stored.exists());
        assert_eq!(table.get(&Dtype::U32(1)).unwrap(), None);
        assert_eq!(table.len().unwrap(), 1);
    }

    #[test]
    fn test_full_remove_drops_entry() {
        init_tracing();

        let table = MemoryDtable::new(KeyType::U32, true);
        table.insert(&Dtype::U32(1), Blob::from(&b"a"[..])).unwrap();
        table.remove(&Dtype::U32(1)).unwrap();

        assert_eq!(table.lookup(&Dtype::U32(1)).unwrap(), None);
        assert_eq!(table.len().unwrap(), 0);
    }

    #[test]
    fn test_insert_dne_equals_remove() {
        init_tracing();

        let table = seeded_memory(&[(1, b"a")]);
        table.insert(&Dtype::U32(1), Blob::dne()).unwrap();
        let stored = table.lookup(&Dtype::U32(1)).unwrap().unwrap();
        assert!(!stored.exists());
    }

    #[test]
    fn test_wrong_key_type_rejected() {
        init_tracing();

        let table = MemoryDtable::new(KeyType::U32, false);
        let err = table
            .insert(&Dtype::str("nope"), Blob::empty())
            .unwrap_err();
        assert!(matches!(err, DtableError::InvalidArgument(_)));
        assert!(matches!(
            table.lookup(&Dtype::str("nope")),
            Err(DtableError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_iterator_snapshot_survives_mutation() {
        init_tracing();

        let table = seeded_memory(&[(1, b"a"), (2, b"b")]);
        let mut iter = table.iterate().unwrap();
        table.insert(&Dtype::U32(3), Blob::from(&b"c"[..])).unwrap();

        // The iterator observes the state captured at creation.
        assert_eq!(collect_keys(iter.as_mut()), vec![1, 2]);
        let mut fresh = table.iterate().unwrap();
        assert_eq!(collect_keys(fresh.as_mut()), vec![1, 2, 3]);
    }

    #[test]
    fn test_seek_and_prev_recover_last() {
        init_tracing();

        let table = seeded_memory(&[(10, b"a"), (20, b"b"), (30, b"c")]);
        let mut iter = table.iterate().unwrap();

        assert!(iter.seek(&Dtype::U32(20)));
        assert_eq!(iter.key().map(|k| k.flatten()), Some(Blob::from_u32(20)));

        // Seek to a missing key parks at the next greater entry.
        assert!(!iter.seek(&Dtype::U32(25)));
        assert_eq!(iter.key().map(|k| k.flatten()), Some(Blob::from_u32(30)));

        // Seek past the end, then prev recovers the last element.
        assert!(!iter.seek(&Dtype::U32(99)));
        assert!(!iter.valid());
        assert!(iter.prev());
        assert_eq!(iter.key().map(|k| k.flatten()), Some(Blob::from_u32(30)));
    }

    #[test]
    fn test_empty_iteration_invalid_immediately() {
        init_tracing();

        let table = MemoryDtable::new(KeyType::U32, false);
        let iter = table.iterate().unwrap();
        assert!(!iter.valid());
    }

    #[test]
    fn test_atx_staging_and_commit() {
        init_tracing();

        let table = seeded_memory(&[(1, b"old")]);
        let atx = table.create_tx().unwrap();

        table
            .insert_atx(&Dtype::U32(1), Blob::from(&b"new"[..]), false, Some(atx))
            .unwrap();
        table
            .insert_atx(&Dtype::U32(2), Blob::from(&b"two"[..]), false, Some(atx))
            .unwrap();

        // Staged writes are visible inside the transaction only.
        assert_eq!(
            table.lookup_atx(&Dtype::U32(1), Some(atx)).unwrap(),
            Some(Blob::from(&b"new"[..]))
        );
        assert_eq!(
            table.lookup(&Dtype::U32(1)).unwrap(),
            Some(Blob::from(&b"old"[..]))
        );
        assert_eq!(table.lookup(&Dtype::U32(2)).unwrap(), None);

        table.commit_tx(atx).unwrap();
        assert_eq!(
            table.lookup(&Dtype::U32(1)).unwrap(),
            Some(Blob::from(&b"new"[..]))
        );
        assert_eq!(
            table.lookup(&Dtype::U32(2)).unwrap(),
            Some(Blob::from(&b"two"[..]))
        );
    }

    #[test]
    fn test_atx_abort_discards() {
        init_tracing();

        let table = seeded_memory(&[(1, b"keep")]);
        let atx = table.create_tx().unwrap();
        table
            .insert_atx(&Dtype::U32(1), Blob::from(&b"drop"[..]), false, Some(atx))
            .unwrap();
        table.abort_tx(atx).unwrap();

        assert_eq!(
            table.lookup(&Dtype::U32(1)).unwrap(),
            Some(Blob::from(&b"keep"[..]))
        );
        // The handle is gone.
        assert!(table.check_tx(atx).is_err());
    }
}
