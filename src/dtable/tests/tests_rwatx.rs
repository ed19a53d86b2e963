#[cfg(test)]
mod tests {
    use crate::dtable::tests::helpers::{config, init_tracing, test_env};
    use crate::dtable::{Dtable, DtableError};
    use crate::factory::dtable_entry;
    use crate::value::{Blob, Dtype, KeyType};

    const RWATX_CONFIG: &str = r#"config [
        "class" class(dt) rwatx_dtable
        "config" config [
            "base" class(dt) managed_dtable
            "base_config" config [
                "base" class(dt) simple_dtable
            ]
        ]
    ]"#;

    fn open_rwatx(env: &crate::env::Env) -> std::sync::Arc<dyn Dtable> {
        let cfg = config(RWATX_CONFIG);
        let (factory, sub) = dtable_entry(env.ctx(), &cfg, "class", "config").unwrap();
        let path = env.dir().join("tx_table");
        factory
            .create_empty(env.ctx(), &path, &sub, KeyType::U32)
            .unwrap();
        factory.open(env.ctx(), &path, &sub).unwrap()
    }

    #[test]
    fn test_commit_applies_all_writes() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_rwatx(&env);

        let atx = table.create_tx().unwrap();
        table
            .insert_atx(&Dtype::U32(1), Blob::from(&b"a"[..]), false, Some(atx))
            .unwrap();
        table
            .insert_atx(&Dtype::U32(2), Blob::from(&b"b"[..]), false, Some(atx))
            .unwrap();

        // Nothing visible outside the transaction yet.
        assert_eq!(table.lookup(&Dtype::U32(1)).unwrap(), None);

        table.commit_tx(atx).unwrap();
        assert_eq!(
            table.get(&Dtype::U32(1)).unwrap(),
            Some(Blob::from(&b"a"[..]))
        );
        assert_eq!(
            table.get(&Dtype::U32(2)).unwrap(),
            Some(Blob::from(&b"b"[..]))
        );
    }

    #[test]
    fn test_abort_discards_all_writes() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_rwatx(&env);

        let atx = table.create_tx().unwrap();
        table
            .insert_atx(&Dtype::U32(1), Blob::from(&b"a"[..]), false, Some(atx))
            .unwrap();
        table.abort_tx(atx).unwrap();

        assert_eq!(table.lookup(&Dtype::U32(1)).unwrap(), None);
    }

    #[test]
    fn test_write_write_conflict_aborts_second() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_rwatx(&env);

        let t1 = table.create_tx().unwrap();
        let t2 = table.create_tx().unwrap();

        table
            .insert_atx(&Dtype::U32(1), Blob::from(&b"a"[..]), false, Some(t1))
            .unwrap();
        // T2 hits T1's write lock: busy, and T2 is now doomed.
        let err = table
            .insert_atx(&Dtype::U32(1), Blob::from(&b"b"[..]), false, Some(t2))
            .unwrap_err();
        assert!(matches!(err, DtableError::Busy(_)));
        assert!(matches!(table.check_tx(t2), Err(DtableError::Busy(_))));
        assert!(matches!(table.commit_tx(t2), Err(DtableError::Busy(_))));

        // T1 commits; T2 must abort to release its state.
        table.commit_tx(t1).unwrap();
        table.abort_tx(t2).unwrap();

        assert_eq!(
            table.get(&Dtype::U32(1)).unwrap(),
            Some(Blob::from(&b"a"[..]))
        );
    }

    #[test]
    fn test_read_blocks_foreign_write() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_rwatx(&env);
        table.insert(&Dtype::U32(1), Blob::from(&b"base"[..])).unwrap();

        let reader = table.create_tx().unwrap();
        let writer = table.create_tx().unwrap();

        // Reader tags the key shared.
        assert_eq!(
            table.lookup_atx(&Dtype::U32(1), Some(reader)).unwrap(),
            Some(Blob::from(&b"base"[..]))
        );
        // A foreign write cannot take the exclusive lock.
        let err = table
            .insert_atx(&Dtype::U32(1), Blob::from(&b"w"[..]), false, Some(writer))
            .unwrap_err();
        assert!(matches!(err, DtableError::Busy(_)));

        table.abort_tx(writer).unwrap();
        table.commit_tx(reader).unwrap();
    }

    #[test]
    fn test_sole_reader_upgrades_to_writer() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_rwatx(&env);
        table.insert(&Dtype::U32(1), Blob::from(&b"base"[..])).unwrap();

        let atx = table.create_tx().unwrap();
        assert!(
            table
                .lookup_atx(&Dtype::U32(1), Some(atx))
                .unwrap()
                .is_some()
        );
        // Sole reader: the upgrade succeeds.
        table
            .insert_atx(&Dtype::U32(1), Blob::from(&b"new"[..]), false, Some(atx))
            .unwrap();
        table.commit_tx(atx).unwrap();
        assert_eq!(
            table.get(&Dtype::U32(1)).unwrap(),
            Some(Blob::from(&b"new"[..]))
        );
    }

    #[test]
    fn test_two_readers_block_upgrade() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_rwatx(&env);
        table.insert(&Dtype::U32(1), Blob::from(&b"base"[..])).unwrap();

        let t1 = table.create_tx().unwrap();
        let t2 = table.create_tx().unwrap();
        assert!(table.lookup_atx(&Dtype::U32(1), Some(t1)).unwrap().is_some());
        assert!(table.lookup_atx(&Dtype::U32(1), Some(t2)).unwrap().is_some());

        // Two readers: neither may upgrade.
        let err = table
            .insert_atx(&Dtype::U32(1), Blob::from(&b"x"[..]), false, Some(t1))
            .unwrap_err();
        assert!(matches!(err, DtableError::Busy(_)));

        table.abort_tx(t1).unwrap();
        table.commit_tx(t2).unwrap();
    }

    #[test]
    fn test_iterator_reads_tag_keys() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_rwatx(&env);
        table.insert(&Dtype::U32(1), Blob::from(&b"a"[..])).unwrap();

        let reader = table.create_tx().unwrap();
        let writer = table.create_tx().unwrap();

        let mut iter = table.iterate_atx(Some(reader)).unwrap();
        iter.first();
        // Touching the value counts as a read of that key.
        assert_eq!(iter.value(), Some(Blob::from(&b"a"[..])));

        let err = table
            .insert_atx(&Dtype::U32(1), Blob::from(&b"w"[..]), false, Some(writer))
            .unwrap_err();
        assert!(matches!(err, DtableError::Busy(_)));

        table.abort_tx(writer).unwrap();
        table.commit_tx(reader).unwrap();
    }

    #[test]
    fn test_release_frees_keys_for_later_transactions() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_rwatx(&env);

        let t1 = table.create_tx().unwrap();
        table
            .insert_atx(&Dtype::U32(1), Blob::from(&b"a"[..]), false, Some(t1))
            .unwrap();
        table.commit_tx(t1).unwrap();

        // The key is free again.
        let t2 = table.create_tx().unwrap();
        table
            .insert_atx(&Dtype::U32(1), Blob::from(&b"b"[..]), false, Some(t2))
            .unwrap();
        table.commit_tx(t2).unwrap();
        assert_eq!(
            table.get(&Dtype::U32(1)).unwrap(),
            Some(Blob::from(&b"b"[..]))
        );
    }
}
