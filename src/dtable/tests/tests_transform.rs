#[cfg(test)]
mod tests {
    use crate::dtable::tests::helpers::{collect_keys, config, init_tracing, seeded_memory, test_env};
    use crate::dtable::{Dtable, DtableError, memory::MemoryDtable};
    use crate::factory::dtable_entry;
    use crate::value::{Blob, Dtype, KeyType};

    fn u32_memory(entries: &[(u32, u32)]) -> MemoryDtable {
        let table = MemoryDtable::new(KeyType::U32, false);
        for (key, value) in entries {
            table.insert(&Dtype::U32(*key), Blob::from_u32(*value)).unwrap();
        }
        table
    }

    /// Creates a table through a wrapper factory from an in-memory source.
    fn create_from(
        env: &crate::env::Env,
        name: &str,
        cfg: &crate::params::Params,
        source: &MemoryDtable,
    ) -> Result<(), DtableError> {
        let (factory, sub) = dtable_entry(env.ctx(), cfg, "class", "config")?;
        let mut iter = source.iterate()?;
        factory.create(
            env.ctx(),
            &env.dir().join(name),
            &sub,
            iter.as_mut(),
            None,
            None,
        )
    }

    fn open_from(
        env: &crate::env::Env,
        name: &str,
        cfg: &crate::params::Params,
    ) -> Result<std::sync::Arc<dyn Dtable>, DtableError> {
        let (factory, sub) = dtable_entry(env.ctx(), cfg, "class", "config")?;
        factory.open(env.ctx(), &env.dir().join(name), &sub)
    }

    // --------------------------------------------------------------------------------------------
    // smallint
    // --------------------------------------------------------------------------------------------

    const SMALLINT_CONFIG: &str = r#"config [
        "class" class(dt) smallint_dtable
        "config" config [
            "bytes" int 1
            "base" class(dt) simple_dtable
        ]
    ]"#;

    #[test]
    fn test_smallint_packs_in_range_values() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = config(SMALLINT_CONFIG);
        let source = u32_memory(&[(1, 0), (2, 1), (3, 255)]);
        create_from(&env, "sm", &cfg, &source).unwrap();

        let table = open_from(&env, "sm", &cfg).unwrap();
        assert_eq!(table.get(&Dtype::U32(1)).unwrap(), Some(Blob::from_u32(0)));
        assert_eq!(table.get(&Dtype::U32(2)).unwrap(), Some(Blob::from_u32(1)));
        assert_eq!(
            table.get(&Dtype::U32(3)).unwrap(),
            Some(Blob::from_u32(255))
        );

        let mut iter = table.iterate().unwrap();
        assert_eq!(collect_keys(iter.as_mut()), vec![1, 2, 3]);
    }

    #[test]
    fn test_smallint_rejects_out_of_range_without_exception_base() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = config(SMALLINT_CONFIG);
        let source = u32_memory(&[(1, 255), (2, 256)]);
        let err = create_from(&env, "sm", &cfg, &source).unwrap_err();
        assert!(matches!(err, DtableError::Unsupported(_)));
        assert!(!env.dir().join("sm").exists());
    }

    #[test]
    fn test_smallint_rejects_zero_length_values() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = config(SMALLINT_CONFIG);
        let source = MemoryDtable::new(KeyType::U32, false);
        source.insert(&Dtype::U32(1), Blob::empty()).unwrap();
        let err = create_from(&env, "sm", &cfg, &source).unwrap_err();
        assert!(matches!(err, DtableError::Unsupported(_)));
    }

    // --------------------------------------------------------------------------------------------
    // exception
    // --------------------------------------------------------------------------------------------

    const EXCEPTION_CONFIG: &str = r#"config [
        "class" class(dt) exception_dtable
        "config" config [
            "reject_value" blob ff000000
            "base" class(dt) smallint_dtable
            "base_config" config [
                "bytes" int 1
                "base" class(dt) simple_dtable
            ]
            "alt" class(dt) simple_dtable
        ]
    ]"#;

    #[test]
    fn test_exception_absorbs_out_of_range_values() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = config(EXCEPTION_CONFIG);
        let source = u32_memory(&[(1, 0), (2, 1), (3, 255), (4, 256), (5, 70000)]);
        create_from(&env, "ex", &cfg, &source).unwrap();

        let table = open_from(&env, "ex", &cfg).unwrap();
        for (key, value) in [(1u32, 0u32), (2, 1), (3, 255), (4, 256), (5, 70000)] {
            assert_eq!(
                table.get(&Dtype::U32(key)).unwrap(),
                Some(Blob::from_u32(value)),
                "key {key}"
            );
        }
        let mut iter = table.iterate().unwrap();
        assert_eq!(collect_keys(iter.as_mut()), vec![1, 2, 3, 4, 5]);
    }

    // --------------------------------------------------------------------------------------------
    // exist
    // --------------------------------------------------------------------------------------------

    const EXIST_CONFIG: &str = r#"config [
        "class" class(dt) exist_dtable
        "config" config [
            "base" class(dt) simple_dtable
            "dnebase" class(dt) simple_dtable
        ]
    ]"#;

    #[test]
    fn test_exist_splits_present_and_dne() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = config(EXIST_CONFIG);
        let source = seeded_memory(&[(1, b"a"), (3, b"c")]);
        source.remove(&Dtype::U32(2)).unwrap();
        source.remove(&Dtype::U32(4)).unwrap();
        create_from(&env, "ex", &cfg, &source).unwrap();

        let table = open_from(&env, "ex", &cfg).unwrap();
        // Present values come from the base.
        assert_eq!(
            table.get(&Dtype::U32(1)).unwrap(),
            Some(Blob::from(&b"a"[..]))
        );
        // Tombstoned keys resolve to dne, not not-found.
        let stored = table.lookup(&Dtype::U32(2)).unwrap().unwrap();
        assert!(!stored.exists());
        let stored = table.lookup(&Dtype::U32(4)).unwrap().unwrap();
        assert!(!stored.exists());
        // Unknown keys are simply absent.
        assert_eq!(table.lookup(&Dtype::U32(9)).unwrap(), None);
    }

    // --------------------------------------------------------------------------------------------
    // deltaint
    // --------------------------------------------------------------------------------------------

    const DELTAINT_CONFIG: &str = r#"config [
        "class" class(dt) deltaint_dtable
        "config" config [
            "skip" int 3
            "base" class(dt) simple_dtable
            "ref" class(dt) simple_dtable
        ]
    ]"#;

    #[test]
    fn test_deltaint_roundtrip_iteration() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = config(DELTAINT_CONFIG);
        let values: Vec<(u32, u32)> =
            (0..20u32).map(|i| (i + 1, 1000 + i * i)).collect();
        let source = u32_memory(&values);
        create_from(&env, "di", &cfg, &source).unwrap();

        let table = open_from(&env, "di", &cfg).unwrap();
        let mut iter = table.iterate().unwrap();
        iter.first();
        for (key, value) in &values {
            assert!(iter.valid());
            assert_eq!(iter.key().map(|k| k.flatten()), Some(Blob::from_u32(*key)));
            assert_eq!(iter.value(), Some(Blob::from_u32(*value)), "key {key}");
            iter.next();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_deltaint_point_lookup_via_references() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = config(DELTAINT_CONFIG);
        let values: Vec<(u32, u32)> = (0..50u32).map(|i| (i * 2, 500 + i * 7)).collect();
        let source = u32_memory(&values);
        create_from(&env, "di", &cfg, &source).unwrap();

        let table = open_from(&env, "di", &cfg).unwrap();
        for (key, value) in &values {
            assert_eq!(
                table.get(&Dtype::U32(*key)).unwrap(),
                Some(Blob::from_u32(*value)),
                "key {key}"
            );
        }
        // Between and beyond stored keys.
        assert_eq!(table.lookup(&Dtype::U32(1)).unwrap(), None);
        assert_eq!(table.lookup(&Dtype::U32(98 + 3)).unwrap(), None);
    }

    #[test]
    fn test_deltaint_seek_last_and_backward() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = config(DELTAINT_CONFIG);
        let values: Vec<(u32, u32)> = (1..=10u32).map(|i| (i, i * 100)).collect();
        let source = u32_memory(&values);
        create_from(&env, "di", &cfg, &source).unwrap();

        let table = open_from(&env, "di", &cfg).unwrap();
        let mut iter = table.iterate().unwrap();

        assert!(iter.seek(&Dtype::U32(7)));
        assert_eq!(iter.value(), Some(Blob::from_u32(700)));

        assert!(iter.last());
        assert_eq!(iter.value(), Some(Blob::from_u32(1000)));

        assert!(iter.prev());
        assert_eq!(iter.value(), Some(Blob::from_u32(900)));
        assert!(iter.prev());
        assert_eq!(iter.value(), Some(Blob::from_u32(800)));
    }

    // --------------------------------------------------------------------------------------------
    // keydiv
    // --------------------------------------------------------------------------------------------

    const KEYDIV_CONFIG: &str = r#"config [
        "class" class(dt) keydiv_dtable
        "config" config [
            "divider_0" int 100
            "divider_1" int 200
            "base" class(dt) managed_dtable
            "base_config" config [
                "base" class(dt) simple_dtable
            ]
        ]
    ]"#;

    #[test]
    fn test_keydiv_routing_and_iteration() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = config(KEYDIV_CONFIG);
        let (factory, sub) = dtable_entry(env.ctx(), &cfg, "class", "config").unwrap();
        let path = env.dir().join("kd");
        factory
            .create_empty(env.ctx(), &path, &sub, KeyType::U32)
            .unwrap();
        let table = factory.open(env.ctx(), &path, &sub).unwrap();

        table.insert(&Dtype::U32(50), Blob::from(&b"low"[..])).unwrap();
        table.insert(&Dtype::U32(150), Blob::from(&b"mid"[..])).unwrap();
        table.insert(&Dtype::U32(250), Blob::from(&b"high"[..])).unwrap();

        assert_eq!(
            table.get(&Dtype::U32(150)).unwrap(),
            Some(Blob::from(&b"mid"[..]))
        );
        let mut iter = table.iterate().unwrap();
        assert_eq!(collect_keys(iter.as_mut()), vec![50, 150, 250]);

        // Release the shards' journal listeners before reopening them
        // directly.
        drop(iter);
        drop(table);

        // Each shard holds exactly its routed key.
        let managed_cfg = config(r#"config [ "base" class(dt) simple_dtable ]"#);
        for (shard, key) in [(0usize, 50u32), (1, 150), (2, 250)] {
            let shard_table = crate::dtable::managed::ManagedDtable::open(
                env.ctx(),
                &path.join(format!("kd_data.{shard}")),
                &managed_cfg,
            )
            .unwrap();
            assert!(shard_table.present(&Dtype::U32(key)).unwrap(), "shard {shard}");
            for other in [50u32, 150, 250] {
                if other != key {
                    assert_eq!(shard_table.lookup(&Dtype::U32(other)).unwrap(), None);
                }
            }
        }
    }

    #[test]
    fn test_keydiv_boundary_keys_route_right() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = config(KEYDIV_CONFIG);
        let (factory, sub) = dtable_entry(env.ctx(), &cfg, "class", "config").unwrap();
        let path = env.dir().join("kd");
        factory
            .create_empty(env.ctx(), &path, &sub, KeyType::U32)
            .unwrap();
        let table = factory.open(env.ctx(), &path, &sub).unwrap();

        // A divider value belongs to the shard to its right.
        table.insert(&Dtype::U32(99), Blob::from(&b"s0"[..])).unwrap();
        table.insert(&Dtype::U32(100), Blob::from(&b"s1"[..])).unwrap();
        table.insert(&Dtype::U32(200), Blob::from(&b"s2"[..])).unwrap();

        let mut iter = table.iterate().unwrap();
        assert_eq!(collect_keys(iter.as_mut()), vec![99, 100, 200]);
        assert_eq!(
            table.get(&Dtype::U32(100)).unwrap(),
            Some(Blob::from(&b"s1"[..]))
        );
    }

    // --------------------------------------------------------------------------------------------
    // btree
    // --------------------------------------------------------------------------------------------

    const BTREE_CONFIG: &str = r#"config [
        "class" class(dt) btree_dtable
        "config" config [
            "base" class(dt) simple_dtable
        ]
    ]"#;

    #[test]
    fn test_btree_lookup_matches_base() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = config(BTREE_CONFIG);
        // Enough keys for more than one leaf page.
        let values: Vec<(u32, u32)> = (0..2000u32).map(|i| (i * 3, i)).collect();
        let source = u32_memory(&values);
        create_from(&env, "bt", &cfg, &source).unwrap();

        let table = open_from(&env, "bt", &cfg).unwrap();
        assert_eq!(table.entry_count().unwrap(), 2000);
        for (key, value) in values.iter().step_by(97) {
            assert_eq!(
                table.get(&Dtype::U32(*key)).unwrap(),
                Some(Blob::from_u32(*value)),
                "key {key}"
            );
        }
        // Keys between stored ones miss.
        assert_eq!(table.lookup(&Dtype::U32(4)).unwrap(), None);
        assert_eq!(table.lookup(&Dtype::U32(3 * 2000)).unwrap(), None);
    }

    #[test]
    fn test_btree_iterator_seek_and_last() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = config(BTREE_CONFIG);
        let values: Vec<(u32, u32)> = (1..=600u32).map(|i| (i, i)).collect();
        let source = u32_memory(&values);
        create_from(&env, "bt", &cfg, &source).unwrap();

        let table = open_from(&env, "bt", &cfg).unwrap();
        let mut iter = table.iterate().unwrap();

        assert!(iter.seek(&Dtype::U32(517)));
        assert_eq!(iter.value(), Some(Blob::from_u32(517)));

        assert!(!iter.seek(&Dtype::U32(601)));
        assert!(iter.last());
        assert_eq!(iter.value(), Some(Blob::from_u32(600)));

        assert!(iter.first());
        assert_eq!(iter.value(), Some(Blob::from_u32(1)));
    }

    #[test]
    fn test_btree_requires_u32_keys() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = config(BTREE_CONFIG);
        let source = MemoryDtable::new(KeyType::Str, false);
        source
            .insert(&Dtype::str("k"), Blob::from(&b"v"[..]))
            .unwrap();
        let err = create_from(&env, "bt", &cfg, &source).unwrap_err();
        assert!(matches!(err, DtableError::InvalidArgument(_)));
    }
}
