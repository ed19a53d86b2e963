//! End-to-end scenarios over the public interface: environments, parsed
//! configurations, managed tables, transforming wrappers, column tables,
//! and abortable transactions.

use std::sync::Arc;

use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use anvil::dtable::{Dtable, DtableError, DtableIter};
use anvil::env::Env;
use anvil::factory::dtable_entry;
use anvil::params::Params;
use anvil::value::{Blob, Dtype, KeyType};

fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::DEBUG)
        .try_init();
}

fn test_env() -> (TempDir, Env) {
    let tmp = TempDir::new().unwrap();
    let env = Env::open(tmp.path().join("store")).unwrap();
    (tmp, env)
}

fn managed_config(env: &Env) -> Params {
    Params::parse(
        r#"config [ "base" class(dt) simple_dtable ]"#,
        env.registry(),
    )
    .unwrap()
}

fn keys_of(iter: &mut dyn DtableIter) -> Vec<u32> {
    let mut keys = Vec::new();
    iter.first();
    while iter.valid() {
        match iter.key() {
            Some(Dtype::U32(key)) => keys.push(key),
            other => panic!("unexpected key {other:?}"),
        }
        iter.next();
    }
    keys
}

#[test]
fn test_create_insert_reopen() {
    init_tracing();

    let (_tmp, env) = test_env();
    let config = managed_config(&env);
    env.create_managed("table", &config, KeyType::U32).unwrap();

    {
        let table = env.open_managed("table", &config).unwrap();
        table.insert(&Dtype::U32(1), Blob::from(&b"a"[..])).unwrap();
        table.insert(&Dtype::U32(2), Blob::from(&b"b"[..])).unwrap();
    }

    let table = env.open_managed("table", &config).unwrap();
    assert_eq!(
        table.get(&Dtype::U32(1)).unwrap(),
        Some(Blob::from(&b"a"[..]))
    );
    assert_eq!(
        table.get(&Dtype::U32(2)).unwrap(),
        Some(Blob::from(&b"b"[..]))
    );

    let mut iter = table.iterate().unwrap();
    iter.first();
    assert_eq!(iter.key().map(|k| k.flatten()), Some(Blob::from_u32(1)));
    assert_eq!(iter.value(), Some(Blob::from(&b"a"[..])));
    assert!(iter.next());
    assert_eq!(iter.key().map(|k| k.flatten()), Some(Blob::from_u32(2)));
    assert_eq!(iter.value(), Some(Blob::from(&b"b"[..])));
    assert!(!iter.next());
}

#[test]
fn test_tombstone_shadowing() {
    init_tracing();

    let (_tmp, env) = test_env();
    let config = managed_config(&env);
    env.create_managed("table", &config, KeyType::U32).unwrap();
    let table = env.open_managed("table", &config).unwrap();

    table.insert(&Dtype::U32(1), Blob::from(&b"a"[..])).unwrap();
    table.digest(true).unwrap();
    table.remove(&Dtype::U32(1)).unwrap();
    table.digest(true).unwrap();

    assert_eq!(table.get(&Dtype::U32(1)).unwrap(), None);
    let mut iter = table.iterate().unwrap();
    assert_eq!(keys_of(iter.as_mut()), Vec::<u32>::new());
}

#[test]
fn test_combine_three_digests() {
    init_tracing();

    let (_tmp, env) = test_env();
    let config = managed_config(&env);
    env.create_managed("table", &config, KeyType::U32).unwrap();
    let table = env.open_managed("table", &config).unwrap();

    let mut next = 1u32;
    for batch in [333u32, 333, 334] {
        for _ in 0..batch {
            table
                .insert(&Dtype::U32(next), Blob::from_u32(next))
                .unwrap();
            next += 1;
        }
        table.digest(true).unwrap();
    }
    assert_eq!(table.disk_count().unwrap(), 3);

    table.combine_last(4).unwrap();
    assert_eq!(table.disk_count().unwrap(), 1);

    let mut iter = table.iterate().unwrap();
    let keys = keys_of(iter.as_mut());
    assert_eq!(keys, (1..=1000).collect::<Vec<u32>>());
    for key in 1..=1000u32 {
        assert_eq!(
            table.get(&Dtype::U32(key)).unwrap(),
            Some(Blob::from_u32(key)),
            "key {key}"
        );
    }
}

#[test]
fn test_smallint_reject_paths() {
    init_tracing();

    let (_tmp, env) = test_env();

    // Plain smallint over a general base: out-of-range values abort.
    let plain = Params::parse(
        r#"config [
            "bytes" int 1
            "base" class(dt) simple_dtable
        ]"#,
        env.registry(),
    )
    .unwrap();
    let source = anvil::dtable::memory::MemoryDtable::new(KeyType::U32, false);
    for (key, value) in [(1u32, 0u32), (2, 1), (3, 255), (4, 256)] {
        source.insert(&Dtype::U32(key), Blob::from_u32(value)).unwrap();
    }
    let factory = env.registry().lookup_dtable("smallint_dtable").unwrap();
    let mut iter = source.iterate().unwrap();
    let err = factory
        .create(
            env.ctx(),
            &env.dir().join("plain"),
            &plain,
            iter.as_mut(),
            None,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, DtableError::Unsupported(_)));

    // Behind an exception table, the same data succeeds and reads back
    // exactly.
    let with_exceptions = Params::parse(
        r#"config [
            "reject_value" blob ff000000
            "base" class(dt) smallint_dtable
            "base_config" config [
                "bytes" int 1
                "base" class(dt) simple_dtable
            ]
            "alt" class(dt) simple_dtable
        ]"#,
        env.registry(),
    )
    .unwrap();
    let factory = env.registry().lookup_dtable("exception_dtable").unwrap();
    let mut iter = source.iterate().unwrap();
    factory
        .create(
            env.ctx(),
            &env.dir().join("exceptional"),
            &with_exceptions,
            iter.as_mut(),
            None,
            None,
        )
        .unwrap();

    let table = factory
        .open(env.ctx(), &env.dir().join("exceptional"), &with_exceptions)
        .unwrap();
    for (key, value) in [(1u32, 0u32), (2, 1), (3, 255), (4, 256)] {
        assert_eq!(
            table.get(&Dtype::U32(key)).unwrap(),
            Some(Blob::from_u32(value)),
            "key {key}"
        );
    }
}

#[test]
fn test_keydiv_routing() {
    init_tracing();

    let (_tmp, env) = test_env();
    let config = Params::parse(
        r#"config [
            "class" class(dt) keydiv_dtable
            "config" config [
                "divider_0" int 100
                "divider_1" int 200
                "base" class(dt) managed_dtable
                "base_config" config [ "base" class(dt) simple_dtable ]
            ]
        ]"#,
        env.registry(),
    )
    .unwrap();
    let (factory, sub) = dtable_entry(env.ctx(), &config, "class", "config").unwrap();
    let path = env.dir().join("sharded");
    factory
        .create_empty(env.ctx(), &path, &sub, KeyType::U32)
        .unwrap();
    let table = factory.open(env.ctx(), &path, &sub).unwrap();

    table.insert(&Dtype::U32(50), Blob::from(&b"low"[..])).unwrap();
    table.insert(&Dtype::U32(150), Blob::from(&b"mid"[..])).unwrap();
    table.insert(&Dtype::U32(250), Blob::from(&b"high"[..])).unwrap();

    let mut iter = table.iterate().unwrap();
    assert_eq!(keys_of(iter.as_mut()), vec![50, 150, 250]);
    drop(iter);
    drop(table);

    // Shard contents match the divider routing.
    let managed = Params::parse(
        r#"config [ "base" class(dt) simple_dtable ]"#,
        env.registry(),
    )
    .unwrap();
    for (shard, key) in [(0u32, 50u32), (1, 150), (2, 250)] {
        let shard_table = anvil::dtable::managed::ManagedDtable::open(
            env.ctx(),
            &path.join(format!("kd_data.{shard}")),
            &managed,
        )
        .unwrap();
        assert!(
            shard_table.present(&Dtype::U32(key)).unwrap(),
            "shard {shard} should hold {key}"
        );
    }
}

#[test]
fn test_rwatx_conflict() {
    init_tracing();

    let (_tmp, env) = test_env();
    let config = Params::parse(
        r#"config [
            "base" class(dt) managed_dtable
            "base_config" config [ "base" class(dt) simple_dtable ]
        ]"#,
        env.registry(),
    )
    .unwrap();
    let factory = env.registry().lookup_dtable("rwatx_dtable").unwrap();
    let path = env.dir().join("tx");
    factory
        .create_empty(env.ctx(), &path, &config, KeyType::U32)
        .unwrap();
    let table: Arc<dyn Dtable> = factory.open(env.ctx(), &path, &config).unwrap();

    let t1 = table.create_tx().unwrap();
    let t2 = table.create_tx().unwrap();

    table
        .insert_atx(&Dtype::U32(1), Blob::from(&b"a"[..]), false, Some(t1))
        .unwrap();
    let err = table
        .insert_atx(&Dtype::U32(1), Blob::from(&b"b"[..]), false, Some(t2))
        .unwrap_err();
    assert!(matches!(err, DtableError::Busy(_)));
    assert!(matches!(table.check_tx(t2), Err(DtableError::Busy(_))));

    table.commit_tx(t1).unwrap();
    table.abort_tx(t2).unwrap();

    assert_eq!(
        table.get(&Dtype::U32(1)).unwrap(),
        Some(Blob::from(&b"a"[..]))
    );
}

#[test]
fn test_journal_survives_crashless_reopen_cycles() {
    init_tracing();

    let tmp = TempDir::new().unwrap();
    let store = tmp.path().join("store");
    let config_text = r#"config [ "base" class(dt) simple_dtable ]"#;

    {
        let env = Env::open(&store).unwrap();
        let config = Params::parse(config_text, env.registry()).unwrap();
        env.create_managed("table", &config, KeyType::U32).unwrap();
        let table = env.open_managed("table", &config).unwrap();
        table.insert(&Dtype::U32(1), Blob::from(&b"one"[..])).unwrap();
    }
    {
        let env = Env::open(&store).unwrap();
        let config = Params::parse(config_text, env.registry()).unwrap();
        let table = env.open_managed("table", &config).unwrap();
        assert_eq!(
            table.get(&Dtype::U32(1)).unwrap(),
            Some(Blob::from(&b"one"[..]))
        );
        table.insert(&Dtype::U32(2), Blob::from(&b"two"[..])).unwrap();
        table.digest(true).unwrap();
    }
    let env = Env::open(&store).unwrap();
    let config = Params::parse(config_text, env.registry()).unwrap();
    let table = env.open_managed("table", &config).unwrap();
    assert_eq!(
        table.get(&Dtype::U32(1)).unwrap(),
        Some(Blob::from(&b"one"[..]))
    );
    assert_eq!(
        table.get(&Dtype::U32(2)).unwrap(),
        Some(Blob::from(&b"two"[..]))
    );
    assert_eq!(table.journal_len().unwrap(), 0);
}

#[test]
fn test_ctable_over_managed_stack() {
    init_tracing();

    let (_tmp, env) = test_env();
    let config = Params::parse(
        r#"config [
            "class" class(ct) simple_ctable
            "config" config [
                "base" class(dt) managed_dtable
                "base_config" config [ "base" class(dt) simple_dtable ]
            ]
        ]"#,
        env.registry(),
    )
    .unwrap();

    env.create_ctable("rows", &config, KeyType::U32).unwrap();
    let table = env.open_ctable("rows", &config).unwrap();

    table
        .insert(&Dtype::U32(1), "name", Blob::from(&b"anvil"[..]))
        .unwrap();
    table
        .insert(&Dtype::U32(1), "mass", Blob::from_u32(50))
        .unwrap();
    table
        .insert(&Dtype::U32(2), "name", Blob::from(&b"hammer"[..]))
        .unwrap();

    assert_eq!(
        table.find(&Dtype::U32(1), "name").unwrap(),
        Some(Blob::from(&b"anvil"[..]))
    );
    table.remove(&Dtype::U32(1), "mass").unwrap();
    assert_eq!(table.find(&Dtype::U32(1), "mass").unwrap(), None);
    assert!(table.contains(&Dtype::U32(1)).unwrap());
    table.remove_row(&Dtype::U32(1)).unwrap();
    assert!(!table.contains(&Dtype::U32(1)).unwrap());
    assert!(table.contains(&Dtype::U32(2)).unwrap());
}
