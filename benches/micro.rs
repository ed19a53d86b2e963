//! Micro-benchmarks for the managed-table write and read paths.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tempfile::TempDir;

use anvil::dtable::Dtable;
use anvil::env::Env;
use anvil::params::Params;
use anvil::value::{Blob, Dtype, KeyType};

fn setup() -> (TempDir, std::sync::Arc<anvil::dtable::managed::ManagedDtable>) {
    let tmp = TempDir::new().unwrap();
    let env = Env::open(tmp.path().join("store")).unwrap();
    let config = Params::parse(
        r#"config [ "base" class(dt) simple_dtable ]"#,
        env.registry(),
    )
    .unwrap();
    env.create_managed("bench", &config, KeyType::U32).unwrap();
    let table = env.open_managed("bench", &config).unwrap();
    (tmp, table)
}

fn bench_insert(c: &mut Criterion) {
    let (_tmp, table) = setup();
    let mut key = 0u32;
    c.bench_function("managed_insert", |b| {
        b.iter(|| {
            key = key.wrapping_add(1);
            table
                .insert(&Dtype::U32(key), Blob::from_u32(key))
                .unwrap();
        })
    });
}

fn bench_lookup_after_digest(c: &mut Criterion) {
    let (_tmp, table) = setup();
    for key in 0..10_000u32 {
        table.insert(&Dtype::U32(key), Blob::from_u32(key)).unwrap();
    }
    table.digest(true).unwrap();

    let mut key = 0u32;
    c.bench_function("managed_lookup_digested", |b| {
        b.iter(|| {
            key = (key.wrapping_add(7919)) % 10_000;
            black_box(table.get(&Dtype::U32(key)).unwrap());
        })
    });
}

fn bench_iterate(c: &mut Criterion) {
    let (_tmp, table) = setup();
    for key in 0..1_000u32 {
        table.insert(&Dtype::U32(key), Blob::from_u32(key)).unwrap();
    }
    table.digest(true).unwrap();

    c.bench_function("managed_scan_1k", |b| {
        b.iter(|| {
            let mut iter = table.iterate().unwrap();
            let mut count = 0u32;
            iter.first();
            while iter.valid() {
                black_box(iter.value());
                count += 1;
                iter.next();
            }
            assert_eq!(count, 1_000);
        })
    });
}

criterion_group!(benches, bench_insert, bench_lookup_after_digest, bench_iterate);
criterion_main!(benches);
