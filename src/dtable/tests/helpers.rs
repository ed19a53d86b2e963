#![cfg(test)]

use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::{
    dtable::{Dtable, DtableIter, memory::MemoryDtable},
    env::Env,
    factory::Registry,
    params::Params,
    value::{Blob, Dtype, KeyType},
};

pub(crate) fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .try_init();
}

/// A fresh environment in its own temp directory.
pub(crate) fn test_env() -> (TempDir, Env) {
    let tmp = TempDir::new().unwrap();
    let env = Env::open(tmp.path().join("store")).unwrap();
    (tmp, env)
}

/// Parses a config against the standard registry.
pub(crate) fn config(text: &str) -> Params {
    Params::parse(text, &Registry::standard()).unwrap()
}

/// An in-memory table seeded with u32 keys and byte-string values.
pub(crate) fn seeded_memory(entries: &[(u32, &[u8])]) -> MemoryDtable {
    let table = MemoryDtable::new(KeyType::U32, false);
    for (key, value) in entries {
        table.insert(&Dtype::U32(*key), Blob::from(*value)).unwrap();
    }
    table
}

/// Collects (key, value) pairs from an iterator, tombstones included.
pub(crate) fn collect(iter: &mut dyn DtableIter) -> Vec<(Dtype, Blob)> {
    let mut out = Vec::new();
    iter.first();
    while iter.valid() {
        out.push((iter.key().unwrap(), iter.value().unwrap()));
        iter.next();
    }
    out
}

/// Collects u32 keys from an iterator.
pub(crate) fn collect_keys(iter: &mut dyn DtableIter) -> Vec<u32> {
    collect(iter)
        .into_iter()
        .map(|(key, _)| match key {
            Dtype::U32(k) => k,
            other => panic!("expected u32 key, got {other:?}"),
        })
        .collect()
}
