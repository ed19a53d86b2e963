//! In-memory ordered table with a hash index.
//!
//! The write-absorbing table of the stack: an ordered map provides key-order
//! iteration while a comparator-consistent hash index serves O(1) `lookup`
//! and `present`. The two structures always hold the same entries; every
//! mutation updates both.
//!
//! Two removal modes exist. In *full-remove* mode `remove` drops the entry
//! outright; otherwise it stores a dne tombstone, which is what layered
//! users need so the removal can shadow older layers.
//!
//! Abortable transactions are supported natively: writes inside an atx are
//! staged per transaction and applied to the shared maps only at commit.

use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};

use tracing::trace;

use crate::{
    dtable::{
        AtxId, Dtable, DtableError, DtableIter, KeyHash, KeyOrd, check_key_type,
        iter::SnapshotIter,
    },
    value::{Blob, BlobComparator, CmpRef, Dtype, KeyType},
};
use std::sync::Arc;

/// Ordered + hashed in-memory dtable.
pub struct MemoryDtable {
    key_type: KeyType,
    full_remove: bool,
    inner: RwLock<MemoryInner>,
}

struct MemoryInner {
    cmp: CmpRef,
    map: BTreeMap<KeyOrd, Blob>,
    hash: HashMap<KeyHash, Blob>,
    next_atx: AtxId,
    /// Staged writes per open transaction; a dne blob stages a removal.
    atxs: HashMap<AtxId, HashMap<KeyHash, Blob>>,
}

impl MemoryDtable {
    /// An empty table for `key_type`. With `full_remove`, removals drop
    /// entries instead of writing tombstones.
    pub fn new(key_type: KeyType, full_remove: bool) -> Self {
        Self {
            key_type,
            full_remove,
            inner: RwLock::new(MemoryInner {
                cmp: None,
                map: BTreeMap::new(),
                hash: HashMap::new(),
                next_atx: 1,
                atxs: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryInner>, DtableError> {
        self.inner
            .read()
            .map_err(|_| DtableError::Internal("memory dtable lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryInner>, DtableError> {
        self.inner
            .write()
            .map_err(|_| DtableError::Internal("memory dtable lock poisoned".into()))
    }

    /// Number of entries (tombstones included).
    pub fn len(&self) -> Result<usize, DtableError> {
        Ok(self.read()?.map.len())
    }

    /// Whether the table holds no entries at all.
    pub fn is_empty(&self) -> Result<bool, DtableError> {
        Ok(self.read()?.map.is_empty())
    }

    /// Drops every entry (and any staged transaction writes).
    pub fn clear(&self) -> Result<(), DtableError> {
        let mut inner = self.write()?;
        inner.map.clear();
        inner.hash.clear();
        inner.atxs.clear();
        Ok(())
    }

    /// A frozen, sorted copy of the committed entries.
    pub(crate) fn snapshot(&self) -> Result<Vec<(Dtype, Blob)>, DtableError> {
        let inner = self.read()?;
        Ok(inner
            .map
            .iter()
            .map(|(k, v)| (k.key.clone(), v.clone()))
            .collect())
    }
}

impl MemoryInner {
    fn apply(&mut self, key: &Dtype, value: Blob, full_remove: bool) {
        let ord = KeyOrd::new(key.clone(), self.cmp.clone());
        let hashed = KeyHash::new(key.clone(), self.cmp.clone());
        if !value.exists() && full_remove {
            self.map.remove(&ord);
            self.hash.remove(&hashed);
        } else {
            self.map.insert(ord, value.clone());
            self.hash.insert(hashed, value);
        }
        debug_assert_eq!(self.map.len(), self.hash.len());
    }

    fn committed_lookup(&self, key: &Dtype) -> Option<Blob> {
        self.hash
            .get(&KeyHash::new(key.clone(), self.cmp.clone()))
            .cloned()
    }
}

impl Dtable for MemoryDtable {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), DtableError> {
        if self.key_type != KeyType::Blob {
            return Err(DtableError::Unsupported("comparators require blob keys"));
        }
        let mut inner = self.write()?;
        if let Some(existing) = &inner.cmp {
            if existing.name() != cmp.name() {
                return Err(DtableError::InvalidArgument(format!(
                    "comparator {} does not match attached {}",
                    cmp.name(),
                    existing.name()
                )));
            }
        } else if !inner.map.is_empty() {
            // The ordered index was built under another ordering.
            return Err(DtableError::Busy("table already populated"));
        }
        inner.cmp = Some(cmp);
        Ok(())
    }

    fn lookup_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<Option<Blob>, DtableError> {
        check_key_type(self, key)?;
        let inner = self.read()?;
        if let Some(atx) = atx {
            let staged = inner
                .atxs
                .get(&atx)
                .ok_or(DtableError::NoEntry("unknown transaction".into()))?;
            if let Some(value) = staged.get(&KeyHash::new(key.clone(), inner.cmp.clone())) {
                if !value.exists() && self.full_remove {
                    return Ok(None);
                }
                return Ok(Some(value.clone()));
            }
        }
        Ok(inner.committed_lookup(key))
    }

    fn iterate_atx(&self, atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError> {
        let inner = self.read()?;
        let cmp = inner.cmp.clone();
        let entries: Vec<(Dtype, Blob)> = match atx {
            None => inner
                .map
                .iter()
                .map(|(k, v)| (k.key.clone(), v.clone()))
                .collect(),
            Some(atx) => {
                let staged = inner
                    .atxs
                    .get(&atx)
                    .ok_or(DtableError::NoEntry("unknown transaction".into()))?;
                let mut merged: BTreeMap<KeyOrd, Blob> = inner.map.clone();
                for (key, value) in staged {
                    let ord = KeyOrd::new(key.key.clone(), cmp.clone());
                    if !value.exists() && self.full_remove {
                        merged.remove(&ord);
                    } else {
                        merged.insert(ord, value.clone());
                    }
                }
                merged
                    .into_iter()
                    .map(|(k, v)| (k.key, v))
                    .collect()
            }
        };
        Ok(Box::new(SnapshotIter::new(
            Arc::new(entries),
            self.key_type,
            cmp,
        )))
    }

    fn writable(&self) -> bool {
        true
    }

    fn insert_atx(
        &self,
        key: &Dtype,
        value: Blob,
        append_hint: bool,
        atx: Option<AtxId>,
    ) -> Result<(), DtableError> {
        check_key_type(self, key)?;
        let _ = append_hint;
        let mut inner = self.write()?;
        match atx {
            None => {
                inner.apply(key, value, self.full_remove);
                trace!(size = inner.map.len(), "memory dtable insert");
                Ok(())
            }
            Some(atx) => {
                let cmp = inner.cmp.clone();
                let staged = inner
                    .atxs
                    .get_mut(&atx)
                    .ok_or(DtableError::NoEntry("unknown transaction".into()))?;
                staged.insert(KeyHash::new(key.clone(), cmp), value);
                Ok(())
            }
        }
    }

    fn create_tx(&self) -> Result<AtxId, DtableError> {
        let mut inner = self.write()?;
        let atx = inner.next_atx;
        inner.next_atx += 1;
        inner.atxs.insert(atx, HashMap::new());
        Ok(atx)
    }

    fn check_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        let inner = self.read()?;
        if inner.atxs.contains_key(&atx) {
            Ok(())
        } else {
            Err(DtableError::NoEntry("unknown transaction".into()))
        }
    }

    fn commit_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        let mut inner = self.write()?;
        let staged = inner
            .atxs
            .remove(&atx)
            .ok_or(DtableError::NoEntry("unknown transaction".into()))?;
        for (key, value) in staged {
            inner.apply(&key.key, value, self.full_remove);
        }
        Ok(())
    }

    fn abort_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        let mut inner = self.write()?;
        inner
            .atxs
            .remove(&atx)
            .ok_or(DtableError::NoEntry("unknown transaction".into()))?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Factory
// ------------------------------------------------------------------------------------------------

/// Factory for the `memory_dtable` class: a fresh, non-persistent table on
/// every open. Config: `key_type` string (`u32`, `f64`, `string`, `blob`;
/// default `u32`) and `full_remove` bool.
pub struct MemoryDtableFactory;

impl MemoryDtableFactory {
    fn config_key_type(config: &crate::params::Params) -> Result<KeyType, DtableError> {
        match config.string("key_type")?.unwrap_or("u32") {
            "u32" => Ok(KeyType::U32),
            "f64" => Ok(KeyType::F64),
            "string" => Ok(KeyType::Str),
            "blob" => Ok(KeyType::Blob),
            other => Err(DtableError::InvalidArgument(format!(
                "unknown key type {other:?}"
            ))),
        }
    }
}

impl crate::factory::DtableFactory for MemoryDtableFactory {
    fn class_name(&self) -> &'static str {
        "memory_dtable"
    }

    fn create_empty(
        &self,
        _ctx: &crate::factory::TableContext,
        _path: &std::path::Path,
        _config: &crate::params::Params,
        _key_type: KeyType,
    ) -> Result<(), DtableError> {
        // Nothing on disk to create.
        Ok(())
    }

    fn open(
        &self,
        _ctx: &crate::factory::TableContext,
        _path: &std::path::Path,
        config: &crate::params::Params,
    ) -> Result<Arc<dyn Dtable>, DtableError> {
        let key_type = Self::config_key_type(config)?;
        let full_remove = config.bool("full_remove", false)?;
        Ok(Arc::new(MemoryDtable::new(key_type, full_remove)))
    }
}
