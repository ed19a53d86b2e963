//! Read/write conflict detection over abortable transactions.
//!
//! Wraps a base dtable that supports atx create/commit/abort and layers
//! implicit per-key locking on top: reads tag a key shared, writes tag it
//! exclusive, and any conflict marks the offending transaction *aborted* —
//! its operations return `Busy` from then on, and it must be explicitly
//! aborted to release its keys. A key may be read-held by many
//! transactions or write-held by exactly one; upgrading read → write
//! succeeds only for the sole reader.
//!
//! Transactions abort at the first sign of conflict rather than blocking,
//! so heavy contention degrades like a collision-backoff channel; the
//! payoff is that no waiting (and no deadlock) ever happens.
//!
//! Iterators opened inside a transaction tag conservatively: any call that
//! exposes a key or value (`key`, `seek`, `meta`, `value`) counts as a
//! read of that key.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Arc, Mutex},
};

use tracing::trace;

use crate::{
    dtable::{AtxId, Dtable, DtableError, DtableIter, KeyHash, check_key_type},
    factory::{DtableFactory, TableContext, dtable_entry},
    params::Params,
    value::{Blob, BlobComparator, BlobMeta, CmpRef, Dtype, KeyType},
};

/// Conflict-detecting transactional wrapper.
pub struct RwatxDtable {
    base: Arc<dyn Dtable>,
    state: Arc<Mutex<RwatxState>>,
}

#[derive(Default)]
struct RwatxState {
    cmp: CmpRef,
    keys: HashMap<KeyHash, KeyStatus>,
    atxs: HashMap<AtxId, AtxStatus>,
}

struct KeyStatus {
    readers: HashSet<AtxId>,
    writer: Option<AtxId>,
}

impl KeyStatus {
    fn new() -> Self {
        Self {
            readers: HashSet::new(),
            writer: None,
        }
    }
}

#[derive(Default)]
struct AtxStatus {
    reads: HashSet<u64>,
    writes: HashSet<u64>,
    /// Hashed key → real key, for releasing tags at the end.
    held: HashMap<u64, KeyHash>,
    aborted: bool,
}

fn key_token(state: &RwatxState, key: &Dtype) -> (u64, KeyHash) {
    let hashed = KeyHash::new(key.clone(), state.cmp.clone());
    (key.hash_value(state.cmp.as_deref()), hashed)
}

impl RwatxState {
    /// Tags `key` read for `atx`. False on conflict (the transaction is
    /// then marked aborted).
    fn note_read(&mut self, key: &Dtype, atx: AtxId) -> bool {
        let (token, hashed) = key_token(self, key);
        let Some(status) = self.atxs.get_mut(&atx) else {
            return false;
        };
        if status.aborted {
            return false;
        }
        if status.writes.contains(&token) {
            // Already write-held; a read needs no extra tag.
            return true;
        }
        if !status.reads.insert(token) {
            return true;
        }
        let entry = self
            .keys
            .entry(hashed.clone())
            .or_insert_with(KeyStatus::new);
        if entry.writer.is_some() {
            // Another transaction holds the write lock.
            self.atxs
                .get_mut(&atx)
                .map(|status| {
                    status.reads.remove(&token);
                    status.aborted = true;
                })
                .unwrap_or(());
            return false;
        }
        entry.readers.insert(atx);
        if let Some(status) = self.atxs.get_mut(&atx) {
            status.held.insert(token, hashed);
        }
        true
    }

    /// Tags `key` write-exclusive for `atx`. False on conflict.
    fn note_write(&mut self, key: &Dtype, atx: AtxId) -> bool {
        let (token, hashed) = key_token(self, key);
        let Some(status) = self.atxs.get_mut(&atx) else {
            return false;
        };
        if status.aborted {
            return false;
        }
        if !status.writes.insert(token) {
            return true;
        }
        let upgrading = status.reads.contains(&token);
        let entry = self
            .keys
            .entry(hashed.clone())
            .or_insert_with(KeyStatus::new);

        let granted = if upgrading {
            // Upgrade is allowed only for the sole reader.
            entry.writer.is_none()
                && entry.readers.len() == 1
                && entry.readers.contains(&atx)
        } else {
            entry.writer.is_none() && entry.readers.is_empty()
        };

        if !granted {
            if let Some(status) = self.atxs.get_mut(&atx) {
                status.writes.remove(&token);
                status.aborted = true;
            }
            return false;
        }

        let entry = self
            .keys
            .entry(hashed.clone())
            .or_insert_with(KeyStatus::new);
        entry.readers.remove(&atx);
        entry.writer = Some(atx);
        if let Some(status) = self.atxs.get_mut(&atx) {
            status.reads.remove(&token);
            status.held.insert(token, hashed);
        }
        true
    }

    /// Releases every key held by a finished transaction.
    fn release(&mut self, atx: AtxId) {
        let Some(status) = self.atxs.remove(&atx) else {
            return;
        };
        for (_, hashed) in status.held {
            let mut unlocked = false;
            if let Some(entry) = self.keys.get_mut(&hashed) {
                entry.readers.remove(&atx);
                if entry.writer == Some(atx) {
                    entry.writer = None;
                }
                unlocked = entry.readers.is_empty() && entry.writer.is_none();
            }
            if unlocked {
                self.keys.remove(&hashed);
            }
        }
    }
}

impl RwatxDtable {
    /// Opens the wrapper over its configured base.
    pub fn open(ctx: &TableContext, path: &Path, config: &Params) -> Result<Self, DtableError> {
        let (factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        let base = factory.open(ctx, path, &base_config)?;
        Ok(Self {
            base,
            state: Arc::new(Mutex::new(RwatxState::default())),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RwatxState>, DtableError> {
        self.state
            .lock()
            .map_err(|_| DtableError::Internal("rwatx lock poisoned".into()))
    }
}

impl Dtable for RwatxDtable {
    fn key_type(&self) -> KeyType {
        self.base.key_type()
    }

    fn cmp_name(&self) -> Option<String> {
        self.base.cmp_name()
    }

    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), DtableError> {
        self.base.set_blob_cmp(Arc::clone(&cmp))?;
        self.lock()?.cmp = Some(cmp);
        Ok(())
    }

    fn lookup_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<Option<Blob>, DtableError> {
        check_key_type(self, key)?;
        if let Some(atx) = atx {
            // Reads tag but do not report conflicts; a doomed transaction
            // finds out when it writes or commits.
            let _ = self.lock()?.note_read(key, atx);
        }
        self.base.lookup_atx(key, atx)
    }

    fn present_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<bool, DtableError> {
        if let Some(atx) = atx {
            let _ = self.lock()?.note_read(key, atx);
        }
        self.base.present_atx(key, atx)
    }

    fn iterate_atx(&self, atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError> {
        let base = self.base.iterate_atx(atx)?;
        match atx {
            None => Ok(base),
            Some(atx) => Ok(Box::new(RwatxIter {
                base,
                state: Arc::clone(&self.state),
                atx,
            })),
        }
    }

    fn writable(&self) -> bool {
        self.base.writable()
    }

    fn insert_atx(
        &self,
        key: &Dtype,
        value: Blob,
        append_hint: bool,
        atx: Option<AtxId>,
    ) -> Result<(), DtableError> {
        check_key_type(self, key)?;
        if let Some(atx) = atx {
            if !self.lock()?.note_write(key, atx) {
                trace!(atx, "write conflict, transaction aborted");
                return Err(DtableError::Busy("transaction conflict"));
            }
        }
        self.base.insert_atx(key, value, append_hint, atx)
    }

    fn maintain(&self, force: bool) -> Result<(), DtableError> {
        self.base.maintain(force)
    }

    fn create_tx(&self) -> Result<AtxId, DtableError> {
        let atx = self.base.create_tx()?;
        self.lock()?.atxs.insert(atx, AtxStatus::default());
        Ok(atx)
    }

    fn check_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        {
            let state = self.lock()?;
            let status = state
                .atxs
                .get(&atx)
                .ok_or(DtableError::NoEntry("unknown transaction".into()))?;
            if status.aborted {
                return Err(DtableError::Busy("transaction aborted by conflict"));
            }
        }
        self.base.check_tx(atx)
    }

    fn commit_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        {
            let state = self.lock()?;
            let status = state
                .atxs
                .get(&atx)
                .ok_or(DtableError::NoEntry("unknown transaction".into()))?;
            if status.aborted {
                return Err(DtableError::Busy("transaction aborted by conflict"));
            }
        }
        self.base.commit_tx(atx)?;
        self.lock()?.release(atx);
        Ok(())
    }

    fn abort_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        self.lock()?.release(atx);
        self.base.abort_tx(atx)
    }
}

impl std::fmt::Debug for RwatxDtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwatxDtable").finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Tags every exposed key as read for the owning transaction.
struct RwatxIter {
    base: Box<dyn DtableIter>,
    state: Arc<Mutex<RwatxState>>,
    atx: AtxId,
}

impl RwatxIter {
    fn tag_current(&self) {
        let Some(key) = self.base.key() else { return };
        if let Ok(mut state) = self.state.lock() {
            let _ = state.note_read(&key, self.atx);
        }
    }
}

impl DtableIter for RwatxIter {
    fn valid(&self) -> bool {
        self.base.valid()
    }

    fn next(&mut self) -> bool {
        self.base.next()
    }

    fn prev(&mut self) -> bool {
        self.base.prev()
    }

    fn first(&mut self) -> bool {
        self.base.first()
    }

    fn last(&mut self) -> bool {
        self.base.last()
    }

    fn seek(&mut self, key: &Dtype) -> bool {
        if let Ok(mut state) = self.state.lock() {
            let _ = state.note_read(key, self.atx);
        }
        self.base.seek(key)
    }

    fn key(&self) -> Option<Dtype> {
        self.tag_current();
        self.base.key()
    }

    fn meta(&self) -> Option<BlobMeta> {
        self.tag_current();
        self.base.meta()
    }

    fn value(&self) -> Option<Blob> {
        self.tag_current();
        self.base.value()
    }

    fn iter_key_type(&self) -> KeyType {
        self.base.iter_key_type()
    }
}

// ------------------------------------------------------------------------------------------------
// Factory
// ------------------------------------------------------------------------------------------------

/// Factory for the `rwatx_dtable` class: a pure wrapper, so create passes
/// through to the base class.
pub struct RwatxDtableFactory;

impl DtableFactory for RwatxDtableFactory {
    fn class_name(&self) -> &'static str {
        "rwatx_dtable"
    }

    fn create_empty(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        key_type: KeyType,
    ) -> Result<(), DtableError> {
        let (factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        factory.create_empty(ctx, path, &base_config, key_type)
    }

    fn create(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        source: &mut dyn DtableIter,
        shadow: Option<&dyn Dtable>,
        cmp: CmpRef,
    ) -> Result<(), DtableError> {
        let (factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        factory.create(ctx, path, &base_config, source, shadow, cmp)
    }

    fn open(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
    ) -> Result<Arc<dyn Dtable>, DtableError> {
        Ok(Arc::new(RwatxDtable::open(ctx, path, config)?))
    }
}
