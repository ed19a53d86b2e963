//! Journal-backed writable dtable: the managed table's write-front.
//!
//! Mutations are persisted only as entries in the shared system journal,
//! appended under this table's listener id, and mirrored into an in-memory
//! ordered map. On open the managed table registers the journal dtable as a
//! listener and replays its entries to rebuild the map; after a digest folds
//! the map into an immutable file, [`JournalDtable::reinit`] discards the
//! old entries and starts over under a fresh id.
//!
//! Entry wire format (via [`crate::encoding`]):
//!
//! ```text
//! [u8 tag=1][key: flattened blob][value: blob]    insert / remove
//! [u8 tag=2][comparator name: string]             blob-key ordering marker
//! ```
//!
//! A blob-keyed table writes the comparator-name marker before its first
//! entry. Replay cannot order blob keys until the matching comparator is
//! attached, so entries replayed before that are parked and applied when
//! [`Dtable::set_blob_cmp`] arrives; reads in between fail with `Busy`.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use tracing::{debug, trace};

use crate::{
    dtable::{
        AtxId, Dtable, DtableError, DtableIter, KeyOrd, check_key_type, iter::SnapshotIter,
    },
    encoding::{Decode, Encode},
    journal::{JournalError, JournalListener, ListenerId, SysJournal},
    value::{Blob, BlobComparator, CmpRef, Dtype, KeyType},
};

const TAG_ENTRY: u8 = 1;
const TAG_CMP_NAME: u8 = 2;

/// Writable dtable persisted through the system journal.
pub struct JournalDtable {
    key_type: KeyType,
    journal: Arc<SysJournal>,
    inner: RwLock<JdInner>,
}

struct JdInner {
    id: ListenerId,
    cmp: CmpRef,
    /// Required comparator name, learned from replay or first attachment.
    cmp_name: Option<String>,
    wrote_cmp_name: bool,
    map: BTreeMap<KeyOrd, Blob>,
    /// Replayed blob-key entries waiting for the comparator.
    deferred: Vec<(Blob, Blob)>,
    next_atx: AtxId,
    /// Staged operations per open transaction, in arrival order.
    atxs: HashMap<AtxId, Vec<(Dtype, Blob)>>,
}

impl JournalDtable {
    /// A fresh journal dtable under `id`. The caller registers it with
    /// [`JournalDtable::register`] before any replay.
    pub fn new(key_type: KeyType, id: ListenerId, journal: Arc<SysJournal>) -> Arc<Self> {
        Arc::new(Self {
            key_type,
            journal,
            inner: RwLock::new(JdInner {
                id,
                cmp: None,
                cmp_name: None,
                wrote_cmp_name: false,
                map: BTreeMap::new(),
                deferred: Vec::new(),
                next_atx: 1,
                atxs: HashMap::new(),
            }),
        })
    }

    /// Registers this table as the journal listener for its id.
    pub fn register(self: &Arc<Self>) -> Result<(), DtableError> {
        let id = self.listener_id()?;
        let weak: std::sync::Weak<dyn JournalListener> = Arc::downgrade(self) as std::sync::Weak<dyn JournalListener>;
        self.journal.register_listener(id, weak)?;
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, JdInner>, DtableError> {
        self.inner
            .read()
            .map_err(|_| DtableError::Internal("journal dtable lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, JdInner>, DtableError> {
        self.inner
            .write()
            .map_err(|_| DtableError::Internal("journal dtable lock poisoned".into()))
    }

    /// This table's current listener id.
    pub fn listener_id(&self) -> Result<ListenerId, DtableError> {
        Ok(self.read()?.id)
    }

    /// Number of entries in the write-front (tombstones included).
    pub fn len(&self) -> Result<usize, DtableError> {
        Ok(self.read()?.map.len())
    }

    /// Whether the write-front holds nothing (its journal entries are then
    /// discardable).
    pub fn is_empty(&self) -> Result<bool, DtableError> {
        let inner = self.read()?;
        Ok(inner.map.is_empty() && inner.deferred.is_empty())
    }

    /// The required comparator name, if one is known.
    pub fn required_cmp_name(&self) -> Result<Option<String>, DtableError> {
        Ok(self.read()?.cmp_name.clone())
    }

    /// Switches to a fresh listener id after a digest: discards the old
    /// entries, clears the map, and re-registers under `new_id`.
    pub fn reinit(self: &Arc<Self>, new_id: ListenerId) -> Result<(), DtableError> {
        let old_id = {
            let mut inner = self.write()?;
            let old = inner.id;
            inner.id = new_id;
            inner.map.clear();
            inner.deferred.clear();
            inner.atxs.clear();
            inner.wrote_cmp_name = false;
            old
        };
        self.journal.discard(old_id)?;
        self.journal.commit()?;
        self.journal.unregister_listener(old_id);
        self.register()?;
        debug!(old_id, new_id, "journal dtable reinitialized");
        Ok(())
    }

    fn cmp_gate(inner: &JdInner, key_type: KeyType) -> Result<(), DtableError> {
        if key_type == KeyType::Blob && inner.cmp_name.is_some() && inner.cmp.is_none() {
            return Err(DtableError::Busy("required comparator not attached"));
        }
        Ok(())
    }

    fn encode_entry(key: &Dtype, value: &Blob) -> Result<Vec<u8>, DtableError> {
        let mut buf = Vec::new();
        TAG_ENTRY.encode_to(&mut buf)?;
        key.flatten().encode_to(&mut buf)?;
        value.encode_to(&mut buf)?;
        Ok(buf)
    }

    /// Appends the comparator-name marker once per journal generation.
    fn ensure_cmp_record(&self, inner: &mut JdInner) -> Result<(), DtableError> {
        if self.key_type != KeyType::Blob || inner.wrote_cmp_name {
            return Ok(());
        }
        let Some(cmp) = &inner.cmp else {
            return Ok(());
        };
        let mut buf = Vec::new();
        TAG_CMP_NAME.encode_to(&mut buf)?;
        cmp.name().encode_to(&mut buf)?;
        self.journal.append(inner.id, &buf)?;
        inner.cmp_name = Some(cmp.name().to_string());
        inner.wrote_cmp_name = true;
        Ok(())
    }

    fn apply(&self, inner: &mut JdInner, key: Dtype, value: Blob) {
        let ord = KeyOrd::new(key, inner.cmp.clone());
        inner.map.insert(ord, value);
    }
}

impl JournalListener for JournalDtable {
    fn journal_replay(&self, entry: &[u8]) -> Result<(), JournalError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| JournalError::Internal("journal dtable lock poisoned".into()))?;
        let (tag, mut offset) =
            u8::decode_from(entry).map_err(JournalError::Encoding)?;
        match tag {
            TAG_CMP_NAME => {
                let (name, _) =
                    String::decode_from(&entry[offset..]).map_err(JournalError::Encoding)?;
                if let Some(cmp) = &inner.cmp {
                    if cmp.name() != name {
                        return Err(JournalError::Replay(format!(
                            "attached comparator {} does not match recorded {name}",
                            cmp.name()
                        )));
                    }
                }
                inner.cmp_name = Some(name);
                inner.wrote_cmp_name = true;
                Ok(())
            }
            TAG_ENTRY => {
                let (key_flat, n) =
                    Blob::decode_from(&entry[offset..]).map_err(JournalError::Encoding)?;
                offset += n;
                let (value, _) =
                    Blob::decode_from(&entry[offset..]).map_err(JournalError::Encoding)?;
                if self.key_type == KeyType::Blob
                    && inner.cmp_name.is_some()
                    && inner.cmp.is_none()
                {
                    // Ordering unknown until the comparator arrives.
                    inner.deferred.push((key_flat, value));
                    return Ok(());
                }
                let key = Dtype::from_blob(&key_flat, self.key_type)
                    .map_err(|e| JournalError::Replay(e.to_string()))?;
                let cmp = inner.cmp.clone();
                inner.map.insert(KeyOrd::new(key, cmp), value);
                Ok(())
            }
            other => Err(JournalError::Replay(format!("unknown entry tag {other}"))),
        }
    }
}

impl Dtable for JournalDtable {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn cmp_name(&self) -> Option<String> {
        self.read().ok().and_then(|inner| inner.cmp_name.clone())
    }

    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), DtableError> {
        if self.key_type != KeyType::Blob {
            return Err(DtableError::Unsupported("comparators require blob keys"));
        }
        let mut inner = self.write()?;
        if let Some(required) = &inner.cmp_name {
            if required != cmp.name() {
                return Err(DtableError::InvalidArgument(format!(
                    "comparator {} does not match required {required}",
                    cmp.name()
                )));
            }
        }
        inner.cmp = Some(cmp);
        // Deferred replay: entries parked while the ordering was unknown.
        let deferred = std::mem::take(&mut inner.deferred);
        for (key_flat, value) in deferred {
            let key = Dtype::from_blob(&key_flat, self.key_type)?;
            let ord = KeyOrd::new(key, inner.cmp.clone());
            inner.map.insert(ord, value);
        }
        Ok(())
    }

    fn lookup_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<Option<Blob>, DtableError> {
        check_key_type(self, key)?;
        let inner = self.read()?;
        Self::cmp_gate(&inner, self.key_type)?;
        if let Some(atx) = atx {
            let staged = inner
                .atxs
                .get(&atx)
                .ok_or(DtableError::NoEntry("unknown transaction".into()))?;
            // Later stages win; scan newest first.
            for (staged_key, value) in staged.iter().rev() {
                if staged_key.compare(key, inner.cmp.as_deref()) == std::cmp::Ordering::Equal {
                    return Ok(Some(value.clone()));
                }
            }
        }
        Ok(inner
            .map
            .get(&KeyOrd::new(key.clone(), inner.cmp.clone()))
            .cloned())
    }

    fn iterate_atx(&self, atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError> {
        let inner = self.read()?;
        Self::cmp_gate(&inner, self.key_type)?;
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
                let mut merged = inner.map.clone();
                for (key, value) in staged {
                    merged.insert(KeyOrd::new(key.clone(), cmp.clone()), value.clone());
                }
                merged.into_iter().map(|(k, v)| (k.key, v)).collect()
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
        _append_hint: bool,
        atx: Option<AtxId>,
    ) -> Result<(), DtableError> {
        check_key_type(self, key)?;
        let mut inner = self.write()?;
        Self::cmp_gate(&inner, self.key_type)?;
        match atx {
            None => {
                self.ensure_cmp_record(&mut inner)?;
                let record = Self::encode_entry(key, &value)?;
                self.journal.append(inner.id, &record)?;
                self.journal.commit()?;
                self.apply(&mut inner, key.clone(), value);
                trace!(entries = inner.map.len(), "journal dtable insert");
                Ok(())
            }
            Some(atx) => {
                let staged = inner
                    .atxs
                    .get_mut(&atx)
                    .ok_or(DtableError::NoEntry("unknown transaction".into()))?;
                staged.push((key.clone(), value));
                Ok(())
            }
        }
    }

    fn create_tx(&self) -> Result<AtxId, DtableError> {
        let mut inner = self.write()?;
        let atx = inner.next_atx;
        inner.next_atx += 1;
        inner.atxs.insert(atx, Vec::new());
        Ok(atx)
    }

    fn check_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        if self.read()?.atxs.contains_key(&atx) {
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
        if staged.is_empty() {
            return Ok(());
        }
        self.ensure_cmp_record(&mut inner)?;
        for (key, value) in &staged {
            let record = Self::encode_entry(key, value)?;
            self.journal.append(inner.id, &record)?;
        }
        // One durability point for the whole transaction.
        self.journal.commit()?;
        for (key, value) in staged {
            self.apply(&mut inner, key, value);
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

impl Drop for JournalDtable {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.read() {
            self.journal.unregister_listener(inner.id);
        }
    }
}

impl std::fmt::Debug for JournalDtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalDtable")
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}
