//! Key-range sharding over an ordered list of dividers.
//!
//! Divider *i* separates sub-table *i* from sub-table *i*+1: a key belongs
//! to the smallest *i* with `key < divider[i]`, or to the last shard when no
//! divider exceeds it. Point operations route directly; iteration
//! concatenates the shards' cursors, which is already key order because the
//! shards partition the keyspace.
//!
//! Abortable transactions are passed through lazily: a parent transaction
//! creates a sub-transaction in a shard only when an operation first
//! touches that shard — except for iterators, which force every shard's
//! sub-transaction so the merged view is consistent.

use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use tracing::{debug, info};

use crate::{
    dtable::{AtxId, Dtable, DtableError, DtableIter, check_key_type},
    factory::{DtableFactory, TableContext, dtable_entry},
    params::Params,
    value::{Blob, BlobComparator, BlobMeta, Dtype, KeyType},
};

const KEYDIV_MAGIC: u32 = 0x1172_0081;
const KEYDIV_VERSION: u32 = 1;

const META_NAME: &str = "kd_meta";

fn shard_name(index: usize) -> String {
    format!("kd_data.{index}")
}

/// Key-range sharded dtable.
pub struct KeydivDtable {
    subs: Vec<Arc<dyn Dtable>>,
    dividers: Vec<Dtype>,
    key_type: KeyType,
    atx: Mutex<KeydivAtxMap>,
}

#[derive(Default)]
struct KeydivAtxMap {
    next: AtxId,
    open: HashMap<AtxId, Vec<Option<AtxId>>>,
}

impl KeydivDtable {
    fn config_dividers(config: &Params, key_type: KeyType) -> Result<Vec<Dtype>, DtableError> {
        let dividers: Vec<Dtype> = match key_type {
            KeyType::U32 => config
                .int_seq("divider_")?
                .into_iter()
                .map(|v| Dtype::U32(v as u32))
                .collect(),
            KeyType::Str => config
                .string_seq("divider_")?
                .into_iter()
                .map(|s| Dtype::str(&s))
                .collect(),
            _ => {
                return Err(DtableError::InvalidArgument(
                    "keydiv dividers support u32 and string keys".into(),
                ));
            }
        };
        if dividers.is_empty() {
            return Err(DtableError::NoEntry("keydiv needs divider_0…".into()));
        }
        for pair in dividers.windows(2) {
            if pair[0].compare(&pair[1], None) != std::cmp::Ordering::Less {
                return Err(DtableError::InvalidArgument(
                    "keydiv dividers must be strictly increasing".into(),
                ));
            }
        }
        Ok(dividers)
    }

    /// Creates the meta file and one empty sub-table per shard.
    pub fn create(
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        key_type: KeyType,
    ) -> Result<(), DtableError> {
        let dividers = Self::config_dividers(config, key_type)?;
        let (factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        let shard_count = dividers.len() + 1;

        fs::create_dir(path)?;
        let result = (|| -> Result<(), DtableError> {
            // Exact fixed layout: magic, version, key_type, dt_count.
            let mut meta = Vec::with_capacity(10);
            meta.extend_from_slice(&KEYDIV_MAGIC.to_le_bytes());
            meta.extend_from_slice(&KEYDIV_VERSION.to_le_bytes());
            meta.push(key_type.wire_tag());
            meta.push(shard_count as u8);
            let mut file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(path.join(META_NAME))?;
            file.write_all(&meta)?;
            file.sync_all()?;

            for index in 0..shard_count {
                factory.create_empty(ctx, &path.join(shard_name(index)), &base_config, key_type)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                info!(path = %path.display(), shards = shard_count, "keydiv dtable created");
                Ok(())
            }
            Err(error) => {
                let _ = fs::remove_dir_all(path);
                Err(error)
            }
        }
    }

    /// Opens the meta file and every shard.
    pub fn open(ctx: &TableContext, path: &Path, config: &Params) -> Result<Self, DtableError> {
        let meta = fs::read(path.join(META_NAME))?;
        if meta.len() < 10 {
            return Err(DtableError::Corrupt("keydiv meta too short".into()));
        }
        let magic = u32::from_le_bytes(meta[0..4].try_into().unwrap_or([0; 4]));
        let version = u32::from_le_bytes(meta[4..8].try_into().unwrap_or([0; 4]));
        if magic != KEYDIV_MAGIC || version != KEYDIV_VERSION {
            return Err(DtableError::Corrupt("keydiv meta magic/version".into()));
        }
        let key_type = KeyType::from_wire_tag(meta[8])?;
        let shard_count = meta[9] as usize;

        let dividers = Self::config_dividers(config, key_type)?;
        if dividers.len() + 1 != shard_count {
            return Err(DtableError::InvalidArgument(format!(
                "config names {} shards, meta has {shard_count}",
                dividers.len() + 1
            )));
        }
        let (factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;

        let mut subs = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            let sub = factory.open(ctx, &path.join(shard_name(index)), &base_config)?;
            if sub.key_type() != key_type {
                return Err(DtableError::Corrupt(format!(
                    "shard {index} key type disagrees with meta"
                )));
            }
            subs.push(sub);
        }
        debug!(path = %path.display(), shards = shard_count, "keydiv dtable opened");
        Ok(Self {
            subs,
            dividers,
            key_type,
            atx: Mutex::new(KeydivAtxMap {
                next: 1,
                open: HashMap::new(),
            }),
        })
    }

    /// The shard index owning `key`.
    fn key_index(&self, key: &Dtype) -> usize {
        for (index, divider) in self.dividers.iter().enumerate() {
            if key.compare(divider, None) == std::cmp::Ordering::Less {
                return index;
            }
        }
        self.subs.len() - 1
    }

    fn lock_atx(&self) -> Result<std::sync::MutexGuard<'_, KeydivAtxMap>, DtableError> {
        self.atx
            .lock()
            .map_err(|_| DtableError::Internal("keydiv atx lock poisoned".into()))
    }

    /// Resolves (creating on first touch) the shard-level transaction for
    /// `atx` in shard `index`.
    fn map_atx(&self, atx: AtxId, index: usize) -> Result<AtxId, DtableError> {
        let mut map = self.lock_atx()?;
        let state = map
            .open
            .get_mut(&atx)
            .ok_or(DtableError::NoEntry("unknown transaction".into()))?;
        if let Some(existing) = state[index] {
            return Ok(existing);
        }
        let sub_atx = self.subs[index].create_tx()?;
        state[index] = Some(sub_atx);
        Ok(sub_atx)
    }

    /// Forces a shard-level transaction in every shard (iterators need a
    /// consistent view across the whole keyspace).
    fn populate_atx(&self, atx: AtxId) -> Result<Vec<Option<AtxId>>, DtableError> {
        for index in 0..self.subs.len() {
            self.map_atx(atx, index)?;
        }
        Ok(self
            .lock_atx()?
            .open
            .get(&atx)
            .cloned()
            .unwrap_or_default())
    }
}

impl Dtable for KeydivDtable {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn cmp_name(&self) -> Option<String> {
        self.subs.iter().find_map(|sub| sub.cmp_name())
    }

    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), DtableError> {
        for sub in &self.subs {
            sub.set_blob_cmp(Arc::clone(&cmp))?;
        }
        Ok(())
    }

    fn lookup_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<Option<Blob>, DtableError> {
        check_key_type(self, key)?;
        let index = self.key_index(key);
        let sub_atx = match atx {
            Some(atx) => Some(self.map_atx(atx, index)?),
            None => None,
        };
        self.subs[index].lookup_atx(key, sub_atx)
    }

    fn iterate_atx(&self, atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError> {
        let sub_atxs: Vec<Option<AtxId>> = match atx {
            Some(atx) => self.populate_atx(atx)?,
            None => vec![None; self.subs.len()],
        };
        let mut cursors = Vec::with_capacity(self.subs.len());
        for (sub, sub_atx) in self.subs.iter().zip(sub_atxs) {
            cursors.push(Cursor::new(sub.iterate_atx(sub_atx)?));
        }
        let mut iter = KeydivIter {
            subs: cursors,
            dividers: self.dividers.clone(),
            key_type: self.key_type,
            current: 0,
        };
        // Park at the first nonempty shard.
        while iter.current < iter.subs.len() && iter.subs[iter.current].at_end {
            iter.current += 1;
        }
        Ok(Box::new(iter))
    }

    fn writable(&self) -> bool {
        self.subs.iter().all(|sub| sub.writable())
    }

    fn insert_atx(
        &self,
        key: &Dtype,
        value: Blob,
        append_hint: bool,
        atx: Option<AtxId>,
    ) -> Result<(), DtableError> {
        check_key_type(self, key)?;
        let index = self.key_index(key);
        let sub_atx = match atx {
            Some(atx) => Some(self.map_atx(atx, index)?),
            None => None,
        };
        self.subs[index].insert_atx(key, value, append_hint, sub_atx)
    }

    fn maintain(&self, force: bool) -> Result<(), DtableError> {
        for sub in &self.subs {
            sub.maintain(force)?;
        }
        Ok(())
    }

    fn create_tx(&self) -> Result<AtxId, DtableError> {
        let mut map = self.lock_atx()?;
        let atx = map.next;
        map.next += 1;
        map.open.insert(atx, vec![None; self.subs.len()]);
        Ok(atx)
    }

    fn check_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        let state = self
            .lock_atx()?
            .open
            .get(&atx)
            .cloned()
            .ok_or(DtableError::NoEntry("unknown transaction".into()))?;
        // A shard the transaction never touched cannot fail it.
        for (index, sub_atx) in state.iter().enumerate() {
            if let Some(sub_atx) = sub_atx {
                self.subs[index].check_tx(*sub_atx)?;
            }
        }
        Ok(())
    }

    fn commit_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        let state = {
            let mut map = self.lock_atx()?;
            map.open
                .remove(&atx)
                .ok_or(DtableError::NoEntry("unknown transaction".into()))?
        };
        for (index, sub_atx) in state.iter().enumerate() {
            if let Some(sub_atx) = sub_atx {
                self.subs[index].commit_tx(*sub_atx)?;
            }
        }
        Ok(())
    }

    fn abort_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        let state = {
            let mut map = self.lock_atx()?;
            map.open
                .remove(&atx)
                .ok_or(DtableError::NoEntry("unknown transaction".into()))?
        };
        for (index, sub_atx) in state.iter().enumerate() {
            if let Some(sub_atx) = sub_atx {
                self.subs[index].abort_tx(*sub_atx)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for KeydivDtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeydivDtable")
            .field("shards", &self.subs.len())
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

struct Cursor {
    iter: Box<dyn DtableIter>,
    at_first: bool,
    at_end: bool,
}

impl Cursor {
    fn new(iter: Box<dyn DtableIter>) -> Self {
        let at_end = !iter.valid();
        Self {
            iter,
            at_first: true,
            at_end,
        }
    }
}

/// Concatenating cursor over the shards, `current` naming the active one
/// (`subs.len()` = after the end).
struct KeydivIter {
    subs: Vec<Cursor>,
    dividers: Vec<Dtype>,
    key_type: KeyType,
    current: usize,
}

impl KeydivIter {
    fn key_index(&self, key: &Dtype) -> usize {
        for (index, divider) in self.dividers.iter().enumerate() {
            if key.compare(divider, None) == std::cmp::Ordering::Less {
                return index;
            }
        }
        self.subs.len() - 1
    }
}

impl DtableIter for KeydivIter {
    fn valid(&self) -> bool {
        self.current < self.subs.len()
    }

    fn next(&mut self) -> bool {
        if self.current >= self.subs.len() {
            return false;
        }
        if self.subs[self.current].iter.next() {
            self.subs[self.current].at_first = false;
            return true;
        }
        self.subs[self.current].at_end = true;
        self.current += 1;
        while self.current < self.subs.len() {
            let cursor = &mut self.subs[self.current];
            if !cursor.at_first {
                cursor.at_first = true;
                cursor.at_end = !cursor.iter.first();
            }
            if !cursor.at_end {
                return true;
            }
            self.current += 1;
        }
        false
    }

    fn prev(&mut self) -> bool {
        if self.current == 0 && self.subs[0].at_first {
            return false;
        }
        if self.current < self.subs.len() {
            if self.subs[self.current].iter.prev() {
                return true;
            }
            self.subs[self.current].at_first = true;
        }
        while self.current > 0 {
            self.current -= 1;
            let cursor = &mut self.subs[self.current];
            let empty = if cursor.at_end {
                !cursor.iter.prev()
            } else {
                !cursor.iter.last()
            };
            cursor.at_first = empty;
            cursor.at_end = empty;
            if !empty {
                return true;
            }
        }
        // Everything before is empty; recover the first entry so the
        // cursor never sits before the beginning.
        if self.subs[0].at_end {
            self.next();
        }
        false
    }

    fn first(&mut self) -> bool {
        for cursor in &mut self.subs {
            cursor.at_first = true;
            cursor.at_end = !cursor.iter.first();
        }
        self.current = 0;
        while self.current < self.subs.len() && self.subs[self.current].at_end {
            self.current += 1;
        }
        self.current < self.subs.len()
    }

    fn last(&mut self) -> bool {
        self.current = self.subs.len();
        self.prev()
    }

    fn seek(&mut self, key: &Dtype) -> bool {
        // Route the seek to the shard that owns the key; later shards only
        // come into play if that one has nothing at or after it.
        let target = self.key_index(key);
        let cursor = &mut self.subs[target];
        let found = cursor.iter.seek(key);
        let valid = found || cursor.iter.valid();
        self.current = target;
        cursor.at_first = false;
        cursor.at_end = !valid;
        if found {
            return true;
        }
        if !valid {
            self.next();
        }
        false
    }

    fn key(&self) -> Option<Dtype> {
        self.subs.get(self.current)?.iter.key()
    }

    fn meta(&self) -> Option<BlobMeta> {
        self.subs.get(self.current)?.iter.meta()
    }

    fn value(&self) -> Option<Blob> {
        self.subs.get(self.current)?.iter.value()
    }

    fn iter_key_type(&self) -> KeyType {
        self.key_type
    }
}

// ------------------------------------------------------------------------------------------------
// Factory
// ------------------------------------------------------------------------------------------------

/// Factory for the `keydiv_dtable` class. Config: `base`/`base_config` for
/// the shards and the `divider_0`, `divider_1`, … sequence.
pub struct KeydivDtableFactory;

impl DtableFactory for KeydivDtableFactory {
    fn class_name(&self) -> &'static str {
        "keydiv_dtable"
    }

    fn create_empty(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        key_type: KeyType,
    ) -> Result<(), DtableError> {
        KeydivDtable::create(ctx, path, config, key_type)
    }

    fn open(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
    ) -> Result<Arc<dyn Dtable>, DtableError> {
        Ok(Arc::new(KeydivDtable::open(ctx, path, config)?))
    }
}
