//! Delta-encoded u32 sequences with periodic absolute references.
//!
//! For monotonically non-decreasing u32 values, storing per-entry deltas
//! (in a `base` sub-table, typically packed small) plus an absolute value
//! at every `skip`-th present entry (the `ref` sub-table) compresses far
//! better than raw 4-byte values.
//!
//! Forward iteration keeps a running sum of deltas; backward iteration
//! subtracts the delta being left. A point operation finds the nearest
//! reference at or below the key and scans deltas forward from there —
//! which is also how `seek` and `last` position themselves.
//!
//! Create drives two reverse passes over the source: a delta pass feeding
//! the base writer (non-4-byte values go through the source's reject hook)
//! and a reference pass feeding the ref writer with every `skip`-th
//! surviving absolute.

use std::{
    cell::{Cell, RefCell},
    fs,
    path::Path,
    sync::Arc,
};

use tracing::debug;

use crate::{
    dtable::{AtxId, Dtable, DtableError, DtableIter, check_key_type, source_shadow_ok},
    factory::{DtableFactory, TableContext, dtable_entry},
    params::Params,
    value::{Blob, BlobComparator, BlobMeta, CmpRef, Dtype, KeyType},
};

const BASE_NAME: &str = "base";
const REF_NAME: &str = "ref";

/// Wrapper dtable reading delta-encoded values.
pub struct DeltaintDtable {
    base: Arc<dyn Dtable>,
    reference: Arc<dyn Dtable>,
}

impl DeltaintDtable {
    /// Opens the `base` (deltas) and `ref` (absolutes) sub-tables.
    pub fn open(ctx: &TableContext, path: &Path, config: &Params) -> Result<Self, DtableError> {
        let (base_factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        let (ref_factory, ref_config) = dtable_entry(ctx, config, "ref", "ref_config")?;
        let base = base_factory.open(ctx, &path.join(BASE_NAME), &base_config)?;
        let reference = ref_factory.open(ctx, &path.join(REF_NAME), &ref_config)?;
        if base.key_type() != reference.key_type() {
            return Err(DtableError::Corrupt(
                "deltaint sub-tables disagree on key type".into(),
            ));
        }
        Ok(Self { base, reference })
    }

}

/// Positions a fresh base iterator at `key`'s floor reference and returns
/// (iterator, running absolute at that position).
///
/// The ref table samples existing entries, so any key at or after the
/// first entry has a floor reference.
fn floor_position(
    base: &Arc<dyn Dtable>,
    reference: &Arc<dyn Dtable>,
    key: &Dtype,
) -> Result<Option<(Box<dyn DtableIter>, u32)>, DtableError> {
    let mut ref_iter = reference.iterate()?;
    let found = ref_iter.seek(key);
    if !found && !ref_iter.prev() {
        // Before the first reference: the key precedes every entry.
        return Ok(None);
    }
    let (Some(ref_key), Some(ref_value)) = (ref_iter.key(), ref_iter.value()) else {
        return Ok(None);
    };
    let absolute = ref_value.as_u32()?;

    let mut base_iter = base.iterate()?;
    if !base_iter.seek(&ref_key) {
        return Err(DtableError::Corrupt(
            "reference key missing from delta table".into(),
        ));
    }
    Ok(Some((base_iter, absolute)))
}

/// Scans forward from a positioned floor reference to `key`, accumulating
/// deltas. Returns whether the exact key was found, with the iterator
/// parked at the first entry ≥ `key`.
fn scan_to(
    base_iter: &mut dyn DtableIter,
    current: &mut u32,
    exists: &mut bool,
    key: &Dtype,
) -> Result<bool, DtableError> {
    loop {
        let Some(probe) = base_iter.key() else {
            return Ok(false);
        };
        match probe.compare(key, None) {
            std::cmp::Ordering::Equal => return Ok(true),
            std::cmp::Ordering::Greater => return Ok(false),
            std::cmp::Ordering::Less => {}
        }
        if !base_iter.next() {
            return Ok(false);
        }
        match base_iter.value() {
            Some(delta) if delta.exists() => {
                *current = current.wrapping_add(delta.as_u32()?);
                *exists = true;
            }
            _ => *exists = false,
        }
    }
}

impl Dtable for DeltaintDtable {
    fn key_type(&self) -> KeyType {
        self.base.key_type()
    }

    fn cmp_name(&self) -> Option<String> {
        self.base.cmp_name()
    }

    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), DtableError> {
        self.base.set_blob_cmp(Arc::clone(&cmp))?;
        self.reference.set_blob_cmp(cmp)
    }

    fn lookup_atx(&self, key: &Dtype, _atx: Option<AtxId>) -> Result<Option<Blob>, DtableError> {
        check_key_type(self, key)?;
        let Some((mut base_iter, mut current)) = floor_position(&self.base, &self.reference, key)?
        else {
            return Ok(None);
        };
        let mut exists = true;
        let found = scan_to(base_iter.as_mut(), &mut current, &mut exists, key)?;
        if !found {
            return Ok(None);
        }
        Ok(Some(if exists {
            Blob::from_u32(current)
        } else {
            Blob::dne()
        }))
    }

    fn present_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<bool, DtableError> {
        self.base.present_atx(key, atx)
    }

    fn iterate_atx(&self, _atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError> {
        let base_iter = self.base.iterate()?;
        let mut iter = DeltaintIter {
            base: base_iter,
            table: DeltaRefs {
                base: Arc::clone(&self.base),
                reference: Arc::clone(&self.reference),
            },
            current: 0,
            exists: false,
        };
        iter.reload_at_position();
        Ok(Box::new(iter))
    }
}

impl std::fmt::Debug for DeltaintDtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaintDtable").finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Forward iterator
// ------------------------------------------------------------------------------------------------

#[derive(Clone)]
struct DeltaRefs {
    base: Arc<dyn Dtable>,
    reference: Arc<dyn Dtable>,
}

struct DeltaintIter {
    base: Box<dyn DtableIter>,
    table: DeltaRefs,
    current: u32,
    exists: bool,
}

impl DeltaintIter {
    fn raw_delta(&self) -> Option<u32> {
        let value = self.base.value()?;
        if !value.exists() {
            return None;
        }
        value.as_u32().ok()
    }

    /// Recomputes the running sum for the base iterator's current position
    /// by scanning from the floor reference.
    fn reload_at_position(&mut self) {
        self.exists = false;
        let Some(target) = self.base.key() else {
            return;
        };
        if let Ok(Some((mut scan, mut current))) =
            floor_position(&self.table.base, &self.table.reference, &target)
        {
            let mut exists = true;
            if let Ok(true) = scan_to(scan.as_mut(), &mut current, &mut exists, &target) {
                self.current = current;
                self.exists = exists;
                return;
            }
        }
        // No floor reference: the running sum starts from zero at the
        // first entry.
        if let Some(delta) = self.raw_delta() {
            self.current = delta;
            self.exists = true;
        }
    }
}

impl DtableIter for DeltaintIter {
    fn valid(&self) -> bool {
        self.base.valid()
    }

    fn next(&mut self) -> bool {
        let valid = self.base.next();
        if valid {
            match self.raw_delta() {
                Some(delta) => {
                    self.current = self.current.wrapping_add(delta);
                    self.exists = true;
                }
                None => self.exists = false,
            }
        } else {
            self.exists = false;
        }
        valid
    }

    fn prev(&mut self) -> bool {
        // Leaving an existing entry backward subtracts its own delta; a
        // tombstone contributed nothing to the sum.
        let leaving = if self.base.valid() {
            self.raw_delta().unwrap_or(0)
        } else {
            0
        };
        let was_end = !self.base.valid();
        let valid = self.base.prev();
        if !valid {
            return false;
        }
        if was_end {
            // Recovering the last entry from the end slot: recompute.
            self.reload_at_position();
            return true;
        }
        self.current = self.current.wrapping_sub(leaving);
        self.exists = self.raw_delta().is_some();
        true
    }

    fn first(&mut self) -> bool {
        let valid = self.base.first();
        if valid {
            match self.raw_delta() {
                Some(delta) => {
                    self.current = delta;
                    self.exists = true;
                }
                None => {
                    self.current = 0;
                    self.exists = false;
                }
            }
        } else {
            self.exists = false;
        }
        valid
    }

    fn last(&mut self) -> bool {
        if !self.base.last() {
            self.exists = false;
            return false;
        }
        self.reload_at_position();
        true
    }

    fn seek(&mut self, key: &Dtype) -> bool {
        let found = self.base.seek(key);
        self.reload_at_position();
        found
    }

    fn key(&self) -> Option<Dtype> {
        self.base.key()
    }

    fn meta(&self) -> Option<BlobMeta> {
        if !self.base.valid() {
            return None;
        }
        Some(if self.exists {
            BlobMeta::present(4)
        } else {
            BlobMeta::nonexistent()
        })
    }

    fn value(&self) -> Option<Blob> {
        if !self.base.valid() {
            return None;
        }
        Some(if self.exists {
            Blob::from_u32(self.current)
        } else {
            Blob::dne()
        })
    }

    fn iter_key_type(&self) -> KeyType {
        self.base.iter_key_type()
    }
}

// ------------------------------------------------------------------------------------------------
// Reverse (create-time) iterators
// ------------------------------------------------------------------------------------------------

/// Emits per-entry deltas of a non-decreasing u32 source.
struct DeltaRevIter<'a> {
    source: RefCell<&'a mut dyn DtableIter>,
    delta: Cell<u32>,
    previous: Cell<u32>,
    exists: Cell<bool>,
    failed: Cell<bool>,
}

impl<'a> DeltaRevIter<'a> {
    fn new(source: &'a mut dyn DtableIter) -> Self {
        let iter = Self {
            source: RefCell::new(source),
            delta: Cell::new(0),
            previous: Cell::new(0),
            exists: Cell::new(false),
            failed: Cell::new(false),
        };
        iter.refresh();
        iter
    }

    /// Reads the current source value, routing non-u32 payloads through the
    /// reject hook; updates the delta state.
    fn refresh(&self) {
        let mut source = self.source.borrow_mut();
        if !source.valid() {
            self.exists.set(false);
            return;
        }
        let Some(mut value) = source.value() else {
            self.exists.set(false);
            return;
        };
        if value.exists() && value.size() != 4 {
            let mut replacement = value.clone();
            if !source.reject(&mut replacement) {
                self.failed.set(true);
                self.exists.set(false);
                return;
            }
            value = replacement;
            if value.exists() && value.size() != 4 {
                self.failed.set(true);
                self.exists.set(false);
                return;
            }
        }
        if !value.exists() {
            self.exists.set(false);
            return;
        }
        let absolute = match value.as_u32() {
            Ok(v) => v,
            Err(_) => {
                self.failed.set(true);
                self.exists.set(false);
                return;
            }
        };
        self.delta.set(absolute.wrapping_sub(self.previous.get()));
        self.previous.set(absolute);
        self.exists.set(true);
    }
}

impl DtableIter for DeltaRevIter<'_> {
    fn valid(&self) -> bool {
        self.source.borrow().valid()
    }

    fn next(&mut self) -> bool {
        let valid = self.source.get_mut().next();
        if valid {
            self.refresh();
        } else {
            self.exists.set(false);
        }
        valid
    }

    fn prev(&mut self) -> bool {
        // The delta stream is written strictly forward.
        false
    }

    fn first(&mut self) -> bool {
        let valid = self.source.get_mut().first();
        self.previous.set(0);
        if valid {
            self.refresh();
        } else {
            self.exists.set(false);
        }
        valid
    }

    fn last(&mut self) -> bool {
        false
    }

    fn seek(&mut self, _key: &Dtype) -> bool {
        false
    }

    fn key(&self) -> Option<Dtype> {
        self.source.borrow().key()
    }

    fn meta(&self) -> Option<BlobMeta> {
        if !self.valid() {
            return None;
        }
        Some(if self.exists.get() {
            BlobMeta::present(4)
        } else {
            BlobMeta::nonexistent()
        })
    }

    fn value(&self) -> Option<Blob> {
        if !self.valid() {
            return None;
        }
        Some(if self.exists.get() {
            Blob::from_u32(self.delta.get())
        } else {
            Blob::dne()
        })
    }

    fn reject(&mut self, replacement: &mut Blob) -> bool {
        self.source.get_mut().reject(replacement)
    }

    fn iter_key_type(&self) -> KeyType {
        self.source.borrow().iter_key_type()
    }
}

/// Emits the absolute value at every `skip`-th present source entry.
struct RefRevIter<'a> {
    source: RefCell<&'a mut dyn DtableIter>,
    skip: usize,
}

impl<'a> RefRevIter<'a> {
    fn new(source: &'a mut dyn DtableIter, skip: usize) -> Self {
        let iter = Self {
            source: RefCell::new(source),
            skip,
        };
        iter.settle();
        iter
    }

    /// Advances to the next present 4-byte entry.
    fn settle(&self) {
        let mut source = self.source.borrow_mut();
        while source.valid() {
            if let Some(meta) = source.meta() {
                if meta.exists && meta.size == 4 {
                    return;
                }
            }
            source.next();
        }
    }
}

impl DtableIter for RefRevIter<'_> {
    fn valid(&self) -> bool {
        self.source.borrow().valid()
    }

    fn next(&mut self) -> bool {
        {
            let source = self.source.get_mut();
            for _ in 0..self.skip {
                if !source.next() {
                    return false;
                }
            }
        }
        self.settle();
        self.valid()
    }

    fn prev(&mut self) -> bool {
        false
    }

    fn first(&mut self) -> bool {
        self.source.get_mut().first();
        self.settle();
        self.valid()
    }

    fn last(&mut self) -> bool {
        false
    }

    fn seek(&mut self, _key: &Dtype) -> bool {
        false
    }

    fn key(&self) -> Option<Dtype> {
        self.source.borrow().key()
    }

    fn meta(&self) -> Option<BlobMeta> {
        self.source.borrow().meta()
    }

    fn value(&self) -> Option<Blob> {
        self.source.borrow().value()
    }

    fn reject(&mut self, replacement: &mut Blob) -> bool {
        // The reference table is an acceleration structure; losing one
        // sample costs a longer delta scan, not data.
        *replacement = Blob::dne();
        true
    }

    fn iter_key_type(&self) -> KeyType {
        self.source.borrow().iter_key_type()
    }
}

// ------------------------------------------------------------------------------------------------
// Create
// ------------------------------------------------------------------------------------------------

impl DeltaintDtable {
    /// Writes the delta and reference sub-tables from one source.
    pub fn create(
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        source: &mut dyn DtableIter,
        shadow: Option<&dyn Dtable>,
        cmp: CmpRef,
    ) -> Result<(), DtableError> {
        source_shadow_ok(source, shadow)?;
        let skip = config.int("skip", 0)?;
        if skip < 2 {
            return Err(DtableError::InvalidArgument(
                "deltaint skip must be at least 2".into(),
            ));
        }
        let (base_factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        let (ref_factory, ref_config) = dtable_entry(ctx, config, "ref", "ref_config")?;

        fs::create_dir(path)?;
        let result = (|| -> Result<(), DtableError> {
            source.first();
            {
                let mut rev = DeltaRevIter::new(&mut *source);
                base_factory.create(
                    ctx,
                    &path.join(BASE_NAME),
                    &base_config,
                    &mut rev,
                    shadow,
                    cmp.clone(),
                )?;
                if rev.failed.get() {
                    return Err(DtableError::Unsupported(
                        "value not representable as a delta-encoded u32",
                    ));
                }
            }

            source.first();
            {
                let mut rev = RefRevIter::new(&mut *source, skip as usize);
                ref_factory.create(
                    ctx,
                    &path.join(REF_NAME),
                    &ref_config,
                    &mut rev,
                    None,
                    cmp,
                )?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                debug!(path = %path.display(), skip, "deltaint dtable written");
                Ok(())
            }
            Err(error) => {
                let _ = fs::remove_dir_all(path);
                Err(error)
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Factory
// ------------------------------------------------------------------------------------------------

/// Factory for the `deltaint_dtable` class. Config: `base`/`base_config`
/// (deltas), `ref`/`ref_config` (absolutes), `skip` int ≥ 2.
pub struct DeltaintDtableFactory;

impl DtableFactory for DeltaintDtableFactory {
    fn class_name(&self) -> &'static str {
        "deltaint_dtable"
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
        DeltaintDtable::create(ctx, path, config, source, shadow, cmp)
    }

    fn open(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
    ) -> Result<Arc<dyn Dtable>, DtableError> {
        Ok(Arc::new(DeltaintDtable::open(ctx, path, config)?))
    }
}
