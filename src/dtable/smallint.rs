//! Integer-packing wrapper: u32 values stored in 1–3 bytes.
//!
//! The forward table decodes on read; a create-time reverse iterator packs
//! values pulled from the source. Packing is length-homogeneous, so the
//! base keeps its ordering and indexed access.
//!
//! A value packs only if it is exactly 4 bytes wide and below
//! `2^(8·bytes)`. Anything else — out-of-range, wrong width, zero-length —
//! goes through the reject protocol: the source may substitute a
//! replacement (an exception table storing the real value out of line), or
//! refuse, which aborts the create with `Unsupported`.

use std::{
    cell::{Cell, RefCell},
    path::Path,
    sync::Arc,
};

use crate::{
    dtable::{AtxId, Dtable, DtableError, DtableIter, check_key_type},
    factory::{DtableFactory, TableContext, dtable_entry},
    params::Params,
    value::{Blob, BlobComparator, BlobMeta, CmpRef, Dtype, KeyType},
};

fn value_limit(bytes: usize) -> u32 {
    1u32 << (8 * bytes)
}

/// Packs a 4-byte u32 blob into `bytes` big-endian bytes, when in range.
fn pack(value: &Blob, bytes: usize) -> Option<Blob> {
    if value.size() != 4 {
        return None;
    }
    let Ok(v) = value.as_u32() else { return None };
    if v >= value_limit(bytes) {
        return None;
    }
    let be = v.to_be_bytes();
    Some(Blob::from(&be[4 - bytes..]))
}

/// Expands a packed value back to its 4-byte u32 blob.
fn unpack(packed: &Blob, bytes: usize) -> Result<Blob, DtableError> {
    if packed.size() != bytes {
        return Err(DtableError::Corrupt(format!(
            "packed value has {} bytes, expected {bytes}",
            packed.size()
        )));
    }
    let mut be = [0u8; 4];
    be[4 - bytes..].copy_from_slice(packed.bytes());
    Ok(Blob::from_u32(u32::from_be_bytes(be)))
}

/// Wrapper dtable storing u32 values packed to `bytes` bytes.
pub struct SmallintDtable {
    base: Arc<dyn Dtable>,
    bytes: usize,
}

impl SmallintDtable {
    fn config_bytes(config: &Params) -> Result<usize, DtableError> {
        let bytes = config.int("bytes", 0)?;
        if !(1..=3).contains(&bytes) {
            return Err(DtableError::InvalidArgument(
                "smallint bytes must be 1, 2, or 3".into(),
            ));
        }
        Ok(bytes as usize)
    }

    /// Opens the wrapper over its configured base.
    pub fn open(ctx: &TableContext, path: &Path, config: &Params) -> Result<Self, DtableError> {
        let bytes = Self::config_bytes(config)?;
        let (factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        let base = factory.open(ctx, path, &base_config)?;
        Ok(Self { base, bytes })
    }
}

impl Dtable for SmallintDtable {
    fn key_type(&self) -> KeyType {
        self.base.key_type()
    }

    fn cmp_name(&self) -> Option<String> {
        self.base.cmp_name()
    }

    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), DtableError> {
        self.base.set_blob_cmp(cmp)
    }

    fn lookup_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<Option<Blob>, DtableError> {
        check_key_type(self, key)?;
        match self.base.lookup_atx(key, atx)? {
            Some(value) if value.exists() => Ok(Some(unpack(&value, self.bytes)?)),
            other => Ok(other),
        }
    }

    fn present_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<bool, DtableError> {
        self.base.present_atx(key, atx)
    }

    fn iterate_atx(&self, atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError> {
        Ok(Box::new(SmallintIter {
            base: self.base.iterate_atx(atx)?,
            bytes: self.bytes,
        }))
    }

    fn entry_count(&self) -> Result<usize, DtableError> {
        self.base.entry_count()
    }

    fn index_value(&self, index: usize) -> Result<Blob, DtableError> {
        let value = self.base.index_value(index)?;
        if value.exists() {
            unpack(&value, self.bytes)
        } else {
            Ok(value)
        }
    }

    fn contains_index(&self, index: usize) -> Result<bool, DtableError> {
        self.base.contains_index(index)
    }
}

// ------------------------------------------------------------------------------------------------
// Forward iterator
// ------------------------------------------------------------------------------------------------

struct SmallintIter {
    base: Box<dyn DtableIter>,
    bytes: usize,
}

impl DtableIter for SmallintIter {
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
        self.base.seek(key)
    }

    fn seek_index(&mut self, index: usize) -> Result<bool, DtableError> {
        self.base.seek_index(index)
    }

    fn get_index(&self) -> Result<usize, DtableError> {
        self.base.get_index()
    }

    fn key(&self) -> Option<Dtype> {
        self.base.key()
    }

    fn meta(&self) -> Option<BlobMeta> {
        // The decoded width differs from the stored width.
        self.value().map(|v| v.meta())
    }

    fn value(&self) -> Option<Blob> {
        let value = self.base.value()?;
        if !value.exists() {
            return Some(value);
        }
        unpack(&value, self.bytes).ok()
    }

    fn iter_key_type(&self) -> KeyType {
        self.base.iter_key_type()
    }
}

// ------------------------------------------------------------------------------------------------
// Reverse (create-time) iterator
// ------------------------------------------------------------------------------------------------

/// Packs values on the way down to the base writer.
///
/// An unencodable value goes to the underlying source's reject hook right
/// from `value()` (the source may substitute something packable, typically
/// an exception sentinel); a refused reject flags the whole create as
/// failed.
struct SmallintRevIter<'a> {
    source: RefCell<&'a mut dyn DtableIter>,
    bytes: usize,
    failed: Cell<bool>,
}

impl<'a> SmallintRevIter<'a> {
    fn new(source: &'a mut dyn DtableIter, bytes: usize) -> Self {
        Self {
            source: RefCell::new(source),
            bytes,
            failed: Cell::new(false),
        }
    }
}

impl DtableIter for SmallintRevIter<'_> {
    fn valid(&self) -> bool {
        self.source.borrow().valid()
    }

    fn next(&mut self) -> bool {
        self.source.get_mut().next()
    }

    fn prev(&mut self) -> bool {
        self.source.get_mut().prev()
    }

    fn first(&mut self) -> bool {
        self.source.get_mut().first()
    }

    fn last(&mut self) -> bool {
        self.source.get_mut().last()
    }

    fn seek(&mut self, key: &Dtype) -> bool {
        self.source.get_mut().seek(key)
    }

    fn key(&self) -> Option<Dtype> {
        self.source.borrow().key()
    }

    fn meta(&self) -> Option<BlobMeta> {
        self.value().map(|v| v.meta())
    }

    fn value(&self) -> Option<Blob> {
        let mut source = self.source.borrow_mut();
        let value = source.value()?;
        if !value.exists() {
            return Some(value);
        }
        if let Some(packed) = pack(&value, self.bytes) {
            return Some(packed);
        }
        let mut replacement = value;
        if source.reject(&mut replacement) {
            if !replacement.exists() {
                return Some(replacement);
            }
            if let Some(packed) = pack(&replacement, self.bytes) {
                return Some(packed);
            }
        }
        self.failed.set(true);
        Some(Blob::dne())
    }

    fn reject(&mut self, replacement: &mut Blob) -> bool {
        if self.failed.get() {
            return false;
        }
        self.source.get_mut().reject(replacement)
    }

    fn iter_key_type(&self) -> KeyType {
        self.source.borrow().iter_key_type()
    }
}

// ------------------------------------------------------------------------------------------------
// Create
// ------------------------------------------------------------------------------------------------

impl SmallintDtable {
    /// Writes a packed table: every source value is re-encoded through the
    /// reverse iterator, with rejects routed to the source.
    pub fn create(
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        source: &mut dyn DtableIter,
        shadow: Option<&dyn Dtable>,
        cmp: CmpRef,
    ) -> Result<(), DtableError> {
        let bytes = Self::config_bytes(config)?;
        let (factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;

        // The reverse wrapper packs values and asks the source to absorb
        // what cannot be packed.
        let mut rev = SmallintRevIter::new(source, bytes);
        let result = factory.create(ctx, path, &base_config, &mut rev, shadow, cmp);
        let failed = rev.failed.get();
        result?;
        if failed {
            let _ = std::fs::remove_file(path);
            let _ = std::fs::remove_dir_all(path);
            return Err(DtableError::Unsupported(
                "value not representable as a small integer",
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Factory
// ------------------------------------------------------------------------------------------------

/// Factory for the `smallint_dtable` class. Config: `bytes` int in 1..=3,
/// `base` class + `base_config`.
pub struct SmallintDtableFactory;

impl DtableFactory for SmallintDtableFactory {
    fn class_name(&self) -> &'static str {
        "smallint_dtable"
    }

    fn indexed_access(&self, ctx: &TableContext, config: &Params) -> bool {
        let Ok((factory, base_config)) = dtable_entry(ctx, config, "base", "base_config") else {
            return false;
        };
        factory.indexed_access(ctx, &base_config)
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
        SmallintDtable::create(ctx, path, config, source, shadow, cmp)
    }

    fn open(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
    ) -> Result<Arc<dyn Dtable>, DtableError> {
        Ok(Arc::new(SmallintDtable::open(ctx, path, config)?))
    }
}
