//! Packed base plus an out-of-line exception map.
//!
//! The accepting side of the reject protocol. At create time this wrapper
//! hands the source to a packed base implementation (smallint, fixed,
//! array…); whenever the base's reverse iterator cannot encode a value, the
//! reject lands here: the real value is captured into a side list, and the
//! configured *sentinel* blob is stored in the base instead. The side list
//! becomes the `alt` sub-table.
//!
//! At read time a base value equal to the sentinel redirects the lookup to
//! `alt`. The sentinel must therefore be a value the base encodes but real
//! data never uses (for a 1-byte smallint base, say `ff`).

use std::{
    cell::{Cell, RefCell},
    fs,
    path::Path,
    sync::Arc,
};

use tracing::debug;

use crate::{
    dtable::{
        AtxId, Dtable, DtableError, DtableIter, check_key_type, iter::SnapshotIter,
    },
    factory::{DtableFactory, TableContext, dtable_entry},
    params::Params,
    value::{Blob, BlobComparator, BlobMeta, CmpRef, Dtype, KeyType},
};

const BASE_NAME: &str = "base";
const ALT_NAME: &str = "alt";

/// Wrapper dtable splitting values between a packed base and an exception
/// table.
pub struct ExceptionDtable {
    base: Arc<dyn Dtable>,
    alt: Arc<dyn Dtable>,
    sentinel: Blob,
}

impl ExceptionDtable {
    fn config_sentinel(config: &Params) -> Result<Blob, DtableError> {
        let sentinel = config.blob("reject_value", Blob::dne())?;
        if !sentinel.exists() {
            return Err(DtableError::NoEntry(
                "exception dtable needs a \"reject_value\" blob".into(),
            ));
        }
        Ok(sentinel)
    }

    /// Opens the wrapper: `base` and `alt` sub-tables under `path`.
    pub fn open(ctx: &TableContext, path: &Path, config: &Params) -> Result<Self, DtableError> {
        let sentinel = Self::config_sentinel(config)?;
        let (base_factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        let (alt_factory, alt_config) = dtable_entry(ctx, config, "alt", "alt_config")?;
        let base = base_factory.open(ctx, &path.join(BASE_NAME), &base_config)?;
        let alt = alt_factory.open(ctx, &path.join(ALT_NAME), &alt_config)?;
        if base.key_type() != alt.key_type() {
            return Err(DtableError::Corrupt(
                "exception sub-tables disagree on key type".into(),
            ));
        }
        Ok(Self {
            base,
            alt,
            sentinel,
        })
    }

    /// Creates both sub-tables from one source pass: values the base's
    /// writer rejects are absorbed into the exception list.
    pub fn create(
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        source: &mut dyn DtableIter,
        shadow: Option<&dyn Dtable>,
        cmp: CmpRef,
    ) -> Result<(), DtableError> {
        let sentinel = Self::config_sentinel(config)?;
        let (base_factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        let (alt_factory, alt_config) = dtable_entry(ctx, config, "alt", "alt_config")?;
        let key_type = source.iter_key_type();

        fs::create_dir(path)?;
        let result = (|| -> Result<usize, DtableError> {
            let mut absorber = AbsorbingIter::new(source, sentinel.clone());
            base_factory.create(
                ctx,
                &path.join(BASE_NAME),
                &base_config,
                &mut absorber,
                shadow,
                cmp.clone(),
            )?;
            let exceptions = absorber.exceptions.into_inner();
            let count = exceptions.len();

            let mut alt_source =
                SnapshotIter::new(Arc::new(exceptions), key_type, cmp.clone());
            alt_factory.create(
                ctx,
                &path.join(ALT_NAME),
                &alt_config,
                &mut alt_source,
                None,
                cmp,
            )?;
            Ok(count)
        })();

        match result {
            Ok(exceptions) => {
                debug!(path = %path.display(), exceptions, "exception dtable written");
                Ok(())
            }
            Err(error) => {
                let _ = fs::remove_dir_all(path);
                Err(error)
            }
        }
    }
}

impl Dtable for ExceptionDtable {
    fn key_type(&self) -> KeyType {
        self.base.key_type()
    }

    fn cmp_name(&self) -> Option<String> {
        self.base.cmp_name().or_else(|| self.alt.cmp_name())
    }

    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), DtableError> {
        self.base.set_blob_cmp(Arc::clone(&cmp))?;
        self.alt.set_blob_cmp(cmp)
    }

    fn lookup_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<Option<Blob>, DtableError> {
        check_key_type(self, key)?;
        match self.base.lookup_atx(key, atx)? {
            Some(value) if value == self.sentinel => {
                match self.alt.lookup_atx(key, atx)? {
                    Some(real) => Ok(Some(real)),
                    // The sentinel was stored as a real value.
                    None => Ok(Some(value)),
                }
            }
            other => Ok(other),
        }
    }

    fn iterate_atx(&self, atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError> {
        Ok(Box::new(ExceptionIter {
            base: self.base.iterate_atx(atx)?,
            alt: Arc::clone(&self.alt),
            sentinel: self.sentinel.clone(),
        }))
    }

    fn entry_count(&self) -> Result<usize, DtableError> {
        self.base.entry_count()
    }

    fn index_value(&self, index: usize) -> Result<Blob, DtableError> {
        let value = self.base.index_value(index)?;
        if value != self.sentinel {
            return Ok(value);
        }
        // Indexed access cannot resolve the key cheaply; report the stored
        // sentinel as-is.
        Ok(value)
    }

    fn contains_index(&self, index: usize) -> Result<bool, DtableError> {
        self.base.contains_index(index)
    }
}

// ------------------------------------------------------------------------------------------------
// Forward iterator
// ------------------------------------------------------------------------------------------------

struct ExceptionIter {
    base: Box<dyn DtableIter>,
    alt: Arc<dyn Dtable>,
    sentinel: Blob,
}

impl ExceptionIter {
    fn resolve(&self, value: Blob) -> Blob {
        if value != self.sentinel {
            return value;
        }
        let Some(key) = self.base.key() else {
            return value;
        };
        match self.alt.lookup(&key) {
            Ok(Some(real)) => real,
            _ => value,
        }
    }
}

impl DtableIter for ExceptionIter {
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
        self.value().map(|v| v.meta())
    }

    fn value(&self) -> Option<Blob> {
        let value = self.base.value()?;
        if !value.exists() {
            return Some(value);
        }
        Some(self.resolve(value))
    }

    fn iter_key_type(&self) -> KeyType {
        self.base.iter_key_type()
    }
}

// ------------------------------------------------------------------------------------------------
// Absorbing (create-time) iterator
// ------------------------------------------------------------------------------------------------

/// Pass-through source wrapper that accepts rejects: the real value is
/// captured for the `alt` table and the sentinel goes to the base.
struct AbsorbingIter<'a> {
    source: RefCell<&'a mut dyn DtableIter>,
    sentinel: Blob,
    exceptions: RefCell<Vec<(Dtype, Blob)>>,
    /// Guards against the same position being absorbed twice.
    last_absorbed: Cell<bool>,
}

impl<'a> AbsorbingIter<'a> {
    fn new(source: &'a mut dyn DtableIter, sentinel: Blob) -> Self {
        Self {
            source: RefCell::new(source),
            sentinel,
            exceptions: RefCell::new(Vec::new()),
            last_absorbed: Cell::new(false),
        }
    }
}

impl DtableIter for AbsorbingIter<'_> {
    fn valid(&self) -> bool {
        self.source.borrow().valid()
    }

    fn next(&mut self) -> bool {
        self.last_absorbed.set(false);
        self.source.get_mut().next()
    }

    fn prev(&mut self) -> bool {
        self.last_absorbed.set(false);
        self.source.get_mut().prev()
    }

    fn first(&mut self) -> bool {
        self.last_absorbed.set(false);
        self.source.get_mut().first()
    }

    fn last(&mut self) -> bool {
        self.last_absorbed.set(false);
        self.source.get_mut().last()
    }

    fn seek(&mut self, key: &Dtype) -> bool {
        self.last_absorbed.set(false);
        self.source.get_mut().seek(key)
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
        if self.last_absorbed.get() {
            // Already absorbed this position; the substitute itself failed
            // downstream, so give up.
            return false;
        }
        let source = self.source.get_mut();
        let Some(key) = source.key() else {
            return false;
        };
        let Some(real) = source.value() else {
            return false;
        };
        self.exceptions.get_mut().push((key, real));
        *replacement = self.sentinel.clone();
        self.last_absorbed.set(true);
        true
    }

    fn iter_key_type(&self) -> KeyType {
        self.source.borrow().iter_key_type()
    }
}

// ------------------------------------------------------------------------------------------------
// Factory
// ------------------------------------------------------------------------------------------------

/// Factory for the `exception_dtable` class. Config: `base`/`base_config`,
/// `alt`/`alt_config`, and the `reject_value` sentinel blob.
pub struct ExceptionDtableFactory;

impl DtableFactory for ExceptionDtableFactory {
    fn class_name(&self) -> &'static str {
        "exception_dtable"
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
        ExceptionDtable::create(ctx, path, config, source, shadow, cmp)
    }

    fn open(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
    ) -> Result<Arc<dyn Dtable>, DtableError> {
        Ok(Arc::new(ExceptionDtable::open(ctx, path, config)?))
    }
}
