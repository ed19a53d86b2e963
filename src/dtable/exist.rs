//! Split existence table: present entries in `base`, tombstoned keys in
//! `dnebase`.
//!
//! Useful when tombstones are numerous and the base representation is
//! expensive per entry: the `dnebase` sub-table stores only keys (their
//! values are all dne), typically in a dense form. Create splits one source
//! iterator with complementary existence filters; open wires the two
//! sub-tables into an overlay so lookups transparently report dne for
//! tombstoned keys and not-found otherwise. The union of the two
//! sub-tables' key sets is the logical key set.

use std::{fs, path::Path, sync::Arc};

use tracing::debug;

use crate::{
    dtable::{
        AtxId, Dtable, DtableError, DtableIter, iter::SkipIter, overlay::OverlayDtable,
        source_shadow_ok,
    },
    factory::{DtableFactory, TableContext, dtable_entry},
    params::Params,
    value::{Blob, BlobComparator, CmpRef, Dtype, KeyType},
};

const BASE_NAME: &str = "base";
const DNEBASE_NAME: &str = "dnebase";

/// Shadow that contains every key, forcing tombstone retention in the
/// dnebase pass.
struct FullShadow {
    key_type: KeyType,
}

impl Dtable for FullShadow {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn lookup_atx(&self, _key: &Dtype, _atx: Option<AtxId>) -> Result<Option<Blob>, DtableError> {
        Ok(Some(Blob::empty()))
    }

    fn iterate_atx(&self, _atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError> {
        Err(DtableError::Unsupported("full shadow is lookup-only"))
    }
}

/// Wrapper dtable over a present/dne split.
pub struct ExistDtable {
    overlay: OverlayDtable,
}

impl ExistDtable {
    /// Opens `base` and `dnebase` and overlays them.
    pub fn open(ctx: &TableContext, path: &Path, config: &Params) -> Result<Self, DtableError> {
        let (base_factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        let (dnebase_factory, dnebase_config) =
            dtable_entry(ctx, config, "dnebase", "dnebase_config")?;
        let base = base_factory.open(ctx, &path.join(BASE_NAME), &base_config)?;
        let dnebase = dnebase_factory.open(ctx, &path.join(DNEBASE_NAME), &dnebase_config)?;
        if base.key_type() != dnebase.key_type() {
            return Err(DtableError::Corrupt(
                "exist sub-tables disagree on key type".into(),
            ));
        }
        Ok(Self {
            overlay: OverlayDtable::new(vec![base, dnebase])?,
        })
    }

    /// Splits `source` into the two sub-tables.
    ///
    /// The present pass drops every tombstone; the dne pass keeps only
    /// tombstones, created under a full shadow so none are elided.
    pub fn create(
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        source: &mut dyn DtableIter,
        shadow: Option<&dyn Dtable>,
        cmp: CmpRef,
    ) -> Result<(), DtableError> {
        source_shadow_ok(source, shadow)?;
        let (base_factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        let (dnebase_factory, dnebase_config) =
            dtable_entry(ctx, config, "dnebase", "dnebase_config")?;
        let key_type = source.iter_key_type();

        fs::create_dir(path)?;
        let result = (|| -> Result<(), DtableError> {
            source.first();
            {
                let mut present_only = SkipIter::skip_nonexistent(BorrowedIter(&mut *source));
                base_factory.create(
                    ctx,
                    &path.join(BASE_NAME),
                    &base_config,
                    &mut present_only,
                    None,
                    cmp.clone(),
                )?;
            }

            source.first();
            {
                let full_shadow = FullShadow { key_type };
                let mut dne_only = SkipIter::skip_present(BorrowedIter(&mut *source));
                dnebase_factory.create(
                    ctx,
                    &path.join(DNEBASE_NAME),
                    &dnebase_config,
                    &mut dne_only,
                    Some(&full_shadow),
                    cmp,
                )?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                debug!(path = %path.display(), "exist dtable written");
                Ok(())
            }
            Err(error) => {
                let _ = fs::remove_dir_all(path);
                Err(error)
            }
        }
    }
}

impl Dtable for ExistDtable {
    fn key_type(&self) -> KeyType {
        self.overlay.key_type()
    }

    fn cmp_name(&self) -> Option<String> {
        self.overlay.cmp_name()
    }

    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), DtableError> {
        self.overlay.set_blob_cmp(cmp)
    }

    fn lookup_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<Option<Blob>, DtableError> {
        self.overlay.lookup_atx(key, atx)
    }

    fn iterate_atx(&self, atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError> {
        self.overlay.iterate_atx(atx)
    }
}

// ------------------------------------------------------------------------------------------------
// Borrowed source adapter
// ------------------------------------------------------------------------------------------------

/// Adapts a borrowed source into the boxed form the skip filter takes,
/// letting create run two passes over the same iterator.
struct BorrowedIter<'a>(&'a mut dyn DtableIter);

impl DtableIter for BorrowedIter<'_> {
    fn valid(&self) -> bool {
        self.0.valid()
    }
    fn next(&mut self) -> bool {
        self.0.next()
    }
    fn prev(&mut self) -> bool {
        self.0.prev()
    }
    fn first(&mut self) -> bool {
        self.0.first()
    }
    fn last(&mut self) -> bool {
        self.0.last()
    }
    fn seek(&mut self, key: &Dtype) -> bool {
        self.0.seek(key)
    }
    fn key(&self) -> Option<Dtype> {
        self.0.key()
    }
    fn meta(&self) -> Option<crate::value::BlobMeta> {
        self.0.meta()
    }
    fn value(&self) -> Option<Blob> {
        self.0.value()
    }
    fn reject(&mut self, replacement: &mut Blob) -> bool {
        self.0.reject(replacement)
    }
    fn iter_key_type(&self) -> KeyType {
        self.0.iter_key_type()
    }
}

// ------------------------------------------------------------------------------------------------
// Factory
// ------------------------------------------------------------------------------------------------

/// Factory for the `exist_dtable` class. Config: `base`/`base_config` for
/// present entries, `dnebase`/`dnebase_config` for tombstoned keys.
pub struct ExistDtableFactory;

impl DtableFactory for ExistDtableFactory {
    fn class_name(&self) -> &'static str {
        "exist_dtable"
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
        ExistDtable::create(ctx, path, config, source, shadow, cmp)
    }

    fn open(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
    ) -> Result<Arc<dyn Dtable>, DtableError> {
        Ok(Arc::new(ExistDtable::open(ctx, path, config)?))
    }
}
