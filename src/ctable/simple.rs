//! Column table over packed row blobs in one dtable.
//!
//! Each row is a single blob holding its columns — [`SubBlob`] layout for
//! free-form named columns, [`IndexBlob`] when the config declares a fixed
//! column set. A column write is read-modify-flatten-write of one row;
//! removing the last present column collects the row.

use std::{path::Path, sync::Arc};

use tracing::debug;

use crate::{
    ctable::{
        Ctable, CtableError, CtableIter,
        rowblob::{IndexBlob, SubBlob},
    },
    dtable::{Dtable, DtableError, DtableIter, iter::SkipIter},
    factory::{CtableFactory, TableContext, dtable_entry},
    params::Params,
    value::{Blob, BlobComparator, Dtype, KeyType},
};

/// One-dtable column table.
pub struct SimpleCtable {
    base: Arc<dyn Dtable>,
    /// Declared column names; empty means free-form SubBlob rows.
    names: Vec<String>,
}

impl SimpleCtable {
    fn config_names(config: &Params) -> Result<Vec<String>, DtableError> {
        let declared = config.int("columns", 0)?;
        if declared <= 0 {
            return Ok(Vec::new());
        }
        let mut names = Vec::with_capacity(declared as usize);
        for index in 0..declared {
            let key = format!("column{index}_name");
            let name = config.string(&key)?.ok_or_else(|| {
                DtableError::NoEntry(format!("missing {key:?} for declared column"))
            })?;
            names.push(name.to_string());
        }
        Ok(names)
    }

    /// Creates the backing dtable.
    pub fn create(
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        key_type: KeyType,
    ) -> Result<(), DtableError> {
        Self::config_names(config)?;
        let (factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        factory.create_empty(ctx, path, &base_config, key_type)?;
        debug!(path = %path.display(), "simple ctable created");
        Ok(())
    }

    /// Opens the backing dtable.
    pub fn open(ctx: &TableContext, path: &Path, config: &Params) -> Result<Self, CtableError> {
        let names = Self::config_names(config)?;
        let (factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        let base = factory.open(ctx, path, &base_config)?;
        Ok(Self { base, names })
    }

    fn column_index(&self, column: &str) -> Result<usize, CtableError> {
        self.names
            .iter()
            .position(|name| name == column)
            .ok_or_else(|| CtableError::NoColumn(column.to_string()))
    }

    fn indexed(&self) -> bool {
        !self.names.is_empty()
    }

    /// Reads the row's edit form as (name, value) pairs.
    fn read_row(&self, key: &Dtype) -> Result<Vec<(String, Blob)>, CtableError> {
        let Some(row) = self.base.get(key)? else {
            return Ok(Vec::new());
        };
        if self.indexed() {
            let parsed = IndexBlob::from_blob(&row, self.names.len())?;
            Ok(self
                .names
                .iter()
                .enumerate()
                .filter_map(|(i, name)| parsed.get(i).map(|v| (name.clone(), v)))
                .collect())
        } else {
            let parsed = SubBlob::from_blob(&row)?;
            Ok(parsed
                .present()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect())
        }
    }

    /// Applies one column mutation to the stored row.
    fn update_row(&self, key: &Dtype, column: &str, value: Blob) -> Result<(), CtableError> {
        let stored = self.base.get(key)?;
        if self.indexed() {
            let index = self.column_index(column)?;
            let mut row = match &stored {
                Some(blob) => IndexBlob::from_blob(blob, self.names.len())?,
                None => IndexBlob::new(self.names.len()),
            };
            row.set(index, value)?;
            if row.is_empty() {
                self.base.remove(key)?;
            } else {
                self.base.insert(key, row.flatten())?;
            }
        } else {
            let mut row = match &stored {
                Some(blob) => SubBlob::from_blob(blob)?,
                None => SubBlob::new(),
            };
            row.set(column, value)?;
            if row.is_empty() {
                self.base.remove(key)?;
            } else {
                self.base.insert(key, row.flatten())?;
            }
        }
        Ok(())
    }
}

impl Ctable for SimpleCtable {
    fn key_type(&self) -> KeyType {
        self.base.key_type()
    }

    fn column_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn find(&self, key: &Dtype, column: &str) -> Result<Option<Blob>, CtableError> {
        let Some(row) = self.base.get(key)? else {
            return Ok(None);
        };
        if self.indexed() {
            let index = self.column_index(column)?;
            Ok(IndexBlob::from_blob(&row, self.names.len())?.get(index))
        } else {
            SubBlob::extract(&row, column)
        }
    }

    fn contains(&self, key: &Dtype) -> Result<bool, CtableError> {
        Ok(self.base.present(key)?)
    }

    fn insert(&self, key: &Dtype, column: &str, value: Blob) -> Result<(), CtableError> {
        self.update_row(key, column, value)
    }

    fn remove(&self, key: &Dtype, column: &str) -> Result<(), CtableError> {
        self.update_row(key, column, Blob::dne())
    }

    fn remove_row(&self, key: &Dtype) -> Result<(), CtableError> {
        Ok(self.base.remove(key)?)
    }

    fn keys(&self) -> Result<Box<dyn DtableIter>, CtableError> {
        Ok(Box::new(SkipIter::skip_nonexistent(self.base.iterate()?)))
    }

    fn iterate(&self) -> Result<Box<dyn CtableIter>, CtableError> {
        let rows = SkipIter::skip_nonexistent(self.base.iterate()?);
        let mut iter = SimpleCtableIter {
            rows: Box::new(rows),
            names: self.names.clone(),
            cells: Vec::new(),
            col: 0,
        };
        iter.load_row();
        Ok(Box::new(iter))
    }

    fn maintain(&self, force: bool) -> Result<(), CtableError> {
        Ok(self.base.maintain(force)?)
    }

    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), CtableError> {
        Ok(self.base.set_blob_cmp(cmp)?)
    }
}

impl std::fmt::Debug for SimpleCtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleCtable")
            .field("columns", &self.names)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Walks rows through the base iterator and cells through the parsed row.
struct SimpleCtableIter {
    rows: Box<dyn DtableIter>,
    names: Vec<String>,
    /// Present cells of the current row.
    cells: Vec<(String, Blob)>,
    col: usize,
}

impl SimpleCtableIter {
    /// Parses the current row into its present cells.
    fn load_row(&mut self) {
        self.cells.clear();
        self.col = 0;
        let Some(row) = self.rows.value() else {
            return;
        };
        if !self.names.is_empty() {
            if let Ok(parsed) = IndexBlob::from_blob(&row, self.names.len()) {
                for (i, name) in self.names.iter().enumerate() {
                    if let Some(value) = parsed.get(i) {
                        self.cells.push((name.clone(), value));
                    }
                }
            }
        } else if let Ok(parsed) = SubBlob::from_blob(&row) {
            for (name, value) in parsed.present() {
                self.cells.push((name.to_string(), value.clone()));
            }
        }
    }

    /// Moves forward until a row with at least one present cell.
    fn advance_row(&mut self) -> bool {
        while self.rows.next() {
            self.load_row();
            if !self.cells.is_empty() {
                return true;
            }
        }
        self.cells.clear();
        self.col = 0;
        false
    }

    fn retreat_row(&mut self) -> bool {
        while self.rows.prev() {
            self.load_row();
            if !self.cells.is_empty() {
                self.col = self.cells.len() - 1;
                return true;
            }
        }
        // Recover forward to a sane position.
        self.rows.first();
        self.load_row();
        false
    }
}

impl CtableIter for SimpleCtableIter {
    fn valid(&self) -> bool {
        self.col < self.cells.len()
    }

    fn next(&mut self) -> bool {
        if self.col + 1 < self.cells.len() {
            self.col += 1;
            return true;
        }
        self.advance_row()
    }

    fn next_row(&mut self) -> bool {
        self.advance_row()
    }

    fn prev(&mut self) -> bool {
        if self.col > 0 {
            self.col -= 1;
            return true;
        }
        self.retreat_row()
    }

    fn first(&mut self) -> bool {
        if !self.rows.first() {
            self.cells.clear();
            self.col = 0;
            return false;
        }
        self.load_row();
        if self.cells.is_empty() {
            return self.advance_row();
        }
        true
    }

    fn last(&mut self) -> bool {
        if !self.rows.last() {
            self.cells.clear();
            self.col = 0;
            return false;
        }
        self.load_row();
        if self.cells.is_empty() {
            return self.retreat_row();
        }
        self.col = self.cells.len() - 1;
        true
    }

    fn seek(&mut self, key: &Dtype) -> bool {
        let found = self.rows.seek(key);
        self.load_row();
        if self.cells.is_empty() && self.rows.valid() {
            self.advance_row();
            return false;
        }
        found
    }

    fn key(&self) -> Option<Dtype> {
        if !self.valid() {
            return None;
        }
        self.rows.key()
    }

    fn column(&self) -> Option<String> {
        self.cells.get(self.col).map(|(name, _)| name.clone())
    }

    fn value(&self) -> Option<Blob> {
        self.cells.get(self.col).map(|(_, value)| value.clone())
    }
}

// ------------------------------------------------------------------------------------------------
// Factory
// ------------------------------------------------------------------------------------------------

/// Factory for the `simple_ctable` class. Config: `base`/`base_config`
/// plus optional `columns` int with `column0_name`, `column1_name`, …
/// declaring a fixed indexed column set.
pub struct SimpleCtableFactory;

impl CtableFactory for SimpleCtableFactory {
    fn class_name(&self) -> &'static str {
        "simple_ctable"
    }

    fn create(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        key_type: KeyType,
    ) -> Result<(), DtableError> {
        SimpleCtable::create(ctx, path, config, key_type)
    }

    fn open(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
    ) -> Result<Arc<dyn Ctable>, CtableError> {
        Ok(Arc::new(SimpleCtable::open(ctx, path, config)?))
    }
}
