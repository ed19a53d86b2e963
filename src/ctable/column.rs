//! Column table with one dtable per column.
//!
//! All columns share the declared key type; a central metadata file records
//! the column-name table, and each column lives in its own sub-dtable
//! (`cc_data.<n>`). Inserts touch a single column's table; removing a row
//! removes the key from every column; row-level iteration advances all
//! columns in lockstep, keyed on the rows where at least one column is
//! present.
//!
//! # Metadata layout
//!
//! ```text
//! magic u32 = 0x36BC4B9D, version u32 = 0, columns u32,
//! per column: name_len u32, name bytes
//! ```

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
    sync::Arc,
};

use tracing::{debug, info};

use crate::{
    ctable::{Ctable, CtableError, CtableIter},
    dtable::{Dtable, DtableError, DtableIter, iter::SkipIter},
    factory::{CtableFactory, TableContext, dtable_entry},
    params::Params,
    value::{Blob, BlobComparator, Dtype, KeyType},
};

const COLUMN_CTABLE_MAGIC: u32 = 0x36BC_4B9D;
const COLUMN_CTABLE_VERSION: u32 = 0;

const META_NAME: &str = "cc_meta";

fn column_path(index: usize) -> String {
    format!("cc_data.{index}")
}

/// Per-column dtable column table.
pub struct ColumnCtable {
    columns: Vec<Arc<dyn Dtable>>,
    names: Vec<String>,
    key_type: KeyType,
}

impl ColumnCtable {
    fn config_names(config: &Params) -> Result<Vec<String>, DtableError> {
        let declared = config.int("columns", 0)?;
        if declared < 1 {
            return Err(DtableError::InvalidArgument(
                "column ctable needs at least one column".into(),
            ));
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

    /// Creates the metadata file and one empty sub-dtable per column.
    pub fn create(
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        key_type: KeyType,
    ) -> Result<(), DtableError> {
        let names = Self::config_names(config)?;
        let (factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;

        fs::create_dir(path)?;
        let result = (|| -> Result<(), DtableError> {
            let mut meta = Vec::new();
            meta.extend_from_slice(&COLUMN_CTABLE_MAGIC.to_le_bytes());
            meta.extend_from_slice(&COLUMN_CTABLE_VERSION.to_le_bytes());
            meta.extend_from_slice(&(names.len() as u32).to_le_bytes());
            for name in &names {
                meta.extend_from_slice(&(name.len() as u32).to_le_bytes());
                meta.extend_from_slice(name.as_bytes());
            }
            let mut file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(path.join(META_NAME))?;
            file.write_all(&meta)?;
            file.sync_all()?;

            for index in 0..names.len() {
                factory.create_empty(ctx, &path.join(column_path(index)), &base_config, key_type)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                info!(path = %path.display(), columns = names.len(), "column ctable created");
                Ok(())
            }
            Err(error) => {
                let _ = fs::remove_dir_all(path);
                Err(error)
            }
        }
    }

    /// Opens the metadata and every column's sub-dtable.
    pub fn open(ctx: &TableContext, path: &Path, config: &Params) -> Result<Self, CtableError> {
        let meta = fs::read(path.join(META_NAME)).map_err(DtableError::from)?;
        if meta.len() < 12 {
            return Err(CtableError::InvalidArgument("metadata too short".into()));
        }
        let magic = u32::from_le_bytes(meta[0..4].try_into().unwrap_or([0; 4]));
        let version = u32::from_le_bytes(meta[4..8].try_into().unwrap_or([0; 4]));
        if magic != COLUMN_CTABLE_MAGIC || version != COLUMN_CTABLE_VERSION {
            return Err(CtableError::InvalidArgument(
                "metadata magic/version mismatch".into(),
            ));
        }
        let count = u32::from_le_bytes(meta[8..12].try_into().unwrap_or([0; 4])) as usize;
        let mut names = Vec::with_capacity(count);
        let mut offset = 12;
        for _ in 0..count {
            if offset + 4 > meta.len() {
                return Err(CtableError::InvalidArgument("name table truncated".into()));
            }
            let len =
                u32::from_le_bytes(meta[offset..offset + 4].try_into().unwrap_or([0; 4])) as usize;
            offset += 4;
            if offset + len > meta.len() {
                return Err(CtableError::InvalidArgument("name table truncated".into()));
            }
            let name = std::str::from_utf8(&meta[offset..offset + len])
                .map_err(|_| CtableError::InvalidArgument("column name not UTF-8".into()))?;
            offset += len;
            names.push(name.to_string());
        }

        let (factory, base_config) = dtable_entry(ctx, config, "base", "base_config")?;
        let mut columns = Vec::with_capacity(count);
        for index in 0..count {
            columns.push(factory.open(ctx, &path.join(column_path(index)), &base_config)?);
        }
        let key_type = columns
            .first()
            .map(|c| c.key_type())
            .ok_or_else(|| CtableError::InvalidArgument("no columns".into()))?;
        if columns.iter().any(|c| c.key_type() != key_type) {
            return Err(CtableError::InvalidArgument(
                "columns disagree on key type".into(),
            ));
        }
        debug!(path = %path.display(), columns = count, "column ctable opened");
        Ok(Self {
            columns,
            names,
            key_type,
        })
    }

    fn column_index(&self, column: &str) -> Result<usize, CtableError> {
        self.names
            .iter()
            .position(|name| name == column)
            .ok_or_else(|| CtableError::NoColumn(column.to_string()))
    }
}

impl Ctable for ColumnCtable {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn column_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn find(&self, key: &Dtype, column: &str) -> Result<Option<Blob>, CtableError> {
        let index = self.column_index(column)?;
        Ok(self.columns[index].get(key)?)
    }

    fn contains(&self, key: &Dtype) -> Result<bool, CtableError> {
        for column in &self.columns {
            if column.present(key)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn insert(&self, key: &Dtype, column: &str, value: Blob) -> Result<(), CtableError> {
        let index = self.column_index(column)?;
        Ok(self.columns[index].insert(key, value)?)
    }

    fn remove(&self, key: &Dtype, column: &str) -> Result<(), CtableError> {
        let index = self.column_index(column)?;
        Ok(self.columns[index].remove(key)?)
    }

    fn remove_row(&self, key: &Dtype) -> Result<(), CtableError> {
        // Every column in turn; the journal's commit discipline makes each
        // removal durable as it lands.
        for column in &self.columns {
            column.remove(key)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Box<dyn DtableIter>, CtableError> {
        // Keys come from the primary (first) column.
        Ok(Box::new(SkipIter::skip_nonexistent(
            self.columns[0].iterate()?,
        )))
    }

    fn iterate(&self) -> Result<Box<dyn CtableIter>, CtableError> {
        let mut subs = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            subs.push(column.iterate()?);
        }
        let mut iter = ColumnCtableIter {
            subs,
            names: self.names.clone(),
            row: None,
            cells: Vec::new(),
            col: 0,
        };
        iter.first();
        Ok(Box::new(iter))
    }

    fn maintain(&self, force: bool) -> Result<(), CtableError> {
        for column in &self.columns {
            column.maintain(force)?;
        }
        Ok(())
    }

    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), CtableError> {
        for column in &self.columns {
            column.set_blob_cmp(Arc::clone(&cmp))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ColumnCtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnCtable")
            .field("columns", &self.names)
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Lockstep cursor: the primary column drives row order; the other columns
/// are aligned to each row as it is visited.
struct ColumnCtableIter {
    subs: Vec<Box<dyn DtableIter>>,
    names: Vec<String>,
    row: Option<Dtype>,
    /// (column index, value) cells present in the current row.
    cells: Vec<(usize, Blob)>,
    col: usize,
}

impl ColumnCtableIter {
    /// Collects the present cells for the row at the primary cursor,
    /// aligning every other column.
    fn load_row(&mut self) {
        self.cells.clear();
        self.col = 0;
        self.row = None;
        let Some(row_key) = self.subs[0].key() else {
            return;
        };
        self.row = Some(row_key.clone());
        for (index, sub) in self.subs.iter_mut().enumerate() {
            let aligned = if index == 0 {
                true
            } else {
                sub.seek(&row_key)
            };
            if !aligned {
                continue;
            }
            if let Some(value) = sub.value() {
                if value.exists() {
                    self.cells.push((index, value));
                }
            }
        }
    }

    /// Advances the primary cursor to the next row with any present cell.
    fn advance_row(&mut self) -> bool {
        while self.subs[0].next() {
            if !self.primary_present() {
                continue;
            }
            self.load_row();
            if !self.cells.is_empty() {
                return true;
            }
        }
        self.cells.clear();
        self.row = None;
        false
    }

    fn retreat_row(&mut self) -> bool {
        while self.subs[0].prev() {
            if !self.primary_present() {
                continue;
            }
            self.load_row();
            if !self.cells.is_empty() {
                self.col = self.cells.len() - 1;
                return true;
            }
        }
        self.subs[0].first();
        self.load_row();
        false
    }

    /// Whether the primary column has a present value at its cursor (rows
    /// the primary lacks are skipped).
    fn primary_present(&self) -> bool {
        self.subs[0]
            .meta()
            .map(|meta| meta.exists)
            .unwrap_or(false)
    }
}

impl CtableIter for ColumnCtableIter {
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
        if !self.subs[0].first() {
            self.cells.clear();
            self.row = None;
            return false;
        }
        if self.primary_present() {
            self.load_row();
            if !self.cells.is_empty() {
                return true;
            }
        }
        self.advance_row()
    }

    fn last(&mut self) -> bool {
        if !self.subs[0].last() {
            self.cells.clear();
            self.row = None;
            return false;
        }
        if self.primary_present() {
            self.load_row();
            if !self.cells.is_empty() {
                self.col = self.cells.len() - 1;
                return true;
            }
        }
        self.retreat_row()
    }

    fn seek(&mut self, key: &Dtype) -> bool {
        let found = self.subs[0].seek(key);
        if self.subs[0].valid() {
            if self.primary_present() {
                self.load_row();
                if self.cells.is_empty() {
                    self.advance_row();
                    return false;
                }
            } else {
                self.advance_row();
                return false;
            }
        } else {
            self.cells.clear();
            self.row = None;
        }
        found && self.valid()
    }

    fn key(&self) -> Option<Dtype> {
        if !self.valid() {
            return None;
        }
        self.row.clone()
    }

    fn column(&self) -> Option<String> {
        let (index, _) = self.cells.get(self.col)?;
        self.names.get(*index).cloned()
    }

    fn value(&self) -> Option<Blob> {
        self.cells.get(self.col).map(|(_, value)| value.clone())
    }
}

// ------------------------------------------------------------------------------------------------
// Factory
// ------------------------------------------------------------------------------------------------

/// Factory for the `column_ctable` class. Config: `base`/`base_config`
/// shared by every column, `columns` int, and `column0_name`,
/// `column1_name`, …
pub struct ColumnCtableFactory;

impl CtableFactory for ColumnCtableFactory {
    fn class_name(&self) -> &'static str {
        "column_ctable"
    }

    fn create(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
        key_type: KeyType,
    ) -> Result<(), DtableError> {
        ColumnCtable::create(ctx, path, config, key_type)
    }

    fn open(
        &self,
        ctx: &TableContext,
        path: &Path,
        config: &Params,
    ) -> Result<Arc<dyn Ctable>, CtableError> {
        Ok(Arc::new(ColumnCtable::open(ctx, path, config)?))
    }
}
