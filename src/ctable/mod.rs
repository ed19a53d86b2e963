//! Column tables: a (key, column, value) model layered on dtables.
//!
//! Two shapes exist. [`simple::SimpleCtable`] packs a whole row's columns
//! into one blob stored in a single dtable — cheap rows, one read per row.
//! [`column::ColumnCtable`] keeps one dtable per column with synchronized
//! keys — cheap single-column scans, one table per column. Both speak the
//! same [`Ctable`] interface, and both are described by configuration trees
//! like any dtable stack.

pub mod column;
pub mod rowblob;
pub mod simple;

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::{
    dtable::{DtableError, DtableIter},
    value::{Blob, Dtype, KeyType},
};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by column-table operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CtableError {
    /// Failure in the underlying dtable stack.
    #[error("dtable error: {0}")]
    Dtable(#[from] DtableError),

    /// The named column is not declared by this table.
    #[error("no such column: {0:?}")]
    NoColumn(String),

    /// A packed row blob failed to parse.
    #[error("corrupt row: {0}")]
    CorruptRow(String),

    /// Malformed configuration or metadata.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ------------------------------------------------------------------------------------------------
// The ctable trait
// ------------------------------------------------------------------------------------------------

/// A keyed table of named columns.
pub trait Ctable: Send + Sync {
    /// The key type shared by every column.
    fn key_type(&self) -> KeyType;

    /// The declared column names, in declaration order, when the table has
    /// a fixed column set (empty for free-form named columns).
    fn column_names(&self) -> Vec<String>;

    /// Value of one column of one row; `None` when absent.
    fn find(&self, key: &Dtype, column: &str) -> Result<Option<Blob>, CtableError>;

    /// Whether the row exists at all.
    fn contains(&self, key: &Dtype) -> Result<bool, CtableError>;

    /// Sets one column of one row.
    fn insert(&self, key: &Dtype, column: &str, value: Blob) -> Result<(), CtableError>;

    /// Removes one column of one row (an all-absent row is collected).
    fn remove(&self, key: &Dtype, column: &str) -> Result<(), CtableError>;

    /// Removes a whole row.
    fn remove_row(&self, key: &Dtype) -> Result<(), CtableError>;

    /// Iterator over the row keys.
    fn keys(&self) -> Result<Box<dyn DtableIter>, CtableError>;

    /// Iterator over (key, column, value) cells in key order.
    fn iterate(&self) -> Result<Box<dyn CtableIter>, CtableError>;

    /// Passes maintenance down the stack.
    fn maintain(&self, force: bool) -> Result<(), CtableError>;

    /// Attaches a blob comparator to every underlying dtable.
    fn set_blob_cmp(
        &self,
        cmp: std::sync::Arc<dyn crate::value::BlobComparator>,
    ) -> Result<(), CtableError>;
}

// ------------------------------------------------------------------------------------------------
// The cell iterator trait
// ------------------------------------------------------------------------------------------------

/// Cursor over (key, column, value) cells, ordered by key then column.
pub trait CtableIter: Send {
    /// Whether the cursor is on a cell.
    fn valid(&self) -> bool;

    /// Advances to the next cell (crossing row boundaries).
    fn next(&mut self) -> bool;

    /// Skips the rest of the current row.
    fn next_row(&mut self) -> bool;

    /// Steps back one cell.
    fn prev(&mut self) -> bool;

    /// Moves to the first cell.
    fn first(&mut self) -> bool;

    /// Moves to the last cell.
    fn last(&mut self) -> bool;

    /// Positions at the first cell of `key`'s row (true when the row
    /// exists), else at the next greater row.
    fn seek(&mut self, key: &Dtype) -> bool;

    /// Row key at the cursor.
    fn key(&self) -> Option<Dtype>;

    /// Column name at the cursor.
    fn column(&self) -> Option<String>;

    /// Cell value at the cursor.
    fn value(&self) -> Option<Blob>;
}
