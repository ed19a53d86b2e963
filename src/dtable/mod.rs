//! The dtable abstraction and every implementation.
//!
//! A **dtable** is an ordered map from keys of one declared [`KeyType`] to
//! blob values, with stable forward/backward iteration and point lookup.
//! Implementations split into *leaves* that own storage —
//! [`memory::MemoryDtable`], [`simple::SimpleDtable`],
//! [`array::ArrayDtable`], [`fixed::FixedDtable`],
//! [`journal::JournalDtable`] — and *wrappers* that compose inner dtables —
//! [`overlay::OverlayDtable`], [`managed::ManagedDtable`],
//! [`smallint::SmallintDtable`], [`deltaint::DeltaintDtable`],
//! [`exception::ExceptionDtable`], [`exist::ExistDtable`],
//! [`keydiv::KeydivDtable`], [`btree::BtreeDtable`],
//! [`rwatx::RwatxDtable`].
//!
//! # Lookup contract
//!
//! `lookup` returns `Ok(None)` when a table has no entry for the key, and
//! `Ok(Some(blob))` when it has one — including `Some(Blob::dne())` for a
//! stored tombstone. Nonexistence is data: overlays use a higher layer's
//! tombstone to hide a lower layer's value. The `get` convenience folds
//! tombstones into `None` for callers that only care about live values.
//! Inserting a dne blob is equivalent to `remove`.
//!
//! # Iterator contract
//!
//! A [`DtableIter`] walks entries in key order, forward and backward.
//! Positions are the entries plus one after-the-end slot; `seek` lands on
//! the exact key (returning true) or the next greater key (returning
//! false), and `prev` from the end slot recovers the last entry. Iterators
//! hold reference-counted snapshots of their source state, so they stay
//! self-consistent across source mutations; two iterators over the same
//! immutable table always observe identical sequences.
//!
//! Create-time *reverse* iterators add [`DtableIter::reject`]: when a
//! transforming writer cannot encode a value it offers a replacement back to
//! the source, which may accept it into an exception side-table (see
//! [`exception`]) or refuse, aborting the create.
//!
//! # Abortable transactions
//!
//! Operations take an optional [`AtxId`]. Tables that support abortable
//! transactions implement `create_tx`/`check_tx`/`commit_tx`/`abort_tx` and
//! honor the id on reads and writes; the default implementations report
//! [`DtableError::Unsupported`].

pub mod array;
pub mod btree;
pub mod deltaint;
pub mod exception;
pub mod exist;
pub mod fixed;
pub mod iter;
pub mod journal;
pub mod keydiv;
pub mod managed;
pub mod memory;
pub mod overlay;
pub mod rwatx;
pub mod simple;
pub mod smallint;

#[cfg(test)]
mod tests;

use std::{
    cmp::Ordering,
    hash::{Hash, Hasher},
    io,
    sync::Arc,
};

use thiserror::Error;

use crate::{
    encoding::EncodingError,
    journal::JournalError,
    value::{Blob, BlobComparator, BlobMeta, CmpRef, Dtype, KeyType, ValueError},
};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by dtable operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DtableError {
    /// No entry for the requested key or index.
    #[error("not found")]
    NotFound,

    /// An object that must not exist already does.
    #[error("already exists: {0}")]
    Exists(String),

    /// Wrong key type, malformed configuration, or bad range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A required sub-object (factory, config entry, file) is missing.
    #[error("missing: {0}")]
    NoEntry(String),

    /// Temporarily unusable: required comparator not attached, or an
    /// abortable-transaction conflict.
    #[error("busy: {0}")]
    Busy(&'static str),

    /// The operation is not available in the chosen implementation.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Underlying file or transaction failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Configuration tree failure.
    #[error("config error: {0}")]
    Config(#[from] crate::params::ParamsError),

    /// System-journal failure.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    /// Key/value model failure.
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// A file failed validation.
    #[error("corrupt table: {0}")]
    Corrupt(String),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Abortable transaction ids
// ------------------------------------------------------------------------------------------------

/// Handle for an abortable transaction on one dtable.
pub type AtxId = u64;

// ------------------------------------------------------------------------------------------------
// The dtable trait
// ------------------------------------------------------------------------------------------------

/// The capability interface every dtable implements.
///
/// All methods take `&self`; mutable implementations synchronize internally
/// and are shared behind `Arc<dyn Dtable>`.
pub trait Dtable: Send + Sync {
    /// The single key type this table accepts.
    fn key_type(&self) -> KeyType;

    /// Name of the comparator this table was built with, if it sorts blob
    /// keys under a named ordering.
    fn cmp_name(&self) -> Option<String> {
        None
    }

    /// Attaches a named blob comparator. Only meaningful for blob-keyed
    /// tables; a mismatched name fails with `InvalidArgument`.
    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), DtableError> {
        let _ = cmp;
        Err(DtableError::Unsupported("comparators require blob keys"))
    }

    /// Point lookup: `None` = no entry, `Some(dne)` = tombstone,
    /// `Some(present)` = value.
    fn lookup_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<Option<Blob>, DtableError>;

    /// Whether the key maps to a present (non-tombstone) value.
    fn present_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<bool, DtableError> {
        Ok(self
            .lookup_atx(key, atx)?
            .map_or(false, |blob| blob.exists()))
    }

    /// An ordered iterator over the whole table.
    fn iterate_atx(&self, atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError>;

    /// Whether this table accepts `insert`/`remove`.
    fn writable(&self) -> bool {
        false
    }

    /// Inserts or replaces the entry for `key`. Inserting `Blob::dne()` is
    /// equivalent to `remove`. `append_hint` promises the key is greater
    /// than every key currently present.
    fn insert_atx(
        &self,
        key: &Dtype,
        value: Blob,
        append_hint: bool,
        atx: Option<AtxId>,
    ) -> Result<(), DtableError> {
        let (_, _, _, _) = (key, value, append_hint, atx);
        Err(DtableError::Unsupported("table is read-only"))
    }

    /// Removes the entry for `key` (writes a tombstone in layered tables).
    fn remove_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<(), DtableError> {
        self.insert_atx(key, Blob::dne(), false, atx)
    }

    /// Performs background maintenance (digest/combine for managed tables).
    fn maintain(&self, force: bool) -> Result<(), DtableError> {
        let _ = force;
        Ok(())
    }

    // --- indexed access (optional capability) ---

    /// Number of entries, for tables with stable indexed access.
    fn entry_count(&self) -> Result<usize, DtableError> {
        Err(DtableError::Unsupported("indexed access"))
    }

    /// Value of entry `index` (may be a tombstone blob).
    fn index_value(&self, index: usize) -> Result<Blob, DtableError> {
        let _ = index;
        Err(DtableError::Unsupported("indexed access"))
    }

    /// Whether entry `index` exists and is not a stored tombstone.
    fn contains_index(&self, index: usize) -> Result<bool, DtableError> {
        let _ = index;
        Err(DtableError::Unsupported("indexed access"))
    }

    // --- abortable transactions (optional capability) ---

    /// Opens an abortable transaction.
    fn create_tx(&self) -> Result<AtxId, DtableError> {
        Err(DtableError::Unsupported("abortable transactions"))
    }

    /// Reports whether the transaction can still commit.
    fn check_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        let _ = atx;
        Err(DtableError::Unsupported("abortable transactions"))
    }

    /// Atomically applies the transaction's writes.
    fn commit_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        let _ = atx;
        Err(DtableError::Unsupported("abortable transactions"))
    }

    /// Drops the transaction's writes and releases its state.
    fn abort_tx(&self, atx: AtxId) -> Result<(), DtableError> {
        let _ = atx;
        Err(DtableError::Unsupported("abortable transactions"))
    }

    // --- convenience (no-atx) forms ---

    /// [`Dtable::lookup_atx`] outside any transaction.
    fn lookup(&self, key: &Dtype) -> Result<Option<Blob>, DtableError> {
        self.lookup_atx(key, None)
    }

    /// Live value for `key`: tombstones and missing entries both fold to
    /// `None`.
    fn get(&self, key: &Dtype) -> Result<Option<Blob>, DtableError> {
        Ok(self.lookup_atx(key, None)?.filter(|blob| blob.exists()))
    }

    /// [`Dtable::present_atx`] outside any transaction.
    fn present(&self, key: &Dtype) -> Result<bool, DtableError> {
        self.present_atx(key, None)
    }

    /// [`Dtable::iterate_atx`] outside any transaction.
    fn iterate(&self) -> Result<Box<dyn DtableIter>, DtableError> {
        self.iterate_atx(None)
    }

    /// [`Dtable::insert_atx`] outside any transaction, no append hint.
    fn insert(&self, key: &Dtype, value: Blob) -> Result<(), DtableError> {
        self.insert_atx(key, value, false, None)
    }

    /// [`Dtable::remove_atx`] outside any transaction.
    fn remove(&self, key: &Dtype) -> Result<(), DtableError> {
        self.remove_atx(key, None)
    }
}

/// Checks a key against the table's declared type.
pub(crate) fn check_key_type(table: &dyn Dtable, key: &Dtype) -> Result<(), DtableError> {
    if table.key_type() != key.key_type() {
        return Err(DtableError::InvalidArgument(format!(
            "key type {} does not match table type {}",
            key.key_type().name(),
            table.key_type().name()
        )));
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// The iterator trait
// ------------------------------------------------------------------------------------------------

/// Ordered cursor over a dtable.
///
/// Valid positions are the entries in key order; one extra slot sits after
/// the last entry (`!valid()`). A fresh iterator starts at the first entry.
pub trait DtableIter: Send {
    /// Whether the cursor is on an entry.
    fn valid(&self) -> bool;

    /// Advances to the next entry; false at the end (cursor parks on the
    /// after-the-end slot).
    fn next(&mut self) -> bool;

    /// Steps back; from the after-the-end slot this recovers the last
    /// entry. False (without moving) at the first entry.
    fn prev(&mut self) -> bool;

    /// Moves to the first entry; false if the table is empty.
    fn first(&mut self) -> bool;

    /// Moves to the last entry; false if the table is empty.
    fn last(&mut self) -> bool;

    /// Positions at `key` if present (true), else at the next greater key
    /// or the end slot (false).
    fn seek(&mut self, key: &Dtype) -> bool;

    /// Positions at entry `index` for indexed sources.
    fn seek_index(&mut self, index: usize) -> Result<bool, DtableError> {
        let _ = index;
        Err(DtableError::Unsupported("indexed access"))
    }

    /// Index of the current entry for indexed sources.
    fn get_index(&self) -> Result<usize, DtableError> {
        Err(DtableError::Unsupported("indexed access"))
    }

    /// Key at the cursor; `None` when `!valid()`.
    fn key(&self) -> Option<Dtype>;

    /// (size, exists) of the value at the cursor without materializing it.
    fn meta(&self) -> Option<BlobMeta>;

    /// Value at the cursor (may be a tombstone blob); `None` when
    /// `!valid()`.
    fn value(&self) -> Option<Blob>;

    /// Create-time reject protocol: a transforming writer could not encode
    /// the current value and offers `replacement` instead. Returning true
    /// accepts the substitution (the source stores the real value
    /// elsewhere); the default refuses.
    fn reject(&mut self, replacement: &mut Blob) -> bool {
        let _ = replacement;
        false
    }

    /// The key type of the entries this iterator produces.
    fn iter_key_type(&self) -> KeyType;
}

impl<T: DtableIter + ?Sized> DtableIter for Box<T> {
    fn valid(&self) -> bool {
        (**self).valid()
    }
    fn next(&mut self) -> bool {
        (**self).next()
    }
    fn prev(&mut self) -> bool {
        (**self).prev()
    }
    fn first(&mut self) -> bool {
        (**self).first()
    }
    fn last(&mut self) -> bool {
        (**self).last()
    }
    fn seek(&mut self, key: &Dtype) -> bool {
        (**self).seek(key)
    }
    fn seek_index(&mut self, index: usize) -> Result<bool, DtableError> {
        (**self).seek_index(index)
    }
    fn get_index(&self) -> Result<usize, DtableError> {
        (**self).get_index()
    }
    fn key(&self) -> Option<Dtype> {
        (**self).key()
    }
    fn meta(&self) -> Option<BlobMeta> {
        (**self).meta()
    }
    fn value(&self) -> Option<Blob> {
        (**self).value()
    }
    fn reject(&mut self, replacement: &mut Blob) -> bool {
        (**self).reject(replacement)
    }
    fn iter_key_type(&self) -> KeyType {
        (**self).iter_key_type()
    }
}

// ------------------------------------------------------------------------------------------------
// Comparator-aware key wrappers
// ------------------------------------------------------------------------------------------------

/// Key wrapper giving [`Dtype`] a total order under an attached comparator,
/// for use in ordered collections. Every key in one collection must carry
/// the same comparator.
#[derive(Clone, Debug)]
pub(crate) struct KeyOrd {
    pub key: Dtype,
    pub cmp: CmpRef,
}

impl KeyOrd {
    pub(crate) fn new(key: Dtype, cmp: CmpRef) -> Self {
        Self { key, cmp }
    }
}

impl PartialEq for KeyOrd {
    fn eq(&self, other: &Self) -> bool {
        self.key.compare(&other.key, self.cmp.as_deref()) == Ordering::Equal
    }
}

impl Eq for KeyOrd {}

impl PartialOrd for KeyOrd {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(Ord::cmp(self, other))
    }
}

impl Ord for KeyOrd {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.compare(&other.key, self.cmp.as_deref())
    }
}

/// Key wrapper giving [`Dtype`] comparator-consistent equality and hashing,
/// for use in hashed collections.
#[derive(Clone, Debug)]
pub(crate) struct KeyHash {
    pub key: Dtype,
    pub cmp: CmpRef,
}

impl KeyHash {
    pub(crate) fn new(key: Dtype, cmp: CmpRef) -> Self {
        Self { key, cmp }
    }
}

impl PartialEq for KeyHash {
    fn eq(&self, other: &Self) -> bool {
        self.key.compare(&other.key, self.cmp.as_deref()) == Ordering::Equal
    }
}

impl Eq for KeyHash {}

impl Hash for KeyHash {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.key.hash_value(self.cmp.as_deref()));
    }
}

// ------------------------------------------------------------------------------------------------
// Create-time helpers
// ------------------------------------------------------------------------------------------------

/// Validates that a create-time source iterator and shadow agree on key
/// type.
pub(crate) fn source_shadow_ok(
    source: &dyn DtableIter,
    shadow: Option<&dyn Dtable>,
) -> Result<(), DtableError> {
    if let Some(shadow) = shadow {
        if shadow.key_type() != source.iter_key_type() {
            return Err(DtableError::InvalidArgument(
                "shadow key type does not match source".into(),
            ));
        }
    }
    Ok(())
}

/// Whether a tombstone for `key` must be written: true iff the shadow
/// (the stack of older layers) still has an entry the tombstone needs to
/// hide.
pub(crate) fn shadow_needs_tombstone(
    shadow: Option<&dyn Dtable>,
    key: &Dtype,
) -> Result<bool, DtableError> {
    match shadow {
        Some(shadow) => Ok(shadow.lookup(key)?.is_some()),
        None => Ok(false),
    }
}
