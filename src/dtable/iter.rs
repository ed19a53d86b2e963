//! Iterator building blocks shared by dtable implementations.
//!
//! [`SnapshotIter`] walks a frozen, sorted entry list (the in-memory tables
//! hand their iterators a snapshot, which is what keeps them valid across
//! source mutations). [`SkipIter`] filters entries by existence, both for
//! external iteration that hides tombstones and for create-time source
//! splitting. [`CachingIter`] memoizes the current position's key and value
//! so repeated reads don't re-decode.

use std::{cell::RefCell, sync::Arc};

use crate::{
    dtable::{DtableError, DtableIter},
    value::{Blob, BlobMeta, CmpRef, Dtype, KeyType},
};

// ------------------------------------------------------------------------------------------------
// SnapshotIter
// ------------------------------------------------------------------------------------------------

/// Iterator over a frozen, key-ordered entry list.
///
/// Entries must already be sorted under `cmp`. Position `len` is the
/// after-the-end slot.
pub struct SnapshotIter {
    entries: Arc<Vec<(Dtype, Blob)>>,
    pos: usize,
    key_type: KeyType,
    cmp: CmpRef,
}

impl SnapshotIter {
    /// A cursor over `entries`, initially at the first entry.
    pub fn new(entries: Arc<Vec<(Dtype, Blob)>>, key_type: KeyType, cmp: CmpRef) -> Self {
        Self {
            entries,
            pos: 0,
            key_type,
            cmp,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Binary search under the snapshot's comparator.
    fn search(&self, key: &Dtype) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|(probe, _)| probe.compare(key, self.cmp.as_deref()))
    }
}

impl DtableIter for SnapshotIter {
    fn valid(&self) -> bool {
        self.pos < self.len()
    }

    fn next(&mut self) -> bool {
        if self.pos >= self.len() {
            return false;
        }
        self.pos += 1;
        self.pos < self.len()
    }

    fn prev(&mut self) -> bool {
        if self.pos == 0 {
            return false;
        }
        self.pos -= 1;
        true
    }

    fn first(&mut self) -> bool {
        self.pos = 0;
        !self.entries.is_empty()
    }

    fn last(&mut self) -> bool {
        if self.entries.is_empty() {
            self.pos = 0;
            return false;
        }
        self.pos = self.len() - 1;
        true
    }

    fn seek(&mut self, key: &Dtype) -> bool {
        match self.search(key) {
            Ok(index) => {
                self.pos = index;
                true
            }
            Err(insertion) => {
                self.pos = insertion;
                false
            }
        }
    }

    fn key(&self) -> Option<Dtype> {
        self.entries.get(self.pos).map(|(key, _)| key.clone())
    }

    fn meta(&self) -> Option<BlobMeta> {
        self.entries.get(self.pos).map(|(_, value)| value.meta())
    }

    fn value(&self) -> Option<Blob> {
        self.entries.get(self.pos).map(|(_, value)| value.clone())
    }

    fn iter_key_type(&self) -> KeyType {
        self.key_type
    }
}

// ------------------------------------------------------------------------------------------------
// SkipIter
// ------------------------------------------------------------------------------------------------

/// Existence filter over another iterator.
///
/// In `skip_nonexistent` mode, tombstone entries are invisible (external
/// iteration). In `skip_present` mode, only tombstones show through
/// (create-time splitting of a source into present and dne partitions).
pub struct SkipIter<'a> {
    base: Box<dyn DtableIter + 'a>,
    skip_present: bool,
}

impl<'a> SkipIter<'a> {
    /// Hides tombstones.
    pub fn skip_nonexistent(base: impl DtableIter + 'a) -> Self {
        let mut iter = Self {
            base: Box::new(base),
            skip_present: false,
        };
        iter.settle_forward();
        iter
    }

    /// Hides present entries, showing only tombstones.
    pub fn skip_present(base: impl DtableIter + 'a) -> Self {
        let mut iter = Self {
            base: Box::new(base),
            skip_present: true,
        };
        iter.settle_forward();
        iter
    }

    fn skipped(&self) -> bool {
        match self.base.meta() {
            Some(meta) => meta.exists == self.skip_present,
            None => false,
        }
    }

    /// Moves forward to the nearest kept entry (or the end).
    fn settle_forward(&mut self) -> bool {
        while self.base.valid() && self.skipped() {
            self.base.next();
        }
        self.base.valid()
    }

    /// Moves backward to the nearest kept entry; if none exists before the
    /// cursor, restores the first kept position and reports false.
    fn settle_backward(&mut self) -> bool {
        loop {
            if !self.skipped() && self.base.valid() {
                return true;
            }
            if !self.base.prev() {
                // Ran off the front while skipping: recover to the first
                // kept entry so the cursor never sits before the beginning.
                self.settle_forward();
                return false;
            }
        }
    }
}

impl DtableIter for SkipIter<'_> {
    fn valid(&self) -> bool {
        self.base.valid() && !self.skipped()
    }

    fn next(&mut self) -> bool {
        if !self.base.next() {
            return false;
        }
        self.settle_forward()
    }

    fn prev(&mut self) -> bool {
        if !self.base.prev() {
            // The base recovered its raw first entry, which may itself be
            // filtered; park on the first kept one.
            self.settle_forward();
            return false;
        }
        self.settle_backward()
    }

    fn first(&mut self) -> bool {
        if !self.base.first() {
            return false;
        }
        self.settle_forward()
    }

    fn last(&mut self) -> bool {
        if !self.base.last() {
            return false;
        }
        self.settle_backward()
    }

    fn seek(&mut self, key: &Dtype) -> bool {
        let found = self.base.seek(key);
        if found && self.skipped() {
            // The exact key is filtered out here: advance past it and
            // report not-found.
            self.base.next();
            self.settle_forward();
            return false;
        }
        if !found {
            self.settle_forward();
        }
        found
    }

    fn key(&self) -> Option<Dtype> {
        if self.valid() { self.base.key() } else { None }
    }

    fn meta(&self) -> Option<BlobMeta> {
        if self.valid() { self.base.meta() } else { None }
    }

    fn value(&self) -> Option<Blob> {
        if self.valid() { self.base.value() } else { None }
    }

    fn reject(&mut self, replacement: &mut Blob) -> bool {
        self.base.reject(replacement)
    }

    fn iter_key_type(&self) -> KeyType {
        self.base.iter_key_type()
    }
}

// ------------------------------------------------------------------------------------------------
// CachingIter
// ------------------------------------------------------------------------------------------------

/// Memoizes the current position's key and value.
///
/// Useful above iterators whose `key()`/`value()` re-decode on every call
/// (file-backed tables, transforming wrappers) when a caller reads the same
/// position repeatedly.
pub struct CachingIter {
    base: Box<dyn DtableIter>,
    key: RefCell<Option<Option<Dtype>>>,
    value: RefCell<Option<Option<Blob>>>,
}

impl CachingIter {
    /// Wraps `base` with a one-position cache.
    pub fn new(base: Box<dyn DtableIter>) -> Self {
        Self {
            base,
            key: RefCell::new(None),
            value: RefCell::new(None),
        }
    }

    fn invalidate(&mut self) {
        *self.key.borrow_mut() = None;
        *self.value.borrow_mut() = None;
    }
}

impl DtableIter for CachingIter {
    fn valid(&self) -> bool {
        self.base.valid()
    }

    fn next(&mut self) -> bool {
        self.invalidate();
        self.base.next()
    }

    fn prev(&mut self) -> bool {
        self.invalidate();
        self.base.prev()
    }

    fn first(&mut self) -> bool {
        self.invalidate();
        self.base.first()
    }

    fn last(&mut self) -> bool {
        self.invalidate();
        self.base.last()
    }

    fn seek(&mut self, key: &Dtype) -> bool {
        self.invalidate();
        self.base.seek(key)
    }

    fn seek_index(&mut self, index: usize) -> Result<bool, DtableError> {
        self.invalidate();
        self.base.seek_index(index)
    }

    fn get_index(&self) -> Result<usize, DtableError> {
        self.base.get_index()
    }

    fn key(&self) -> Option<Dtype> {
        let mut cached = self.key.borrow_mut();
        if cached.is_none() {
            *cached = Some(self.base.key());
        }
        cached.clone().unwrap_or(None)
    }

    fn meta(&self) -> Option<BlobMeta> {
        self.base.meta()
    }

    fn value(&self) -> Option<Blob> {
        let mut cached = self.value.borrow_mut();
        if cached.is_none() {
            *cached = Some(self.base.value());
        }
        cached.clone().unwrap_or(None)
    }

    fn iter_key_type(&self) -> KeyType {
        self.base.iter_key_type()
    }
}
