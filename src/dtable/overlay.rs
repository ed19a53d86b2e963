//! Merge view of a stack of dtables.
//!
//! Layer 0 is the highest; higher layers shadow lower ones. A lookup probes
//! layers top-down and stops at the first *existence decision* — a present
//! value or a tombstone both end the search, which is exactly what lets a
//! removal in the write-front hide an older on-disk value.
//!
//! Iteration is a k-way merge: each layer contributes its next key, the
//! minimum is emitted, and ties resolve to the highest layer. Tombstones
//! are surfaced (the managed table's digest and combine need them); callers
//! presenting external iteration wrap the result in
//! [`crate::dtable::iter::SkipIter`] to hide them.

use std::{cmp::Ordering, sync::Arc};

use crate::{
    dtable::{AtxId, Dtable, DtableError, DtableIter, check_key_type},
    value::{Blob, BlobComparator, BlobMeta, CmpRef, Dtype, KeyType},
};
use std::sync::RwLock;

/// Layered merge dtable.
pub struct OverlayDtable {
    layers: Vec<Arc<dyn Dtable>>,
    key_type: KeyType,
    cmp: RwLock<CmpRef>,
}

impl OverlayDtable {
    /// Builds an overlay; `layers[0]` is the highest (winning) layer. All
    /// layers must share a key type.
    pub fn new(layers: Vec<Arc<dyn Dtable>>) -> Result<Self, DtableError> {
        let Some(first) = layers.first() else {
            return Err(DtableError::InvalidArgument("overlay needs layers".into()));
        };
        let key_type = first.key_type();
        if layers.iter().any(|layer| layer.key_type() != key_type) {
            return Err(DtableError::InvalidArgument(
                "overlay layers disagree on key type".into(),
            ));
        }
        Ok(Self {
            layers,
            key_type,
            cmp: RwLock::new(None),
        })
    }

    fn current_cmp(&self) -> CmpRef {
        self.cmp.read().ok().and_then(|guard| guard.clone())
    }

    /// The layer stack, highest first.
    pub fn layers(&self) -> &[Arc<dyn Dtable>] {
        &self.layers
    }
}

impl Dtable for OverlayDtable {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn cmp_name(&self) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.cmp_name())
    }

    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), DtableError> {
        if self.key_type != KeyType::Blob {
            return Err(DtableError::Unsupported("comparators require blob keys"));
        }
        for layer in &self.layers {
            layer.set_blob_cmp(Arc::clone(&cmp))?;
        }
        *self
            .cmp
            .write()
            .map_err(|_| DtableError::Internal("comparator lock poisoned".into()))? = Some(cmp);
        Ok(())
    }

    fn lookup_atx(&self, key: &Dtype, atx: Option<AtxId>) -> Result<Option<Blob>, DtableError> {
        check_key_type(self, key)?;
        for layer in &self.layers {
            if let Some(blob) = layer.lookup_atx(key, atx)? {
                return Ok(Some(blob));
            }
        }
        Ok(None)
    }

    fn iterate_atx(&self, atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError> {
        let mut subs = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            subs.push(layer.iterate_atx(atx)?);
        }
        let mut iter = OverlayIter {
            subs: subs.into_iter().map(Sub::new).collect(),
            key_type: self.key_type,
            cmp: self.current_cmp(),
            direction: Direction::Forward,
            current: None,
        };
        iter.first();
        Ok(Box::new(iter))
    }

    fn maintain(&self, force: bool) -> Result<(), DtableError> {
        for layer in &self.layers {
            layer.maintain(force)?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Merge iterator
// ------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Direction {
    Forward,
    Backward,
}

struct Sub {
    iter: Box<dyn DtableIter>,
    /// Exhausted walking backward: logically before the first entry, with
    /// the cursor physically parked at the first entry.
    before_begin: bool,
}

impl Sub {
    fn new(iter: Box<dyn DtableIter>) -> Self {
        Self {
            iter,
            before_begin: false,
        }
    }

    fn usable(&self) -> bool {
        !self.before_begin && self.iter.valid()
    }
}

/// K-way merge with highest-layer (lowest index) tie wins.
struct OverlayIter {
    subs: Vec<Sub>,
    key_type: KeyType,
    cmp: CmpRef,
    direction: Direction,
    current: Option<usize>,
}

impl OverlayIter {
    fn compare(&self, a: &Dtype, b: &Dtype) -> Ordering {
        a.compare(b, self.cmp.as_deref())
    }

    /// Picks the minimum key among usable subs; ties go to the smallest
    /// (highest) layer index.
    fn find_smallest(&mut self) {
        let mut best: Option<(usize, Dtype)> = None;
        for (index, sub) in self.subs.iter().enumerate() {
            if !sub.usable() {
                continue;
            }
            let Some(key) = sub.iter.key() else { continue };
            match &best {
                None => best = Some((index, key)),
                Some((_, best_key)) => {
                    if self.compare(&key, best_key) == Ordering::Less {
                        best = Some((index, key));
                    }
                }
            }
        }
        self.current = best.map(|(index, _)| index);
    }

    /// Picks the maximum key among usable subs; ties go to the smallest
    /// index.
    fn find_largest(&mut self) {
        let mut best: Option<(usize, Dtype)> = None;
        for (index, sub) in self.subs.iter().enumerate() {
            if !sub.usable() {
                continue;
            }
            let Some(key) = sub.iter.key() else { continue };
            match &best {
                None => best = Some((index, key)),
                Some((_, best_key)) => {
                    if self.compare(&key, best_key) == Ordering::Greater {
                        best = Some((index, key));
                    }
                }
            }
        }
        self.current = best.map(|(index, _)| index);
    }

    fn current_key(&self) -> Option<Dtype> {
        let index = self.current?;
        self.subs[index].iter.key()
    }

    /// Re-establishes the forward invariant (every sub positioned past
    /// `pivot`) after backward movement.
    fn turn_forward(&mut self, pivot: &Dtype) {
        for (index, sub) in self.subs.iter_mut().enumerate() {
            if Some(index) == self.current {
                continue;
            }
            sub.before_begin = false;
            let found = sub.iter.seek(pivot);
            if found {
                sub.iter.next();
            }
        }
        self.direction = Direction::Forward;
    }

    /// Re-establishes the backward invariant (every sub positioned at or
    /// before `pivot`, or flagged before-begin) after forward movement.
    fn turn_backward(&mut self, pivot: &Dtype) {
        let cmp = self.cmp.clone();
        for (index, sub) in self.subs.iter_mut().enumerate() {
            if Some(index) == self.current {
                continue;
            }
            sub.before_begin = false;
            sub.iter.seek(pivot);
            // seek() parks at the first key ≥ pivot (or the end); one step
            // back lands at the last key < pivot.
            if !sub.iter.valid() {
                if !sub.iter.last() {
                    sub.before_begin = true;
                }
                continue;
            }
            let at_or_past = sub
                .iter
                .key()
                .map(|key| key.compare(pivot, cmp.as_deref()) != Ordering::Less)
                .unwrap_or(false);
            if at_or_past && !sub.iter.prev() {
                sub.before_begin = true;
            }
        }
        self.direction = Direction::Backward;
    }
}

impl DtableIter for OverlayIter {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn next(&mut self) -> bool {
        let Some(key) = self.current_key() else {
            return false;
        };
        if self.direction == Direction::Backward {
            self.turn_forward(&key);
        }
        // Advance every sub sitting on the emitted key (the winner and any
        // shadowed duplicates).
        let cmp = self.cmp.clone();
        for sub in &mut self.subs {
            if !sub.usable() {
                continue;
            }
            if let Some(sub_key) = sub.iter.key() {
                if sub_key.compare(&key, cmp.as_deref()) == Ordering::Equal {
                    sub.iter.next();
                }
            }
        }
        self.find_smallest();
        self.current.is_some()
    }

    fn prev(&mut self) -> bool {
        let Some(key) = self.current_key() else {
            // After the end: recover the last entry.
            return self.last();
        };
        if self.direction == Direction::Forward {
            self.turn_backward(&key);
        }
        // Step every sub sitting on the current key backward.
        let cmp = self.cmp.clone();
        for sub in &mut self.subs {
            if sub.before_begin || !sub.iter.valid() {
                continue;
            }
            let Some(sub_key) = sub.iter.key() else { continue };
            if sub_key.compare(&key, cmp.as_deref()) == Ordering::Equal {
                if !sub.iter.prev() {
                    sub.before_begin = true;
                }
            }
        }
        self.find_largest();
        if self.current.is_none() {
            // Already at the first merged entry: restore forward state on
            // it so the cursor does not sit before the beginning.
            for sub in &mut self.subs {
                sub.before_begin = false;
                sub.iter.first();
            }
            self.direction = Direction::Forward;
            self.find_smallest();
            return false;
        }
        true
    }

    fn first(&mut self) -> bool {
        for sub in &mut self.subs {
            sub.before_begin = false;
            sub.iter.first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
        self.current.is_some()
    }

    fn last(&mut self) -> bool {
        for sub in &mut self.subs {
            sub.before_begin = false;
            if !sub.iter.last() {
                sub.before_begin = true;
            }
        }
        self.direction = Direction::Backward;
        self.find_largest();
        self.current.is_some()
    }

    fn seek(&mut self, key: &Dtype) -> bool {
        let mut found = false;
        for sub in &mut self.subs {
            sub.before_begin = false;
            found |= sub.iter.seek(key);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
        found
    }

    fn key(&self) -> Option<Dtype> {
        self.current_key()
    }

    fn meta(&self) -> Option<BlobMeta> {
        let index = self.current?;
        self.subs[index].iter.meta()
    }

    fn value(&self) -> Option<Blob> {
        let index = self.current?;
        self.subs[index].iter.value()
    }

    fn iter_key_type(&self) -> KeyType {
        self.key_type
    }
}
