//! Dense fixed-size-value dtable over contiguous u32 keys.
//!
//! Stores one slot per key in `[min_key, min_key + slots)`, each a tag byte
//! plus exactly `value_size` value bytes. No per-entry lengths, no key
//! index: a lookup is pure arithmetic. Keys the source never mentioned are
//! *holes* — not entries at all — while stored tombstones keep their
//! shadowing power. Best for key spaces that are nearly contiguous; every
//! hole still costs a slot.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use memmap2::Mmap;
use tracing::debug;

use crate::{
    dtable::{
        AtxId, Dtable, DtableError, DtableIter, check_key_type, shadow_needs_tombstone,
        source_shadow_ok,
    },
    encoding::{Decode, Encode},
    value::{Blob, BlobMeta, Dtype, KeyType},
};

const ARRAY_MAGIC: u32 = 0x5A7E_C11A;
const ARRAY_VERSION: u32 = 1;

const TAG_HOLE: u8 = 0;
const TAG_DNE: u8 = 1;
const TAG_PRESENT: u8 = 2;

struct ArrayHeader {
    magic: u32,
    version: u32,
    min_key: u32,
    slots: u32,
    value_size: u32,
}

impl Encode for ArrayHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), crate::encoding::EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.slots.encode_to(buf)?;
        self.value_size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for ArrayHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), crate::encoding::EncodingError> {
        let mut offset = 0;
        let (magic, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (min_key, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (slots, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (value_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                magic,
                version,
                min_key,
                slots,
                value_size,
            },
            offset,
        ))
    }
}

/// Dense u32-keyed dtable with fixed-size values.
pub struct ArrayDtable {
    inner: Arc<ArrayInner>,
}

struct ArrayInner {
    map: Mmap,
    min_key: u32,
    slots: usize,
    value_size: usize,
    data_start: usize,
    path: PathBuf,
}

impl ArrayInner {
    fn slot(&self, index: usize) -> (u8, &[u8]) {
        let base = self.data_start + index * (1 + self.value_size);
        (
            self.map[base],
            &self.map[base + 1..base + 1 + self.value_size],
        )
    }

    fn value_at(&self, index: usize) -> Blob {
        match self.slot(index) {
            (TAG_PRESENT, bytes) => Blob::from(bytes),
            _ => Blob::dne(),
        }
    }
}

impl ArrayDtable {
    /// Writes a dense array file from `source`.
    ///
    /// Values must all be exactly the same size; a mismatch goes through
    /// the source's reject hook, and an unaccepted reject aborts with
    /// `Unsupported`. `value_size` pins the slot width; when absent it is
    /// taken from the first present value.
    pub fn create(
        path: &Path,
        source: &mut dyn DtableIter,
        shadow: Option<&dyn Dtable>,
        value_size: Option<usize>,
    ) -> Result<(), DtableError> {
        source_shadow_ok(source, shadow)?;
        if source.iter_key_type() != KeyType::U32 {
            return Err(DtableError::InvalidArgument(
                "array dtable requires u32 keys".into(),
            ));
        }

        // (key, tombstone?, bytes)
        let mut entries: Vec<(u32, Option<Vec<u8>>)> = Vec::new();
        let mut width = value_size;

        source.first();
        while source.valid() {
            let (Some(key), Some(value)) = (source.key(), source.value()) else {
                break;
            };
            let Dtype::U32(key) = key else {
                return Err(DtableError::InvalidArgument(
                    "source produced non-u32 key".into(),
                ));
            };
            let mut value = value;
            if value.exists() {
                if width.is_none() {
                    width = Some(value.size());
                }
                if Some(value.size()) != width {
                    let mut replacement = Blob::dne();
                    if !source.reject(&mut replacement)
                        || (replacement.exists() && Some(replacement.size()) != width)
                    {
                        return Err(DtableError::Unsupported(
                            "value size not representable in array dtable",
                        ));
                    }
                    value = replacement;
                }
            }
            if value.exists() {
                entries.push((key, Some(value.bytes().to_vec())));
            } else if shadow_needs_tombstone(shadow, &Dtype::U32(key))? {
                entries.push((key, None));
            }
            source.next();
        }

        let value_size = width.unwrap_or(0);
        let (min_key, slots) = match (entries.first(), entries.last()) {
            (Some((first, _)), Some((last, _))) => (*first, (last - first + 1) as usize),
            _ => (0, 0),
        };

        let header = ArrayHeader {
            magic: ARRAY_MAGIC,
            version: ARRAY_VERSION,
            min_key,
            slots: slots as u32,
            value_size: value_size as u32,
        };
        let mut bytes = crate::encoding::encode_to_vec(&header)?;
        let data_start = bytes.len();
        bytes.resize(data_start + slots * (1 + value_size), 0);
        for (key, value) in &entries {
            let base = data_start + (key - min_key) as usize * (1 + value_size);
            match value {
                Some(data) => {
                    bytes[base] = TAG_PRESENT;
                    bytes[base + 1..base + 1 + value_size].copy_from_slice(data);
                }
                None => bytes[base] = TAG_DNE,
            }
        }

        let tmp = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;

        debug!(path = %path.display(), slots, value_size, "array file written");
        Ok(())
    }

    /// Opens an existing array file.
    pub fn open(path: &Path) -> Result<Self, DtableError> {
        let file = File::open(path)?;
        // Never modified after the create-time rename.
        let map = unsafe { Mmap::map(&file)? };
        let (header, data_start) = ArrayHeader::decode_from(&map)?;
        if header.magic != ARRAY_MAGIC || header.version != ARRAY_VERSION {
            return Err(DtableError::Corrupt(format!(
                "bad magic/version in {}",
                path.display()
            )));
        }
        let slots = header.slots as usize;
        let value_size = header.value_size as usize;
        if map.len() < data_start + slots * (1 + value_size) {
            return Err(DtableError::Corrupt(format!(
                "truncated array file {}",
                path.display()
            )));
        }
        Ok(Self {
            inner: Arc::new(ArrayInner {
                map,
                min_key: header.min_key,
                slots,
                value_size,
                data_start,
                path: path.to_path_buf(),
            }),
        })
    }
}

impl Dtable for ArrayDtable {
    fn key_type(&self) -> KeyType {
        KeyType::U32
    }

    fn lookup_atx(&self, key: &Dtype, _atx: Option<AtxId>) -> Result<Option<Blob>, DtableError> {
        check_key_type(self, key)?;
        let Dtype::U32(key) = key else {
            return Err(DtableError::InvalidArgument("non-u32 key".into()));
        };
        if *key < self.inner.min_key {
            return Ok(None);
        }
        let index = (*key - self.inner.min_key) as usize;
        if index >= self.inner.slots {
            return Ok(None);
        }
        match self.inner.slot(index) {
            (TAG_HOLE, _) => Ok(None),
            (TAG_DNE, _) => Ok(Some(Blob::dne())),
            (_, bytes) => Ok(Some(Blob::from(bytes))),
        }
    }

    fn iterate_atx(&self, _atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError> {
        let mut iter = ArrayIter {
            inner: Arc::clone(&self.inner),
            pos: 0,
        };
        iter.settle_forward();
        Ok(Box::new(iter))
    }

    fn entry_count(&self) -> Result<usize, DtableError> {
        Ok(self.inner.slots)
    }

    fn index_value(&self, index: usize) -> Result<Blob, DtableError> {
        if index >= self.inner.slots {
            return Err(DtableError::NotFound);
        }
        Ok(self.inner.value_at(index))
    }

    fn contains_index(&self, index: usize) -> Result<bool, DtableError> {
        if index >= self.inner.slots {
            return Err(DtableError::NotFound);
        }
        Ok(self.inner.slot(index).0 == TAG_PRESENT)
    }
}

impl std::fmt::Debug for ArrayDtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayDtable")
            .field("path", &self.inner.path)
            .field("slots", &self.inner.slots)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Walks slots in key order, treating holes as nonexistent positions.
struct ArrayIter {
    inner: Arc<ArrayInner>,
    pos: usize,
}

impl ArrayIter {
    fn is_hole(&self, index: usize) -> bool {
        self.inner.slot(index).0 == TAG_HOLE
    }

    fn settle_forward(&mut self) -> bool {
        while self.pos < self.inner.slots && self.is_hole(self.pos) {
            self.pos += 1;
        }
        self.pos < self.inner.slots
    }

    fn settle_backward(&mut self) -> bool {
        loop {
            if self.pos < self.inner.slots && !self.is_hole(self.pos) {
                return true;
            }
            if self.pos == 0 {
                self.settle_forward();
                return false;
            }
            self.pos -= 1;
        }
    }
}

impl DtableIter for ArrayIter {
    fn valid(&self) -> bool {
        self.pos < self.inner.slots && !self.is_hole(self.pos)
    }

    fn next(&mut self) -> bool {
        if self.pos >= self.inner.slots {
            return false;
        }
        self.pos += 1;
        self.settle_forward()
    }

    fn prev(&mut self) -> bool {
        if self.pos == 0 {
            return false;
        }
        self.pos -= 1;
        self.settle_backward()
    }

    fn first(&mut self) -> bool {
        self.pos = 0;
        self.settle_forward()
    }

    fn last(&mut self) -> bool {
        if self.inner.slots == 0 {
            self.pos = 0;
            return false;
        }
        self.pos = self.inner.slots - 1;
        self.settle_backward()
    }

    fn seek(&mut self, key: &Dtype) -> bool {
        let Dtype::U32(key) = key else {
            return false;
        };
        if *key < self.inner.min_key {
            self.pos = 0;
            self.settle_forward();
            return false;
        }
        let index = (*key - self.inner.min_key) as usize;
        if index >= self.inner.slots {
            self.pos = self.inner.slots;
            return false;
        }
        self.pos = index;
        if self.is_hole(index) {
            self.settle_forward();
            return false;
        }
        true
    }

    fn seek_index(&mut self, index: usize) -> Result<bool, DtableError> {
        self.pos = index.min(self.inner.slots);
        Ok(index < self.inner.slots && !self.is_hole(index))
    }

    fn get_index(&self) -> Result<usize, DtableError> {
        Ok(self.pos)
    }

    fn key(&self) -> Option<Dtype> {
        self.valid()
            .then(|| Dtype::U32(self.inner.min_key + self.pos as u32))
    }

    fn meta(&self) -> Option<BlobMeta> {
        if !self.valid() {
            return None;
        }
        Some(match self.inner.slot(self.pos).0 {
            TAG_PRESENT => BlobMeta::present(self.inner.value_size),
            _ => BlobMeta::nonexistent(),
        })
    }

    fn value(&self) -> Option<Blob> {
        self.valid().then(|| self.inner.value_at(self.pos))
    }

    fn iter_key_type(&self) -> KeyType {
        KeyType::U32
    }
}

// ------------------------------------------------------------------------------------------------
// Factory
// ------------------------------------------------------------------------------------------------

/// Factory for the `array_dtable` class. Config: optional `value_size` int
/// pinning the slot width.
pub struct ArrayDtableFactory;

impl crate::factory::DtableFactory for ArrayDtableFactory {
    fn class_name(&self) -> &'static str {
        "array_dtable"
    }

    fn indexed_access(&self, _ctx: &crate::factory::TableContext, _config: &crate::params::Params) -> bool {
        true
    }

    fn create(
        &self,
        _ctx: &crate::factory::TableContext,
        path: &Path,
        config: &crate::params::Params,
        source: &mut dyn DtableIter,
        shadow: Option<&dyn Dtable>,
        _cmp: crate::value::CmpRef,
    ) -> Result<(), DtableError> {
        let value_size = config.int("value_size", 0)?;
        let value_size = (value_size > 0).then_some(value_size as usize);
        ArrayDtable::create(path, source, shadow, value_size)
    }

    fn open(
        &self,
        _ctx: &crate::factory::TableContext,
        path: &Path,
        _config: &crate::params::Params,
    ) -> Result<Arc<dyn Dtable>, DtableError> {
        Ok(Arc::new(ArrayDtable::open(path)?))
    }
}
