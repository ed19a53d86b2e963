//! Immutable sorted-file dtable.
//!
//! The workhorse on-disk table: a self-contained read-only file holding a
//! binary-searchable key index, a value region, and (for string/blob keys)
//! an aux table carrying the variable-length key bytes. Produced in one shot
//! from a source iterator over a consistent snapshot, then never modified.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER]            magic, version, key_type, cmp_name, count,
//!                     value_size, aux_count, aux_size
//! [KEY INDEX]         count × { key_field u64, value_offset u32, value_len u32 }
//! [VALUE REGION]      concatenated value bytes
//! [AUX DIRECTORY]     aux_count × { offset u32, len u32 }
//! [AUX BYTES]         concatenated key bytes for string/blob keys
//! ```
//!
//! `key_field` holds the u32 key (zero-extended), the f64 bit pattern, or
//! the aux-directory index for string/blob keys. A `value_len` of
//! `u32::MAX` marks a stored tombstone; [`Dtable::contains_index`]
//! distinguishes those from live entries. Managed tables keep tombstones in
//! upper layers and drop them in the final combine, driven by the `shadow`
//! argument to [`SimpleDtable::create`].
//!
//! The file is written to a temporary path, synced, then renamed into
//! place, so a crash never leaves a half-written table where a reader will
//! look. Reads go through a shared memory map; iterators clone the map
//! handle, which keeps them valid for their whole life.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use memmap2::Mmap;
use tracing::{debug, trace};

use crate::{
    dtable::{
        AtxId, Dtable, DtableError, DtableIter, check_key_type, shadow_needs_tombstone,
        source_shadow_ok,
    },
    encoding::{Decode, Encode},
    value::{Blob, BlobComparator, BlobMeta, CmpRef, Dtype, KeyType},
};

const SIMPLE_MAGIC: u32 = 0x24A3_D1E6;
const SIMPLE_VERSION: u32 = 1;

/// `value_len` sentinel marking a stored tombstone.
const DNE_LEN: u32 = u32::MAX;

/// Bytes per key-index entry.
const INDEX_ENTRY_SIZE: usize = 16;

/// Bytes per aux-directory entry.
const AUX_ENTRY_SIZE: usize = 8;

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

struct SimpleHeader {
    magic: u32,
    version: u32,
    key_type: u8,
    cmp_name: Option<String>,
    count: u32,
    value_size: u32,
    aux_count: u32,
    aux_size: u32,
}

impl Encode for SimpleHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), crate::encoding::EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.key_type.encode_to(buf)?;
        self.cmp_name.encode_to(buf)?;
        self.count.encode_to(buf)?;
        self.value_size.encode_to(buf)?;
        self.aux_count.encode_to(buf)?;
        self.aux_size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SimpleHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), crate::encoding::EncodingError> {
        let mut offset = 0;
        let (magic, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (key_type, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (cmp_name, n) = Option::<String>::decode_from(&buf[offset..])?;
        offset += n;
        let (count, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (value_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (aux_count, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (aux_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                magic,
                version,
                key_type,
                cmp_name,
                count,
                value_size,
                aux_count,
                aux_size,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// SimpleDtable
// ------------------------------------------------------------------------------------------------

/// Read-only sorted-file dtable.
pub struct SimpleDtable {
    inner: Arc<SimpleInner>,
    cmp: RwLock<CmpRef>,
}

struct SimpleInner {
    map: Mmap,
    key_type: KeyType,
    cmp_name: Option<String>,
    count: usize,
    index_start: usize,
    value_start: usize,
    aux_dir_start: usize,
    aux_bytes_start: usize,
    path: PathBuf,
}

impl SimpleInner {
    fn entry(&self, index: usize) -> (u64, u32, u32) {
        let base = self.index_start + index * INDEX_ENTRY_SIZE;
        let bytes = &self.map[base..base + INDEX_ENTRY_SIZE];
        let key_field = u64::from_le_bytes(bytes[0..8].try_into().unwrap_or([0; 8]));
        let value_offset = u32::from_le_bytes(bytes[8..12].try_into().unwrap_or([0; 4]));
        let value_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap_or([0; 4]));
        (key_field, value_offset, value_len)
    }

    fn aux(&self, index: usize) -> &[u8] {
        let base = self.aux_dir_start + index * AUX_ENTRY_SIZE;
        let bytes = &self.map[base..base + AUX_ENTRY_SIZE];
        let offset = u32::from_le_bytes(bytes[0..4].try_into().unwrap_or([0; 4])) as usize;
        let len = u32::from_le_bytes(bytes[4..8].try_into().unwrap_or([0; 4])) as usize;
        &self.map[self.aux_bytes_start + offset..self.aux_bytes_start + offset + len]
    }

    fn key_at(&self, index: usize) -> Dtype {
        let (key_field, _, _) = self.entry(index);
        match self.key_type {
            KeyType::U32 => Dtype::U32(key_field as u32),
            KeyType::F64 => Dtype::F64(f64::from_bits(key_field)),
            KeyType::Str => {
                let bytes = self.aux(key_field as usize);
                Dtype::str(std::str::from_utf8(bytes).unwrap_or(""))
            }
            KeyType::Blob => Dtype::Blob(Blob::from(self.aux(key_field as usize))),
        }
    }

    fn value_at(&self, index: usize) -> Blob {
        let (_, value_offset, value_len) = self.entry(index);
        if value_len == DNE_LEN {
            return Blob::dne();
        }
        let start = self.value_start + value_offset as usize;
        Blob::from(&self.map[start..start + value_len as usize])
    }

    fn meta_at(&self, index: usize) -> BlobMeta {
        let (_, _, value_len) = self.entry(index);
        if value_len == DNE_LEN {
            BlobMeta::nonexistent()
        } else {
            BlobMeta::present(value_len as usize)
        }
    }

    /// Binary search for `key` under `cmp`.
    fn search(&self, key: &Dtype, cmp: Option<&dyn BlobComparator>) -> Result<usize, usize> {
        let mut low = 0usize;
        let mut high = self.count;
        while low < high {
            let mid = low + (high - low) / 2;
            match self.key_at(mid).compare(key, cmp) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(low)
    }
}

impl SimpleDtable {
    /// Writes a new sorted file at `path` from `source`.
    ///
    /// Tombstones in the source are written only when `shadow` still has an
    /// entry for the key (an older layer the tombstone must hide);
    /// otherwise they are dropped. The creating context's comparator `cmp`
    /// orders string/blob aux data and has its name persisted.
    pub fn create(
        path: &Path,
        source: &mut dyn DtableIter,
        shadow: Option<&dyn Dtable>,
        cmp: CmpRef,
    ) -> Result<(), DtableError> {
        source_shadow_ok(source, shadow)?;
        let key_type = source.iter_key_type();

        let mut index = Vec::new();
        let mut values: Vec<u8> = Vec::new();
        let mut aux_dir: Vec<(u32, u32)> = Vec::new();
        let mut aux_bytes: Vec<u8> = Vec::new();

        let mut append_entry =
            |key: &Dtype, value: &Blob| -> Result<(), DtableError> {
                let key_field = match key {
                    Dtype::U32(x) => u64::from(*x),
                    Dtype::F64(x) => x.to_bits(),
                    Dtype::Str(_) | Dtype::Blob(_) => {
                        let flat = key.flatten();
                        let offset = u32::try_from(aux_bytes.len()).map_err(|_| {
                            DtableError::InvalidArgument("aux region exceeds 4 GiB".into())
                        })?;
                        let len = u32::try_from(flat.size()).map_err(|_| {
                            DtableError::InvalidArgument("key exceeds 4 GiB".into())
                        })?;
                        aux_bytes.extend_from_slice(flat.bytes());
                        aux_dir.push((offset, len));
                        (aux_dir.len() - 1) as u64
                    }
                };
                let (value_offset, value_len) = if value.exists() {
                    let offset = u32::try_from(values.len()).map_err(|_| {
                        DtableError::InvalidArgument("value region exceeds 4 GiB".into())
                    })?;
                    let len = u32::try_from(value.size()).map_err(|_| {
                        DtableError::InvalidArgument("value exceeds 4 GiB".into())
                    })?;
                    values.extend_from_slice(value.bytes());
                    (offset, len)
                } else {
                    (values.len() as u32, DNE_LEN)
                };
                index.push((key_field, value_offset, value_len));
                Ok(())
            };

        source.first();
        while source.valid() {
            let (Some(key), Some(mut value)) = (source.key(), source.value()) else {
                break;
            };
            if key.key_type() != key_type {
                return Err(DtableError::InvalidArgument(
                    "source produced mixed key types".into(),
                ));
            }
            if !value.exists() {
                // The source may substitute a value through the reject
                // protocol when asked; here nonexistence is legitimate, so
                // only the shadow decides.
                if !shadow_needs_tombstone(shadow, &key)? {
                    source.next();
                    continue;
                }
                value = Blob::dne();
            }
            append_entry(&key, &value)?;
            source.next();
        }

        let header = SimpleHeader {
            magic: SIMPLE_MAGIC,
            version: SIMPLE_VERSION,
            key_type: key_type.wire_tag(),
            cmp_name: cmp.as_ref().map(|c| c.name().to_string()),
            count: index.len() as u32,
            value_size: values.len() as u32,
            aux_count: aux_dir.len() as u32,
            aux_size: aux_bytes.len() as u32,
        };

        let mut file_bytes = crate::encoding::encode_to_vec(&header)?;
        for (key_field, value_offset, value_len) in &index {
            file_bytes.extend_from_slice(&key_field.to_le_bytes());
            file_bytes.extend_from_slice(&value_offset.to_le_bytes());
            file_bytes.extend_from_slice(&value_len.to_le_bytes());
        }
        file_bytes.extend_from_slice(&values);
        for (offset, len) in &aux_dir {
            file_bytes.extend_from_slice(&offset.to_le_bytes());
            file_bytes.extend_from_slice(&len.to_le_bytes());
        }
        file_bytes.extend_from_slice(&aux_bytes);

        let tmp = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        file.write_all(&file_bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;

        debug!(
            path = %path.display(),
            entries = index.len(),
            bytes = file_bytes.len(),
            "sorted file written"
        );
        Ok(())
    }

    /// Opens an existing sorted file.
    pub fn open(path: &Path) -> Result<Self, DtableError> {
        let file = File::open(path)?;
        // The file is never modified after the create-time rename.
        let map = unsafe { Mmap::map(&file)? };

        let (header, header_len) = SimpleHeader::decode_from(&map)?;
        if header.magic != SIMPLE_MAGIC || header.version != SIMPLE_VERSION {
            return Err(DtableError::Corrupt(format!(
                "bad magic/version in {}",
                path.display()
            )));
        }
        let key_type = KeyType::from_wire_tag(header.key_type)?;

        let index_start = header_len;
        let value_start = index_start + header.count as usize * INDEX_ENTRY_SIZE;
        let aux_dir_start = value_start + header.value_size as usize;
        let aux_bytes_start = aux_dir_start + header.aux_count as usize * AUX_ENTRY_SIZE;
        let total = aux_bytes_start + header.aux_size as usize;
        if map.len() < total {
            return Err(DtableError::Corrupt(format!(
                "truncated sorted file {} ({} < {total})",
                path.display(),
                map.len()
            )));
        }

        trace!(path = %path.display(), entries = header.count, "sorted file opened");

        Ok(Self {
            inner: Arc::new(SimpleInner {
                map,
                key_type,
                cmp_name: header.cmp_name,
                count: header.count as usize,
                index_start,
                value_start,
                aux_dir_start,
                aux_bytes_start,
                path: path.to_path_buf(),
            }),
            cmp: RwLock::new(None),
        })
    }

    fn active_cmp(&self) -> Result<CmpRef, DtableError> {
        let cmp = self
            .cmp
            .read()
            .map_err(|_| DtableError::Internal("comparator lock poisoned".into()))?
            .clone();
        if self.inner.cmp_name.is_some() && cmp.is_none() {
            return Err(DtableError::Busy("required comparator not attached"));
        }
        Ok(cmp)
    }
}

impl Dtable for SimpleDtable {
    fn key_type(&self) -> KeyType {
        self.inner.key_type
    }

    fn cmp_name(&self) -> Option<String> {
        self.inner.cmp_name.clone()
    }

    fn set_blob_cmp(&self, cmp: Arc<dyn BlobComparator>) -> Result<(), DtableError> {
        if self.inner.key_type != KeyType::Blob {
            return Err(DtableError::Unsupported("comparators require blob keys"));
        }
        if let Some(required) = &self.inner.cmp_name {
            if required != cmp.name() {
                return Err(DtableError::InvalidArgument(format!(
                    "comparator {} does not match required {required}",
                    cmp.name()
                )));
            }
        }
        *self
            .cmp
            .write()
            .map_err(|_| DtableError::Internal("comparator lock poisoned".into()))? = Some(cmp);
        Ok(())
    }

    fn lookup_atx(&self, key: &Dtype, _atx: Option<AtxId>) -> Result<Option<Blob>, DtableError> {
        check_key_type(self, key)?;
        let cmp = self.active_cmp()?;
        match self.inner.search(key, cmp.as_deref()) {
            Ok(index) => Ok(Some(self.inner.value_at(index))),
            Err(_) => Ok(None),
        }
    }

    fn iterate_atx(&self, _atx: Option<AtxId>) -> Result<Box<dyn DtableIter>, DtableError> {
        let cmp = self.active_cmp()?;
        Ok(Box::new(SimpleIter {
            inner: Arc::clone(&self.inner),
            pos: 0,
            cmp,
        }))
    }

    fn entry_count(&self) -> Result<usize, DtableError> {
        Ok(self.inner.count)
    }

    fn index_value(&self, index: usize) -> Result<Blob, DtableError> {
        if index >= self.inner.count {
            return Err(DtableError::NotFound);
        }
        Ok(self.inner.value_at(index))
    }

    fn contains_index(&self, index: usize) -> Result<bool, DtableError> {
        if index >= self.inner.count {
            return Err(DtableError::NotFound);
        }
        Ok(self.inner.meta_at(index).exists)
    }
}

impl std::fmt::Debug for SimpleDtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleDtable")
            .field("path", &self.inner.path)
            .field("count", &self.inner.count)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

struct SimpleIter {
    inner: Arc<SimpleInner>,
    pos: usize,
    cmp: CmpRef,
}

impl DtableIter for SimpleIter {
    fn valid(&self) -> bool {
        self.pos < self.inner.count
    }

    fn next(&mut self) -> bool {
        if self.pos >= self.inner.count {
            return false;
        }
        self.pos += 1;
        self.pos < self.inner.count
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
        self.inner.count > 0
    }

    fn last(&mut self) -> bool {
        if self.inner.count == 0 {
            self.pos = 0;
            return false;
        }
        self.pos = self.inner.count - 1;
        true
    }

    fn seek(&mut self, key: &Dtype) -> bool {
        match self.inner.search(key, self.cmp.as_deref()) {
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

    fn seek_index(&mut self, index: usize) -> Result<bool, DtableError> {
        self.pos = index.min(self.inner.count);
        Ok(index < self.inner.count)
    }

    fn get_index(&self) -> Result<usize, DtableError> {
        Ok(self.pos)
    }

    fn key(&self) -> Option<Dtype> {
        self.valid().then(|| self.inner.key_at(self.pos))
    }

    fn meta(&self) -> Option<BlobMeta> {
        self.valid().then(|| self.inner.meta_at(self.pos))
    }

    fn value(&self) -> Option<Blob> {
        self.valid().then(|| self.inner.value_at(self.pos))
    }

    fn iter_key_type(&self) -> KeyType {
        self.inner.key_type
    }
}

// ------------------------------------------------------------------------------------------------
// Factory
// ------------------------------------------------------------------------------------------------

/// Factory for the `simple_dtable` class.
pub struct SimpleDtableFactory;

impl crate::factory::DtableFactory for SimpleDtableFactory {
    fn class_name(&self) -> &'static str {
        "simple_dtable"
    }

    fn indexed_access(&self, _ctx: &crate::factory::TableContext, _config: &crate::params::Params) -> bool {
        true
    }

    fn create(
        &self,
        _ctx: &crate::factory::TableContext,
        path: &Path,
        _config: &crate::params::Params,
        source: &mut dyn DtableIter,
        shadow: Option<&dyn Dtable>,
        cmp: CmpRef,
    ) -> Result<(), DtableError> {
        SimpleDtable::create(path, source, shadow, cmp)
    }

    fn open(
        &self,
        _ctx: &crate::factory::TableContext,
        path: &Path,
        _config: &crate::params::Params,
    ) -> Result<Arc<dyn Dtable>, DtableError> {
        Ok(Arc::new(SimpleDtable::open(path)?))
    }
}
