//! Sorted-file dtable with fixed-size values and no per-entry lengths.
//!
//! Same key index discipline as the simple dtable, but the value region is
//! one fixed-width slot per entry, so the index entry shrinks to a key field
//! plus an existence tag. Suited to packed integer payloads (the smallint
//! and deltaint wrappers produce exactly these).

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use memmap2::Mmap;
use tracing::debug;

use crate::{
    dtable::{
        AtxId, Dtable, DtableError, DtableIter, check_key_type, shadow_needs_tombstone,
        source_shadow_ok,
    },
    encoding::{Decode, Encode},
    value::{Blob, BlobComparator, BlobMeta, CmpRef, Dtype, KeyType},
};

const FIXED_MAGIC: u32 = 0x46D7_0A3E;
const FIXED_VERSION: u32 = 1;

/// Key field + existence tag.
const INDEX_ENTRY_SIZE: usize = 9;
const AUX_ENTRY_SIZE: usize = 8;

struct FixedHeader {
    magic: u32,
    version: u32,
    key_type: u8,
    cmp_name: Option<String>,
    count: u32,
    value_size: u32,
    aux_count: u32,
    aux_size: u32,
}

impl Encode for FixedHeader {
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

impl Decode for FixedHeader {
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

/// Read-only sorted file with uniform value widths.
pub struct FixedDtable {
    inner: Arc<FixedInner>,
    cmp: RwLock<CmpRef>,
}

struct FixedInner {
    map: Mmap,
    key_type: KeyType,
    cmp_name: Option<String>,
    count: usize,
    value_size: usize,
    index_start: usize,
    value_start: usize,
    aux_dir_start: usize,
    aux_bytes_start: usize,
    path: PathBuf,
}

impl FixedInner {
    fn entry(&self, index: usize) -> (u64, bool) {
        let base = self.index_start + index * INDEX_ENTRY_SIZE;
        let bytes = &self.map[base..base + INDEX_ENTRY_SIZE];
        let key_field = u64::from_le_bytes(bytes[0..8].try_into().unwrap_or([0; 8]));
        (key_field, bytes[8] == 1)
    }

    fn aux(&self, index: usize) -> &[u8] {
        let base = self.aux_dir_start + index * AUX_ENTRY_SIZE;
        let bytes = &self.map[base..base + AUX_ENTRY_SIZE];
        let offset = u32::from_le_bytes(bytes[0..4].try_into().unwrap_or([0; 4])) as usize;
        let len = u32::from_le_bytes(bytes[4..8].try_into().unwrap_or([0; 4])) as usize;
        &self.map[self.aux_bytes_start + offset..self.aux_bytes_start + offset + len]
    }

    fn key_at(&self, index: usize) -> Dtype {
        let (key_field, _) = self.entry(index);
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
        let (_, exists) = self.entry(index);
        if !exists {
            return Blob::dne();
        }
        let start = self.value_start + index * self.value_size;
        Blob::from(&self.map[start..start + self.value_size])
    }

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

impl FixedDtable {
    /// Writes a fixed-width sorted file from `source`.
    ///
    /// Values of any other size than the first present one (or the pinned
    /// `value_size`) go through the source's reject hook; an unaccepted
    /// reject aborts with `Unsupported`.
    pub fn create(
        path: &Path,
        source: &mut dyn DtableIter,
        shadow: Option<&dyn Dtable>,
        cmp: CmpRef,
        value_size: Option<usize>,
    ) -> Result<(), DtableError> {
        source_shadow_ok(source, shadow)?;
        let key_type = source.iter_key_type();

        let mut width = value_size;
        let mut index: Vec<(u64, Option<Vec<u8>>)> = Vec::new();
        let mut aux_dir: Vec<(u32, u32)> = Vec::new();
        let mut aux_bytes: Vec<u8> = Vec::new();

        source.first();
        while source.valid() {
            let (Some(key), Some(value)) = (source.key(), source.value()) else {
                break;
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
                            "value size not representable in fixed dtable",
                        ));
                    }
                    value = replacement;
                }
            }
            if !value.exists() && !shadow_needs_tombstone(shadow, &key)? {
                source.next();
                continue;
            }

            let key_field = match &key {
                Dtype::U32(x) => u64::from(*x),
                Dtype::F64(x) => x.to_bits(),
                Dtype::Str(_) | Dtype::Blob(_) => {
                    let flat = key.flatten();
                    let offset = aux_bytes.len() as u32;
                    aux_bytes.extend_from_slice(flat.bytes());
                    aux_dir.push((offset, flat.size() as u32));
                    (aux_dir.len() - 1) as u64
                }
            };
            index.push((
                key_field,
                value.exists().then(|| value.bytes().to_vec()),
            ));
            source.next();
        }

        let value_size = width.unwrap_or(0);
        let header = FixedHeader {
            magic: FIXED_MAGIC,
            version: FIXED_VERSION,
            key_type: key_type.wire_tag(),
            cmp_name: cmp.as_ref().map(|c| c.name().to_string()),
            count: index.len() as u32,
            value_size: value_size as u32,
            aux_count: aux_dir.len() as u32,
            aux_size: aux_bytes.len() as u32,
        };

        let mut bytes = crate::encoding::encode_to_vec(&header)?;
        for (key_field, value) in &index {
            bytes.extend_from_slice(&key_field.to_le_bytes());
            bytes.push(u8::from(value.is_some()));
        }
        for (_, value) in &index {
            match value {
                Some(data) => bytes.extend_from_slice(data),
                None => bytes.extend(std::iter::repeat_n(0u8, value_size)),
            }
        }
        for (offset, len) in &aux_dir {
            bytes.extend_from_slice(&offset.to_le_bytes());
            bytes.extend_from_slice(&len.to_le_bytes());
        }
        bytes.extend_from_slice(&aux_bytes);

        let tmp = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;

        debug!(path = %path.display(), entries = index.len(), value_size, "fixed file written");
        Ok(())
    }

    /// Opens an existing fixed-width sorted file.
    pub fn open(path: &Path) -> Result<Self, DtableError> {
        let file = File::open(path)?;
        // Never modified after the create-time rename.
        let map = unsafe { Mmap::map(&file)? };
        let (header, header_len) = FixedHeader::decode_from(&map)?;
        if header.magic != FIXED_MAGIC || header.version != FIXED_VERSION {
            return Err(DtableError::Corrupt(format!(
                "bad magic/version in {}",
                path.display()
            )));
        }
        let key_type = KeyType::from_wire_tag(header.key_type)?;
        let count = header.count as usize;
        let value_size = header.value_size as usize;
        let index_start = header_len;
        let value_start = index_start + count * INDEX_ENTRY_SIZE;
        let aux_dir_start = value_start + count * value_size;
        let aux_bytes_start = aux_dir_start + header.aux_count as usize * AUX_ENTRY_SIZE;
        if map.len() < aux_bytes_start + header.aux_size as usize {
            return Err(DtableError::Corrupt(format!(
                "truncated fixed file {}",
                path.display()
            )));
        }
        Ok(Self {
            inner: Arc::new(FixedInner {
                map,
                key_type,
                cmp_name: header.cmp_name,
                count,
                value_size,
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

impl Dtable for FixedDtable {
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
        Ok(Box::new(FixedIter {
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
        Ok(self.inner.entry(index).1)
    }
}

impl std::fmt::Debug for FixedDtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedDtable")
            .field("path", &self.inner.path)
            .field("count", &self.inner.count)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

struct FixedIter {
    inner: Arc<FixedInner>,
    pos: usize,
    cmp: CmpRef,
}

impl DtableIter for FixedIter {
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
        if !self.valid() {
            return None;
        }
        let (_, exists) = self.inner.entry(self.pos);
        Some(if exists {
            BlobMeta::present(self.inner.value_size)
        } else {
            BlobMeta::nonexistent()
        })
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

/// Factory for the `fixed_dtable` class. Config: optional `value_size` int
/// pinning the slot width (otherwise taken from the first present value).
pub struct FixedDtableFactory;

impl crate::factory::DtableFactory for FixedDtableFactory {
    fn class_name(&self) -> &'static str {
        "fixed_dtable"
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
        cmp: CmpRef,
    ) -> Result<(), DtableError> {
        let value_size = config.int("value_size", 0)?;
        let value_size = (value_size > 0).then_some(value_size as usize);
        FixedDtable::create(path, source, shadow, cmp, value_size)
    }

    fn open(
        &self,
        _ctx: &crate::factory::TableContext,
        path: &Path,
        _config: &crate::params::Params,
    ) -> Result<Arc<dyn Dtable>, DtableError> {
        Ok(Arc::new(FixedDtable::open(path)?))
    }
}
