//! Value and key data model.
//!
//! All data stored by Anvil is carried by two types: [`Blob`] for values and
//! [`Dtype`] for keys.
//!
//! A [`Blob`] is an immutable, reference-counted byte sequence with three
//! semantic states:
//!
//! - **does-not-exist** (`dne`) — a first-class tombstone that propagates
//!   through table wrappers,
//! - **empty** — present with zero bytes,
//! - **present** — present with `N ≥ 1` bytes (`N ≤ u32::MAX`).
//!
//! Cloning a blob bumps a reference count; mutation goes through the owned
//! [`BlobBuffer`] builder, which freezes into a new blob. [`BlobMeta`] is the
//! lightweight (size, exists) pair iterators expose so callers can decide
//! whether to materialize a value at all.
//!
//! A [`Dtype`] is a tagged variant over the four key kinds ([`KeyType`]):
//! u32, f64, string, blob. Each table declares exactly one key type at
//! creation and rejects mismatched keys. Ordering is the natural ordering
//! for u32/f64/string; blob keys order through an optional named
//! [`BlobComparator`], falling back to lexicographic bytes. A comparator's
//! name is saved alongside any table that sorts blob keys with it, and such
//! a table refuses to operate until a comparator with the matching name is
//! attached again.


use std::{cmp::Ordering, fmt, sync::Arc};

use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError};

/// Reference-counted immutable string.
pub type IStr = Arc<str>;

/// Shared handle to an optional named blob comparator.
pub type CmpRef = Option<Arc<dyn BlobComparator>>;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors produced by value/key conversions.
#[derive(Debug, Error)]
pub enum ValueError {
    /// A key or value had the wrong type for the operation.
    #[error("wrong type: expected {expected}, got {actual}")]
    WrongType {
        /// The type the operation required.
        expected: &'static str,
        /// The type actually supplied.
        actual: &'static str,
    },

    /// A byte sequence had the wrong size for the target type.
    #[error("wrong size: expected {expected} bytes, got {actual}")]
    WrongSize {
        /// Required byte count.
        expected: usize,
        /// Actual byte count.
        actual: usize,
    },

    /// A nonexistent blob was used where a present value is required.
    #[error("blob does not exist")]
    DoesNotExist,

    /// A byte sequence was not valid UTF-8.
    #[error("invalid UTF-8 in string key")]
    InvalidUtf8,

    /// An unknown key-type tag was read from disk.
    #[error("invalid key type tag {0}")]
    InvalidKeyType(u8),
}

// ------------------------------------------------------------------------------------------------
// Blob
// ------------------------------------------------------------------------------------------------

/// An immutable, reference-counted byte sequence with a tri-state:
/// does-not-exist, empty, or present.
///
/// Nonexistence is first-class: a `dne` blob stored into a table acts as a
/// tombstone, and wrappers propagate it unchanged.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Blob {
    bytes: Option<Arc<[u8]>>,
}

impl Blob {
    /// The does-not-exist blob (tombstone).
    pub fn dne() -> Self {
        Self { bytes: None }
    }

    /// A present blob of zero length.
    pub fn empty() -> Self {
        Self {
            bytes: Some(Arc::from(&[][..])),
        }
    }

    /// Whether this blob is present (empty counts as present).
    pub fn exists(&self) -> bool {
        self.bytes.is_some()
    }

    /// Byte length; zero for both empty and nonexistent blobs.
    pub fn size(&self) -> usize {
        self.bytes.as_ref().map_or(0, |b| b.len())
    }

    /// The bytes of this blob; empty for both empty and nonexistent blobs.
    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or(&[])
    }

    /// The (size, exists) summary of this blob.
    pub fn meta(&self) -> BlobMeta {
        BlobMeta {
            exists: self.exists(),
            size: self.size(),
        }
    }

    /// A present blob holding a little-endian u32.
    pub fn from_u32(value: u32) -> Self {
        Self::from(&value.to_le_bytes()[..])
    }

    /// Reads this blob as a little-endian u32.
    pub fn as_u32(&self) -> Result<u32, ValueError> {
        let bytes = self.bytes();
        if !self.exists() {
            return Err(ValueError::DoesNotExist);
        }
        let arr: [u8; 4] = bytes.try_into().map_err(|_| ValueError::WrongSize {
            expected: 4,
            actual: bytes.len(),
        })?;
        Ok(u32::from_le_bytes(arr))
    }

    /// Total ordering by state then bytes: dne < empty < present, present
    /// blobs lexicographically.
    pub fn compare(&self, other: &Blob) -> Ordering {
        match (&self.bytes, &other.bytes) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.as_ref().cmp(b.as_ref()),
        }
    }
}

impl From<&[u8]> for Blob {
    fn from(bytes: &[u8]) -> Self {
        Self {
            bytes: Some(Arc::from(bytes)),
        }
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Some(Arc::from(bytes.into_boxed_slice())),
        }
    }
}

impl From<&str> for Blob {
    fn from(s: &str) -> Self {
        Self::from(s.as_bytes())
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bytes {
            None => write!(f, "Blob(dne)"),
            Some(b) if b.is_empty() => write!(f, "Blob(empty)"),
            Some(b) => {
                write!(f, "Blob(")?;
                for byte in b.iter().take(16) {
                    write!(f, "{byte:02x}")?;
                }
                if b.len() > 16 {
                    write!(f, "…[{} bytes]", b.len())?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Wire form: `[u8 tag: 0 = dne, 1 = present][bytes if present]`.
impl Encode for Blob {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match &self.bytes {
            None => false.encode_to(buf),
            Some(b) => {
                true.encode_to(buf)?;
                b.as_ref().encode_to(buf)
            }
        }
    }
}

impl Decode for Blob {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (exists, mut offset) = bool::decode_from(buf)?;
        if !exists {
            return Ok((Blob::dne(), offset));
        }
        let (bytes, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Blob::from(bytes), offset))
    }
}

// ------------------------------------------------------------------------------------------------
// BlobMeta
// ------------------------------------------------------------------------------------------------

/// Lightweight (size, exists) summary of a blob.
///
/// Iterators expose this so callers can decide whether to materialize the
/// value; a nonexistent blob reports size zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobMeta {
    /// Whether the entry is present (empty counts as present).
    pub exists: bool,

    /// Byte length of the value when present.
    pub size: usize,
}

impl BlobMeta {
    /// The summary of a nonexistent blob.
    pub fn nonexistent() -> Self {
        Self {
            exists: false,
            size: 0,
        }
    }

    /// The summary of a present blob of `size` bytes.
    pub fn present(size: usize) -> Self {
        Self { exists: true, size }
    }
}

// ------------------------------------------------------------------------------------------------
// BlobBuffer
// ------------------------------------------------------------------------------------------------

/// Mutable builder for blobs.
///
/// Grows on demand, supports overwriting arbitrary ranges (zero-filling any
/// gap), and freezes into an immutable [`Blob`].
#[derive(Debug, Default)]
pub struct BlobBuffer {
    data: Vec<u8>,
}

impl BlobBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty buffer with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// A buffer seeded with the contents of an existing blob.
    pub fn from_blob(blob: &Blob) -> Self {
        Self {
            data: blob.bytes().to_vec(),
        }
    }

    /// Current length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends bytes at the end.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Appends a single byte.
    pub fn push(&mut self, byte: u8) {
        self.data.push(byte);
    }

    /// Overwrites `bytes` starting at `offset`, extending the buffer with
    /// zeroes if `offset` lies past the current end.
    pub fn overwrite(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(bytes);
    }

    /// Truncates or zero-extends to exactly `size` bytes.
    pub fn set_size(&mut self, size: usize) {
        self.data.resize(size, 0);
    }

    /// Read access to the accumulated bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Freezes the buffer into an immutable present blob.
    pub fn freeze(self) -> Blob {
        Blob::from(self.data)
    }
}

// ------------------------------------------------------------------------------------------------
// KeyType
// ------------------------------------------------------------------------------------------------

/// The four key kinds a table can declare.
///
/// Wire tags are stable (1..=4) and appear in every on-disk header that
/// records a key type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// 32-bit unsigned integer keys.
    U32,
    /// 64-bit float keys (total ordering).
    F64,
    /// UTF-8 string keys.
    Str,
    /// Raw byte-sequence keys, ordered by an attached comparator.
    Blob,
}

impl KeyType {
    /// The stable on-disk tag for this key type.
    pub fn wire_tag(self) -> u8 {
        match self {
            KeyType::U32 => 1,
            KeyType::F64 => 2,
            KeyType::Str => 3,
            KeyType::Blob => 4,
        }
    }

    /// Decodes an on-disk tag.
    pub fn from_wire_tag(tag: u8) -> Result<Self, ValueError> {
        match tag {
            1 => Ok(KeyType::U32),
            2 => Ok(KeyType::F64),
            3 => Ok(KeyType::Str),
            4 => Ok(KeyType::Blob),
            other => Err(ValueError::InvalidKeyType(other)),
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            KeyType::U32 => "u32",
            KeyType::F64 => "f64",
            KeyType::Str => "string",
            KeyType::Blob => "blob",
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Dtype
// ------------------------------------------------------------------------------------------------

/// A typed key value: the tagged variant every table keys on.
#[derive(Clone, Debug, PartialEq)]
pub enum Dtype {
    /// u32 key.
    U32(u32),
    /// f64 key.
    F64(f64),
    /// String key.
    Str(IStr),
    /// Blob key.
    Blob(Blob),
}

impl Dtype {
    /// Convenience constructor for string keys.
    pub fn str(s: &str) -> Self {
        Dtype::Str(Arc::from(s))
    }

    /// The key type of this value.
    pub fn key_type(&self) -> KeyType {
        match self {
            Dtype::U32(_) => KeyType::U32,
            Dtype::F64(_) => KeyType::F64,
            Dtype::Str(_) => KeyType::Str,
            Dtype::Blob(_) => KeyType::Blob,
        }
    }

    /// Total-order comparison against another key of the same type.
    ///
    /// Blob keys use `cmp` when supplied, else lexicographic bytes. Floats
    /// use IEEE total ordering so keys sort deterministically. Callers
    /// guarantee matching types (the table boundary checks); mismatched
    /// types fall back to ordering by type tag.
    pub fn compare(&self, other: &Dtype, cmp: Option<&dyn BlobComparator>) -> Ordering {
        match (self, other) {
            (Dtype::U32(a), Dtype::U32(b)) => a.cmp(b),
            (Dtype::F64(a), Dtype::F64(b)) => a.total_cmp(b),
            (Dtype::Str(a), Dtype::Str(b)) => a.as_ref().cmp(b.as_ref()),
            (Dtype::Blob(a), Dtype::Blob(b)) => match cmp {
                Some(c) => c.compare(a, b),
                None => a.compare(b),
            },
            _ => self.key_type().wire_tag().cmp(&other.key_type().wire_tag()),
        }
    }

    /// Serializes this key into a blob of bytes.
    ///
    /// u32 and f64 flatten to their 4- and 8-byte little-endian forms;
    /// strings to their UTF-8 bytes; blobs to themselves.
    pub fn flatten(&self) -> Blob {
        match self {
            Dtype::U32(x) => Blob::from(&x.to_le_bytes()[..]),
            Dtype::F64(x) => Blob::from(&x.to_bits().to_le_bytes()[..]),
            Dtype::Str(s) => Blob::from(s.as_bytes()),
            Dtype::Blob(b) => b.clone(),
        }
    }

    /// Reconstructs a key of the given type from its flattened form.
    pub fn from_blob(blob: &Blob, key_type: KeyType) -> Result<Self, ValueError> {
        if !blob.exists() && key_type != KeyType::Blob {
            return Err(ValueError::DoesNotExist);
        }
        match key_type {
            KeyType::U32 => Ok(Dtype::U32(blob.as_u32()?)),
            KeyType::F64 => {
                let bytes: [u8; 8] =
                    blob.bytes().try_into().map_err(|_| ValueError::WrongSize {
                        expected: 8,
                        actual: blob.size(),
                    })?;
                Ok(Dtype::F64(f64::from_bits(u64::from_le_bytes(bytes))))
            }
            KeyType::Str => {
                let s = std::str::from_utf8(blob.bytes()).map_err(|_| ValueError::InvalidUtf8)?;
                Ok(Dtype::str(s))
            }
            KeyType::Blob => Ok(Dtype::Blob(blob.clone())),
        }
    }

    /// Hash of this key, consistent with [`Dtype::compare`] under the same
    /// comparator.
    pub fn hash_value(&self, cmp: Option<&dyn BlobComparator>) -> u64 {
        match self {
            Dtype::U32(x) => u64::from(*x),
            // 0.0 and -0.0 compare equal under natural f64 ordering but not
            // under total_cmp; total_cmp distinguishes them, so hashing the
            // bit pattern stays consistent.
            Dtype::F64(x) => x.to_bits(),
            Dtype::Str(s) => fnv_hash(s.as_bytes()),
            Dtype::Blob(b) => match cmp {
                Some(c) => c.hash(b),
                None => fnv_hash(b.bytes()),
            },
        }
    }
}

/// FNV-1a over a byte slice; the default hash for string and blob keys.
pub(crate) fn fnv_hash(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ------------------------------------------------------------------------------------------------
// Blob comparators
// ------------------------------------------------------------------------------------------------

/// A named, pluggable total ordering over blob keys.
///
/// The name is persisted alongside any table that sorts blob keys with the
/// comparator; reopening such a table requires attaching a comparator with
/// the matching name before any lookup or iteration succeeds.
pub trait BlobComparator: Send + Sync {
    /// Stable identifying name, saved with tables built under this ordering.
    fn name(&self) -> &str;

    /// Total ordering over blobs. Only called with present blobs of the
    /// table's key space; the dne state never reaches a comparator.
    fn compare(&self, a: &Blob, b: &Blob) -> Ordering;

    /// Hash consistent with [`BlobComparator::compare`]: equal blobs must
    /// hash equal. Defaults to FNV over the raw bytes, which is correct for
    /// any comparator that never equates distinct byte sequences.
    fn hash(&self, blob: &Blob) -> u64 {
        fnv_hash(blob.bytes())
    }
}

impl fmt::Debug for dyn BlobComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobComparator({})", self.name())
    }
}

/// The default lexicographic byte ordering, usable where a named comparator
/// is wanted but plain byte order suffices.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalComparator;

impl BlobComparator for LexicalComparator {
    fn name(&self) -> &str {
        "lexical"
    }

    fn compare(&self, a: &Blob, b: &Blob) -> Ordering {
        a.bytes().cmp(b.bytes())
    }
}
