//! Deterministic binary encoding for on-disk persistence.
//!
//! Every file Anvil writes — the system journal, managed-table metadata,
//! sorted-table headers, column-table directories — goes through the
//! [`Encode`] and [`Decode`] traits defined here. The crate owns its wire
//! format end to end, so the on-disk representation never changes out from
//! under a stored table because of a dependency upgrade.
//!
//! # Wire format
//!
//! | Rust type          | Encoding                                     |
//! |--------------------|----------------------------------------------|
//! | `u8`               | 1 byte                                       |
//! | `u32`              | 4 bytes, little-endian                       |
//! | `u64`              | 8 bytes, little-endian                       |
//! | `f64`              | 8 bytes, little-endian IEEE-754 bits         |
//! | `bool`             | 1 byte (`0x00` = false, `0x01` = true)       |
//! | `[u8; N]`          | `N` raw bytes (no length prefix)             |
//! | `Vec<u8>` / bytes  | `[u32 len][bytes]`                           |
//! | `String`           | `[u32 len][utf-8 bytes]`                     |
//! | `Option<T>`        | `[u8 tag: 0=None, 1=Some][T if Some]`        |
//! | `Vec<T>`           | `[u32 count][T₁][T₂]…` via [`encode_vec`]    |
//!
//! All multi-byte integers are **little-endian**. Lengths and counts are
//! `u32`, so no single encoded item exceeds 4 GiB — the same ceiling the
//! value model places on a blob.
//!
//! # Decode safety
//!
//! Variable-length decoders enforce upper bounds ([`MAX_BYTE_LEN`],
//! [`MAX_VEC_ELEMENTS`]) so a corrupted length field cannot become an
//! allocation bomb. Decoders return `(value, bytes_consumed)` so callers
//! can walk a buffer of concatenated items with a cursor.
//!
//! No function here panics; every failure is an [`EncodingError`].

#[cfg(test)]
mod tests;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Safety limits
// ------------------------------------------------------------------------------------------------

/// Maximum byte length accepted for a single decoded `Vec<u8>` or `String`
/// (64 MiB). Anything larger is treated as corruption.
pub const MAX_BYTE_LEN: u32 = 64 * 1024 * 1024;

/// Maximum element count accepted for a decoded `Vec<T>` (4 M).
pub const MAX_VEC_ELEMENTS: u32 = 4 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// An enum discriminant was not recognised.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag {
        /// The tag value that was read.
        tag: u32,
        /// The Rust type being decoded.
        type_name: &'static str,
    },

    /// A bool field contained a byte other than `0x00` or `0x01`.
    #[error("invalid bool byte: 0x{0:02X}")]
    InvalidBool(u8),

    /// A byte sequence decoded as a string was not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A length or count exceeded its safety limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` into a byte buffer.
///
/// Implementations must be deterministic: the same logical value always
/// produces the same bytes.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from the front of a byte slice.
///
/// Returns `(value, bytes_consumed)` so callers can advance a cursor
/// through a buffer containing multiple encoded items.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

// ------------------------------------------------------------------------------------------------
// Convenience functions
// ------------------------------------------------------------------------------------------------

/// Encode a value into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`, returning `(value,
/// consumed)`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

/// Copies the first `N` bytes of `buf`, or reports how short it fell.
#[inline]
fn take<const N: usize>(buf: &[u8]) -> Result<[u8; N], EncodingError> {
    match buf.get(..N).and_then(|head| <[u8; N]>::try_from(head).ok()) {
        Some(array) => Ok(array),
        None => Err(EncodingError::UnexpectedEof {
            needed: N,
            available: buf.len(),
        }),
    }
}

/// Decodes a `u32` length prefix bounded by `limit`, returning it as usize
/// alongside the prefix width.
#[inline]
fn take_len(buf: &[u8], limit: u32, what: &str) -> Result<(usize, usize), EncodingError> {
    let (len, consumed) = u32::decode_from(buf)?;
    if len > limit {
        return Err(EncodingError::LengthOverflow(format!(
            "{what} length {len} exceeds limit {limit}"
        )));
    }
    Ok((len as usize, consumed))
}

#[inline]
fn put_len(len: usize, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    let len = u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))?;
    len.encode_to(buf)
}

// ------------------------------------------------------------------------------------------------
// Primitive implementations
// ------------------------------------------------------------------------------------------------

/// Little-endian fixed-width numbers share one implementation shape.
macro_rules! le_number {
    ($ty:ty, $width:expr, |$raw:ident| $from:expr, |$this:ident| $to:expr) => {
        impl Encode for $ty {
            #[inline]
            fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
                let $this = self;
                buf.extend_from_slice(&($to).to_le_bytes());
                Ok(())
            }
        }

        impl Decode for $ty {
            #[inline]
            fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
                let $raw = take::<$width>(buf)?;
                Ok(($from, $width))
            }
        }
    };
}

le_number!(u32, 4, |raw| u32::from_le_bytes(raw), |this| *this);
le_number!(u64, 8, |raw| u64::from_le_bytes(raw), |this| *this);
le_number!(
    f64,
    8,
    |raw| f64::from_bits(u64::from_le_bytes(raw)),
    |this| this.to_bits()
);

impl Encode for u8 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let [byte] = take::<1>(buf)?;
        Ok((byte, 1))
    }
}

impl Encode for bool {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        match take::<1>(buf)? {
            [0] => Ok((false, 1)),
            [1] => Ok((true, 1)),
            [other] => Err(EncodingError::InvalidBool(other)),
        }
    }
}

impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        Ok((take::<N>(buf)?, N))
    }
}

// ------------------------------------------------------------------------------------------------
// Length-prefixed bytes and strings
// ------------------------------------------------------------------------------------------------

impl Encode for &[u8] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        put_len(self.len(), buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Encode for Vec<u8> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_slice().encode_to(buf)
    }
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, prefix) = take_len(buf, MAX_BYTE_LEN, "byte vector")?;
        match buf.get(prefix..prefix + len) {
            Some(bytes) => Ok((bytes.to_vec(), prefix + len)),
            None => Err(EncodingError::UnexpectedEof {
                needed: len,
                available: buf.len().saturating_sub(prefix),
            }),
        }
    }
}

impl Encode for &str {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_bytes().encode_to(buf)
    }
}

impl Encode for String {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_str().encode_to(buf)
    }
}

impl Decode for String {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (raw, consumed) = Vec::<u8>::decode_from(buf)?;
        Ok((String::from_utf8(raw)?, consumed))
    }
}

// ------------------------------------------------------------------------------------------------
// Option<T>: [u8 tag][T if Some]
// ------------------------------------------------------------------------------------------------

impl<T: Encode> Encode for Option<T> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            None => buf.push(0),
            Some(inner) => {
                buf.push(1);
                inner.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Option<T> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        match take::<1>(buf)? {
            [0] => Ok((None, 1)),
            [1] => {
                let (inner, consumed) = T::decode_from(&buf[1..])?;
                Ok((Some(inner), 1 + consumed))
            }
            [tag] => Err(EncodingError::InvalidTag {
                tag: u32::from(tag),
                type_name: "Option<T>",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Vec<T>: [u32 count][T₁][T₂]…
//
// `Vec<u8>` has the specialised raw-bytes impl above; coherence prevents a
// blanket impl from coexisting with it, so vectors of structs go through
// these free functions instead.
// ------------------------------------------------------------------------------------------------

/// Encode a slice of `T` as `[u32 count][T₁][T₂]…`.
pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    put_len(items.len(), buf)?;
    items.iter().try_for_each(|item| item.encode_to(buf))
}

/// Decode a `Vec<T>` from `[u32 count][T₁][T₂]…`, capped at
/// [`MAX_VEC_ELEMENTS`].
pub fn decode_vec<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let (count, mut offset) = take_len(buf, MAX_VEC_ELEMENTS, "vector element")?;
    let mut items = Vec::with_capacity(count);
    while items.len() < count {
        let (item, consumed) = T::decode_from(&buf[offset..])?;
        offset += consumed;
        items.push(item);
    }
    Ok((items, offset))
}
