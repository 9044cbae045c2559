//! Deterministic binary encoding for everything tabletdb persists.
//!
//! Two families of primitives live here:
//!
//! - [`Encode`] / [`Decode`] for fixed-layout structures (WAL headers and
//!   records, tablet footers, index entries, properties).
//! - LEB128 varints ([`put_varint`] / [`get_varint`]) used by the
//!   prefix-compressed data-block entries, where most lengths fit in a
//!   single byte.
//!
//! # Wire format
//!
//! | Rust type          | Encoding                                     |
//! |--------------------|----------------------------------------------|
//! | `u8`               | 1 byte                                       |
//! | `u32`              | 4 bytes, little-endian                       |
//! | `u64`              | 8 bytes, little-endian                       |
//! | `[u8; N]`          | `N` raw bytes (no length prefix)             |
//! | `Vec<u8>` / `&[u8]`| `[u32 len][bytes]`                           |
//! | `Vec<T>`           | `[u32 count][T₁][T₂]…` via [`encode_vec`]    |
//! | varint             | LEB128, 7 bits per byte, at most 10 bytes    |
//!
//! Decoders never panic on short or hostile input; every failure is an
//! [`EncodingError`]. Length fields are capped by [`MAX_BYTE_LEN`] and
//! [`MAX_VEC_ELEMENTS`] before anything is allocated.

#[cfg(test)]
mod tests;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Safety limits
// ------------------------------------------------------------------------------------------------

/// Largest byte string accepted by the decoder (256 MiB).
pub const MAX_BYTE_LEN: u32 = 256 * 1024 * 1024;

/// Largest element count accepted by [`decode_vec`] (16 M).
pub const MAX_VEC_ELEMENTS: u32 = 16 * 1024 * 1024;

/// Maximum number of bytes a LEB128-encoded `u64` can occupy.
pub const MAX_VARINT_LEN: usize = 10;

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

    /// A varint ran past ten bytes or overflowed 64 bits.
    #[error("malformed varint")]
    MalformedVarint,

    /// A length or count exceeded its safety limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` by appending to a byte buffer.
///
/// Output must be deterministic: equal values produce identical bytes.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from the front of a byte slice.
///
/// Returns `(value, bytes_consumed)` so callers can walk a buffer holding
/// several encoded items back to back.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

/// Encode a value into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

#[inline]
fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

/// Copy the first `N` bytes of `buf` into an array.
#[inline]
fn take_array<const N: usize>(buf: &[u8]) -> Result<[u8; N], EncodingError> {
    require(buf, N)?;
    let mut arr = [0u8; N];
    arr.copy_from_slice(&buf[..N]);
    Ok(arr)
}

// ------------------------------------------------------------------------------------------------
// Fixed-width integers
// ------------------------------------------------------------------------------------------------

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
        require(buf, 1)?;
        Ok((buf[0], 1))
    }
}

impl Encode for u32 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u32 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        Ok((u32::from_le_bytes(take_array::<4>(buf)?), 4))
    }
}

impl Encode for u64 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u64 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        Ok((u64::from_le_bytes(take_array::<8>(buf)?), 8))
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
        Ok((take_array::<N>(buf)?, N))
    }
}

// ------------------------------------------------------------------------------------------------
// Length-prefixed byte strings: [u32 len][bytes]
// ------------------------------------------------------------------------------------------------

impl Encode for Vec<u8> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_slice().encode_to(buf)
    }
}

impl Encode for &[u8] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_to_u32(self.len())?.encode_to(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, offset) = u32::decode_from(buf)?;
        if len > MAX_BYTE_LEN {
            return Err(EncodingError::LengthOverflow(format!(
                "byte string length {len} exceeds MAX_BYTE_LEN ({MAX_BYTE_LEN})"
            )));
        }
        let len = len as usize;
        require(&buf[offset..], len)?;
        Ok((buf[offset..offset + len].to_vec(), offset + len))
    }
}

// ------------------------------------------------------------------------------------------------
// Vec<T>: [u32 count][T₁][T₂]…
// ------------------------------------------------------------------------------------------------

/// Encode a slice of `T` as `[u32 count][T₁][T₂]…`.
pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    len_to_u32(items.len())?.encode_to(buf)?;
    for item in items {
        item.encode_to(buf)?;
    }
    Ok(())
}

/// Decode a `Vec<T>` written by [`encode_vec`].
pub fn decode_vec<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let (count, mut offset) = u32::decode_from(buf)?;
    if count > MAX_VEC_ELEMENTS {
        return Err(EncodingError::LengthOverflow(format!(
            "element count {count} exceeds MAX_VEC_ELEMENTS ({MAX_VEC_ELEMENTS})"
        )));
    }
    // Cap the pre-allocation by what the buffer could possibly hold.
    let mut items = Vec::with_capacity((count as usize).min(buf.len()));
    for _ in 0..count {
        let (item, consumed) = T::decode_from(&buf[offset..])?;
        offset += consumed;
        items.push(item);
    }
    Ok((items, offset))
}

// ------------------------------------------------------------------------------------------------
// LEB128 varints
// ------------------------------------------------------------------------------------------------

/// Append `value` as an unsigned LEB128 varint.
#[inline]
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Decode an unsigned LEB128 varint from the front of `buf`.
///
/// Returns `(value, bytes_consumed)`.
#[inline]
pub fn get_varint(buf: &[u8]) -> Result<(u64, usize), EncodingError> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        let chunk = u64::from(byte & 0x7F);
        // The tenth byte may only contribute the single remaining bit.
        if i == MAX_VARINT_LEN - 1 && chunk > 1 {
            return Err(EncodingError::MalformedVarint);
        }
        value |= chunk << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() < MAX_VARINT_LEN {
        Err(EncodingError::UnexpectedEof {
            needed: buf.len() + 1,
            available: buf.len(),
        })
    } else {
        Err(EncodingError::MalformedVarint)
    }
}

/// Decode a varint that must fit in a `usize` length.
#[inline]
pub fn get_varint_len(buf: &[u8]) -> Result<(usize, usize), EncodingError> {
    let (value, n) = get_varint(buf)?;
    if value > u64::from(MAX_BYTE_LEN) {
        return Err(EncodingError::LengthOverflow(format!(
            "varint length {value} exceeds MAX_BYTE_LEN ({MAX_BYTE_LEN})"
        )));
    }
    Ok((value as usize, n))
}
