//! Block compression capability.
//!
//! Tablet data and metadata blocks are compressed one at a time through a
//! [`BlockCodec`]. The codec that produced a block is recorded by id in the
//! block trailer, so a reader only needs a [`CodecRegistry`] that knows every
//! id it may encounter.
//!
//! Built-in codecs:
//!
//! | id | codec             | notes                         |
//! |----|-------------------|-------------------------------|
//! | 0  | [`IdentityCodec`] | stored as-is                  |
//! | 1  | [`SnappyCodec`]   | `snap` raw (unframed) format  |

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Id of [`IdentityCodec`].
pub const IDENTITY_CODEC_ID: u8 = 0;

/// Id of [`SnappyCodec`].
pub const SNAPPY_CODEC_ID: u8 = 1;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{codec}: compression failed: {reason}")]
    Compress { codec: &'static str, reason: String },

    #[error("{codec}: decompression failed: {reason}")]
    Decompress { codec: &'static str, reason: String },

    #[error("decompressed size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("unknown codec id {0}")]
    UnknownCodec(u8),
}

// ------------------------------------------------------------------------------------------------
// Capability
// ------------------------------------------------------------------------------------------------

/// Compresses and decompresses whole blocks.
pub trait BlockCodec: Send + Sync + fmt::Debug {
    /// Stable id written into every block this codec produces.
    fn id(&self) -> u8;

    /// Human-readable name used in logs and errors.
    fn name(&self) -> &'static str;

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Reverses [`compress`](Self::compress). `expected_size` is the raw
    /// length recorded alongside the block; output of any other length is
    /// an error.
    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>, CodecError>;
}

fn check_size(expected: usize, out: Vec<u8>) -> Result<Vec<u8>, CodecError> {
    if out.len() != expected {
        return Err(CodecError::SizeMismatch {
            expected,
            actual: out.len(),
        });
    }
    Ok(out)
}

/// Stores blocks uncompressed.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl BlockCodec for IdentityCodec {
    fn id(&self) -> u8 {
        IDENTITY_CODEC_ID
    }

    fn name(&self) -> &'static str {
        "identity"
    }

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(raw.to_vec())
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>, CodecError> {
        check_size(expected_size, data.to_vec())
    }
}

/// Snappy raw block compression.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnappyCodec;

impl BlockCodec for SnappyCodec {
    fn id(&self) -> u8 {
        SNAPPY_CODEC_ID
    }

    fn name(&self) -> &'static str {
        "snappy"
    }

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
        snap::raw::Encoder::new()
            .compress_vec(raw)
            .map_err(|e| CodecError::Compress {
                codec: self.name(),
                reason: e.to_string(),
            })
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>, CodecError> {
        let decoded_len =
            snap::raw::decompress_len(data).map_err(|e| CodecError::Decompress {
                codec: self.name(),
                reason: e.to_string(),
            })?;
        // Refuse to allocate for a header that disagrees with the index.
        if decoded_len != expected_size {
            return Err(CodecError::SizeMismatch {
                expected: expected_size,
                actual: decoded_len,
            });
        }
        let out = snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| CodecError::Decompress {
                codec: self.name(),
                reason: e.to_string(),
            })?;
        check_size(expected_size, out)
    }
}

// ------------------------------------------------------------------------------------------------
// Registry
// ------------------------------------------------------------------------------------------------

/// Codecs a reader can resolve by id.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: BTreeMap<u8, Arc<dyn BlockCodec>>,
}

impl CodecRegistry {
    /// A registry holding only [`IdentityCodec`].
    pub fn identity_only() -> Self {
        let mut codecs: BTreeMap<u8, Arc<dyn BlockCodec>> = BTreeMap::new();
        codecs.insert(IDENTITY_CODEC_ID, Arc::new(IdentityCodec));
        Self { codecs }
    }

    /// Adds or replaces the codec registered under `codec.id()`.
    pub fn register(&mut self, codec: Arc<dyn BlockCodec>) {
        self.codecs.insert(codec.id(), codec);
    }

    pub fn get(&self, id: u8) -> Option<&Arc<dyn BlockCodec>> {
        self.codecs.get(&id)
    }

    /// Like [`get`](Self::get), but an unknown id is an error.
    pub fn resolve(&self, id: u8) -> Result<&Arc<dyn BlockCodec>, CodecError> {
        self.get(id).ok_or(CodecError::UnknownCodec(id))
    }

    pub fn contains(&self, id: u8) -> bool {
        self.codecs.contains_key(&id)
    }
}

impl Default for CodecRegistry {
    /// Identity and Snappy.
    fn default() -> Self {
        let mut registry = Self::identity_only();
        registry.register(Arc::new(SnappyCodec));
        registry
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.codecs.values().map(|c| (c.id(), c.name())))
            .finish()
    }
}
