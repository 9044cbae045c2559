//! Tablets: immutable, sorted, block-compressed runs of records.
//!
//! A tablet is written once (by [`TabletWriter`] or by streaming the bytes
//! of an existing tablet) and never modified afterwards. Readers map the
//! whole file through a [`ReadHandle`] and decode blocks lazily.
//!
//! # On-disk layout
//!
//! ```text
//! [DATA_BLOCK_0][TRAILER]
//! [DATA_BLOCK_1][TRAILER]
//! ...
//! [INDEX_BLOCK][TRAILER]
//! [BLOOM_BLOCK][TRAILER]
//! [PROPERTIES_BLOCK][TRAILER]
//! [FOOTER]
//! ```
//!
//! - **Data blocks** hold prefix-compressed entries (see [`block`]) and are
//!   compressed one at a time by a [`BlockCodec`](crate::codec::BlockCodec).
//! - **Trailer** is `[CODEC_ID u8][CRC32 LE]`; the CRC covers the stored
//!   payload followed by the codec id.
//! - **Index block** maps each data block's *last* key to its
//!   [`BlockHandle`], so the first index entry with `last_key >= key` names
//!   the only block that can hold `key`.
//! - **Bloom block** is the serialized bitmap of a bloom filter over every
//!   key in the tablet, tombstones included.
//! - **Properties block** carries [`TabletProperties`].
//! - **Footer** is fixed-size ([`FOOTER_SIZE`] bytes) at the end of the file:
//!
//! ```text
//! [INDEX_HANDLE 24B][BLOOM_HANDLE 24B][PROPERTIES_HANDLE 24B]
//! [CODEC_ID u8][VERSION u32][FOOTER_CRC32 u32][MAGIC 8B]
//! ```
//!
//! A [`BlockHandle`] is `[offset u64][size u64][raw_size u64]`: where the
//! stored payload begins, how many bytes it occupies (trailer excluded) and
//! how large it is once decompressed.
//!
//! # Integrity
//!
//! [`Tablet::open`] validates the footer (magic, version, CRC), every
//! handle's bounds, and the checksums of the index, bloom and properties
//! blocks. Data blocks are checksummed when they are first read, so
//! corruption there surfaces as an error from the lookup or iterator that
//! touched it. [`Tablet::verify`] reads every data block up front.

pub mod block;
pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::{TabletSummary, TabletWriter};
pub use iterator::TabletIter;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use thiserror::Error;

use crate::codec::{BlockCodec, CodecError, CodecRegistry, SnappyCodec};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::engine::Entry;
use crate::storage::{ReadHandle, Storage};

use block::{Block, BlockIter};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub const TABLET_MAGIC: [u8; 8] = *b"TABLET\x00\x01";
pub const TABLET_VERSION: u32 = 1;

/// Encoded size of [`TabletFooter`].
pub const FOOTER_SIZE: usize = 3 * HANDLE_SIZE + 1 + 4 + 4 + 8;

/// `[codec_id u8][crc32 u32]` after every block.
pub const BLOCK_TRAILER_SIZE: usize = 5;

const HANDLE_SIZE: usize = 24;
const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// A codec must shrink a block by at least this fraction of its raw size
/// for the compressed form to be kept.
const MIN_COMPRESSION_GAIN_DIVISOR: usize = 8;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by tablet reads and builds.
#[derive(Debug, Error)]
pub enum TabletError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A block's stored CRC does not match its contents.
    #[error("Checksum mismatch in block at offset {offset}")]
    ChecksumMismatch { offset: u64 },

    /// Structural damage: bad magic, truncated file, out-of-range handle.
    #[error("Malformed tablet: {0}")]
    Format(String),

    /// The writer was handed input that cannot form a tablet.
    #[error("Invalid tablet input: {0}")]
    InvalidInput(String),
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Build-time knobs for new tablets.
#[derive(Debug, Clone)]
pub struct TabletOptions {
    /// Target raw size of a data block; a block is cut once it reaches this.
    pub block_size: usize,

    /// Entries between full (non-prefix-compressed) keys inside a block.
    pub key_restart_interval: usize,

    /// Codec applied to every block.
    pub codec: Arc<dyn BlockCodec>,
}

impl Default for TabletOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            key_restart_interval: 16,
            codec: Arc::new(SnappyCodec),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// Location of one block inside a tablet file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    /// Stored payload size, trailer excluded.
    pub size: u64,
    /// Size after decompression.
    pub raw_size: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub(crate) last_key: Vec<u8>,
    pub(crate) handle: BlockHandle,
}

pub(crate) struct TabletFooter {
    pub(crate) index: BlockHandle,
    pub(crate) bloom: BlockHandle,
    pub(crate) properties: BlockHandle,
    pub(crate) codec_id: u8,
    pub(crate) version: u32,
    pub(crate) footer_crc32: u32,
    pub(crate) magic: [u8; 8],
}

impl TabletFooter {
    fn checksum(&self) -> Result<u32, EncodingError> {
        let zeroed = Self {
            footer_crc32: 0,
            ..*self
        };
        let bytes = encoding::encode_to_vec(&zeroed)?;
        let mut hasher = Crc32::new();
        hasher.update(&bytes);
        Ok(hasher.finalize())
    }
}

/// Tablet-level statistics, stored in the properties block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TabletProperties {
    pub record_count: u64,
    pub tombstone_count: u64,
    pub data_block_count: u64,
    /// Smallest key; empty when the tablet has no records.
    pub min_key: Vec<u8>,
    /// Largest key; empty when the tablet has no records.
    pub max_key: Vec<u8>,
    /// UNIX epoch milliseconds at build time.
    pub creation_timestamp: u64,
    /// Codec selected when the tablet was built.
    pub codec_id: u8,
}

// ------------------------------------------------------------------------------------------------
// Encoding implementations
// ------------------------------------------------------------------------------------------------

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)?;
        self.raw_size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (raw_size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                offset,
                size,
                raw_size,
            },
            off,
        ))
    }
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.last_key.encode_to(buf)?;
        self.handle.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (last_key, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (handle, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { last_key, handle }, off))
    }
}

impl Encode for TabletFooter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.index.encode_to(buf)?;
        self.bloom.encode_to(buf)?;
        self.properties.encode_to(buf)?;
        self.codec_id.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.footer_crc32.encode_to(buf)?;
        self.magic.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for TabletFooter {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (index, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (bloom, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (properties, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (codec_id, n) = u8::decode_from(&buf[off..])?;
        off += n;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (footer_crc32, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (magic, n) = <[u8; 8]>::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                index,
                bloom,
                properties,
                codec_id,
                version,
                footer_crc32,
                magic,
            },
            off,
        ))
    }
}

impl Encode for TabletProperties {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.record_count.encode_to(buf)?;
        self.tombstone_count.encode_to(buf)?;
        self.data_block_count.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        self.creation_timestamp.encode_to(buf)?;
        self.codec_id.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for TabletProperties {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (record_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (tombstone_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (data_block_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (min_key, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (max_key, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (creation_timestamp, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (codec_id, n) = u8::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                record_count,
                tombstone_count,
                data_block_count,
                min_key,
                max_key,
                creation_timestamp,
                codec_id,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// GetResult
// ------------------------------------------------------------------------------------------------

/// Result of a point lookup in a single tablet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetResult {
    Value(Vec<u8>),
    /// The tablet records a deletion of the key.
    Tombstone,
    /// The tablet has no record for the key.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// Block I/O helpers
// ------------------------------------------------------------------------------------------------

pub(crate) fn block_checksum(payload: &[u8], codec_id: u8) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(payload);
    hasher.update(&[codec_id]);
    hasher.finalize()
}

/// Reads, verifies and decompresses the block behind `handle`.
///
/// `limit` is the end of the region the handle may point into.
fn read_block(
    data: &[u8],
    handle: &BlockHandle,
    limit: usize,
    codecs: &CodecRegistry,
) -> Result<Vec<u8>, TabletError> {
    let start = usize::try_from(handle.offset)
        .map_err(|_| TabletError::Format("block offset exceeds addressable range".into()))?;
    let size = usize::try_from(handle.size)
        .map_err(|_| TabletError::Format("block size exceeds addressable range".into()))?;
    let raw_size = usize::try_from(handle.raw_size)
        .map_err(|_| TabletError::Format("block raw size exceeds addressable range".into()))?;

    let end = start
        .checked_add(size)
        .and_then(|e| e.checked_add(BLOCK_TRAILER_SIZE))
        .filter(|e| *e <= limit)
        .ok_or_else(|| {
            TabletError::Format(format!(
                "block at offset {} (size {}) out of range",
                handle.offset, handle.size
            ))
        })?;

    let payload = &data[start..start + size];
    let trailer = &data[start + size..end];
    let codec_id = trailer[0];
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&trailer[1..5]);

    if block_checksum(payload, codec_id) != u32::from_le_bytes(crc) {
        return Err(TabletError::ChecksumMismatch {
            offset: handle.offset,
        });
    }

    let codec = codecs.resolve(codec_id)?;
    Ok(codec.decompress(payload, raw_size)?)
}

// ------------------------------------------------------------------------------------------------
// Tablet reader
// ------------------------------------------------------------------------------------------------

/// An open, validated tablet.
///
/// Cheap to share behind an [`Arc`]; all methods take `&self`.
pub struct Tablet {
    path: PathBuf,
    data: ReadHandle,
    codecs: CodecRegistry,
    index: Vec<IndexEntry>,
    bloom: Bloom<[u8]>,
    properties: TabletProperties,
    /// End of the data-block region (start of the index block).
    data_end: usize,
}

impl fmt::Debug for Tablet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tablet")
            .field("path", &self.path)
            .field("file_size", &self.file_size())
            .field("blocks", &self.index.len())
            .field("properties", &self.properties)
            .finish()
    }
}

impl Tablet {
    /// Opens and validates the tablet stored at `path`.
    pub fn open(
        storage: &dyn Storage,
        path: &Path,
        codecs: &CodecRegistry,
    ) -> Result<Self, TabletError> {
        let data = storage.open(path)?;
        Self::from_handle(path.to_path_buf(), data, codecs)
    }

    /// Validates a tablet already held in memory.
    ///
    /// # Errors
    ///
    /// - [`TabletError::Format`] for a short file, bad magic or version,
    ///   out-of-range handles or unsorted index entries.
    /// - [`TabletError::ChecksumMismatch`] when the footer or a metadata
    ///   block fails its CRC.
    /// - [`TabletError::Codec`] when the footer names a codec missing from
    ///   `codecs`.
    pub fn from_handle(
        path: PathBuf,
        data: ReadHandle,
        codecs: &CodecRegistry,
    ) -> Result<Self, TabletError> {
        let file_len = data.len();
        if file_len < FOOTER_SIZE {
            return Err(TabletError::Format(format!(
                "file is {file_len} bytes, smaller than the {FOOTER_SIZE}-byte footer"
            )));
        }

        let footer_start = file_len - FOOTER_SIZE;
        let (footer, _) = encoding::decode_from_slice::<TabletFooter>(&data[footer_start..])?;

        if footer.magic != TABLET_MAGIC {
            return Err(TabletError::Format("tablet magic mismatch".into()));
        }
        if footer.version != TABLET_VERSION {
            return Err(TabletError::Format(format!(
                "unsupported tablet version {}",
                footer.version
            )));
        }
        if footer.checksum()? != footer.footer_crc32 {
            return Err(TabletError::ChecksumMismatch {
                offset: footer_start as u64,
            });
        }
        codecs.resolve(footer.codec_id)?;

        let index_bytes = read_block(&data, &footer.index, footer_start, codecs)?;
        let (index, _) = encoding::decode_vec::<IndexEntry>(&index_bytes)?;

        let bloom_bytes = read_block(&data, &footer.bloom, footer_start, codecs)?;
        let bloom = Bloom::from_slice(&bloom_bytes)
            .map_err(|e| TabletError::Format(format!("bloom block: {e}")))?;

        let properties_bytes = read_block(&data, &footer.properties, footer_start, codecs)?;
        let (properties, _) =
            encoding::decode_from_slice::<TabletProperties>(&properties_bytes)?;

        // Data blocks live strictly before the index block.
        let data_end = usize::try_from(footer.index.offset)
            .map_err(|_| TabletError::Format("index offset exceeds addressable range".into()))?;
        for pair in index.windows(2) {
            if pair[0].last_key >= pair[1].last_key {
                return Err(TabletError::Format("index keys are not ascending".into()));
            }
        }
        for entry in &index {
            let end = entry
                .handle
                .offset
                .checked_add(entry.handle.size)
                .and_then(|e| e.checked_add(BLOCK_TRAILER_SIZE as u64));
            if end.is_none_or(|e| e > data_end as u64) {
                return Err(TabletError::Format(format!(
                    "data block at offset {} overlaps metadata",
                    entry.handle.offset
                )));
            }
        }
        if properties.data_block_count != index.len() as u64 {
            return Err(TabletError::Format(format!(
                "properties list {} data blocks, index has {}",
                properties.data_block_count,
                index.len()
            )));
        }

        Ok(Self {
            path,
            data,
            codecs: codecs.clone(),
            index,
            bloom,
            properties,
            data_end,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn properties(&self) -> &TabletProperties {
        &self.properties
    }

    /// Raw bytes of the whole tablet file.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// `false` only when the bloom filter rules `key` out.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.bloom.check(key)
    }

    /// Point lookup.
    ///
    /// 1. Bloom filter check.
    /// 2. Binary search of the index for the first block whose last key is
    ///    `>= key`.
    /// 3. Restart-point binary search and linear scan inside that block.
    pub fn get(&self, key: &[u8]) -> Result<GetResult, TabletError> {
        if !self.may_contain(key) {
            return Ok(GetResult::NotFound);
        }
        let block_idx = self.find_block_for_key(key);
        if block_idx >= self.index.len() {
            return Ok(GetResult::NotFound);
        }

        let mut iter = BlockIter::new(self.load_block(block_idx)?);
        iter.seek(key)?;
        match iter.next_entry()? {
            Some((found, entry)) if found.as_slice() == key => Ok(match entry {
                Entry::Value(value) => GetResult::Value(value),
                Entry::Tombstone => GetResult::Tombstone,
            }),
            _ => Ok(GetResult::NotFound),
        }
    }

    /// Forward iterator starting at the first key `>= from`, or at the
    /// beginning of the tablet when `from` is `None`.
    pub fn seek(self: &Arc<Self>, from: Option<&[u8]>) -> Result<TabletIter, TabletError> {
        TabletIter::new(Arc::clone(self), from)
    }

    /// Reads and checksums every data block.
    pub fn verify(&self) -> Result<(), TabletError> {
        for idx in 0..self.index.len() {
            self.load_block(idx)?;
        }
        Ok(())
    }

    /// Index of the only block that can hold `key`; `index.len()` when `key`
    /// is past the last key of the tablet.
    pub(crate) fn find_block_for_key(&self, key: &[u8]) -> usize {
        self.index
            .partition_point(|entry| entry.last_key.as_slice() < key)
    }

    pub(crate) fn block_count(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn load_block(&self, idx: usize) -> Result<Block, TabletError> {
        let entry = self
            .index
            .get(idx)
            .ok_or_else(|| TabletError::Format(format!("block index {idx} out of range")))?;
        let raw = read_block(&self.data, &entry.handle, self.data_end, &self.codecs)?;
        Block::decode(raw)
    }
}
