//! Tablet writer: turns a sorted stream of records into a tablet file.
//!
//! # Input requirements
//!
//! Keys must be strictly ascending. A duplicate or out-of-order key aborts
//! the build with [`TabletError::InvalidInput`]; nothing after the offending
//! record is written.
//!
//! # Atomicity
//!
//! [`TabletWriter::build`] writes to any [`Write`] sink.
//! [`TabletWriter::write_to_storage`] adds the usual crash-safety dance:
//!
//! 1. Write everything to `path.tmp`.
//! 2. Sync the file.
//! 3. Rename `path.tmp` → `path`.
//!
//! A crash cannot leave a partially-written tablet under the final name.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bloomfilter::Bloom;
use tracing::{debug, trace};

use crate::encoding;
use crate::engine::Entry;
use crate::storage::Storage;

use super::block::BlockBuilder;
use super::{
    BLOCK_TRAILER_SIZE, BLOOM_FALSE_POSITIVE_RATE, BlockHandle, IndexEntry,
    MIN_COMPRESSION_GAIN_DIVISOR, TABLET_MAGIC, TABLET_VERSION, TabletError, TabletFooter,
    TabletOptions, TabletProperties, block_checksum,
};

// ------------------------------------------------------------------------------------------------
// Output bookkeeping
// ------------------------------------------------------------------------------------------------

/// Tracks the byte offset of everything written so far, so block handles
/// can be computed without `Seek`.
struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), TabletError> {
        self.inner.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }
}

/// What a finished build produced.
#[derive(Debug, Clone)]
pub struct TabletSummary {
    pub properties: TabletProperties,
    pub file_size: u64,
}

#[derive(Default)]
struct BuildStats {
    record_count: u64,
    tombstone_count: u64,
    min_key: Option<Vec<u8>>,
}

// ------------------------------------------------------------------------------------------------
// TabletWriter
// ------------------------------------------------------------------------------------------------

/// Builds tablets with a fixed set of [`TabletOptions`].
///
/// ```rust,ignore
/// let summary = TabletWriter::new(options).build(&mut file, entries, n)?;
/// ```
#[derive(Debug, Clone)]
pub struct TabletWriter {
    options: TabletOptions,
}

impl TabletWriter {
    pub fn new(options: TabletOptions) -> Self {
        Self { options }
    }

    /// Consumes `entries` and writes a complete tablet to `sink`.
    ///
    /// `expected_count` sizes the bloom filter; it is a hint, and a wrong
    /// value only shifts the false-positive rate.
    pub fn build<W, I>(
        &self,
        sink: W,
        entries: I,
        expected_count: usize,
    ) -> Result<TabletSummary, TabletError>
    where
        W: Write,
        I: IntoIterator<Item = (Vec<u8>, Entry)>,
    {
        let mut out = CountingWriter::new(sink);
        let mut bloom: Bloom<[u8]> =
            Bloom::new_for_fp_rate(expected_count.max(1), BLOOM_FALSE_POSITIVE_RATE)
                .map_err(|e| TabletError::InvalidInput(format!("bloom filter: {e}")))?;
        let mut block = BlockBuilder::new(self.options.key_restart_interval);
        let mut index: Vec<IndexEntry> = Vec::new();
        let mut stats = BuildStats::default();
        let mut last_key: Option<Vec<u8>> = None;

        for (key, entry) in entries {
            if let Some(prev) = &last_key {
                if key.as_slice() <= prev.as_slice() {
                    return Err(TabletError::InvalidInput(format!(
                        "keys must be strictly ascending: {} after {}",
                        crate::engine::HexKey(&key),
                        crate::engine::HexKey(prev)
                    )));
                }
            }

            stats.record_count += 1;
            if matches!(entry, Entry::Tombstone) {
                stats.tombstone_count += 1;
            }
            if stats.min_key.is_none() {
                stats.min_key = Some(key.clone());
            }
            bloom.set(key.as_slice());
            block.add(&key, &entry)?;

            if block.estimated_size() >= self.options.block_size {
                self.flush_data_block(&mut out, &mut block, &mut index)?;
            }
            last_key = Some(key);
        }
        if !block.is_empty() {
            self.flush_data_block(&mut out, &mut block, &mut index)?;
        }

        let properties = TabletProperties {
            record_count: stats.record_count,
            tombstone_count: stats.tombstone_count,
            data_block_count: index.len() as u64,
            min_key: stats.min_key.unwrap_or_default(),
            max_key: last_key.unwrap_or_default(),
            creation_timestamp: now_millis(),
            codec_id: self.options.codec.id(),
        };

        let mut index_bytes = Vec::new();
        encoding::encode_vec(&index, &mut index_bytes)?;
        let index_handle = self.write_block(&mut out, &index_bytes)?;
        let bloom_handle = self.write_block(&mut out, bloom.as_slice())?;
        let properties_bytes = encoding::encode_to_vec(&properties)?;
        let properties_handle = self.write_block(&mut out, &properties_bytes)?;

        let mut footer = TabletFooter {
            index: index_handle,
            bloom: bloom_handle,
            properties: properties_handle,
            codec_id: self.options.codec.id(),
            version: TABLET_VERSION,
            footer_crc32: 0,
            magic: TABLET_MAGIC,
        };
        footer.footer_crc32 = footer.checksum()?;
        out.put(&encoding::encode_to_vec(&footer)?)?;
        out.inner.flush()?;

        debug!(
            records = properties.record_count,
            blocks = properties.data_block_count,
            bytes = out.written,
            codec = self.options.codec.name(),
            "tablet built"
        );

        Ok(TabletSummary {
            properties,
            file_size: out.written,
        })
    }

    /// Builds into `path.tmp` on `storage`, syncs, then renames to `path`.
    pub fn write_to_storage<I>(
        &self,
        storage: &dyn Storage,
        path: &Path,
        entries: I,
        expected_count: usize,
    ) -> Result<TabletSummary, TabletError>
    where
        I: IntoIterator<Item = (Vec<u8>, Entry)>,
    {
        let tmp_path = tmp_path_for(path);
        let handle = storage.create(&tmp_path)?;
        let mut writer = BufWriter::new(handle);

        let summary = match self.build(&mut writer, entries, expected_count) {
            Ok(summary) => summary,
            Err(e) => {
                drop(writer);
                // Best effort: the tmp file is swept on the next open anyway.
                let _ = storage.remove(&tmp_path);
                return Err(e);
            }
        };

        let mut handle = writer.into_inner().map_err(|e| TabletError::Io(e.into_error()))?;
        handle.sync()?;
        drop(handle);
        storage.rename(&tmp_path, path)?;
        Ok(summary)
    }

    /// Compresses one raw block and writes `[payload][codec_id][crc]`.
    fn write_block<W: Write>(
        &self,
        out: &mut CountingWriter<W>,
        raw: &[u8],
    ) -> Result<BlockHandle, TabletError> {
        let codec = &self.options.codec;
        let compressed = codec.compress(raw)?;

        // Keep the raw form when the codec doesn't pay for itself.
        let worthwhile = compressed.len() < raw.len() - raw.len() / MIN_COMPRESSION_GAIN_DIVISOR;
        let (payload, codec_id) = if worthwhile {
            (compressed.as_slice(), codec.id())
        } else {
            (raw, crate::codec::IDENTITY_CODEC_ID)
        };

        let handle = BlockHandle {
            offset: out.written,
            size: payload.len() as u64,
            raw_size: raw.len() as u64,
        };
        out.put(payload)?;
        let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
        trailer[0] = codec_id;
        trailer[1..].copy_from_slice(&block_checksum(payload, codec_id).to_le_bytes());
        out.put(&trailer)?;

        trace!(
            offset = handle.offset,
            raw = handle.raw_size,
            stored = handle.size,
            codec_id,
            "block written"
        );
        Ok(handle)
    }

    fn flush_data_block<W: Write>(
        &self,
        out: &mut CountingWriter<W>,
        block: &mut BlockBuilder,
        index: &mut Vec<IndexEntry>,
    ) -> Result<(), TabletError> {
        let last_key = block.last_key().to_vec();
        let raw = block.finish();
        let handle = self.write_block(out, &raw)?;
        index.push(IndexEntry { last_key, handle });
        Ok(())
    }
}

/// `name.tmp` next to `path`.
pub(crate) fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
