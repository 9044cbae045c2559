//! Write-Ahead Log.
//!
//! A durable, append-only, checksummed log of records, generic over any type
//! implementing [`WalData`]. The database logs [`WalRecord`]s and replays
//! them into an empty memtable on open.
//!
//! # On-disk layout
//!
//! ```text
//! [MAGIC "TWAL"][VERSION u32 LE][MAX_RECORD_SIZE u32 LE][HEADER_CRC32 LE]
//! [REC_LEN u32 LE][REC_BYTES][REC_CRC32 LE]
//! [REC_LEN u32 LE][REC_BYTES][REC_CRC32 LE]
//! ...
//! ```
//!
//! - **Header** is 12 bytes followed by a CRC32 over those 12 bytes.
//! - **Record** CRC32 covers `len || record_bytes`.
//!
//! # Recovery
//!
//! [`Wal::open`] scans the whole file before accepting appends:
//!
//! - A missing file, or one shorter than the header, is (re)initialised.
//! - A header with a bad CRC, magic or version is an error.
//! - Records are read until the first one that is truncated, fails its
//!   CRC, exceeds the size limit or does not decode. Everything from that
//!   point on is the *torn tail*: it is logged with a warning and dropped
//!   by rewriting the well-formed prefix to `wal.log.tmp` and renaming it
//!   over the log.
//!
//! After `open`, [`Wal::replay_iter`] therefore yields only good records.
//!
//! # Failed appends
//!
//! The log remembers where its last acknowledged record ends. If writing or
//! syncing a frame fails, the file is cut back to that offset (same
//! tmp + rename as above) before the error is returned, so a later append
//! never lands behind a half-written frame. If that repair fails too the
//! log refuses further appends until it is reopened.
//!
//! # Guarantees
//!
//! - **Durability:** with `sync` enabled, every `append()` is followed by
//!   [`WriteHandle::sync`].
//! - **Ordering:** records are replayed in exactly the order appended.

#[cfg(test)]
mod tests;

use std::fmt;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{error, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::storage::{ReadHandle, Storage, WriteHandle};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Header bytes plus header CRC; records start here.
pub const WAL_HEADER_SIZE: usize = 16;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Checksum mismatch at offset {0}")]
    ChecksumMismatch(u64),

    #[error("Record size exceeds limit ({size} > {limit} bytes)")]
    RecordTooLarge { size: usize, limit: usize },

    #[error("Unexpected end of file at offset {0}")]
    UnexpectedEof(u64),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub max_record_size: u32,
}

impl WalHeader {
    pub const MAGIC: [u8; 4] = *b"TWAL";
    pub const VERSION: u32 = 1;
    pub const DEFAULT_MAX_RECORD_SIZE: u32 = 1024 * 1024;

    pub fn new(max_record_size: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            max_record_size,
        }
    }

    /// Header bytes followed by their CRC.
    fn to_bytes(self) -> Result<Vec<u8>, WalError> {
        let mut bytes = encoding::encode_to_vec(&self)?;
        let mut hasher = Crc32::new();
        hasher.update(&bytes);
        bytes.extend_from_slice(&hasher.finalize().to_le_bytes());
        Ok(bytes)
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, WalError> {
        let body = &buf[..WAL_HEADER_SIZE - U32_SIZE];
        let stored = read_u32(buf, WAL_HEADER_SIZE - U32_SIZE);
        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != stored {
            return Err(WalError::InvalidHeader("header checksum mismatch".into()));
        }

        let (header, _) = encoding::decode_from_slice::<WalHeader>(body)?;
        if header.magic != Self::MAGIC {
            return Err(WalError::InvalidHeader("bad magic".into()));
        }
        if header.version != Self::VERSION {
            return Err(WalError::InvalidHeader(format!(
                "unsupported version {}",
                header.version
            )));
        }
        Ok(header)
    }
}

impl Encode for WalHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.max_record_size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for WalHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (max_record_size, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                magic,
                version,
                max_record_size,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// Anything that can be logged.
pub trait WalData: Encode + Decode + fmt::Debug + Send + Sync {}
impl<T> WalData for T where T: Encode + Decode + fmt::Debug + Send + Sync {}

/// A logged database mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Encode for WalRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Self::Put { key, value } => {
                0u8.encode_to(buf)?;
                key.encode_to(buf)?;
                value.encode_to(buf)?;
            }
            Self::Delete { key } => {
                1u8.encode_to(buf)?;
                key.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for WalRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut off) = u8::decode_from(buf)?;
        match tag {
            0 => {
                let (key, n) = Vec::<u8>::decode_from(&buf[off..])?;
                off += n;
                let (value, n) = Vec::<u8>::decode_from(&buf[off..])?;
                off += n;
                Ok((Self::Put { key, value }, off))
            }
            1 => {
                let (key, n) = Vec::<u8>::decode_from(&buf[off..])?;
                off += n;
                Ok((Self::Delete { key }, off))
            }
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "WalRecord",
            }),
        }
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; U32_SIZE];
    bytes.copy_from_slice(&buf[at..at + U32_SIZE]);
    u32::from_le_bytes(bytes)
}

/// Parses the record framed at `offset`; returns it with the offset of the
/// next record.
fn parse_record<T: WalData>(
    buf: &[u8],
    offset: usize,
    max_record_size: usize,
) -> Result<(T, usize), WalError> {
    let eof = || WalError::UnexpectedEof(offset as u64);

    let body_at = offset + U32_SIZE;
    if body_at > buf.len() {
        return Err(eof());
    }
    let len = read_u32(buf, offset) as usize;
    if len > max_record_size {
        return Err(WalError::RecordTooLarge {
            size: len,
            limit: max_record_size,
        });
    }
    let crc_at = body_at + len;
    let end = crc_at + U32_SIZE;
    if end > buf.len() {
        return Err(eof());
    }

    let mut hasher = Crc32::new();
    hasher.update(&buf[offset..crc_at]);
    if hasher.finalize() != read_u32(buf, crc_at) {
        return Err(WalError::ChecksumMismatch(offset as u64));
    }

    let (record, consumed) = encoding::decode_from_slice::<T>(&buf[body_at..crc_at])?;
    if consumed != len {
        return Err(WalError::Internal(format!(
            "record at offset {offset} has {} trailing bytes",
            len - consumed
        )));
    }
    Ok((record, end))
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// Append handle plus the offset just past the last acknowledged record.
struct WalWriter {
    handle: Box<dyn WriteHandle>,
    end: u64,
    /// Set when a failed append could not be rolled back.
    broken: bool,
}

/// A generic append-only log stored through a [`Storage`].
pub struct Wal<T: WalData> {
    storage: Arc<dyn Storage>,
    path: PathBuf,
    writer: Mutex<WalWriter>,
    header: WalHeader,
    sync: bool,
    _phantom: PhantomData<T>,
}

impl<T: WalData> fmt::Debug for Wal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

impl<T: WalData> Wal<T> {
    /// Opens the log at `path`, creating it or repairing a torn tail as
    /// described in the [module docs](self).
    ///
    /// `max_record_size` only applies to a newly created log; an existing
    /// log keeps the limit stored in its header.
    pub fn open(
        storage: Arc<dyn Storage>,
        path: &Path,
        max_record_size: u32,
        sync: bool,
    ) -> Result<Self, WalError> {
        let existing_len = if storage.exists(path) {
            storage.len(path)?
        } else {
            0
        };

        let (header, end) = if existing_len < WAL_HEADER_SIZE as u64 {
            if existing_len > 0 {
                warn!(
                    path = %path.display(),
                    len = existing_len,
                    "WAL shorter than its header, reinitialising"
                );
            }
            let header = WalHeader::new(max_record_size);
            let mut w = storage.create(path)?;
            w.write_all(&header.to_bytes()?)?;
            w.sync()?;
            info!(path = %path.display(), max_record_size, "created new WAL");
            (header, WAL_HEADER_SIZE as u64)
        } else {
            let data = storage.open(path)?;
            let header = WalHeader::from_bytes(&data)?;
            let valid_end = Self::scan(&data, header.max_record_size as usize);
            if valid_end < data.len() {
                warn!(
                    path = %path.display(),
                    valid_bytes = valid_end,
                    dropped_bytes = data.len() - valid_end,
                    "WAL has a torn tail, truncating to last good record"
                );
                Self::rewrite_prefix(storage.as_ref(), path, &data[..valid_end])?;
            }
            info!(
                path = %path.display(),
                max_record_size = header.max_record_size,
                "loaded WAL"
            );
            (header, valid_end as u64)
        };

        let handle = storage.append(path)?;
        Ok(Self {
            storage,
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                handle,
                end,
                broken: false,
            }),
            header,
            sync,
            _phantom: PhantomData,
        })
    }

    /// Returns the end offset of the last well-formed record.
    fn scan(data: &[u8], max_record_size: usize) -> usize {
        let mut offset = WAL_HEADER_SIZE;
        while offset < data.len() {
            match parse_record::<T>(data, offset, max_record_size) {
                Ok((_, next)) => offset = next,
                Err(e) => {
                    warn!(offset, error = %e, "WAL scan stopped");
                    break;
                }
            }
        }
        offset
    }

    fn rewrite_prefix(storage: &dyn Storage, path: &Path, prefix: &[u8]) -> Result<(), WalError> {
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        let mut w = storage.create(&tmp_path)?;
        w.write_all(prefix)?;
        w.sync()?;
        drop(w);
        storage.rename(&tmp_path, path)?;
        Ok(())
    }

    /// Appends one record as `[len][bytes][crc]`, syncing if configured.
    pub fn append(&self, record: &T) -> Result<(), WalError> {
        let record_bytes = encoding::encode_to_vec(record)?;
        let limit = self.header.max_record_size as usize;
        if record_bytes.len() > limit {
            return Err(WalError::RecordTooLarge {
                size: record_bytes.len(),
                limit,
            });
        }
        let record_len = record_bytes.len() as u32;

        let mut frame = Vec::with_capacity(record_bytes.len() + 2 * U32_SIZE);
        frame.extend_from_slice(&record_len.to_le_bytes());
        frame.extend_from_slice(&record_bytes);
        let mut hasher = Crc32::new();
        hasher.update(&frame);
        let checksum = hasher.finalize();
        frame.extend_from_slice(&checksum.to_le_bytes());

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        if writer.broken {
            return Err(WalError::Internal(
                "WAL is unusable after a failed append; reopen the database".into(),
            ));
        }

        let mut written = writer.handle.write_all(&frame);
        if written.is_ok() && self.sync {
            written = writer.handle.sync();
        }
        if let Err(e) = written {
            warn!(
                path = %self.path.display(),
                end = writer.end,
                error = %e,
                "WAL append failed, rolling back to last good record"
            );
            if let Err(repair) = self.roll_back(&mut writer) {
                error!(
                    path = %self.path.display(),
                    error = %repair,
                    "WAL rollback failed, refusing further appends"
                );
                writer.broken = true;
            }
            return Err(e.into());
        }
        writer.end += frame.len() as u64;

        trace!(len = record_len, checksum, "WAL append");
        Ok(())
    }

    /// Cuts the file back to `writer.end` and reopens the append handle.
    fn roll_back(&self, writer: &mut WalWriter) -> Result<(), WalError> {
        let data = self.storage.open(&self.path)?;
        let end = usize::try_from(writer.end)
            .map_err(|_| WalError::Internal("WAL offset overflows usize".into()))?;
        if data.len() < end {
            return Err(WalError::UnexpectedEof(data.len() as u64));
        }
        if data.len() > end {
            Self::rewrite_prefix(self.storage.as_ref(), &self.path, &data[..end])?;
        }
        writer.handle = self.storage.append(&self.path)?;
        Ok(())
    }

    /// Iterates over all records from a snapshot of the log.
    pub fn replay_iter(&self) -> Result<WalIter<T>, WalError> {
        let data = self.storage.open(&self.path)?;
        Ok(WalIter {
            data,
            offset: WAL_HEADER_SIZE,
            max_record_size: self.header.max_record_size as usize,
            done: false,
            _phantom: PhantomData,
        })
    }

    /// Resets the log to just its header.
    pub fn truncate(&mut self) -> Result<(), WalError> {
        let mut handle = self.storage.create(&self.path)?;
        handle.write_all(&self.header.to_bytes()?)?;
        handle.sync()?;

        let slot = self
            .writer
            .get_mut()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        *slot = WalWriter {
            handle,
            end: WAL_HEADER_SIZE as u64,
            broken: false,
        };

        info!(path = %self.path.display(), "truncated WAL");
        Ok(())
    }

    /// Syncs pending appends.
    pub fn sync(&self) -> Result<(), WalError> {
        self.writer
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?
            .handle
            .sync()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &WalHeader {
        &self.header
    }
}

impl<T: WalData> Drop for Wal<T> {
    fn drop(&mut self) {
        match self.writer.get_mut() {
            Ok(writer) => {
                if let Err(e) = writer.handle.sync() {
                    error!("Failed to sync WAL on drop: {}", e);
                }
            }
            Err(poisoned) => {
                if let Err(e) = poisoned.into_inner().handle.sync() {
                    error!("Failed to sync WAL (poisoned) on drop: {}", e);
                } else {
                    warn!("Recovered and synced WAL after poisoned lock");
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WalIter
// ------------------------------------------------------------------------------------------------

/// Replay iterator over a snapshot of the log.
///
/// Yields records in append order. A malformed record is reported once as
/// `Err` and ends the iteration.
pub struct WalIter<T: WalData> {
    data: ReadHandle,
    offset: usize,
    max_record_size: usize,
    done: bool,
    _phantom: PhantomData<T>,
}

impl<T: WalData> Iterator for WalIter<T> {
    type Item = Result<T, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.data.len() {
            return None;
        }
        match parse_record::<T>(&self.data, self.offset, self.max_record_size) {
            Ok((record, next)) => {
                self.offset = next;
                Some(Ok(record))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
