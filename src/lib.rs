//! # tabletdb
//!
//! An embeddable, persistent key-value store. Recent writes live in a
//! WAL-backed in-memory **memtable**; everything else lives in immutable,
//! sorted, block-compressed files called **tablets**. Reads merge all
//! layers, newest first.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tabletdb::{Db, DbConfig, DbError};
//!
//! let db = Db::open("/tmp/my_db", DbConfig::default()).unwrap();
//!
//! // Write
//! db.put(b"hello", b"world").unwrap();
//!
//! // Read
//! assert_eq!(db.get(b"hello").unwrap(), b"world".to_vec());
//!
//! // Delete
//! db.delete(b"hello").unwrap();
//! assert!(matches!(db.get(b"hello"), Err(DbError::NotFound)));
//!
//! // Ordered iteration
//! db.put(b"a", b"1").unwrap();
//! db.put(b"b", b"2").unwrap();
//! let pairs: Vec<_> = db.find(None).unwrap().collect::<Result<_, _>>().unwrap();
//! assert_eq!(pairs.len(), 2);
//!
//! // Bulk load a pre-built tablet from any reader
//! let bytes = std::fs::read("/tmp/export.tab").unwrap();
//! db.push_tablet_stream(bytes.as_slice(), "export.tab", None).unwrap();
//!
//! db.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Write-ahead logging**: every mutation is persisted before it is applied.
//! - **Tablets**: prefix-compressed, Snappy-compressed, CRC-checked blocks
//!   with a bloom filter per file.
//! - **All-or-nothing ingestion** of tablets streamed from any `Read`.
//! - **Crash recovery**: torn WAL tails are repaired on open.
//! - **Pluggable storage**: [`storage::DiskStorage`] or the in-memory
//!   [`storage::MemStorage`].

pub mod codec;
pub mod encoding;
pub(crate) mod engine;
pub(crate) mod memtable;
pub mod storage;
pub mod tablet;
pub(crate) mod wal;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use engine::{Engine, EngineConfig, EngineError, FindIterator};
use thiserror::Error;
use tracing::{error, info};

use codec::CodecRegistry;
use storage::{DiskStorage, Storage};
use tablet::{TabletError, TabletOptions};
use wal::{WalError, WalHeader};

pub use engine::{EngineStats as DbStats, Entry, ProgressSink};

/// A single key-value pair yielded by [`Db::find`].
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Smallest accepted tablet block size in bytes.
const MIN_BLOCK_SIZE: usize = 64;

/// Smallest accepted WAL record limit in bytes.
const MIN_WAL_RECORD_SIZE: u32 = 64;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
///
/// All fields have sensible defaults via [`DbConfig::default()`].
/// The configuration is validated when passed to [`Db::open`].
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use tabletdb::DbConfig;
/// use tabletdb::codec::IdentityCodec;
/// use tabletdb::tablet::TabletOptions;
///
/// // Defaults: 4 KiB Snappy blocks, fsync on every write.
/// let config = DbConfig::default();
///
/// // Uncompressed 16 KiB blocks, no per-write fsync.
/// let config = DbConfig {
///     tablet: TabletOptions {
///         block_size: 16 * 1024,
///         codec: Arc::new(IdentityCodec),
///         ..TabletOptions::default()
///     },
///     sync_wal: false,
///     ..DbConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Layout of tablets written by [`Db::flush`].
    ///
    /// Default: 4 KiB blocks, restart point every 16 keys, Snappy.
    /// `block_size` must be ≥ 64 and `key_restart_interval` ≥ 1.
    pub tablet: TabletOptions,

    /// Codecs the reader may resolve by id. Must contain the codec in
    /// `tablet.codec`.
    ///
    /// Default: identity and Snappy.
    pub codecs: CodecRegistry,

    /// Largest WAL record accepted, fixed when the WAL file is created.
    ///
    /// Default: 1 MiB. Must be ≥ 64.
    pub max_wal_record_size: u32,

    /// Fsync the WAL after every `put`/`delete`.
    ///
    /// Default: `true`.
    pub sync_wal: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            tablet: TabletOptions::default(),
            codecs: CodecRegistry::default(),
            max_wal_record_size: WalHeader::DEFAULT_MAX_RECORD_SIZE,
            sync_wal: true,
        }
    }
}

impl DbConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), DbError> {
        if self.tablet.block_size < MIN_BLOCK_SIZE {
            return Err(DbError::InvalidConfig(format!(
                "tablet.block_size must be >= {MIN_BLOCK_SIZE}"
            )));
        }
        if self.tablet.key_restart_interval < 1 {
            return Err(DbError::InvalidConfig(
                "tablet.key_restart_interval must be >= 1".into(),
            ));
        }
        if self.max_wal_record_size < MIN_WAL_RECORD_SIZE {
            return Err(DbError::InvalidConfig(format!(
                "max_wal_record_size must be >= {MIN_WAL_RECORD_SIZE}"
            )));
        }
        let codec_id = self.tablet.codec.id();
        if !self.codecs.contains(codec_id) {
            return Err(DbError::InvalidConfig(format!(
                "codec {} (id {codec_id}) is not in the codec registry",
                self.tablet.codec.name()
            )));
        }
        Ok(())
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            tablet: self.tablet.clone(),
            codecs: self.codecs.clone(),
            max_wal_record_size: self.max_wal_record_size,
            sync_wal: self.sync_wal,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The key is absent from every layer, or its newest record is a
    /// deletion.
    #[error("key not found")]
    NotFound,

    /// The storage medium could not be read or written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted data failed validation (checksum, header, footer, index,
    /// block or codec).
    #[error("format error: {0}")]
    Format(String),

    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Argument rejected: unsorted tablet input, bad tablet name, name
    /// collision, oversized record.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for DbError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Wal(WalError::Io(e)) => DbError::Io(e),
            EngineError::Wal(e @ WalError::RecordTooLarge { .. }) => {
                DbError::InvalidArgument(e.to_string())
            }
            EngineError::Wal(WalError::Internal(msg)) => DbError::Internal(msg),
            EngineError::Wal(e) => DbError::Format(e.to_string()),
            EngineError::Tablet(TabletError::Io(e)) => DbError::Io(e),
            EngineError::Tablet(TabletError::InvalidInput(msg)) => DbError::InvalidArgument(msg),
            EngineError::Tablet(e) => DbError::Format(e.to_string()),
            EngineError::Io(e) => DbError::Io(e),
            EngineError::Manifest(msg) => DbError::Format(msg),
            EngineError::InvalidArgument(msg) => DbError::InvalidArgument(msg),
            EngineError::Closed => DbError::Closed,
            EngineError::Internal(msg) => DbError::Internal(msg),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Find iterator
// ------------------------------------------------------------------------------------------------

/// Ascending, tombstone-free `(key, value)` pairs returned by [`Db::find`].
///
/// The memtable part is copied when the iterator is created and tablets
/// are read through their own handles, so later writes are not observed
/// and the iterator stays valid after [`Db::close`]. After the first error
/// the iterator is exhausted.
pub struct FindIter {
    inner: FindIterator,
}

impl Iterator for FindIter {
    type Item = Result<KeyValue, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| item.map_err(DbError::from))
    }
}

impl std::fmt::Debug for FindIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FindIter").finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The main database handle.
///
/// # Thread safety
///
/// `Db` is `Send + Sync`; every operation takes an internal lock, so it
/// can be shared across threads via `Arc<Db>`.
///
/// # Layers
///
/// A lookup consults the memtable first, then tablets from the most
/// recently pushed (or flushed) to the oldest. The first record found for
/// a key decides the answer, including deletions.
///
/// # Shutdown
///
/// Call [`Db::close`] for a graceful shutdown. If the handle is dropped
/// without calling `close`, the destructor closes it and logs any error.
pub struct Db {
    engine: Engine,
    path: PathBuf,
    closed: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.path)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens (or creates) a database in the given directory on the local
    /// filesystem.
    ///
    /// A fresh directory yields an empty database. An existing one is
    /// recovered: the WAL is replayed (a torn tail is truncated) and every
    /// listed tablet is loaded.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidConfig`] if any configuration parameter
    /// is out of range, and [`DbError::Format`] / [`DbError::Io`] if a
    /// listed tablet cannot be loaded.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        Self::open_with_storage(path, config, Arc::new(DiskStorage))
    }

    /// Same as [`open`](Self::open), on an arbitrary [`Storage`].
    pub fn open_with_storage(
        path: impl AsRef<Path>,
        config: DbConfig,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, DbError> {
        config.validate()?;

        let engine = Engine::open(&path, storage, config.to_engine_config())?;

        info!(path = %path.as_ref().display(), "database opened");

        Ok(Self {
            engine,
            path: path.as_ref().to_path_buf(),
            closed: AtomicBool::new(false),
        })
    }

    /// Syncs and closes the WAL and releases all tablet handles.
    ///
    /// Subsequent operations on this handle return [`DbError::Closed`].
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(()); // Already closed.
        }

        self.engine.close()?;

        info!(path = %self.path.display(), "database closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Inserts or updates a key-value pair.
    ///
    /// The write is persisted to the WAL before being applied in memory.
    /// Empty keys and values are allowed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if the record exceeds
    /// `max_wal_record_size`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.check_open()?;
        Ok(self.engine.put(key.to_vec(), value.to_vec())?)
    }

    /// Deletes a key. Deleting an absent key is not an error.
    pub fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        self.check_open()?;
        Ok(self.engine.delete(key.to_vec())?)
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Retrieves the value associated with a key.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if the key does not exist or has been
    /// deleted.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, DbError> {
        self.check_open()?;
        self.engine.get(key)?.ok_or(DbError::NotFound)
    }

    /// Iterates live pairs in ascending key order, starting at the first
    /// key `>= from` (or the smallest key when `from` is `None`).
    pub fn find(&self, from: Option<&[u8]>) -> Result<FindIter, DbError> {
        self.check_open()?;
        Ok(FindIter {
            inner: self.engine.find(from)?,
        })
    }

    /// Returns a snapshot of database statistics.
    pub fn stats(&self) -> Result<DbStats, DbError> {
        self.check_open()?;
        Ok(self.engine.stats()?)
    }

    // --------------------------------------------------------------------------------------------
    // Tablets
    // --------------------------------------------------------------------------------------------

    /// Adds the tablet file at `path` as the newest layer.
    ///
    /// The file is validated and referenced in place, not copied. A
    /// relative path is resolved against the working directory at the time
    /// of the call.
    ///
    /// # Errors
    ///
    /// [`DbError::InvalidArgument`] if the tablet is already part of the
    /// database, or lies inside the database directory under a reserved
    /// name (`wal.log`, `TABLETS`, `*.tmp`). [`DbError::Format`] /
    /// [`DbError::Io`] if it cannot be loaded.
    pub fn push_tablet(&self, path: impl AsRef<Path>) -> Result<(), DbError> {
        self.check_open()?;
        Ok(self.engine.push_tablet(path.as_ref())?)
    }

    /// Reads a tablet from `reader` until end of stream, stores it verbatim
    /// as `name` in the database directory, and adds it as the newest
    /// layer.
    ///
    /// `progress`, if given, receives the cumulative number of bytes read
    /// after each chunk. The tablet becomes visible only after it has been
    /// fully written and validated; on failure nothing changes.
    ///
    /// Returns the number of bytes ingested.
    ///
    /// # Errors
    ///
    /// [`DbError::InvalidArgument`] for a name that is not a plain file
    /// name, is reserved, or is taken. [`DbError::Io`] if the reader fails.
    /// [`DbError::Format`] if the bytes are not a valid tablet.
    pub fn push_tablet_stream<R: Read>(
        &self,
        mut reader: R,
        name: &str,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<u64, DbError> {
        self.check_open()?;
        Ok(self.engine.push_tablet_stream(&mut reader, name, progress)?)
    }

    /// Writes the memtable out as a new tablet and truncates the WAL.
    ///
    /// Never called automatically. Returns the new tablet's path, or
    /// `None` when there was nothing to flush.
    pub fn flush(&self) -> Result<Option<PathBuf>, DbError> {
        self.check_open()?;
        Ok(self.engine.flush()?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(DbError::Closed)` if the database has been closed.
    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.engine.close() {
            error!(path = %self.path.display(), error = %e, "close on drop failed");
        }
    }
}
