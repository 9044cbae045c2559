//! # Storage Engine
//!
//! Coordinates the memtable, the WAL and the list of tablets behind one
//! `Arc<RwLock<EngineInner>>`.
//!
//! ## Layers
//!
//! Queried in precedence order, highest first:
//!
//! 1. **Memtable**: the latest in-process writes and deletes, rebuilt on
//!    open by replaying the WAL.
//! 2. **Tablets**, newest push first. When two tablets hold the same key,
//!    the one pushed (or flushed) later wins.
//!
//! ## Persisted layout
//!
//! ```text
//! <location>/wal.log            write-ahead log
//! <location>/TABLETS            tablet list, push order
//! <location>/tablet-000001.tab  tablets written by flush
//! <location>/<name>             tablets ingested by push_tablet_stream
//! ```
//!
//! Open removes only the staging files the engine itself writes
//! (`TABLETS.tmp`, `wal.log.tmp`, `tablet-NNNNNN.tab.tmp` and
//! `<name>.ingest.tmp`); anything else in the location is left alone.
//!
//! ## Guarantees
//!
//! - **Durability:** every `put`/`delete` is appended to the WAL before it
//!   is applied to the memtable.
//! - **All-or-nothing ingestion:** a streamed tablet is copied to a
//!   `.ingest.tmp` file and validated before it is renamed into place and listed;
//!   readers never observe a partial tablet.
//! - **Snapshot reads:** [`Engine::find`] copies the memtable range and
//!   holds `Arc` handles on the tablets at creation time.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::codec::CodecRegistry;
use crate::memtable::Memtable;
use crate::storage::Storage;
use crate::tablet::{GetResult, Tablet, TabletError, TabletOptions, TabletWriter};
use crate::wal::{Wal, WalError, WalHeader, WalRecord};

mod ingest;
mod manifest;
pub mod merge;

pub use ingest::ProgressSink;
pub use manifest::MANIFEST_FILE_NAME;
pub use merge::{MergeIterator, VisibilityFilter};

use ingest::{copy_stream, validate_tablet_name};
use manifest::{MANIFEST_TMP_FILE_NAME, ManifestEntry, TabletManifest};

#[cfg(test)]
mod tests;

pub const WAL_FILE_NAME: &str = "wal.log";

const FLUSH_TABLET_PREFIX: &str = "tablet-";
const FLUSH_TABLET_SUFFIX: &str = ".tab";

/// Suffix of the file a tablet stream is staged in before it is published.
const INGEST_STAGING_SUFFIX: &str = ".ingest.tmp";

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// State of a key within one sorted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Value(Vec<u8>),
    /// The key was deleted; shadows older runs.
    Tombstone,
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("Tablet error: {0}")]
    Tablet(#[from] TabletError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The `TABLETS` file is unreadable.
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Caller-supplied input was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Engine is closed")]
    Closed,

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration & stats
// ------------------------------------------------------------------------------------------------

/// Configuration for an [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Options for tablets written by [`Engine::flush`].
    pub tablet: TabletOptions,

    /// Codecs available when reading tablets.
    pub codecs: CodecRegistry,

    /// Record size limit for a newly created WAL.
    pub max_wal_record_size: u32,

    /// Sync the WAL after every append.
    pub sync_wal: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tablet: TabletOptions::default(),
            codecs: CodecRegistry::default(),
            max_wal_record_size: WalHeader::DEFAULT_MAX_RECORD_SIZE,
            sync_wal: true,
        }
    }
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Keys held by the memtable, tombstones included.
    pub memtable_entries: usize,
    /// Approximate memtable footprint in bytes.
    pub memtable_bytes: usize,
    /// Number of tablets.
    pub tablet_count: usize,
    /// Sum of all tablet file sizes in bytes.
    pub total_tablet_bytes: u64,
    /// Per-tablet file sizes in bytes, push order.
    pub tablet_sizes: Vec<u64>,
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

struct EngineInner {
    storage: Arc<dyn Storage>,

    /// Database location.
    dir: PathBuf,

    memtable: Memtable,

    /// `None` once the engine is closed.
    wal: Option<Wal<WalRecord>>,

    /// Tablets in push order (oldest first).
    tablets: Vec<Arc<Tablet>>,

    /// Mirrors `tablets`, one entry per tablet.
    manifest: TabletManifest,

    /// Sequence number for the next flushed tablet's file name.
    next_flush_seq: u64,

    config: EngineConfig,
}

impl EngineInner {
    fn wal(&self) -> Result<&Wal<WalRecord>, EngineError> {
        self.wal.as_ref().ok_or(EngineError::Closed)
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        self.wal().map(|_| ())
    }
}

/// The storage engine handle.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<RwLock<EngineInner>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

/// Merged, tombstone-free view produced by [`Engine::find`].
pub type FindIterator = VisibilityFilter<MergeIterator<'static>>;

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    /// Acquires a read lock on the engine state.
    fn read_lock(&self) -> Result<RwLockReadGuard<'_, EngineInner>, EngineError> {
        self.inner
            .read()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    /// Acquires a write lock on the engine state.
    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, EngineInner>, EngineError> {
        self.inner
            .write()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens (or creates) an engine rooted at `dir` on `storage`.
    ///
    /// 1. Creates the location if needed and removes staging files left by
    ///    an interrupted flush, ingest or manifest update.
    /// 2. Opens the WAL (repairing a torn tail) and replays it into a fresh
    ///    memtable.
    /// 3. Loads every tablet listed in `TABLETS`, in push order. Any tablet
    ///    that fails to open aborts the whole open.
    pub fn open(
        dir: impl AsRef<Path>,
        storage: Arc<dyn Storage>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();

        // 1. Location and orphans.
        storage.create_dir_all(&dir)?;
        for name in storage.list(&dir)? {
            if is_engine_temporary(&name) {
                warn!(file = %name, "removing leftover temporary file");
                storage.remove(&dir.join(&name))?;
            }
        }

        // 2. WAL replay.
        let wal = Wal::<WalRecord>::open(
            Arc::clone(&storage),
            &dir.join(WAL_FILE_NAME),
            config.max_wal_record_size,
            config.sync_wal,
        )?;
        let memtable = Memtable::try_replay(wal.replay_iter()?)?;

        // 3. Tablets.
        let manifest = TabletManifest::load(storage.as_ref(), &dir)?;
        let mut tablets = Vec::with_capacity(manifest.entries().len());
        let mut next_flush_seq = 1;
        for entry in manifest.entries() {
            let path = entry.resolve(&dir);
            let tablet = Tablet::open(storage.as_ref(), &path, &config.codecs)?;
            debug!(
                path = %path.display(),
                records = tablet.properties().record_count,
                bytes = tablet.file_size(),
                "tablet loaded"
            );
            tablets.push(Arc::new(tablet));

            if let Some(seq) = entry.local_name().and_then(flush_seq_of) {
                next_flush_seq = next_flush_seq.max(seq + 1);
            }
        }

        info!(
            path = %dir.display(),
            memtable_entries = memtable.len(),
            tablets = tablets.len(),
            "engine opened"
        );

        Ok(Self {
            inner: Arc::new(RwLock::new(EngineInner {
                storage,
                dir,
                memtable,
                wal: Some(wal),
                tablets,
                manifest,
                next_flush_seq,
                config,
            })),
        })
    }

    /// Syncs and closes the WAL and releases tablet handles.
    ///
    /// Iterators returned by [`find`](Self::find) keep their own handles
    /// and stay usable. Closing twice is harmless.
    pub fn close(&self) -> Result<(), EngineError> {
        let mut inner = self.write_lock()?;
        let Some(wal) = inner.wal.take() else {
            return Ok(());
        };
        wal.sync()?;
        drop(wal);
        inner.tablets.clear();
        inner.memtable.clear();
        info!(path = %inner.dir.display(), "engine closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts or overwrites a key.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), EngineError> {
        trace!(key = %HexKey(&key), value_len = value.len(), "engine put");
        self.apply(WalRecord::Put { key, value })
    }

    /// Installs a tombstone for a key, present or not.
    pub fn delete(&self, key: Vec<u8>) -> Result<(), EngineError> {
        trace!(key = %HexKey(&key), "engine delete");
        self.apply(WalRecord::Delete { key })
    }

    fn apply(&self, record: WalRecord) -> Result<(), EngineError> {
        let mut guard = self.write_lock()?;
        let inner = &mut *guard;

        // 1. WAL first (crash safety)
        inner.wal()?.append(&record)?;

        // 2. In-memory update
        inner.memtable.apply(record);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Looks up a single key.
    ///
    /// Returns `Ok(None)` when the key was never written or its winning
    /// record is a tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        trace!(key = %HexKey(key), "engine get");
        let inner = self.read_lock()?;
        inner.ensure_open()?;

        if let Some(entry) = inner.memtable.get(key) {
            return Ok(match entry {
                Entry::Value(value) => Some(value.clone()),
                Entry::Tombstone => None,
            });
        }

        for tablet in inner.tablets.iter().rev() {
            match tablet.get(key)? {
                GetResult::Value(value) => return Ok(Some(value)),
                GetResult::Tombstone => return Ok(None),
                GetResult::NotFound => {}
            }
        }
        Ok(None)
    }

    /// Ascending live pairs starting at the first key `>= from`, or at the
    /// smallest key when `from` is `None`.
    pub fn find(&self, from: Option<&[u8]>) -> Result<FindIterator, EngineError> {
        let inner = self.read_lock()?;
        inner.ensure_open()?;

        let mut sources: Vec<merge::Source<'static>> = Vec::with_capacity(inner.tablets.len() + 1);

        // Memtable: copied so the iterator outlives the lock.
        let snapshot: Vec<(Vec<u8>, Entry)> = inner
            .memtable
            .scan(from)
            .map(|(k, e)| (k.to_vec(), e.clone()))
            .collect();
        sources.push(Box::new(snapshot.into_iter().map(Ok::<_, EngineError>)));

        // Tablets, newest first.
        for tablet in inner.tablets.iter().rev() {
            let iter = tablet.seek(from)?;
            sources.push(Box::new(iter.map(|r| r.map_err(EngineError::from))));
        }

        trace!(
            from = ?from.map(HexKey),
            runs = sources.len(),
            "engine find"
        );
        Ok(VisibilityFilter::new(MergeIterator::new(sources)))
    }

    /// Returns a snapshot of engine statistics.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let inner = self.read_lock()?;
        inner.ensure_open()?;

        let tablet_sizes: Vec<u64> = inner.tablets.iter().map(|t| t.file_size()).collect();
        Ok(EngineStats {
            memtable_entries: inner.memtable.len(),
            memtable_bytes: inner.memtable.approximate_size(),
            tablet_count: inner.tablets.len(),
            total_tablet_bytes: tablet_sizes.iter().sum(),
            tablet_sizes,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Tablet ingestion
    // --------------------------------------------------------------------------------------------

    /// Adds the existing tablet at `path` as the newest run. No bytes are
    /// copied; the file must stay where it is.
    ///
    /// A file inside the database location must have a name
    /// `push_tablet_stream` would accept. Relative paths outside it are
    /// made absolute before they are recorded.
    pub fn push_tablet(&self, path: &Path) -> Result<(), EngineError> {
        let mut guard = self.write_lock()?;
        let inner = &mut *guard;
        inner.ensure_open()?;

        let dir = inner.storage.absolute(&inner.dir)?;
        let path = inner.storage.absolute(path)?;
        let entry = ManifestEntry::for_path(&dir, &path)?;
        if inner.manifest.contains(&entry) {
            return Err(EngineError::InvalidArgument(format!(
                "tablet {} is already part of the database",
                path.display()
            )));
        }

        let tablet = Tablet::open(inner.storage.as_ref(), &path, &inner.config.codecs)?;
        let manifest = inner.manifest.with_entry(entry);
        manifest.store(inner.storage.as_ref(), &inner.dir)?;

        info!(
            path = %path.display(),
            records = tablet.properties().record_count,
            "tablet pushed"
        );
        inner.manifest = manifest;
        inner.tablets.push(Arc::new(tablet));
        Ok(())
    }

    /// Consumes `reader`, persisting its bytes verbatim as `name` inside the
    /// database location, and adds the result as the newest run.
    ///
    /// The bytes go to `name.ingest.tmp` first and are validated as a tablet
    /// (footer, metadata and every data block) before the file is renamed
    /// and listed. On any failure the temporary file is removed and the
    /// visible state is unchanged.
    ///
    /// Returns the number of bytes ingested.
    pub fn push_tablet_stream(
        &self,
        reader: &mut dyn Read,
        name: &str,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<u64, EngineError> {
        validate_tablet_name(name)?;

        let (storage, dir, codecs) = {
            let inner = self.read_lock()?;
            inner.ensure_open()?;
            (
                Arc::clone(&inner.storage),
                inner.dir.clone(),
                inner.config.codecs.clone(),
            )
        };
        let path = dir.join(name);
        if storage.exists(&path) {
            return Err(EngineError::InvalidArgument(format!(
                "tablet name {name:?} already exists"
            )));
        }

        // 1. Copy + validate without holding the lock.
        let tmp_path = dir.join(format!("{name}{INGEST_STAGING_SUFFIX}"));
        let staged = stage_tablet(storage.as_ref(), &tmp_path, &path, reader, progress, &codecs);
        let (tablet, bytes) = match staged {
            Ok(staged) => staged,
            Err(e) => {
                warn!(name, error = %e, "tablet stream rejected");
                let _ = storage.remove(&tmp_path);
                return Err(e);
            }
        };

        // 2. Publish.
        let mut guard = self.write_lock()?;
        let inner = &mut *guard;
        let published = inner.ensure_open().and_then(|()| {
            if inner.manifest.contains_local(name) || storage.exists(&path) {
                return Err(EngineError::InvalidArgument(format!(
                    "tablet name {name:?} already exists"
                )));
            }
            storage.rename(&tmp_path, &path)?;
            let manifest = inner.manifest.with_entry(ManifestEntry::Local(name.to_owned()));
            if let Err(e) = manifest.store(storage.as_ref(), &dir) {
                let _ = storage.remove(&path);
                return Err(e);
            }
            Ok(manifest)
        });
        let manifest = match published {
            Ok(manifest) => manifest,
            Err(e) => {
                let _ = storage.remove(&tmp_path);
                return Err(e);
            }
        };

        info!(name, bytes, records = tablet.properties().record_count, "tablet stream ingested");
        inner.manifest = manifest;
        inner.tablets.push(Arc::new(tablet));
        Ok(bytes)
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Writes the memtable (tombstones included) as a new tablet, makes it
    /// the newest run, then clears the memtable and truncates the WAL.
    ///
    /// Returns the new tablet's path, or `None` when the memtable is empty.
    pub fn flush(&self) -> Result<Option<PathBuf>, EngineError> {
        let mut guard = self.write_lock()?;
        let inner = &mut *guard;
        inner.ensure_open()?;

        if inner.memtable.is_empty() {
            return Ok(None);
        }

        let (name, path) = loop {
            let name = format!(
                "{FLUSH_TABLET_PREFIX}{:06}{FLUSH_TABLET_SUFFIX}",
                inner.next_flush_seq
            );
            inner.next_flush_seq += 1;
            let path = inner.dir.join(&name);
            if !inner.storage.exists(&path) && !inner.manifest.contains_local(&name) {
                break (name, path);
            }
        };

        // 1. Tablet, then manifest: both durable before the WAL is dropped.
        let count = inner.memtable.len();
        TabletWriter::new(inner.config.tablet.clone()).write_to_storage(
            inner.storage.as_ref(),
            &path,
            inner.memtable.iter_all(),
            count,
        )?;
        let tablet = Tablet::open(inner.storage.as_ref(), &path, &inner.config.codecs)?;
        let manifest = inner.manifest.with_entry(ManifestEntry::Local(name));
        if let Err(e) = manifest.store(inner.storage.as_ref(), &inner.dir) {
            let _ = inner.storage.remove(&path);
            return Err(e);
        }
        inner.manifest = manifest;
        inner.tablets.push(Arc::new(tablet));

        // 2. Memtable and WAL. Replaying a WAL that survived a crash here
        //    just re-applies writes the new tablet already holds.
        inner.memtable.clear();
        if let Some(wal) = inner.wal.as_mut() {
            wal.truncate()?;
        }

        info!(path = %path.display(), records = count, "memtable flushed");
        Ok(Some(path))
    }
}

/// Copies the stream into `tmp_path` and validates it as a tablet that will
/// live at `final_path`.
fn stage_tablet(
    storage: &dyn Storage,
    tmp_path: &Path,
    final_path: &Path,
    reader: &mut dyn Read,
    progress: Option<&dyn ProgressSink>,
    codecs: &CodecRegistry,
) -> Result<(Tablet, u64), EngineError> {
    let mut writer = storage.create(tmp_path)?;
    let bytes = copy_stream(reader, &mut writer, progress)?;
    writer.sync()?;
    drop(writer);

    let data = storage.open(tmp_path)?;
    let tablet = Tablet::from_handle(final_path.to_path_buf(), data, codecs)?;
    tablet.verify()?;
    Ok((tablet, bytes))
}

/// Sequence number of a flushed tablet's file name.
fn flush_seq_of(name: &str) -> Option<u64> {
    name.strip_prefix(FLUSH_TABLET_PREFIX)?
        .strip_suffix(FLUSH_TABLET_SUFFIX)?
        .parse()
        .ok()
}

/// Whether `name` is a staging file written by the engine (manifest
/// replace, WAL repair, flush or stream ingest).
fn is_engine_temporary(name: &str) -> bool {
    if name == MANIFEST_TMP_FILE_NAME || name.ends_with(INGEST_STAGING_SUFFIX) {
        return true;
    }
    match name.strip_suffix(".tmp") {
        Some(stem) => stem == WAL_FILE_NAME || flush_seq_of(stem).is_some(),
        None => false,
    }
}

// ------------------------------------------------------------------------------------------------
// Tracing Helper
// ------------------------------------------------------------------------------------------------

/// Bounded hex rendering of a key for log lines and error messages.
#[derive(Clone, Copy)]
pub(crate) struct HexKey<'a>(pub &'a [u8]);

impl fmt::Display for HexKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{:02x}", byte)?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{:02x}", byte)?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
