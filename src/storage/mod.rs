//! Storage capability.
//!
//! Every byte the database persists goes through a [`Storage`]
//! implementation. The engine never touches `std::fs` directly, so the same
//! code runs against a real directory ([`DiskStorage`]) or an in-process
//! map ([`MemStorage`]) used by tests.
//!
//! The capability is intentionally small:
//!
//! - sequential writers ([`WriteHandle`]) for new files and appends,
//! - immutable random-access views ([`ReadHandle`]) for reading,
//! - directory listing, existence checks, removal, and atomic rename.
//!
//! A [`ReadHandle`] is a snapshot: bytes appended to a file after it was
//! opened are not visible through it. Tablets are immutable, and the WAL is
//! only read once during recovery, so this is all the engine needs.

#[cfg(test)]
pub(crate) mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use memmap2::Mmap;

// ------------------------------------------------------------------------------------------------
// Handles
// ------------------------------------------------------------------------------------------------

/// Sequential writer returned by [`Storage::create`] and [`Storage::append`].
pub trait WriteHandle: Write + Send {
    /// Flush buffered bytes and make them durable.
    fn sync(&mut self) -> io::Result<()>;
}

/// Cheaply cloneable, immutable view over a file's bytes.
#[derive(Clone)]
pub struct ReadHandle {
    bytes: Arc<dyn AsRef<[u8]> + Send + Sync>,
}

impl ReadHandle {
    /// Wraps an owned buffer.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    fn from_mmap(mmap: Mmap) -> Self {
        Self {
            bytes: Arc::new(MmapView(mmap)),
        }
    }
}

impl Deref for ReadHandle {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        (*self.bytes).as_ref()
    }
}

impl fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadHandle")
            .field("len", &self.len())
            .finish()
    }
}

struct MmapView(Mmap);

impl AsRef<[u8]> for MmapView {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ------------------------------------------------------------------------------------------------
// Capability
// ------------------------------------------------------------------------------------------------

/// File-level operations the engine relies on.
///
/// Paths are passed through as given; implementations decide how they map
/// onto the underlying medium.
pub trait Storage: Send + Sync + fmt::Debug {
    /// Create (or truncate) `path` for writing.
    fn create(&self, path: &Path) -> io::Result<Box<dyn WriteHandle>>;

    /// Open `path` for appending, creating it if absent.
    fn append(&self, path: &Path) -> io::Result<Box<dyn WriteHandle>>;

    /// Open an immutable view of `path`.
    fn open(&self, path: &Path) -> io::Result<ReadHandle>;

    /// Whether a file or directory exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Remove the file at `path`.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Atomically replace `to` with `from`.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Create `path` and any missing parents.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// File names (not full paths) directly inside `dir`, sorted.
    fn list(&self, dir: &Path) -> io::Result<Vec<String>>;

    /// Size of the file at `path` in bytes.
    fn len(&self, path: &Path) -> io::Result<u64>;

    /// `path` in a form that does not depend on the process working
    /// directory. The default returns it unchanged.
    fn absolute(&self, path: &Path) -> io::Result<PathBuf> {
        Ok(path.to_path_buf())
    }
}

// ------------------------------------------------------------------------------------------------
// DiskStorage
// ------------------------------------------------------------------------------------------------

/// [`Storage`] over the local filesystem.
///
/// Read views are memory-mapped.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskStorage;

impl DiskStorage {
    fn fsync_parent(path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            if let Ok(dir) = File::open(parent) {
                dir.sync_all()?;
            }
        }
        Ok(())
    }
}

struct DiskWriter {
    file: File,
}

impl Write for DiskWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl WriteHandle for DiskWriter {
    fn sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

impl Storage for DiskStorage {
    fn create(&self, path: &Path) -> io::Result<Box<dyn WriteHandle>> {
        let file = File::create(path)?;
        Ok(Box::new(DiskWriter { file }))
    }

    fn append(&self, path: &Path) -> io::Result<Box<dyn WriteHandle>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(DiskWriter { file }))
    }

    /// # Safety
    ///
    /// The mapping is read-only and the engine never rewrites a file in
    /// place: tablets are immutable and replacements go through
    /// [`Storage::rename`], which leaves existing mappings pointing at the
    /// old inode.
    fn open(&self, path: &Path) -> io::Result<ReadHandle> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            // Zero-length mappings are rejected on some platforms.
            return Ok(ReadHandle::from_vec(Vec::new()));
        }
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(ReadHandle::from_mmap(mmap))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)?;
        Self::fsync_parent(to)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn len(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn absolute(&self, path: &Path) -> io::Result<PathBuf> {
        std::path::absolute(path)
    }
}

// ------------------------------------------------------------------------------------------------
// MemStorage
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
}

/// In-memory [`Storage`] for tests.
///
/// Clones share the same file map, so a test can drop a database and reopen
/// it from a clone to exercise recovery.
#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    state: Arc<Mutex<MemState>>,
}

impl MemStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, MemState>> {
        lock_state(&self.state)
    }

    /// Returns a copy of a file's current contents.
    pub fn read_all(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.lock()?
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    /// Overwrites a file's contents, creating it if needed.
    pub fn write_all(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        self.lock()?.files.insert(path.to_path_buf(), bytes.to_vec());
        Ok(())
    }
}

fn lock_state(state: &Mutex<MemState>) -> io::Result<MutexGuard<'_, MemState>> {
    state
        .lock()
        .map_err(|_| io::Error::other("memory storage lock poisoned"))
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such file: {}", path.display()),
    )
}

/// Appends straight into the shared map; `sync` is a no-op.
struct MemWriter {
    state: Arc<Mutex<MemState>>,
    path: PathBuf,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock_state(&self.state)?;
        match state.files.get_mut(&self.path) {
            Some(file) => {
                file.extend_from_slice(buf);
                Ok(buf.len())
            }
            None => Err(not_found(&self.path)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteHandle for MemWriter {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MemStorage {
    fn check_parent(state: &MemState, path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !state.dirs.contains(parent) => {
                Err(not_found(parent))
            }
            _ => Ok(()),
        }
    }

    fn writer(&self, path: &Path) -> Box<dyn WriteHandle> {
        Box::new(MemWriter {
            state: Arc::clone(&self.state),
            path: path.to_path_buf(),
        })
    }
}

impl Storage for MemStorage {
    fn create(&self, path: &Path) -> io::Result<Box<dyn WriteHandle>> {
        let mut state = self.lock()?;
        Self::check_parent(&state, path)?;
        state.files.insert(path.to_path_buf(), Vec::new());
        drop(state);
        Ok(self.writer(path))
    }

    fn append(&self, path: &Path) -> io::Result<Box<dyn WriteHandle>> {
        let mut state = self.lock()?;
        Self::check_parent(&state, path)?;
        state.files.entry(path.to_path_buf()).or_default();
        drop(state);
        Ok(self.writer(path))
    }

    fn open(&self, path: &Path) -> io::Result<ReadHandle> {
        self.read_all(path).map(ReadHandle::from_vec)
    }

    fn exists(&self, path: &Path) -> bool {
        match self.lock() {
            Ok(state) => state.files.contains_key(path) || state.dirs.contains(path),
            Err(_) => false,
        }
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.lock()?
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut state = self.lock()?;
        Self::check_parent(&state, to)?;
        let bytes = state.files.remove(from).ok_or_else(|| not_found(from))?;
        state.files.insert(to.to_path_buf(), bytes);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock()?;
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            state.dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<String>> {
        let state = self.lock()?;
        if !state.dirs.contains(dir) {
            return Err(not_found(dir));
        }
        // BTreeMap order keeps the result sorted.
        Ok(state
            .files
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect())
    }

    fn len(&self, path: &Path) -> io::Result<u64> {
        self.lock()?
            .files
            .get(path)
            .map(|f| f.len() as u64)
            .ok_or_else(|| not_found(path))
    }
}
