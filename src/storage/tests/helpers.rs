use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::storage::{MemStorage, ReadHandle, Storage, WriteHandle};

/// [`MemStorage`] wrapper whose writers can be told to fail.
///
/// An armed failure stores the first half of the buffer it was given and
/// then returns a "disk full" error, leaving a partial write behind the
/// way a real device would.
#[derive(Debug, Clone)]
pub struct FaultyStorage {
    inner: MemStorage,
    failures_left: Arc<AtomicUsize>,
}

impl FaultyStorage {
    pub fn new(inner: MemStorage) -> Self {
        Self {
            inner,
            failures_left: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The next `n` writes, through any handle, fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn wrap(&self, inner: Box<dyn WriteHandle>) -> Box<dyn WriteHandle> {
        Box::new(FaultyWriter {
            inner,
            failures_left: Arc::clone(&self.failures_left),
        })
    }
}

struct FaultyWriter {
    inner: Box<dyn WriteHandle>,
    failures_left: Arc<AtomicUsize>,
}

impl Write for FaultyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let armed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            self.inner.write_all(&buf[..buf.len() / 2])?;
            return Err(io::Error::other("disk full"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl WriteHandle for FaultyWriter {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.sync()
    }
}

impl Storage for FaultyStorage {
    fn create(&self, path: &Path) -> io::Result<Box<dyn WriteHandle>> {
        Ok(self.wrap(self.inner.create(path)?))
    }

    fn append(&self, path: &Path) -> io::Result<Box<dyn WriteHandle>> {
        Ok(self.wrap(self.inner.append(path)?))
    }

    fn open(&self, path: &Path) -> io::Result<ReadHandle> {
        self.inner.open(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.inner.remove(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.rename(from, to)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path)
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<String>> {
        self.inner.list(dir)
    }

    fn len(&self, path: &Path) -> io::Result<u64> {
        self.inner.len(path)
    }
}
