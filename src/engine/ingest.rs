//! Streaming tablet ingestion helpers.

use std::io::{self, Read, Write};

use crossbeam::channel::Sender;

use super::EngineError;
use super::manifest::MANIFEST_FILE_NAME;
use super::WAL_FILE_NAME;

/// Bytes read from the source per chunk.
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Receives progress while a tablet stream is being consumed.
///
/// `on_progress` is called after every chunk with the cumulative number of
/// bytes persisted so far.
pub trait ProgressSink {
    fn on_progress(&self, bytes: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(u64),
{
    fn on_progress(&self, bytes: u64) {
        self(bytes)
    }
}

impl ProgressSink for Sender<u64> {
    fn on_progress(&self, bytes: u64) {
        // A dropped receiver just means nobody is watching.
        let _ = self.send(bytes);
    }
}

/// Copies `reader` into `writer` verbatim, reporting cumulative progress.
pub(crate) fn copy_stream(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    progress: Option<&dyn ProgressSink>,
) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
        if let Some(sink) = progress {
            sink.on_progress(total);
        }
    }
    Ok(total)
}

/// Checks that `name` can be used as the file name of a new tablet.
pub(crate) fn validate_tablet_name(name: &str) -> Result<(), EngineError> {
    let reject = |why: &str| Err(EngineError::InvalidArgument(format!("tablet name {name:?} {why}")));

    if name.is_empty() {
        return reject("is empty");
    }
    if name == "." || name == ".." {
        return reject("is not a file name");
    }
    if name.contains(['/', '\\', '\n', '\0']) {
        return reject("must be a plain file name");
    }
    if name == WAL_FILE_NAME || name == MANIFEST_FILE_NAME {
        return reject("is reserved");
    }
    if name.ends_with(".tmp") {
        return reject("uses the reserved .tmp suffix");
    }
    Ok(())
}
