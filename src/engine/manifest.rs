//! The `TABLETS` file: which tablets make up the database, in push order.
//!
//! # On-disk layout
//!
//! ```text
//! tabletdb-tablets v1
//! local tablet-000001.tab
//! local imported.tab
//! external /absolute/path/to/pushed.tab
//! ```
//!
//! UTF-8 text, one entry per line after the header line. A `local` entry is
//! a file name inside the database location and is resolved against it on
//! open. An `external` entry is a path pushed from elsewhere and is used
//! exactly as stored. The file is replaced atomically (write
//! `TABLETS.tmp`, sync, rename) on every change.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::storage::Storage;

use super::EngineError;
use super::ingest::validate_tablet_name;

pub const MANIFEST_FILE_NAME: &str = "TABLETS";

/// Staging name used while the manifest is replaced.
pub(crate) const MANIFEST_TMP_FILE_NAME: &str = "TABLETS.tmp";

const MANIFEST_HEADER: &str = "tabletdb-tablets v1";

const LOCAL_PREFIX: &str = "local ";
const EXTERNAL_PREFIX: &str = "external ";

/// One tablet listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEntry {
    /// File name inside the database location.
    Local(String),
    /// Path outside the location, as it should be opened.
    External(String),
}

impl ManifestEntry {
    /// Entry for the tablet at `path`, given the database location `dir`.
    ///
    /// Both paths must already be in the form the storage resolves (see
    /// [`Storage::absolute`]).
    pub fn for_path(dir: &Path, path: &Path) -> Result<Self, EngineError> {
        if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
            if parent == dir {
                let name = name.to_str().ok_or_else(|| not_utf8(path))?;
                validate_tablet_name(name)?;
                return Ok(Self::Local(name.to_owned()));
            }
        }
        let text = path.to_str().ok_or_else(|| not_utf8(path))?;
        if text.contains('\n') {
            return Err(EngineError::InvalidArgument(
                "tablet path contains a newline".into(),
            ));
        }
        Ok(Self::External(text.to_owned()))
    }

    /// Path to open for this entry in the database at `dir`.
    pub fn resolve(&self, dir: &Path) -> PathBuf {
        match self {
            Self::Local(name) => dir.join(name),
            Self::External(path) => PathBuf::from(path),
        }
    }

    /// The file name, for entries inside the location.
    pub fn local_name(&self) -> Option<&str> {
        match self {
            Self::Local(name) => Some(name.as_str()),
            Self::External(_) => None,
        }
    }

    fn parse(line: &str) -> Result<Self, EngineError> {
        if let Some(name) = line.strip_prefix(LOCAL_PREFIX) {
            validate_tablet_name(name)
                .map_err(|_| EngineError::Manifest(format!("bad local entry {name:?}")))?;
            Ok(Self::Local(name.to_owned()))
        } else if let Some(path) = line.strip_prefix(EXTERNAL_PREFIX) {
            if path.is_empty() {
                return Err(EngineError::Manifest("empty external entry".into()));
            }
            Ok(Self::External(path.to_owned()))
        } else {
            Err(EngineError::Manifest(format!("unrecognised entry {line:?}")))
        }
    }

    fn write_line(&self, out: &mut String) {
        match self {
            Self::Local(name) => {
                out.push_str(LOCAL_PREFIX);
                out.push_str(name);
            }
            Self::External(path) => {
                out.push_str(EXTERNAL_PREFIX);
                out.push_str(path);
            }
        }
        out.push('\n');
    }
}

fn not_utf8(path: &Path) -> EngineError {
    EngineError::InvalidArgument(format!("tablet path {} is not valid UTF-8", path.display()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabletManifest {
    entries: Vec<ManifestEntry>,
}

impl TabletManifest {
    /// Reads the manifest at `dir`; a missing file is an empty manifest.
    pub fn load(storage: &dyn Storage, dir: &Path) -> Result<Self, EngineError> {
        let path = dir.join(MANIFEST_FILE_NAME);
        if !storage.exists(&path) {
            return Ok(Self::default());
        }
        let data = storage.open(&path)?;
        let text = std::str::from_utf8(&data)
            .map_err(|e| EngineError::Manifest(format!("not valid UTF-8: {e}")))?;

        let mut lines = text.lines();
        match lines.next() {
            Some(MANIFEST_HEADER) => {}
            Some(other) => {
                return Err(EngineError::Manifest(format!(
                    "unrecognised header {other:?}"
                )));
            }
            None => return Err(EngineError::Manifest("empty manifest".into())),
        }

        let entries = lines
            .filter(|line| !line.is_empty())
            .map(ManifestEntry::parse)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = entries.len(), "tablet manifest loaded");
        Ok(Self { entries })
    }

    /// Writes the manifest to `dir` through a tmp file and rename.
    pub fn store(&self, storage: &dyn Storage, dir: &Path) -> Result<(), EngineError> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let tmp_path = dir.join(MANIFEST_TMP_FILE_NAME);

        let mut text = String::with_capacity(64 + self.entries.len() * 32);
        text.push_str(MANIFEST_HEADER);
        text.push('\n');
        for entry in &self.entries {
            entry.write_line(&mut text);
        }

        let mut w = storage.create(&tmp_path)?;
        w.write_all(text.as_bytes())?;
        w.sync()?;
        drop(w);
        storage.rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn contains(&self, entry: &ManifestEntry) -> bool {
        self.entries.contains(entry)
    }

    /// Whether a tablet named `name` inside the location is listed.
    pub fn contains_local(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.local_name() == Some(name))
    }

    /// A copy with `entry` appended.
    pub fn with_entry(&self, entry: ManifestEntry) -> Self {
        let mut next = self.clone();
        next.entries.push(entry);
        next
    }
}
