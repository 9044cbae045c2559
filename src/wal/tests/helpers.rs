use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::storage::{MemStorage, Storage};
use crate::wal::{Wal, WalHeader, WalRecord};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory storage with `/db` already created, plus the WAL path in it.
pub fn mem_fixture() -> (MemStorage, PathBuf) {
    init_tracing();
    let storage = MemStorage::new();
    storage.create_dir_all(Path::new("/db")).unwrap();
    (storage, PathBuf::from("/db/wal.log"))
}

pub fn open_wal(storage: &MemStorage, path: &Path) -> Wal<WalRecord> {
    Wal::open(
        Arc::new(storage.clone()),
        path,
        WalHeader::DEFAULT_MAX_RECORD_SIZE,
        true,
    )
    .unwrap()
}

pub fn put(key: &str, value: &str) -> WalRecord {
    WalRecord::Put {
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
    }
}

pub fn del(key: &str) -> WalRecord {
    WalRecord::Delete {
        key: key.as_bytes().to_vec(),
    }
}

pub fn replay_all(wal: &Wal<WalRecord>) -> Vec<WalRecord> {
    wal.replay_iter()
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}
