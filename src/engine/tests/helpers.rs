use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineConfig, Entry};
use crate::storage::{MemStorage, Storage};
use crate::tablet::{TabletOptions, TabletWriter};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Location used by every in-memory engine.
pub const DB_DIR: &str = "/db";

/// Small blocks so even short tests cross block boundaries.
pub fn test_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        tablet: TabletOptions {
            block_size: 256,
            key_restart_interval: 4,
            ..TabletOptions::default()
        },
        ..EngineConfig::default()
    }
}

pub fn db_dir() -> PathBuf {
    PathBuf::from(DB_DIR)
}

/// Fresh in-memory engine; the storage handle is returned so tests can
/// inspect files or reopen.
pub fn mem_engine() -> (MemStorage, Engine) {
    let storage = MemStorage::new();
    let engine = open_on(&storage);
    (storage, engine)
}

pub fn open_on(storage: &MemStorage) -> Engine {
    Engine::open(DB_DIR, Arc::new(storage.clone()), test_config()).expect("open")
}

/// Encodes `pairs` (already sorted) as tablet bytes.
pub fn tablet_bytes(pairs: &[(&[u8], Option<&[u8]>)]) -> Vec<u8> {
    let entries = pairs.iter().map(|(k, v)| {
        let entry = match v {
            Some(v) => Entry::Value(v.to_vec()),
            None => Entry::Tombstone,
        };
        (k.to_vec(), entry)
    });
    let mut out = Vec::new();
    TabletWriter::new(test_config().tablet)
        .build(&mut out, entries, pairs.len())
        .expect("build tablet");
    out
}

/// Writes a tablet file at `path` in `storage`.
pub fn write_tablet(storage: &dyn Storage, path: &Path, pairs: &[(&[u8], Option<&[u8]>)]) {
    let bytes = tablet_bytes(pairs);
    let mut w = storage.create(path).expect("create tablet file");
    std::io::Write::write_all(&mut w, &bytes).expect("write tablet");
    w.sync().expect("sync tablet");
}

/// `n` sequential keys `"{prefix}_{i:04}"` with values `"{value}_{i}"`.
pub fn numbered(prefix: &str, value: &str, n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..n)
        .map(|i| {
            (
                format!("{prefix}_{i:04}").into_bytes(),
                format!("{value}_{i}").into_bytes(),
            )
        })
        .collect()
}

/// Pushes `pairs` as an in-memory tablet stream named `name`.
pub fn push_pairs(engine: &Engine, name: &str, pairs: &[(Vec<u8>, Vec<u8>)]) {
    let borrowed: Vec<(&[u8], Option<&[u8]>)> = pairs
        .iter()
        .map(|(k, v)| (k.as_slice(), Some(v.as_slice())))
        .collect();
    let bytes = tablet_bytes(&borrowed);
    engine
        .push_tablet_stream(&mut bytes.as_slice(), name, None)
        .expect("push stream");
}

/// Collects `find(from)` into a Vec.
pub fn collect_find(engine: &Engine, from: Option<&[u8]>) -> Vec<(Vec<u8>, Vec<u8>)> {
    engine
        .find(from)
        .expect("find")
        .collect::<Result<Vec<_>, _>>()
        .expect("find item")
}

pub fn kv(k: &str, v: &str) -> (Vec<u8>, Vec<u8>) {
    (k.as_bytes().to_vec(), v.as_bytes().to_vec())
}
