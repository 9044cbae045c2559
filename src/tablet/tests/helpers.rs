use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::codec::{BlockCodec, CodecRegistry, IdentityCodec, SnappyCodec};
use crate::engine::Entry;
use crate::storage::ReadHandle;
use crate::tablet::{Tablet, TabletOptions, TabletSummary, TabletWriter};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn key(i: usize) -> Vec<u8> {
    format!("key-{i:06}").into_bytes()
}

pub fn value(i: usize) -> Vec<u8> {
    format!("value-{i}-{}", "x".repeat(i % 17)).into_bytes()
}

/// `n` ascending records; every `tombstone_every`-th one is a tombstone
/// (`0` disables tombstones).
pub fn sequential(n: usize, tombstone_every: usize) -> Vec<(Vec<u8>, Entry)> {
    (0..n)
        .map(|i| {
            let entry = if tombstone_every != 0 && i % tombstone_every == 0 {
                Entry::Tombstone
            } else {
                Entry::Value(value(i))
            };
            (key(i), entry)
        })
        .collect()
}

/// Small blocks so a few hundred records span many of them.
pub fn small_blocks(codec: Arc<dyn BlockCodec>) -> TabletOptions {
    TabletOptions {
        block_size: 128,
        key_restart_interval: 4,
        codec,
    }
}

pub fn snappy() -> Arc<dyn BlockCodec> {
    Arc::new(SnappyCodec)
}

pub fn identity() -> Arc<dyn BlockCodec> {
    Arc::new(IdentityCodec)
}

pub fn build_bytes(
    options: TabletOptions,
    entries: Vec<(Vec<u8>, Entry)>,
) -> (Vec<u8>, TabletSummary) {
    init_tracing();
    let mut out = Vec::new();
    let count = entries.len();
    let summary = TabletWriter::new(options)
        .build(&mut out, entries, count)
        .unwrap();
    (out, summary)
}

pub fn open_bytes(bytes: Vec<u8>) -> Result<Tablet, crate::tablet::TabletError> {
    Tablet::from_handle(
        PathBuf::from("mem.tab"),
        ReadHandle::from_vec(bytes),
        &CodecRegistry::default(),
    )
}

pub fn build_and_open(
    options: TabletOptions,
    entries: Vec<(Vec<u8>, Entry)>,
) -> Arc<Tablet> {
    let (bytes, _) = build_bytes(options, entries);
    Arc::new(open_bytes(bytes).unwrap())
}

pub fn collect(tablet: &Arc<Tablet>, from: Option<&[u8]>) -> Vec<(Vec<u8>, Entry)> {
    tablet
        .seek(from)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}
