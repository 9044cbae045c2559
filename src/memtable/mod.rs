//! # Memtable Module
//!
//! The mutable, in-memory sorted layer of the database.
//!
//! A `Memtable` holds the most recent state of every key written since the
//! last flush: either a value or a tombstone. It carries no durability of
//! its own; the engine appends each mutation to the WAL before applying it
//! here, and rebuilds the memtable on open by folding the replayed WAL
//! records into an empty one ([`Memtable::replay`]).
//!
//! ## Semantics
//! - `put` overwrites whatever the key held before.
//! - `delete` installs a tombstone whether or not the key was present, so
//!   it shadows older tablet data for that key.
//! - Replay is a pure fold (last write per key wins), so replaying the same
//!   records twice yields the same state as replaying them once.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::ops::Bound;

use tracing::trace;

use crate::engine::{Entry, HexKey};
use crate::wal::WalRecord;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Per-entry bookkeeping charged on top of key and value bytes.
const ENTRY_OVERHEAD: usize = std::mem::size_of::<Vec<u8>>() + std::mem::size_of::<Entry>();

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// Sorted map from key to its latest [`Entry`].
#[derive(Debug, Default, Clone)]
pub struct Memtable {
    tree: BTreeMap<Vec<u8>, Entry>,

    /// Approximate heap footprint of keys, values and per-entry overhead.
    approximate_size: usize,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `records` into an empty memtable, in order.
    pub fn replay<I>(records: I) -> Self
    where
        I: IntoIterator<Item = WalRecord>,
    {
        let mut memtable = Self::new();
        for record in records {
            memtable.apply(record);
        }
        memtable
    }

    /// Like [`replay`](Self::replay) but stops at the first `Err`.
    pub fn try_replay<I, E>(records: I) -> Result<Self, E>
    where
        I: IntoIterator<Item = Result<WalRecord, E>>,
    {
        let mut memtable = Self::new();
        for record in records {
            memtable.apply(record?);
        }
        Ok(memtable)
    }

    /// Applies one logged mutation.
    pub fn apply(&mut self, record: WalRecord) {
        match record {
            WalRecord::Put { key, value } => self.put(key, value),
            WalRecord::Delete { key } => self.delete(key),
        }
    }

    /// Inserts or overwrites `key`.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        trace!(key = %HexKey(&key), len = value.len(), "memtable put");
        self.insert(key, Entry::Value(value));
    }

    /// Installs a tombstone for `key`.
    pub fn delete(&mut self, key: Vec<u8>) {
        trace!(key = %HexKey(&key), "memtable delete");
        self.insert(key, Entry::Tombstone);
    }

    fn insert(&mut self, key: Vec<u8>, entry: Entry) {
        let added = ENTRY_OVERHEAD + key.len() + entry_len(&entry);
        let key_len = key.len();
        match self.tree.insert(key, entry) {
            Some(old) => {
                self.approximate_size =
                    self.approximate_size + added - (ENTRY_OVERHEAD + key_len + entry_len(&old));
            }
            None => self.approximate_size += added,
        }
    }

    /// Latest entry for `key`; `None` when the memtable has never seen it.
    pub fn get(&self, key: &[u8]) -> Option<&Entry> {
        self.tree.get(key)
    }

    /// Ascending entries starting at the first key `>= from` (or at the
    /// smallest key when `from` is `None`). Tombstones are included.
    pub fn scan<'a>(
        &'a self,
        from: Option<&[u8]>,
    ) -> impl Iterator<Item = (&'a [u8], &'a Entry)> + use<'a> {
        let lower = match from {
            Some(key) => Bound::Included(key),
            None => Bound::Unbounded,
        };
        self.tree
            .range::<[u8], _>((lower, Bound::Unbounded))
            .map(|(k, v)| (k.as_slice(), v))
    }

    /// Owned copies of every entry in key order, for building a tablet.
    pub fn iter_all(&self) -> impl Iterator<Item = (Vec<u8>, Entry)> + '_ {
        self.tree.iter().map(|(k, v)| (k.clone(), v.clone()))
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn approximate_size(&self) -> usize {
        self.approximate_size
    }

    pub fn clear(&mut self) {
        self.tree.clear();
        self.approximate_size = 0;
    }
}

fn entry_len(entry: &Entry) -> usize {
    match entry {
        Entry::Value(v) => v.len(),
        Entry::Tombstone => 0,
    }
}
