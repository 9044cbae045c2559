//! K-way merge across sorted runs, and the tombstone filter on top of it.
//!
//! [`MergeIterator`] combines any number of sorted `(key, Entry)` streams
//! into one ascending stream with exactly one record per key. Sources are
//! given in **precedence order**: when several sources hold the same key,
//! the one with the lowest index wins and the others are skipped.
//!
//! [`VisibilityFilter`] then drops tombstones, leaving only live pairs.
//!
//! Both propagate the first source error as an `Err` item and end there.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::{EngineError, Entry};

/// One sorted run fed into the merge.
pub type Source<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Entry), EngineError>> + Send + 'a>;

// ------------------------------------------------------------------------------------------------
// MergeIterator
// ------------------------------------------------------------------------------------------------

/// Heap-based merge yielding the winning record for every key in
/// ascending order, tombstones included.
pub struct MergeIterator<'a> {
    sources: Vec<Source<'a>>,
    heap: BinaryHeap<HeapEntry>,
    error: Option<EngineError>,
    done: bool,
}

struct HeapEntry {
    key: Vec<u8>,
    entry: Entry,
    source_idx: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on (key ASC, source_idx ASC).
        self.key
            .cmp(&other.key)
            .then(self.source_idx.cmp(&other.source_idx))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source_idx == other.source_idx
    }
}

impl Eq for HeapEntry {}

impl<'a> MergeIterator<'a> {
    pub fn new(sources: Vec<Source<'a>>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            error: None,
            done: false,
        };
        for idx in 0..merge.sources.len() {
            merge.refill(idx);
        }
        merge
    }

    /// Pulls the next record of source `idx` onto the heap.
    fn refill(&mut self, idx: usize) {
        match self.sources[idx].next() {
            Some(Ok((key, entry))) => self.heap.push(HeapEntry {
                key,
                entry,
                source_idx: idx,
            }),
            Some(Err(e)) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
            None => {}
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<(Vec<u8>, Entry), EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        // A failed source may be missing records that would have won, so
        // nothing after the failure can be trusted.
        if let Some(e) = self.error.take() {
            self.done = true;
            return Some(Err(e));
        }

        let Some(winner) = self.heap.pop() else {
            self.done = true;
            return None;
        };
        self.refill(winner.source_idx);

        // Shadowed copies of the same key in lower-precedence runs.
        while self.heap.peek().is_some_and(|top| top.key == winner.key) {
            if let Some(shadowed) = self.heap.pop() {
                self.refill(shadowed.source_idx);
            }
        }

        Some(Ok((winner.key, winner.entry)))
    }
}

// ------------------------------------------------------------------------------------------------
// VisibilityFilter
// ------------------------------------------------------------------------------------------------

/// Drops tombstones from a merged stream, yielding live `(key, value)`
/// pairs.
pub struct VisibilityFilter<I> {
    input: I,
}

impl<I> VisibilityFilter<I>
where
    I: Iterator<Item = Result<(Vec<u8>, Entry), EngineError>>,
{
    pub fn new(input: I) -> Self {
        Self { input }
    }
}

impl<I> Iterator for VisibilityFilter<I>
where
    I: Iterator<Item = Result<(Vec<u8>, Entry), EngineError>>,
{
    type Item = Result<(Vec<u8>, Vec<u8>), EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        for item in self.input.by_ref() {
            match item {
                Ok((key, Entry::Value(value))) => return Some(Ok((key, value))),
                Ok((_, Entry::Tombstone)) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
