//! Forward iteration over a tablet.
//!
//! [`TabletIter`] walks data blocks in index order, decoding each block only
//! when the previous one is exhausted. It yields every record, tombstones
//! included; deciding what is visible is the merge iterator's job.
//!
//! The iterator owns its handle on the tablet (`Arc<Tablet>` by default), so
//! it can outlive the lock under which it was created.

use std::ops::Deref;
use std::sync::Arc;

use crate::engine::Entry;

use super::block::BlockIter;
use super::{Tablet, TabletError};

/// Lazy ascending cursor over one tablet.
///
/// Yields `Err` at most once: after an error the iterator is exhausted.
pub struct TabletIter<S: Deref<Target = Tablet> = Arc<Tablet>> {
    tablet: S,
    block_idx: usize,
    current: Option<BlockIter>,
    done: bool,
}

impl<S: Deref<Target = Tablet>> TabletIter<S> {
    /// Positions a new iterator at the first key `>= from` (or at the first
    /// key when `from` is `None`).
    pub fn new(tablet: S, from: Option<&[u8]>) -> Result<Self, TabletError> {
        let block_idx = match from {
            Some(key) => tablet.find_block_for_key(key),
            None => 0,
        };

        let current = if block_idx < tablet.block_count() {
            let mut it = BlockIter::new(tablet.load_block(block_idx)?);
            if let Some(key) = from {
                it.seek(key)?;
            }
            Some(it)
        } else {
            None
        };

        Ok(Self {
            tablet,
            block_idx,
            done: current.is_none(),
            current,
        })
    }

    fn advance_block(&mut self) -> Result<bool, TabletError> {
        self.block_idx += 1;
        if self.block_idx >= self.tablet.block_count() {
            self.current = None;
            return Ok(false);
        }
        self.current = Some(BlockIter::new(self.tablet.load_block(self.block_idx)?));
        Ok(true)
    }

    fn fail(&mut self, e: TabletError) -> Option<Result<(Vec<u8>, Entry), TabletError>> {
        self.done = true;
        self.current = None;
        Some(Err(e))
    }
}

impl<S: Deref<Target = Tablet>> Iterator for TabletIter<S> {
    type Item = Result<(Vec<u8>, Entry), TabletError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let step = match self.current.as_mut() {
                Some(it) => it.next_entry(),
                None => Ok(None),
            };
            match step {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => match self.advance_block() {
                    Ok(true) => {}
                    Ok(false) => {
                        self.done = true;
                        return None;
                    }
                    Err(e) => return self.fail(e),
                },
                Err(e) => return self.fail(e),
            }
        }
    }
}
