//! Prefix-compressed data blocks.
//!
//! A data block is the unit of compression and checksumming inside a
//! tablet. Before compression it looks like this:
//!
//! ```text
//! [ENTRY_0][ENTRY_1]...[ENTRY_N-1]
//! [RESTART_0 u32 LE]...[RESTART_R-1 u32 LE]
//! [RESTART_COUNT u32 LE]
//! ```
//!
//! Each entry stores only the part of its key that differs from the
//! previous key:
//!
//! ```text
//! [SHARED varint][UNSHARED varint][VALUE_TAG varint][KEY_SUFFIX][VALUE]
//! ```
//!
//! `VALUE_TAG` is `0` for a tombstone and `n + 1` for a value of `n` bytes.
//!
//! Every `restart_interval` entries the prefix chain is broken: the entry
//! at a restart point has `SHARED = 0` and its offset is listed in the
//! restart array. Seeking binary-searches the restart keys, then scans
//! forward linearly.

use crate::encoding::{self, put_varint};
use crate::engine::Entry;

use super::TabletError;

const RESTART_LEN: usize = 4;

// ------------------------------------------------------------------------------------------------
// Builder
// ------------------------------------------------------------------------------------------------

/// Accumulates sorted entries into one raw (uncompressed) data block.
pub(crate) struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    counter: usize,
    entries: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub(crate) fn new(restart_interval: usize) -> Self {
        Self {
            buf: Vec::new(),
            restarts: vec![0],
            restart_interval: restart_interval.max(1),
            counter: 0,
            entries: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in strictly ascending order; the
    /// tablet writer enforces this before calling.
    pub(crate) fn add(&mut self, key: &[u8], entry: &Entry) -> Result<(), TabletError> {
        let shared = if self.counter < self.restart_interval {
            common_prefix_len(&self.last_key, key)
        } else {
            let offset = u32::try_from(self.buf.len())
                .map_err(|_| TabletError::InvalidInput("data block exceeds 4 GiB".into()))?;
            self.restarts.push(offset);
            self.counter = 0;
            0
        };

        let suffix = &key[shared..];
        put_varint(&mut self.buf, shared as u64);
        put_varint(&mut self.buf, suffix.len() as u64);
        match entry {
            Entry::Tombstone => put_varint(&mut self.buf, 0),
            Entry::Value(value) => put_varint(&mut self.buf, value.len() as u64 + 1),
        }
        self.buf.extend_from_slice(suffix);
        if let Entry::Value(value) = entry {
            self.buf.extend_from_slice(value);
        }

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(suffix);
        self.counter += 1;
        self.entries += 1;
        Ok(())
    }

    /// Size of the block if it were finished now.
    pub(crate) fn estimated_size(&self) -> usize {
        self.buf.len() + (self.restarts.len() + 1) * RESTART_LEN
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub(crate) fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Appends the restart array and returns the raw block, leaving the
    /// builder empty and ready for the next block.
    pub(crate) fn finish(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.buf);
        for restart in &self.restarts {
            out.extend_from_slice(&restart.to_le_bytes());
        }
        out.extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());

        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.entries = 0;
        self.last_key.clear();
        out
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// A decoded (decompressed) data block with a validated restart array.
#[derive(Debug)]
pub(crate) struct Block {
    data: Vec<u8>,
    restarts_offset: usize,
    num_restarts: usize,
}

impl Block {
    pub(crate) fn decode(data: Vec<u8>) -> Result<Self, TabletError> {
        if data.len() < RESTART_LEN {
            return Err(TabletError::Format("data block shorter than restart count".into()));
        }
        let count_at = data.len() - RESTART_LEN;
        let num_restarts = read_u32(&data, count_at) as usize;
        if num_restarts == 0 {
            return Err(TabletError::Format("data block has no restart points".into()));
        }
        let restarts_len = num_restarts
            .checked_mul(RESTART_LEN)
            .filter(|len| *len <= count_at)
            .ok_or_else(|| TabletError::Format("restart array exceeds data block".into()))?;
        let restarts_offset = count_at - restarts_len;

        let block = Self {
            data,
            restarts_offset,
            num_restarts,
        };
        let mut prev = None;
        for i in 0..num_restarts {
            let offset = block.restart_point(i);
            let ascending = prev.is_none_or(|p| offset > p);
            let in_range = offset < restarts_offset || (offset == 0 && restarts_offset == 0);
            if !ascending || !in_range {
                return Err(TabletError::Format(format!(
                    "restart point {i} at {offset} is out of order or out of range"
                )));
            }
            prev = Some(offset);
        }
        Ok(block)
    }

    fn restart_point(&self, idx: usize) -> usize {
        read_u32(&self.data, self.restarts_offset + idx * RESTART_LEN) as usize
    }

    /// Full key stored at restart point `idx`.
    fn restart_key(&self, idx: usize) -> Result<&[u8], TabletError> {
        let offset = self.restart_point(idx);
        let header = decode_header(&self.data[..self.restarts_offset], offset)?;
        if header.shared != 0 {
            return Err(TabletError::Format(format!(
                "restart entry at {offset} shares a key prefix"
            )));
        }
        Ok(&self.data[header.key_at..header.key_at + header.unshared])
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(bytes)
}

struct EntryHeader {
    shared: usize,
    unshared: usize,
    /// `None` for a tombstone.
    value_len: Option<usize>,
    key_at: usize,
    /// Offset of the following entry.
    end: usize,
}

/// Parses the entry header at `offset`; `entries` is the block without its
/// restart array, so every bound check is against real entry bytes.
fn decode_header(entries: &[u8], offset: usize) -> Result<EntryHeader, TabletError> {
    if offset >= entries.len() {
        return Err(TabletError::Format(format!("entry offset {offset} past block end")));
    }
    let mut at = offset;
    let (shared, n) = encoding::get_varint_len(&entries[at..])?;
    at += n;
    let (unshared, n) = encoding::get_varint_len(&entries[at..])?;
    at += n;
    let (tag, n) = encoding::get_varint_len(&entries[at..])?;
    at += n;

    let value_len = tag.checked_sub(1);
    let end = at + unshared + value_len.unwrap_or(0);
    if end > entries.len() {
        return Err(TabletError::Format(format!(
            "entry at {offset} runs past block end ({end} > {})",
            entries.len()
        )));
    }
    Ok(EntryHeader {
        shared,
        unshared,
        value_len,
        key_at: at,
        end,
    })
}

/// Forward cursor over one [`Block`].
pub(crate) struct BlockIter {
    block: Block,
    offset: usize,
    key: Vec<u8>,
    peeked: Option<(Vec<u8>, Entry)>,
}

impl BlockIter {
    pub(crate) fn new(block: Block) -> Self {
        Self {
            block,
            offset: 0,
            key: Vec::new(),
            peeked: None,
        }
    }

    /// Positions the cursor so the next entry returned is the first one
    /// with key `>= target`.
    pub(crate) fn seek(&mut self, target: &[u8]) -> Result<(), TabletError> {
        let mut left = 0;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right).div_ceil(2);
            if self.block.restart_key(mid)? < target {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        self.offset = self.block.restart_point(left);
        self.key.clear();
        self.peeked = None;
        while let Some((key, entry)) = self.decode_next()? {
            if key.as_slice() >= target {
                self.peeked = Some((key, entry));
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Entry)>, TabletError> {
        if let Some(peeked) = self.peeked.take() {
            return Ok(Some(peeked));
        }
        self.decode_next()
    }

    fn decode_next(&mut self) -> Result<Option<(Vec<u8>, Entry)>, TabletError> {
        let entries = &self.block.data[..self.block.restarts_offset];
        if self.offset >= entries.len() {
            return Ok(None);
        }
        let header = decode_header(entries, self.offset)?;
        if header.shared > self.key.len() {
            // Poison the cursor so a retry doesn't rebuild a bogus key.
            self.offset = entries.len();
            return Err(TabletError::Format(format!(
                "entry shares {} bytes with a {}-byte key",
                header.shared,
                self.key.len()
            )));
        }
        let value_at = header.key_at + header.unshared;
        self.key.truncate(header.shared);
        self.key.extend_from_slice(&entries[header.key_at..value_at]);

        let entry = match header.value_len {
            None => Entry::Tombstone,
            Some(len) => Entry::Value(entries[value_at..value_at + len].to_vec()),
        };
        self.offset = header.end;
        Ok(Some((self.key.clone(), entry)))
    }
}
