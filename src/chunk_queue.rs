use crate::messages::ResendEntry;
use std::collections::BTreeSet;

/// The longest run a single resend entry can cover: the chunk at `offset`
///  plus 255 more.
const MAX_RUN: u64 = 256;

/// Resend entries covering `width` missing chunks starting at `start`,
///  split so no entry exceeds the 256-chunk limit.
pub fn missing_runs(file_index: u16, mut start: u64, mut width: u64) -> Vec<ResendEntry> {
    let mut res = Vec::new();
    while width > MAX_RUN {
        res.push(ResendEntry {
            file_index,
            offset: start,
            length: (MAX_RUN - 1) as u8,
        });
        start += MAX_RUN;
        width -= MAX_RUN;
    }
    if width > 0 {
        res.push(ResendEntry {
            file_index,
            offset: start,
            length: (width - 1) as u8,
        });
    }
    res
}

/// Per-file record of which chunk offsets have arrived, and the gap
///  computation that turns the out-of-order arrival set into a compact list
///  of retransmission ranges.
#[derive(Debug, Default)]
pub struct ChunkQueue {
    file_index: u16,
    offsets: BTreeSet<u64>,
}

impl ChunkQueue {
    pub fn new(file_index: u16) -> ChunkQueue {
        ChunkQueue {
            file_index,
            offsets: BTreeSet::new(),
        }
    }

    /// Record an arrived chunk. Duplicates are allowed and change nothing.
    pub fn push(&mut self, offset: u64) {
        self.offsets.insert(offset);
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.offsets.contains(&offset)
    }

    /// The highest offset seen so far.
    pub fn top(&self) -> Option<u64> {
        self.offsets.last().copied()
    }

    /// The highest offset up to which chunks 0..=n have all arrived - the
    ///  watermark acknowledged to the sender. 0 while chunk 0 is still
    ///  outstanding.
    pub fn watermark(&self) -> u64 {
        let mut expected = 0u64;
        for &offset in &self.offsets {
            if offset == expected {
                expected += 1;
            } else if offset > expected {
                break;
            }
        }
        expected.saturating_sub(1)
    }

    /// The minimal list of missing runs in `[from, top()]`.
    ///
    /// Every gap of `w` missing chunks is emitted as full 256-chunk runs
    ///  (`length == 255`) while it is wider than one entry can cover, followed
    ///  by one run for the remainder. `length` counts the extra missing chunks
    ///  beyond the one at `offset`, so a single missing chunk has `length 0`.
    pub fn gaps(&self, from: u64) -> Vec<ResendEntry> {
        let mut res = Vec::new();
        let mut cursor = from;

        for &received in self.offsets.range(from..) {
            res.extend(missing_runs(self.file_index, cursor, received - cursor));
            cursor = received + 1;
        }
        res
    }
}
