//! Block and hash selection.
//!
//! A policy hands out indices to fetch (blocks) and to verify (hashes). Handed
//! out indices leave the pending pool until the caller puts them back with a
//! reset, so every index is either pending or dispatched, never both.

use std::collections::BTreeSet;
use tracing::warn;
use vodswarm_proto::BlockIndex;

mod rarest;
mod sequential;

pub use rarest::RarestFirstSelection;
pub use sequential::SequentialSelection;

pub trait SelectionPolicy: Send {
    /// Next batch of hash indices to verify. Empty when verification has run too
    /// far ahead of the lowest pending block, or when nothing is pending.
    fn next_hashes(&mut self) -> Vec<BlockIndex>;

    /// Returns dispatched hash indices to the pending pool.
    fn reset_hashes(&mut self, indices: &[BlockIndex]);

    /// Removes and returns the preferred pending block accepted by `eligible`.
    fn next_block_matching(&mut self, eligible: &mut dyn FnMut(BlockIndex) -> bool) -> Option<BlockIndex>;

    /// Returns a dispatched block index to the pending pool.
    fn reset_block(&mut self, index: BlockIndex);

    fn pending_blocks(&self) -> usize;

    fn pending_hashes(&self) -> usize;

    /// A peer announced the blocks it holds. Policies that ignore peer
    /// contents keep the default.
    fn peer_joined(&mut self, _have: &[bool]) {}

    /// A peer holding `have` went away.
    fn peer_left(&mut self, _have: &[bool]) {}

    /// A connected peer finished one more block.
    fn peer_has(&mut self, _index: BlockIndex) {}

    fn next_block(&mut self) -> Option<BlockIndex> {
        self.next_block_matching(&mut |_| true)
    }

    fn is_complete(&self) -> bool {
        self.pending_blocks() == 0 && self.pending_hashes() == 0
    }
}

/// Pending hash indices, released in ascending batches no further than
/// `window` past the lowest pending block.
#[derive(Debug, Clone)]
pub(crate) struct HashQueue {
    pending: BTreeSet<BlockIndex>,
    nr_blocks: u32,
    batch: usize,
    window: u32,
}

impl HashQueue {
    pub(crate) fn new(nr_blocks: u32, already_present: u32, batch: usize, window: u32) -> Self {
        Self {
            pending: (already_present.min(nr_blocks)..nr_blocks).collect(),
            nr_blocks,
            batch: batch.max(1),
            window,
        }
    }

    pub(crate) fn next(&mut self, lowest_pending_block: Option<BlockIndex>) -> Vec<BlockIndex> {
        let bound = lowest_pending_block.map(|b| b.saturating_add(self.window));
        let mut out = Vec::new();
        while out.len() < self.batch {
            let Some(&first) = self.pending.first() else { break };
            if bound.is_some_and(|bound| first > bound) {
                break;
            }
            self.pending.remove(&first);
            out.push(first);
        }
        out
    }

    pub(crate) fn reset(&mut self, indices: &[BlockIndex]) {
        for &idx in indices {
            if idx >= self.nr_blocks {
                warn!(index = idx, nr_blocks = self.nr_blocks, "ignoring reset of out-of-range hash");
                continue;
            }
            self.pending.insert(idx);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
