use std::collections::BTreeSet;
use tracing::warn;
use vodswarm_proto::BlockIndex;

use super::{HashQueue, SelectionPolicy};
use crate::config::EngineConfig;

/// Downloads the least replicated blocks first. Blocks no peer announces are
/// never handed out. Hashes still follow the ascending hash-ahead rule.
#[derive(Debug, Clone)]
pub struct RarestFirstSelection {
    hashes: HashQueue,
    blocks: BTreeSet<BlockIndex>,
    /// Announcing peers per block.
    replicas: Vec<u32>,
    /// Pending blocks someone announces, ordered by (replicas, index).
    ranked: BTreeSet<(u32, BlockIndex)>,
}

impl RarestFirstSelection {
    pub fn new(nr_blocks: u32, already_present: u32, config: &EngineConfig) -> Self {
        Self {
            hashes: HashQueue::new(nr_blocks, already_present, config.hash_batch_size, config.hash_ahead_window),
            blocks: (already_present.min(nr_blocks)..nr_blocks).collect(),
            replicas: vec![0; nr_blocks as usize],
            ranked: BTreeSet::new(),
        }
    }

    pub fn availability(&self, index: BlockIndex) -> u32 {
        self.replicas.get(index as usize).copied().unwrap_or(0)
    }

    fn adjust(&mut self, index: BlockIndex, up: bool) {
        let Some(count) = self.replicas.get_mut(index as usize) else {
            return;
        };
        let before = *count;
        *count = if up { before + 1 } else { before.saturating_sub(1) };
        let after = *count;
        if self.blocks.contains(&index) {
            self.ranked.remove(&(before, index));
            if after > 0 {
                self.ranked.insert((after, index));
            }
        }
    }

    fn adjust_all(&mut self, have: &[bool], up: bool) {
        if have.len() != self.replicas.len() {
            warn!(len = have.len(), nr_blocks = self.replicas.len(), "bitfield length mismatch");
        }
        for (index, &has) in have.iter().enumerate() {
            if has {
                self.adjust(index as BlockIndex, up);
            }
        }
    }
}

impl SelectionPolicy for RarestFirstSelection {
    fn next_hashes(&mut self) -> Vec<BlockIndex> {
        let lowest = self.blocks.first().copied();
        self.hashes.next(lowest)
    }

    fn reset_hashes(&mut self, indices: &[BlockIndex]) {
        self.hashes.reset(indices);
    }

    fn next_block_matching(&mut self, eligible: &mut dyn FnMut(BlockIndex) -> bool) -> Option<BlockIndex> {
        let picked = self.ranked.iter().copied().find(|&(_, index)| eligible(index))?;
        self.ranked.remove(&picked);
        self.blocks.remove(&picked.1);
        Some(picked.1)
    }

    fn reset_block(&mut self, index: BlockIndex) {
        if index as usize >= self.replicas.len() {
            warn!(index, nr_blocks = self.replicas.len(), "ignoring reset of out-of-range block");
            return;
        }
        if self.blocks.insert(index) {
            let count = self.replicas[index as usize];
            if count > 0 {
                self.ranked.insert((count, index));
            }
        }
    }

    fn pending_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn pending_hashes(&self) -> usize {
        self.hashes.len()
    }

    fn peer_joined(&mut self, have: &[bool]) {
        self.adjust_all(have, true);
    }

    fn peer_left(&mut self, have: &[bool]) {
        self.adjust_all(have, false);
    }

    fn peer_has(&mut self, index: BlockIndex) {
        self.adjust(index, true);
    }
}
