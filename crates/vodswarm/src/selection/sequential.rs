use std::collections::BTreeSet;
use tracing::warn;
use vodswarm_proto::BlockIndex;

use super::{HashQueue, SelectionPolicy};
use crate::config::EngineConfig;

/// Hands out blocks and hashes in strictly ascending order, which keeps storage
/// access sequential and lets playback start from the front of the file.
#[derive(Debug, Clone)]
pub struct SequentialSelection {
    hashes: HashQueue,
    blocks: BTreeSet<BlockIndex>,
    nr_blocks: u32,
}

impl SequentialSelection {
    pub fn new(nr_blocks: u32, already_present: u32, config: &EngineConfig) -> Self {
        Self {
            hashes: HashQueue::new(nr_blocks, already_present, config.hash_batch_size, config.hash_ahead_window),
            blocks: (already_present.min(nr_blocks)..nr_blocks).collect(),
            nr_blocks,
        }
    }
}

impl SelectionPolicy for SequentialSelection {
    fn next_hashes(&mut self) -> Vec<BlockIndex> {
        let lowest = self.blocks.first().copied();
        self.hashes.next(lowest)
    }

    fn reset_hashes(&mut self, indices: &[BlockIndex]) {
        self.hashes.reset(indices);
    }

    fn next_block_matching(&mut self, eligible: &mut dyn FnMut(BlockIndex) -> bool) -> Option<BlockIndex> {
        let picked = self.blocks.iter().copied().find(|&idx| eligible(idx))?;
        self.blocks.remove(&picked);
        Some(picked)
    }

    fn reset_block(&mut self, index: BlockIndex) {
        if index >= self.nr_blocks {
            warn!(index, nr_blocks = self.nr_blocks, "ignoring reset of out-of-range block");
            return;
        }
        self.blocks.insert(index);
    }

    fn pending_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn pending_hashes(&self) -> usize {
        self.hashes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(batch: usize, window: u32) -> EngineConfig {
        EngineConfig {
            hash_batch_size: batch,
            hash_ahead_window: window,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_blocks_exhaust_in_order() {
        let mut sel = SequentialSelection::new(5, 0, &config(8, 64));
        let mut seen = Vec::new();
        while let Some(idx) = sel.next_block() {
            seen.push(idx);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(sel.next_block(), None);

        sel.reset_block(2);
        assert_eq!(sel.next_block(), Some(2));
        assert_eq!(sel.next_block(), None);
    }

    #[test]
    fn test_hash_window_bounds_batches() {
        let mut sel = SequentialSelection::new(100, 0, &config(4, 5));
        assert_eq!(sel.next_hashes(), vec![0, 1, 2, 3]);
        // lowest pending block is 0, so nothing past 5
        assert_eq!(sel.next_hashes(), vec![4, 5]);
        assert!(sel.next_hashes().is_empty());

        sel.next_block();
        sel.next_block();
        // lowest pending block is now 2
        assert_eq!(sel.next_hashes(), vec![6, 7]);
        assert!(sel.next_hashes().is_empty());
    }

    #[test]
    fn test_hash_bound_holds_under_random_dispatch() {
        use rand::Rng;
        let window = 7;
        let mut sel = SequentialSelection::new(300, 0, &config(5, window));
        let mut rng = rand::thread_rng();
        let mut dispatched_hashes = Vec::new();
        while !sel.is_complete() {
            match rng.gen_range(0..4) {
                0 => {
                    let lowest = sel.blocks.first().copied();
                    for idx in sel.next_hashes() {
                        if let Some(low) = lowest {
                            assert!(idx <= low + window, "hash {idx} beyond {low}+{window}");
                        }
                        dispatched_hashes.push(idx);
                    }
                }
                1 if !dispatched_hashes.is_empty() && rng.gen_bool(0.2) => {
                    let idx = dispatched_hashes.swap_remove(0);
                    sel.reset_hashes(&[idx]);
                }
                _ => {
                    sel.next_block();
                }
            }
        }
        assert_eq!(sel.pending_hashes(), 0);
    }

    #[test]
    fn test_unbounded_once_blocks_dispatched() {
        let mut sel = SequentialSelection::new(20, 0, &config(8, 2));
        while sel.next_block().is_some() {}
        assert_eq!(sel.next_hashes(), (0..8).collect::<Vec<_>>());
        sel.reset_hashes(&[3, 99]);
        assert_eq!(sel.next_hashes(), vec![3, 8, 9, 10, 11, 12, 13, 14]);
    }

    #[test]
    fn test_already_present_prefix_skipped() {
        let mut sel = SequentialSelection::new(6, 4, &config(8, 64));
        assert_eq!(sel.next_hashes(), vec![4, 5]);
        assert_eq!(sel.next_block(), Some(4));
        assert_eq!(sel.next_block(), Some(5));
        assert!(sel.is_complete());
    }

    #[test]
    fn test_matching_skips_ineligible() {
        let mut sel = SequentialSelection::new(6, 0, &config(8, 64));
        assert_eq!(sel.next_block_matching(&mut |idx| idx % 2 == 1), Some(1));
        assert_eq!(sel.next_block(), Some(0));
        assert_eq!(sel.next_block_matching(&mut |_| false), None);
        assert_eq!(sel.pending_blocks(), 4);
    }
}
