use bitvec::prelude::*;
use std::collections::HashSet;
use vodswarm_proto::BlockIndex;

use crate::error::{EngineError, Result};

/// Largest number of components a tracker accepts.
pub const MAX_COMPONENTS: u64 = i32::MAX as u64;

/// Records which components (blocks or hashes) of a file are present.
///
/// Bits only ever go from unset to set, so completions may be applied in any
/// order and re-applied without effect.
#[derive(Debug, Clone)]
pub struct CompletionTracker {
    bits: BitVec<u64, Lsb0>,
    completed: u32,
}

impl CompletionTracker {
    /// Creates a tracker for `nr_components` with the first `already_complete` set.
    pub fn new(nr_components: u64, already_complete: u64) -> Result<Self> {
        if nr_components > MAX_COMPONENTS {
            return Err(EngineError::InvalidSize(format!(
                "{nr_components} components exceeds the maximum of {MAX_COMPONENTS}"
            )));
        }
        if already_complete > nr_components {
            return Err(EngineError::InvalidSize(format!(
                "{already_complete} complete components out of {nr_components}"
            )));
        }
        let mut bits = bitvec![u64, Lsb0; 0; nr_components as usize];
        bits[..already_complete as usize].fill(true);
        Ok(Self { bits, completed: already_complete as u32 })
    }

    /// Marks `index` present. Returns whether the bit was newly set.
    pub fn add_component(&mut self, index: BlockIndex) -> Result<bool> {
        let pos = index as usize;
        if pos >= self.bits.len() {
            return Err(EngineError::IndexOutOfRange { index, len: self.nr_components() });
        }
        if self.bits[pos] {
            return Ok(false);
        }
        self.bits.set(pos, true);
        self.completed += 1;
        Ok(true)
    }

    pub fn has_component(&self, index: BlockIndex) -> bool {
        self.bits.get(index as usize).map(|b| *b).unwrap_or(false)
    }

    /// Smallest missing index `>= from`.
    pub fn next_component_missing(&self, from: BlockIndex) -> Option<BlockIndex> {
        let from = from as usize;
        if from >= self.bits.len() {
            return None;
        }
        self.bits[from..].first_zero().map(|off| (from + off) as BlockIndex)
    }

    /// Smallest missing index `>= from` that is not in `except`.
    pub fn next_component_missing_except(
        &self,
        from: BlockIndex,
        except: &HashSet<BlockIndex>,
    ) -> Option<BlockIndex> {
        self.missing_from(from).find(|idx| !except.contains(idx))
    }

    /// Up to `n` missing indices `>= from`, ascending, skipping `except`.
    pub fn next_components_missing(
        &self,
        from: BlockIndex,
        n: usize,
        except: &HashSet<BlockIndex>,
    ) -> Vec<BlockIndex> {
        self.missing_from(from)
            .filter(|idx| !except.contains(idx))
            .take(n)
            .collect()
    }

    pub fn missing_components(&self) -> impl Iterator<Item = BlockIndex> + '_ {
        self.missing_from(0)
    }

    fn missing_from(&self, from: BlockIndex) -> impl Iterator<Item = BlockIndex> + '_ {
        let from = (from as usize).min(self.bits.len());
        self.bits[from..]
            .iter_zeros()
            .map(move |off| (from + off) as BlockIndex)
    }

    pub fn is_complete(&self) -> bool {
        self.completed as usize == self.bits.len()
    }

    pub fn completed_components(&self) -> u32 {
        self.completed
    }

    pub fn nr_components(&self) -> u32 {
        self.bits.len() as u32
    }

    /// Fraction of components present (0.0 to 1.0).
    pub fn progress(&self) -> f64 {
        if self.bits.is_empty() {
            return 1.0;
        }
        self.completed as f64 / self.bits.len() as f64
    }

    /// One entry per component, in index order.
    pub fn to_bools(&self) -> Vec<bool> {
        self.bits.iter().by_vals().collect()
    }
}
