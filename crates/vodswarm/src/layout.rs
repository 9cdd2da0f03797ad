use std::ops::Range;
use vodswarm_proto::BlockIndex;

use crate::error::{EngineError, Result};

/// Maps block indices of a file onto byte ranges. Every block is `block_size`
/// long except the last, which holds the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    file_size: u64,
    block_size: u32,
    nr_blocks: u32,
}

impl BlockLayout {
    pub fn new(file_size: u64, block_size: u32) -> Result<Self> {
        if block_size == 0 {
            return Err(EngineError::InvalidSize("block size must be positive".to_string()));
        }
        let nr_blocks = file_size.div_ceil(block_size as u64);
        let nr_blocks = u32::try_from(nr_blocks)
            .map_err(|_| EngineError::InvalidSize(format!("{nr_blocks} blocks")))?;
        Ok(Self { file_size, block_size, nr_blocks })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn nr_blocks(&self) -> u32 {
        self.nr_blocks
    }

    pub fn block_len(&self, index: BlockIndex) -> u32 {
        let range = self.block_range(index);
        (range.end - range.start) as u32
    }

    /// Byte range of `index`; empty for indices past the end.
    pub fn block_range(&self, index: BlockIndex) -> Range<u64> {
        let start = (index as u64 * self.block_size as u64).min(self.file_size);
        let end = (start + self.block_size as u64).min(self.file_size);
        start..end
    }

    pub fn block_offset(&self, index: BlockIndex) -> u64 {
        self.block_range(index).start
    }

    pub fn block_at(&self, offset: u64) -> Option<BlockIndex> {
        if offset >= self.file_size {
            return None;
        }
        Some((offset / self.block_size as u64) as BlockIndex)
    }

    /// Number of leading blocks fully contained in a stream of `stored_bytes`.
    pub fn complete_prefix(&self, stored_bytes: u64) -> u32 {
        if stored_bytes >= self.file_size {
            return self.nr_blocks;
        }
        (stored_bytes / self.block_size as u64) as u32
    }

    pub fn check(&self, index: BlockIndex) -> Result<()> {
        if index >= self.nr_blocks {
            return Err(EngineError::IndexOutOfRange { index, len: self.nr_blocks });
        }
        Ok(())
    }
}
