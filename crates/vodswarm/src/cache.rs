//! Read-through block cache for serving peers.
//!
//! Readers publish which blocks they expect to need next. Blocks outside every
//! published hint are evicted before hinted ones regardless of recency, which
//! keeps the shared front of a file resident while many viewers stream it.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};
use vodswarm_proto::{BlockIndex, ReaderId};

use crate::error::{EngineError, Result};
use crate::layout::BlockLayout;
use crate::storage::StorageStream;

#[derive(Debug)]
struct CacheEntry {
    data: Bytes,
    l_stamp: u64,
}

#[derive(Debug)]
struct Hint {
    /// In the order the reader expects to need them, without repeats.
    blocks: Vec<BlockIndex>,
    stamp: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<BlockIndex, CacheEntry>,
    hints: HashMap<ReaderId, Hint>,
    clock: u64,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn is_hinted(&self, index: BlockIndex) -> bool {
        self.hints.values().any(|h| h.blocks.contains(&index))
    }

    fn insert(&mut self, index: BlockIndex, data: Bytes, capacity: usize) {
        let l_stamp = self.tick();
        self.entries.insert(index, CacheEntry { data, l_stamp });
        while self.entries.len() > capacity {
            let Some(victim) = self.victim() else { break };
            trace!(block = victim, "evicting");
            self.entries.remove(&victim);
        }
    }

    /// Unhinted blocks go first, then the least recently used.
    fn victim(&self) -> Option<BlockIndex> {
        self.entries
            .iter()
            .min_by_key(|(idx, e)| (self.is_hinted(**idx), e.l_stamp))
            .map(|(idx, _)| *idx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub resident: usize,
    pub readers: usize,
}

pub struct ReadCache {
    layout: BlockLayout,
    source: Arc<dyn StorageStream>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl ReadCache {
    pub fn new(layout: BlockLayout, source: Arc<dyn StorageStream>, capacity: usize) -> Self {
        Self {
            layout,
            source,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the bytes of a durable block, loading them on a miss.
    pub async fn read_block(&self, index: BlockIndex) -> Result<Bytes> {
        self.layout.check(index)?;
        {
            let mut st = self.lock();
            let stamp = st.tick();
            if let Some(entry) = st.entries.get_mut(&index) {
                entry.l_stamp = stamp;
                let data = entry.data.clone();
                st.hits += 1;
                return Ok(data);
            }
            st.misses += 1;
        }
        let data = self.load(index).await?;
        self.lock().insert(index, data.clone(), self.capacity);
        Ok(data)
    }

    async fn load(&self, index: BlockIndex) -> Result<Bytes> {
        let range = self.layout.block_range(index);
        let data = self.source.read(range.clone()).await?;
        if data.len() as u64 != range.end - range.start {
            return Err(EngineError::Storage(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read of block {index}"),
            )));
        }
        Ok(data)
    }

    /// Reads an arbitrary byte range, block by block.
    pub async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        let end = offset.saturating_add(len);
        if end > self.layout.file_size() {
            return Err(EngineError::InvalidSize(format!(
                "range {offset}..{end} exceeds file size {}",
                self.layout.file_size()
            )));
        }
        let mut out = BytesMut::with_capacity(len as usize);
        let mut pos = offset;
        while pos < end {
            let Some(index) = self.layout.block_at(pos) else { break };
            let block = self.read_block(index).await?;
            let block_start = self.layout.block_offset(index);
            let from = (pos - block_start) as usize;
            let to = ((end - block_start) as usize).min(block.len());
            out.extend_from_slice(&block[from..to]);
            pos = block_start + to as u64;
        }
        Ok(out.freeze())
    }

    /// Replaces `reader`'s hint. A hint older than the one already stored is
    /// ignored; returns whether it was applied.
    pub fn set_future_reads(
        &self,
        reader: ReaderId,
        blocks: impl IntoIterator<Item = BlockIndex>,
        stamp: u64,
    ) -> bool {
        let mut st = self.lock();
        if st.hints.get(&reader).is_some_and(|h| h.stamp > stamp) {
            debug!(reader = %reader, stamp, "ignoring stale hint");
            return false;
        }
        let mut seen = HashSet::new();
        let blocks: Vec<BlockIndex> = blocks
            .into_iter()
            .filter(|&b| b < self.layout.nr_blocks() && seen.insert(b))
            .collect();
        trace!(reader = %reader, stamp, blocks = blocks.len(), "hint updated");
        st.hints.insert(reader, Hint { blocks, stamp });
        true
    }

    /// Drops everything attributable to a departed reader.
    pub fn clean(&self, reader: ReaderId) {
        if self.lock().hints.remove(&reader).is_some() {
            debug!(reader = %reader, "reader removed from cache hints");
        }
    }

    /// Loads hinted blocks that are durable in the source but not resident,
    /// without displacing other hinted blocks. Readers take turns, each in
    /// its own hint order, so every reader's next block comes before anyone's
    /// second. Returns how many were loaded.
    pub async fn prefetch(&self) -> Result<usize> {
        let durable = self.layout.complete_prefix(self.source.size().await?);
        let candidates: Vec<BlockIndex> = {
            let st = self.lock();
            let mut readers: Vec<(&ReaderId, &Hint)> = st.hints.iter().collect();
            readers.sort_by_key(|(id, _)| **id);
            let longest = readers.iter().map(|(_, h)| h.blocks.len()).max().unwrap_or(0);
            let mut seen = HashSet::new();
            let mut ordered = Vec::new();
            for rank in 0..longest {
                for (_, hint) in &readers {
                    if let Some(&b) = hint.blocks.get(rank) {
                        if seen.insert(b) {
                            ordered.push(b);
                        }
                    }
                }
            }
            let resident_hinted = ordered.iter().filter(|b| st.entries.contains_key(b)).count();
            let budget = self.capacity.saturating_sub(resident_hinted);
            ordered
                .into_iter()
                .filter(|b| *b < durable && !st.entries.contains_key(b))
                .take(budget)
                .collect()
        };
        let mut loaded = 0;
        for index in candidates {
            let data = self.load(index).await?;
            self.lock().insert(index, data, self.capacity);
            loaded += 1;
        }
        if loaded > 0 {
            debug!(loaded, "prefetched hinted blocks");
        }
        Ok(loaded)
    }

    pub fn invalidate(&self, index: BlockIndex) {
        self.lock().entries.remove(&index);
    }

    pub fn contains(&self, index: BlockIndex) -> bool {
        self.lock().entries.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let st = self.lock();
        CacheStats {
            hits: st.hits,
            misses: st.misses,
            resident: st.entries.len(),
            readers: st.hints.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStream;

    fn cache_over(blocks: u32, capacity: usize) -> (Arc<MemoryStream>, ReadCache) {
        let data: Vec<u8> = (0..blocks * 4).map(|i| i as u8).collect();
        let source = Arc::new(MemoryStream::with_contents("src", &data));
        let layout = BlockLayout::new(data.len() as u64, 4).unwrap();
        let cache = ReadCache::new(layout, source.clone(), capacity);
        (source, cache)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let (_src, cache) = cache_over(4, 2);
        assert_eq!(&cache.read_block(1).await.unwrap()[..], &[4, 5, 6, 7]);
        assert_eq!(&cache.read_block(1).await.unwrap()[..], &[4, 5, 6, 7]);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.resident), (1, 1, 1));
        assert!(cache.read_block(4).await.is_err());
    }

    #[tokio::test]
    async fn lru_without_hints() {
        let (_src, cache) = cache_over(8, 2);
        cache.read_block(0).await.unwrap();
        cache.read_block(1).await.unwrap();
        cache.read_block(0).await.unwrap();
        cache.read_block(2).await.unwrap();
        assert!(cache.contains(0));
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
    }

    #[tokio::test]
    async fn hinted_blocks_outlive_recent_ones() {
        let (_src, cache) = cache_over(8, 2);
        let reader = ReaderId(1);
        assert!(cache.set_future_reads(reader, [0], 1));
        cache.read_block(0).await.unwrap();
        cache.read_block(5).await.unwrap();
        cache.read_block(6).await.unwrap();
        // 0 is the oldest but hinted, so 5 went instead
        assert!(cache.contains(0));
        assert!(!cache.contains(5));
        assert!(cache.contains(6));

        cache.clean(reader);
        cache.read_block(7).await.unwrap();
        assert!(!cache.contains(0));
    }

    #[tokio::test]
    async fn stale_hint_ignored() {
        let (_src, cache) = cache_over(8, 4);
        let reader = ReaderId(9);
        assert!(cache.set_future_reads(reader, [1, 2], 5));
        assert!(!cache.set_future_reads(reader, [6], 4));
        assert_eq!(cache.prefetch().await.unwrap(), 2);
        assert!(cache.contains(1) && cache.contains(2));
        assert!(!cache.contains(6));
    }

    #[tokio::test]
    async fn prefetch_respects_durability_and_capacity() {
        let (src, cache) = cache_over(4, 3);
        cache.set_future_reads(ReaderId(1), [2, 3, 4, 5], 1);
        cache.set_future_reads(ReaderId(2), [0, 1], 1);
        // blocks 4 and 5 are past the file; readers alternate, capacity allows 3
        assert_eq!(cache.prefetch().await.unwrap(), 3);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(2) && cache.contains(0) && cache.contains(3));
        assert!(!cache.contains(1));

        src.fail_next_reads(1);
        cache.invalidate(0);
        assert!(cache.prefetch().await.is_err());
        assert!(!cache.contains(0));
    }

    #[tokio::test]
    async fn prefetch_follows_hint_order() {
        let (_src, cache) = cache_over(8, 2);
        assert!(cache.set_future_reads(ReaderId(4), [7, 1, 7, 5], 1));
        assert_eq!(cache.prefetch().await.unwrap(), 2);
        // the reader's next two blocks, not the two lowest indices
        assert!(cache.contains(7) && cache.contains(1));
        assert!(!cache.contains(5));

        // both stay resident against an unhinted read
        cache.read_block(0).await.unwrap();
        assert!(cache.contains(7) && cache.contains(1));
    }

    #[tokio::test]
    async fn read_range_spans_blocks() {
        let (_src, cache) = cache_over(4, 8);
        let bytes = cache.read_range(3, 6).await.unwrap();
        assert_eq!(&bytes[..], &[3, 4, 5, 6, 7, 8]);
        assert!(cache.read_range(14, 4).await.is_err());
        assert!(cache.read_range(16, 0).await.unwrap().is_empty());
    }
}
