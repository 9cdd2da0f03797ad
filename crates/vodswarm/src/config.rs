use serde::{Deserialize, Serialize};
use std::time::Duration;
use vodswarm_proto::BLOCK_SIZE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub block_size: u32,
    /// Largest number of hash indices handed out per verification request.
    pub hash_batch_size: usize,
    /// How far past the lowest pending block hash requests may run.
    pub hash_ahead_window: u32,
    /// Slots both sides of a new connection start with before any provisioning.
    pub initial_slots: u32,
    /// Ceiling a downloader asks any single peer for.
    pub max_download_slots: u32,
    /// Ceiling a server grants any single peer.
    pub max_upload_slots: u32,
    pub cache_capacity_blocks: usize,
    pub speed_window_secs: u64,
}

impl EngineConfig {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            hash_batch_size: 8,
            hash_ahead_window: 64,
            initial_slots: 4,
            max_download_slots: 64,
            max_upload_slots: 16,
            cache_capacity_blocks: 256,
            speed_window_secs: 5,
        }
    }

    pub fn speed_window(&self) -> Duration {
        Duration::from_secs(self.speed_window_secs.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(BLOCK_SIZE)
    }
}
