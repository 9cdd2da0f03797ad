//! Drives one file transfer: hash and block requests towards peers, block
//! verification, buffered writes and serving from the read cache.

use bytes::Bytes;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vodswarm_proto::{BlockIndex, FileId, PeerId, ProvisionAck, ProvisionRequest, ReaderId, HASH_LEN};

use crate::cache::{CacheStats, ReadCache};
use crate::completion::CompletionTracker;
use crate::config::EngineConfig;
use crate::connection::{CongestionSignal, PartnerSource, TransferConnection};
use crate::error::{EngineError, Result};
use crate::layout::BlockLayout;
use crate::selection::SelectionPolicy;
use crate::storage::StorageStream;
use crate::writer::BufferedWriter;

pub type BlockHash = [u8; HASH_LEN];

pub fn block_hash(data: &[u8]) -> BlockHash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut arr = [0u8; HASH_LEN];
    arr.copy_from_slice(&digest);
    arr
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferStats {
    pub file: String,
    pub completed_blocks: u32,
    pub nr_blocks: u32,
    pub progress: f64,
    /// Bytes received from peers, including blocks later rejected.
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub peers: usize,
    pub pending_writes: usize,
    pub hash_failures: u64,
    pub cache: CacheStats,
}

/// An upload under way. The upload slot stays taken until the matching
/// [`FileTransfer::end_serve`], so concurrent serves count against the
/// peer's ceiling.
#[derive(Clone)]
pub struct ServeRead {
    peer: PeerId,
    block: BlockIndex,
    cache: Arc<ReadCache>,
}

impl ServeRead {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn block(&self) -> BlockIndex {
        self.block
    }

    pub async fn read(&self) -> Result<Bytes> {
        self.cache.read_block(self.block).await
    }
}

pub struct FileTransfer<S, P, C> {
    file: FileId,
    layout: BlockLayout,
    config: EngineConfig,
    tracker: CompletionTracker,
    selection: S,
    hashes: Vec<Option<BlockHash>>,
    hash_requests: HashMap<PeerId, Vec<BlockIndex>>,
    /// Announced contents per peer. A peer without an entry is taken to hold
    /// every block.
    peer_blocks: HashMap<PeerId, Vec<bool>>,
    writer: BufferedWriter,
    /// Bytes already in storage when the transfer started. A partially stored
    /// block is completed by writing only its missing tail.
    resume_at: u64,
    cache: Arc<ReadCache>,
    connection: TransferConnection<P, C>,
    readers: HashMap<PeerId, ReaderId>,
    completions_tx: mpsc::UnboundedSender<(BlockIndex, Result<()>)>,
    completions_rx: mpsc::UnboundedReceiver<(BlockIndex, Result<()>)>,
    pending_writes: usize,
    hash_failures: u64,
}

impl<S, P, C> FileTransfer<S, P, C>
where
    S: SelectionPolicy,
    P: PartnerSource,
    C: CongestionSignal,
{
    /// Builds a transfer over an already positioned writer. Blocks below the
    /// writer's append position count as present; `selection` must have been
    /// created with the same prefix.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        file: FileId,
        layout: BlockLayout,
        hashes: Option<Vec<BlockHash>>,
        selection: S,
        writer: BufferedWriter,
        cache: Arc<ReadCache>,
        connection: TransferConnection<P, C>,
        config: EngineConfig,
    ) -> Result<Self> {
        let nr_blocks = layout.nr_blocks();
        let hashes = match hashes {
            Some(known) if known.len() != nr_blocks as usize => {
                return Err(EngineError::InvalidSize(format!(
                    "{} hashes for {} blocks",
                    known.len(),
                    nr_blocks
                )));
            }
            Some(known) => known.into_iter().map(Some).collect(),
            None => vec![None; nr_blocks as usize],
        };
        let resume_at = writer.append_position().min(layout.file_size());
        let present = layout.complete_prefix(resume_at);
        let tracker = CompletionTracker::new(nr_blocks as u64, present as u64)?;
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        info!(
            file = %file,
            size = layout.file_size(),
            blocks = nr_blocks,
            present,
            "transfer opened"
        );
        Ok(Self {
            file,
            layout,
            config,
            tracker,
            selection,
            hashes,
            hash_requests: HashMap::new(),
            peer_blocks: HashMap::new(),
            writer,
            resume_at,
            cache,
            connection,
            readers: HashMap::new(),
            completions_tx,
            completions_rx,
            pending_writes: 0,
            hash_failures: 0,
        })
    }

    /// Opens `destinations`, derives the present prefix from what the shortest
    /// of them already holds, and serves reads from the first one.
    pub async fn restore(
        file: FileId,
        layout: BlockLayout,
        hashes: Option<Vec<BlockHash>>,
        make_selection: impl FnOnce(u32) -> S,
        destinations: Vec<Arc<dyn StorageStream>>,
        connection: TransferConnection<P, C>,
        config: EngineConfig,
    ) -> Result<Self> {
        let primary = destinations
            .first()
            .cloned()
            .ok_or_else(|| EngineError::InvalidSize("transfer needs at least one destination".to_string()))?;
        let writer = BufferedWriter::open(destinations).await?;
        let present = layout.complete_prefix(writer.append_position());
        let selection = make_selection(present);
        let cache = Arc::new(ReadCache::new(layout, primary, config.cache_capacity_blocks));
        Self::new(file, layout, hashes, selection, writer, cache, connection, config)
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn selection(&self) -> &S {
        &self.selection
    }

    pub fn selection_mut(&mut self) -> &mut S {
        &mut self.selection
    }

    pub fn connection(&self) -> &TransferConnection<P, C> {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut TransferConnection<P, C> {
        &mut self.connection
    }

    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    pub fn hash(&self, index: BlockIndex) -> Option<BlockHash> {
        self.hashes.get(index as usize).copied().flatten()
    }

    /// Next batch of hashes to ask a connected peer for. Indices whose hash is
    /// already known are skipped without a request.
    pub fn next_hash_request(&mut self) -> Option<(PeerId, Vec<BlockIndex>)> {
        let peer = self
            .connection
            .connected_peers()
            .filter(|p| !self.hash_requests.contains_key(p))
            .min()?;
        loop {
            let batch = self.selection.next_hashes();
            if batch.is_empty() {
                return None;
            }
            let wanted: Vec<BlockIndex> = batch
                .into_iter()
                .filter(|&i| self.hashes[i as usize].is_none())
                .collect();
            if wanted.is_empty() {
                continue;
            }
            debug!(peer = %peer, first = wanted[0], count = wanted.len(), "requesting hashes");
            self.hash_requests.insert(peer, wanted.clone());
            return Some((peer, wanted));
        }
    }

    /// Records hashes answered by `peer`. Requested indices missing from the
    /// answer go back to selection.
    pub fn on_hashes(&mut self, peer: PeerId, hashes: Vec<(BlockIndex, BlockHash)>) {
        let requested = self.hash_requests.remove(&peer).unwrap_or_default();
        for (index, hash) in hashes {
            if !requested.contains(&index) {
                debug!(peer = %peer, index, "unrequested hash ignored");
                continue;
            }
            self.hashes[index as usize] = Some(hash);
        }
        let missing: Vec<BlockIndex> = requested
            .into_iter()
            .filter(|&i| self.hashes[i as usize].is_none())
            .collect();
        if !missing.is_empty() {
            debug!(peer = %peer, missing = missing.len(), "hash answer incomplete");
            self.selection.reset_hashes(&missing);
        }
    }

    pub fn on_hashes_failed(&mut self, peer: PeerId) {
        if let Some(requested) = self.hash_requests.remove(&peer) {
            warn!(peer = %peer, count = requested.len(), "hash request failed");
            self.selection.reset_hashes(&requested);
        }
    }

    /// Picks a block with a known hash and a peer with a free download slot
    /// that holds it. Peers with more free slots are tried first.
    pub fn next_block_request(&mut self) -> Result<Option<(PeerId, BlockIndex)>> {
        for (peer, _) in self.connection.download_candidates() {
            let hashes = &self.hashes;
            let have = self.peer_blocks.get(&peer);
            let Some(block) = self.selection.next_block_matching(&mut |i| {
                hashes.get(i as usize).is_some_and(|h| h.is_some())
                    && have.map_or(true, |have| have.get(i as usize).copied().unwrap_or(false))
            }) else {
                continue;
            };
            if let Err(e) = self.connection.use_download_slot(peer, block) {
                self.selection.reset_block(block);
                return Err(e);
            }
            debug!(peer = %peer, block, "requesting block");
            return Ok(Some((peer, block)));
        }
        Ok(None)
    }

    /// Records the full set of blocks `peer` holds, replacing an earlier one.
    pub fn on_peer_bitfield(&mut self, peer: PeerId, have: Vec<bool>) -> Result<()> {
        if have.len() != self.layout.nr_blocks() as usize {
            return Err(EngineError::InvalidSize(format!(
                "bitfield of {} for {} blocks",
                have.len(),
                self.layout.nr_blocks()
            )));
        }
        if !self.connection.connected_peers().any(|p| p == peer) {
            return Err(EngineError::NotConnected(peer));
        }
        if let Some(old) = self.peer_blocks.remove(&peer) {
            self.selection.peer_left(&old);
        }
        self.selection.peer_joined(&have);
        debug!(peer = %peer, blocks = have.iter().filter(|&&b| b).count(), "peer bitfield");
        self.peer_blocks.insert(peer, have);
        Ok(())
    }

    /// `peer` finished one more block. A peer that never sent a bitfield starts
    /// from an empty one.
    pub fn on_peer_have(&mut self, peer: PeerId, block: BlockIndex) -> Result<()> {
        self.layout.check(block)?;
        if !self.connection.connected_peers().any(|p| p == peer) {
            return Err(EngineError::NotConnected(peer));
        }
        let nr_blocks = self.layout.nr_blocks() as usize;
        let have = self.peer_blocks.entry(peer).or_insert_with(|| vec![false; nr_blocks]);
        if !have[block as usize] {
            have[block as usize] = true;
            self.selection.peer_has(block);
        }
        Ok(())
    }

    /// Accepts the bytes of a requested block. The download slot is released on
    /// arrival; the write completes later through [`next_write_completion`].
    ///
    /// [`next_write_completion`]: Self::next_write_completion
    pub fn on_block(&mut self, peer: PeerId, block: BlockIndex, data: Bytes) -> Result<()> {
        self.layout.check(block)?;
        self.connection.success_download_slot(peer, block, data.len() as u64)?;

        let Some(expected) = self.hashes[block as usize] else {
            self.selection.reset_block(block);
            return Err(EngineError::HashMismatch(format!("block={block} has no known hash")));
        };
        let received = block_hash(&data);
        if received != expected || data.len() as u64 != self.layout.block_len(block) as u64 {
            self.hash_failures += 1;
            self.selection.reset_block(block);
            warn!(peer = %peer, block, "block failed verification");
            return Err(EngineError::hash_mismatch(block, expected, received));
        }

        let offset = self.layout.block_offset(block);
        let skip = self.resume_at.saturating_sub(offset).min(data.len() as u64);
        let ticket = match self.writer.submit(offset + skip, data.slice(skip as usize..)) {
            Ok(ticket) => ticket,
            Err(e) => {
                self.selection.reset_block(block);
                return Err(e);
            }
        };
        let tx = self.completions_tx.clone();
        self.pending_writes += 1;
        tokio::spawn(async move {
            let outcome = ticket.wait().await;
            let _ = tx.send((block, outcome));
        });
        debug!(peer = %peer, block, "block verified, write queued");
        Ok(())
    }

    /// Waits for the next block write to finish. Returns `None` when no write
    /// is outstanding. A failed block goes back to selection.
    pub async fn next_write_completion(&mut self) -> Option<(BlockIndex, Result<()>)> {
        if self.pending_writes == 0 {
            return None;
        }
        let (block, outcome) = self.completions_rx.recv().await?;
        self.pending_writes -= 1;
        let outcome = match outcome {
            Ok(()) => self.tracker.add_component(block).map(|_| ()),
            Err(e) => {
                warn!(block, error = %e, "block write failed");
                self.selection.reset_block(block);
                Err(e)
            }
        };
        if outcome.is_ok() && self.tracker.is_complete() {
            info!(file = %self.file, blocks = self.layout.nr_blocks(), "transfer complete");
        }
        Some((block, outcome))
    }

    pub fn pending_writes(&self) -> usize {
        self.pending_writes
    }

    pub fn on_block_timeout(&mut self, peer: PeerId, block: BlockIndex) -> Result<()> {
        self.connection.timeout_download_slot(peer, block)?;
        self.selection.reset_block(block);
        Ok(())
    }

    /// Forgets `peer`. Every block and hash index it held goes back to selection.
    pub fn on_peer_disconnected(&mut self, peer: PeerId) {
        let cancelled = self.connection.disconnect(peer);
        for &block in &cancelled.downloads {
            self.selection.reset_block(block);
        }
        if let Some(requested) = self.hash_requests.remove(&peer) {
            self.selection.reset_hashes(&requested);
        }
        if let Some(have) = self.peer_blocks.remove(&peer) {
            self.selection.peer_left(&have);
        }
        if let Some(reader) = self.readers.remove(&peer) {
            self.cache.clean(reader);
        }
    }

    /// Takes an upload slot for sending a complete block to `peer`. The slot
    /// is held until [`end_serve`](Self::end_serve).
    pub fn begin_serve(&mut self, peer: PeerId, block: BlockIndex) -> Result<ServeRead> {
        self.layout.check(block)?;
        if !self.tracker.has_component(block) {
            return Err(EngineError::BlockUnavailable(block));
        }
        self.connection.use_upload_slot(peer, block)?;
        Ok(ServeRead {
            peer,
            block,
            cache: self.cache.clone(),
        })
    }

    /// Frees the upload slot after `bytes` were sent (zero on failure). Returns
    /// the provisioning acknowledgment that became due with this release; it
    /// is handed out here only and must be sent to the peer.
    pub fn end_serve(&mut self, peer: PeerId, block: BlockIndex, bytes: u64) -> Result<Option<ProvisionAck>> {
        self.connection.release_upload_slot(peer, block, bytes)
    }

    /// Reads and sends one block in a single step.
    pub async fn serve_block(&mut self, peer: PeerId, block: BlockIndex) -> Result<(Bytes, Option<ProvisionAck>)> {
        let serve = self.begin_serve(peer, block)?;
        match serve.read().await {
            Ok(data) => {
                let ack = self.end_serve(peer, block, data.len() as u64)?;
                Ok((data, ack))
            }
            Err(e) => {
                warn!(peer = %peer, block, error = %e, "serving block failed");
                self.end_serve(peer, block, 0)?;
                Err(e)
            }
        }
    }

    /// Publishes the blocks `peer` is expected to request next.
    pub fn hint_reads(&mut self, peer: PeerId, blocks: impl IntoIterator<Item = BlockIndex>, stamp: u64) -> bool {
        let ids = self.connection.ids().clone();
        let reader = *self.readers.entry(peer).or_insert_with(|| ids.reader_id());
        self.cache.set_future_reads(reader, blocks, stamp)
    }

    pub async fn prefetch(&self) -> Result<usize> {
        self.cache.prefetch().await
    }

    /// New ceilings for every peer whose slot count no longer follows the
    /// congestion window. Each request must be sent to the paired peer.
    pub fn rebalance(&mut self) -> Vec<(PeerId, ProvisionRequest)> {
        let mut requests = Vec::new();
        for (peer, slots) in self.connection.provision_targets() {
            match self.connection.request_provision(peer, slots) {
                Ok(req) => requests.push((peer, req)),
                Err(e) => debug!(peer = %peer, error = %e, "skipping provision"),
            }
        }
        requests
    }

    pub fn is_complete(&self) -> bool {
        self.tracker.is_complete()
    }

    pub fn progress(&self) -> f64 {
        self.tracker.progress()
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            file: self.file.to_string(),
            completed_blocks: self.tracker.completed_components(),
            nr_blocks: self.layout.nr_blocks(),
            progress: self.progress(),
            downloaded: self.connection.total_downloaded(),
            uploaded: self.connection.total_uploaded(),
            download_rate: self.connection.speed(),
            upload_rate: self.connection.upload_speed(),
            peers: self.connection.connected_peers().count(),
            pending_writes: self.pending_writes,
            hash_failures: self.hash_failures,
            cache: self.cache.stats(),
        }
    }

    /// Closes storage. Fails with `WriterBusy` while writes are outstanding.
    pub async fn close(&mut self) -> Result<()> {
        if self.pending_writes > 0 {
            return Err(EngineError::WriterBusy);
        }
        self.writer.close().await?;
        info!(file = %self.file, complete = self.is_complete(), "transfer closed");
        Ok(())
    }
}
