use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use rand::seq::SliceRandom;
use rand::RngCore;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vodswarm::{
    block_hash, BlockHash, BlockLayout, CongestionSignal, EngineConfig, EngineError, FileTransfer, LocalFileStream,
    MemoryStream, PartnerSource, ProvisionReply, SelectionPolicy, SequentialSelection, StorageStream, TransferStats,
};
use vodswarm_proto::{FileId, IdFactory, PeerAddress, PeerId};

#[derive(Parser, Debug, Clone)]
#[command(name = "vodswarm-sim", about = "In-process seeder/leecher transfer simulation", version)]
struct SimConfig {
    #[arg(long, value_name = "BYTES", env = "VODSWARM_SIM_SIZE", default_value_t = 4 * 1024 * 1024, help = "Size of the simulated file")]
    size: u64,

    #[arg(long, value_name = "BYTES", env = "VODSWARM_SIM_BLOCK_SIZE", default_value_t = vodswarm_proto::BLOCK_SIZE, help = "Block size")]
    block_size: u32,

    #[arg(long, short = 's', env = "VODSWARM_SIM_SEEDERS", default_value_t = 2, help = "Number of seeders holding the whole file")]
    seeders: usize,

    #[arg(long, env = "VODSWARM_SIM_MIRRORS", default_value_t = 1, help = "Extra in-memory destinations mirroring the download")]
    mirrors: usize,

    #[arg(long, value_name = "COUNT", env = "VODSWARM_SIM_FLAKY_WRITES", default_value_t = 0, help = "Appends that fail on the first mirror")]
    flaky_writes: usize,

    #[arg(long, value_name = "N", env = "VODSWARM_SIM_CORRUPT_EVERY", default_value_t = 0, help = "Corrupt every Nth served block (0 disables)")]
    corrupt_every: u64,

    #[arg(long, env = "VODSWARM_SIM_CWND", default_value_t = 8.0, help = "Initial congestion window in blocks")]
    cwnd: f64,

    #[arg(long, value_name = "FILE", env = "VODSWARM_SIM_OUT", help = "Write the download to this new file instead of memory")]
    out: Option<PathBuf>,

    #[arg(long, value_name = "FILE", env = "VODSWARM_SIM_CONFIG", help = "JSON engine configuration overriding the defaults")]
    config: Option<PathBuf>,
}

/// Fixed membership, handed out once each in random order.
struct StaticPartners {
    peers: Vec<PeerAddress>,
}

impl StaticPartners {
    fn new(peers: &[PeerAddress]) -> Self {
        let mut peers = peers.to_vec();
        peers.shuffle(&mut rand::thread_rng());
        Self { peers }
    }
}

impl PartnerSource for StaticPartners {
    fn random_partner(&mut self) -> Option<PeerAddress> {
        self.peers.pop()
    }
}

/// Additive increase, multiplicative decrease on lost requests.
struct Aimd {
    cwnd: f64,
}

impl CongestionSignal for Aimd {
    fn app_state(&mut self, adjustment: f64) {
        if adjustment < 0.0 {
            self.cwnd = (self.cwnd / 2.0).max(1.0);
        } else if adjustment >= 0.9 {
            self.cwnd += 1.0 / self.cwnd;
        }
    }

    fn total_cwnd(&self) -> f64 {
        self.cwnd
    }
}

type Transfer = FileTransfer<SequentialSelection, StaticPartners, Aimd>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Serialize)]
struct SimReport {
    elapsed_ms: u128,
    seeders: usize,
    destinations: usize,
    rounds: u64,
    corrupted: u64,
    write_failures: u64,
    verified: bool,
    leecher: TransferStats,
    seeders_uploaded: Vec<u64>,
}

struct Seeder {
    id: PeerId,
    transfer: Transfer,
    served: u64,
}

fn peer_address(id: PeerId, port: u16) -> PeerAddress {
    PeerAddress::new(id, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
}

fn load_config(cfg: &SimConfig) -> Result<EngineConfig, BoxError> {
    let mut engine = match &cfg.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str(&text)?
        }
        None => EngineConfig::default(),
    };
    engine.block_size = cfg.block_size;
    Ok(engine)
}

#[allow(clippy::too_many_arguments)]
async fn open_transfer(
    file: FileId,
    layout: BlockLayout,
    hashes: Option<Vec<BlockHash>>,
    local: PeerId,
    remotes: &[PeerAddress],
    destinations: Vec<Arc<dyn StorageStream>>,
    ids: &Arc<IdFactory>,
    engine: &EngineConfig,
    cwnd: f64,
) -> vodswarm::Result<Transfer> {
    let mut connection = vodswarm::TransferConnection::new(
        file,
        local,
        ids.clone(),
        engine.clone(),
        StaticPartners::new(remotes),
        Aimd { cwnd },
    );
    while let Some(partner) = connection.random_partner() {
        connection.connecting(partner)?;
        connection.connected(partner.id)?;
    }
    let nr_blocks = layout.nr_blocks();
    let selection_cfg = engine.clone();
    FileTransfer::restore(
        file,
        layout,
        hashes,
        move |present| SequentialSelection::new(nr_blocks, present, &selection_cfg),
        destinations,
        connection,
        engine.clone(),
    )
    .await
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_target(false).init();

    let cfg = SimConfig::parse();
    let engine = load_config(&cfg)?;
    let layout = BlockLayout::new(cfg.size, engine.block_size)?;
    let ids = Arc::new(IdFactory::with_random_base());
    let file = FileId::random();

    let mut data = vec![0u8; cfg.size as usize];
    rand::thread_rng().fill_bytes(&mut data);
    let hashes: Vec<BlockHash> = data.chunks(engine.block_size as usize).map(block_hash).collect();

    let leecher_id = ids.peer_id();
    let seeder_addrs: Vec<PeerAddress> = (0..cfg.seeders.max(1))
        .map(|i| peer_address(ids.peer_id(), 7000 + i as u16))
        .collect();
    let leecher_addr = peer_address(leecher_id, 6999);

    info!(
        file = %file,
        size = cfg.size,
        blocks = layout.nr_blocks(),
        seeders = seeder_addrs.len(),
        mirrors = cfg.mirrors,
        "starting simulation"
    );

    let mut seeders = Vec::with_capacity(seeder_addrs.len());
    for addr in &seeder_addrs {
        let store: Arc<dyn StorageStream> = Arc::new(MemoryStream::with_contents(addr.id.to_string(), &data));
        let transfer = open_transfer(
            file,
            layout,
            Some(hashes.clone()),
            addr.id,
            &[leecher_addr],
            vec![store],
            &ids,
            &engine,
            cfg.cwnd,
        )
        .await?;
        seeders.push(Seeder { id: addr.id, transfer, served: 0 });
    }

    let primary: Arc<dyn StorageStream> = match &cfg.out {
        Some(path) => {
            let stream = LocalFileStream::new(path);
            if stream.exists().await? {
                return Err(format!("{} already exists", path.display()).into());
            }
            Arc::new(stream)
        }
        None => Arc::new(MemoryStream::new("primary")),
    };
    let mut mirrors = Vec::with_capacity(cfg.mirrors);
    for i in 0..cfg.mirrors {
        let mirror = Arc::new(MemoryStream::new(format!("mirror-{i}")));
        mirror.set_append_delay(Duration::from_millis(1));
        if i == 0 && cfg.flaky_writes > 0 {
            mirror.fail_next_appends(cfg.flaky_writes);
        }
        mirrors.push(mirror);
    }
    let mut destinations = vec![primary.clone()];
    destinations.extend(mirrors.iter().map(|m| m.clone() as Arc<dyn StorageStream>));
    let nr_destinations = destinations.len();

    let mut leecher = open_transfer(
        file,
        layout,
        None,
        leecher_id,
        &seeder_addrs,
        destinations,
        &ids,
        &engine,
        cfg.cwnd,
    )
    .await?;

    let started = Instant::now();
    let mut rounds = 0u64;
    let mut corrupted = 0u64;
    let mut write_failures = 0u64;
    let mut last_report = 0u32;

    while !leecher.is_complete() {
        rounds += 1;
        if rounds > 1_000_000 {
            warn!(rounds, "giving up, transfer is stuck");
            break;
        }

        for (peer, request) in leecher.rebalance() {
            let Some(seeder) = seeders.iter_mut().find(|s| s.id == peer) else {
                continue;
            };
            match seeder.transfer.connection_mut().on_provision(request) {
                Ok(ProvisionReply::Ack(ack)) => {
                    leecher.connection_mut().on_provision_ack(ack)?;
                }
                Ok(ProvisionReply::Deferred(event)) => {
                    debug!(peer = %peer, event = %event, "provision deferred until uploads drain");
                }
                Err(e) => warn!(error = %e, "provision rejected"),
            }
        }

        while let Some((peer, indices)) = leecher.next_hash_request() {
            let Some(seeder) = seeders.iter().find(|s| s.id == peer) else {
                leecher.on_hashes_failed(peer);
                continue;
            };
            let answer = indices
                .iter()
                .filter_map(|&i| seeder.transfer.hash(i).map(|h| (i, h)))
                .collect();
            leecher.on_hashes(peer, answer);
        }

        // every request of the round holds its upload slot until it is answered
        let mut serving = Vec::new();
        while let Some((peer, block)) = leecher.next_block_request()? {
            let Some(seeder) = seeders.iter_mut().find(|s| s.id == peer) else {
                leecher.on_block_timeout(peer, block)?;
                continue;
            };
            match seeder.transfer.begin_serve(leecher_id, block) {
                Ok(serve) => serving.push((peer, serve)),
                Err(e) => {
                    debug!(peer = %peer, block, error = %e, "seeder refused block");
                    leecher.on_block_timeout(peer, block)?;
                }
            }
        }

        for (peer, serve) in serving {
            let block = serve.block();
            let outcome = serve.read().await;
            let Some(seeder) = seeders.iter_mut().find(|s| s.id == peer) else {
                continue;
            };
            let sent = outcome.as_ref().map_or(0, |b| b.len() as u64);
            match seeder.transfer.end_serve(leecher_id, block, sent) {
                Ok(Some(ack)) => {
                    debug!(peer = %peer, slots = ack.slots, "deferred provision acknowledged");
                    if let Err(e) = leecher.connection_mut().on_provision_ack(ack) {
                        warn!(error = %e, "stale acknowledgment");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(peer = %peer, block, error = %e, "upload slot release failed"),
            }
            let mut bytes = match outcome {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(peer = %peer, block, error = %e, "seeder failed to serve");
                    leecher.on_block_timeout(peer, block)?;
                    continue;
                }
            };
            seeder.served += 1;
            if cfg.corrupt_every > 0 && seeder.served % cfg.corrupt_every == 0 {
                let mut garbled = bytes.to_vec();
                garbled[0] ^= 0xff;
                bytes = Bytes::from(garbled);
                corrupted += 1;
            }
            match leecher.on_block(peer, block, bytes) {
                Ok(()) => {}
                Err(e @ EngineError::DestinationLost(_)) => return Err(e.into()),
                Err(e) => debug!(peer = %peer, block, error = %e, "block rejected"),
            }
        }

        while let Some((block, outcome)) = leecher.next_write_completion().await {
            if let Err(e) = outcome {
                write_failures += 1;
                warn!(block, error = %e, "write failed, block will be fetched again");
            }
        }

        let percent = (leecher.progress() * 100.0) as u32;
        if percent / 10 > last_report / 10 {
            last_report = percent;
            info!(
                progress = percent,
                cwnd = leecher.connection().total_cwnd(),
                rate = leecher.connection().speed() as u64,
                "downloading"
            );
        }
    }

    let mut verified = primary.size().await? == cfg.size;
    if verified {
        let stored = primary.read(0..cfg.size).await?;
        verified = stored.as_ref() == data.as_slice();
    }
    for mirror in &mirrors {
        if mirror.contents() != data {
            warn!(mirror = %mirror.name(), "mirror content differs");
            verified = false;
        }
    }
    let digest = block_hash(&data);
    info!(verified, digest = %hex::encode(digest), "transfer finished");

    leecher.close().await?;
    let report = SimReport {
        elapsed_ms: started.elapsed().as_millis(),
        seeders: seeders.len(),
        destinations: nr_destinations,
        rounds,
        corrupted,
        write_failures,
        verified,
        leecher: leecher.stats(),
        seeders_uploaded: seeders.iter().map(|s| s.transfer.stats().uploaded).collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if leecher.selection().pending_blocks() > 0 {
        warn!(pending = leecher.selection().pending_blocks(), "blocks left unfetched");
    }
    Ok(())
}
