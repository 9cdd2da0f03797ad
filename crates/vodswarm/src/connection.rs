//! Per-file view of every peer connection: slot ledgers, provisioning and the
//! feed into the congestion controller.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vodswarm_proto::{BlockIndex, FileId, IdFactory, PeerAddress, PeerId, ProvisionAck, ProvisionRequest};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::provision::ProvisionChannel;
use crate::slots::{ProvisionReply, SlotLedger};
use crate::speed::SpeedMeter;

/// Membership view handing out candidate peers.
pub trait PartnerSource: Send {
    fn random_partner(&mut self) -> Option<PeerAddress>;
}

/// Congestion controller consumed as an opaque signal.
pub trait CongestionSignal: Send {
    /// Reports how the application is using the window. Non-negative values are
    /// the fraction of slots in use; negative values report a lost request.
    fn app_state(&mut self, adjustment: f64);

    /// Current congestion window, in blocks.
    fn total_cwnd(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// At least one slot is in flight.
    Active,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(Activity),
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Connected,
    Disconnecting,
}

/// Blocks that were in flight when a peer went away.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cancelled {
    pub downloads: Vec<BlockIndex>,
    pub uploads: Vec<BlockIndex>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub timeouts: u64,
}

#[derive(Debug)]
struct PeerConnection {
    address: PeerAddress,
    phase: Phase,
    download: SlotLedger,
    provision: ProvisionChannel,
    upload: SlotLedger,
    stats: PeerStats,
}

impl PeerConnection {
    fn is_active(&self) -> bool {
        self.download.is_active() || self.upload.is_active()
    }
}

pub struct TransferConnection<P, C> {
    file: FileId,
    local: PeerId,
    ids: Arc<IdFactory>,
    config: EngineConfig,
    partners: P,
    congestion: C,
    peers: HashMap<PeerId, PeerConnection>,
    download_speed: SpeedMeter,
    upload_speed: SpeedMeter,
}

impl<P: PartnerSource, C: CongestionSignal> TransferConnection<P, C> {
    pub fn new(
        file: FileId,
        local: PeerId,
        ids: Arc<IdFactory>,
        config: EngineConfig,
        partners: P,
        congestion: C,
    ) -> Self {
        let window = config.speed_window();
        Self {
            file,
            local,
            ids,
            config,
            partners,
            congestion,
            peers: HashMap::new(),
            download_speed: SpeedMeter::new(window),
            upload_speed: SpeedMeter::new(window),
        }
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn ids(&self) -> &Arc<IdFactory> {
        &self.ids
    }

    /// A candidate from the membership view that is not already known here.
    pub fn random_partner(&mut self) -> Option<PeerAddress> {
        for _ in 0..3 {
            let candidate = self.partners.random_partner()?;
            if candidate.id != self.local && !self.peers.contains_key(&candidate.id) {
                return Some(candidate);
            }
        }
        None
    }

    pub fn state(&self, peer: PeerId) -> ConnectionState {
        match self.peers.get(&peer) {
            None => ConnectionState::Disconnected,
            Some(c) => match c.phase {
                Phase::Connecting => ConnectionState::Connecting,
                Phase::Disconnecting => ConnectionState::Disconnecting,
                Phase::Connected if c.is_active() => ConnectionState::Connected(Activity::Active),
                Phase::Connected => ConnectionState::Connected(Activity::Idle),
            },
        }
    }

    pub fn connecting(&mut self, address: PeerAddress) -> Result<()> {
        if let Some(existing) = self.peers.get(&address.id) {
            return Err(EngineError::InvalidTransition(format!(
                "{} is {:?}, cannot start connecting",
                address.id, existing.phase
            )));
        }
        let initial = self.config.initial_slots;
        let conn = PeerConnection {
            address,
            phase: Phase::Connecting,
            download: SlotLedger::new(self.file, self.local, address.id, initial),
            provision: ProvisionChannel::new(self.file, self.local, initial),
            upload: SlotLedger::new(self.file, self.local, address.id, initial),
            stats: PeerStats::default(),
        };
        self.peers.insert(address.id, conn);
        debug!(file = %self.file, peer = %address.id, addr = %address.addr, "connecting");
        Ok(())
    }

    pub fn connected(&mut self, peer: PeerId) -> Result<()> {
        let conn = self.peers.get_mut(&peer).ok_or(EngineError::UnknownPeer(peer))?;
        if conn.phase != Phase::Connecting {
            return Err(EngineError::InvalidTransition(format!("{peer} is {:?}, cannot connect", conn.phase)));
        }
        conn.phase = Phase::Connected;
        info!(file = %self.file, peer = %peer, addr = %conn.address.addr, "peer connected");
        Ok(())
    }

    /// Starts a graceful close. Closing while slots are in flight is a caller bug.
    pub fn close(&mut self, peer: PeerId) -> Result<()> {
        let conn = self.peers.get_mut(&peer).ok_or(EngineError::UnknownPeer(peer))?;
        if conn.phase != Phase::Connected {
            return Err(EngineError::InvalidTransition(format!("{peer} is {:?}, cannot close", conn.phase)));
        }
        if conn.is_active() {
            return Err(EngineError::ConnectionActive(peer));
        }
        conn.provision.abandon();
        conn.phase = Phase::Disconnecting;
        debug!(file = %self.file, peer = %peer, "closing");
        Ok(())
    }

    /// Completes a graceful close.
    pub fn closed(&mut self, peer: PeerId) -> Result<()> {
        match self.peers.get(&peer).map(|c| c.phase) {
            Some(Phase::Disconnecting) => {
                self.peers.remove(&peer);
                debug!(file = %self.file, peer = %peer, "closed");
                Ok(())
            }
            Some(phase) => Err(EngineError::InvalidTransition(format!("{peer} is {phase:?}, cannot finish closing"))),
            None => Err(EngineError::UnknownPeer(peer)),
        }
    }

    /// Drops a peer abruptly from any state. In-flight blocks are returned so the
    /// caller can put them back into selection; pending provisioning is discarded.
    pub fn disconnect(&mut self, peer: PeerId) -> Cancelled {
        let Some(mut conn) = self.peers.remove(&peer) else {
            return Cancelled::default();
        };
        conn.provision.abandon();
        let cancelled = Cancelled {
            downloads: conn.download.drain(),
            uploads: conn.upload.drain(),
        };
        if !cancelled.downloads.is_empty() || !cancelled.uploads.is_empty() {
            warn!(
                file = %self.file,
                peer = %peer,
                downloads = cancelled.downloads.len(),
                uploads = cancelled.uploads.len(),
                "peer disconnected with slots in flight"
            );
        } else {
            debug!(file = %self.file, peer = %peer, "peer disconnected");
        }
        cancelled
    }

    fn connected_mut(&mut self, peer: PeerId) -> Result<&mut PeerConnection> {
        match self.peers.get_mut(&peer) {
            Some(c) if c.phase == Phase::Connected => Ok(c),
            Some(_) => Err(EngineError::NotConnected(peer)),
            None => Err(EngineError::UnknownPeer(peer)),
        }
    }

    fn connected_ref(&self, peer: PeerId) -> Result<&PeerConnection> {
        match self.peers.get(&peer) {
            Some(c) if c.phase == Phase::Connected => Ok(c),
            Some(_) => Err(EngineError::NotConnected(peer)),
            None => Err(EngineError::UnknownPeer(peer)),
        }
    }

    pub fn connected_peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers
            .iter()
            .filter(|(_, c)| c.phase == Phase::Connected)
            .map(|(id, _)| *id)
    }

    /// The connected peer with the most free download slots, and how many it has.
    pub fn available_download_slot(&self) -> Option<(PeerId, u32)> {
        self.download_candidates().into_iter().next()
    }

    /// Connected peers with a free download slot, most free slots first and
    /// lowest id on ties.
    pub fn download_candidates(&self) -> Vec<(PeerId, u32)> {
        let mut candidates: Vec<(PeerId, u32)> = self
            .peers
            .iter()
            .filter(|(_, c)| c.phase == Phase::Connected)
            .map(|(id, c)| (*id, c.download.free_slots()))
            .filter(|(_, free)| *free > 0)
            .collect();
        candidates.sort_by_key(|(id, free)| (std::cmp::Reverse(*free), *id));
        candidates
    }

    pub fn use_download_slot(&mut self, peer: PeerId, block: BlockIndex) -> Result<()> {
        self.connected_mut(peer)?.download.use_slot(block)
    }

    /// The block arrived; `bytes` feed the speed estimate.
    pub fn success_download_slot(&mut self, peer: PeerId, block: BlockIndex, bytes: u64) -> Result<()> {
        let conn = self.connected_mut(peer)?;
        let utilization = conn.download.in_use() as f64 / conn.download.provisioned().max(1) as f64;
        conn.download.release_slot(block)?;
        conn.stats.downloaded += bytes;
        self.download_speed.record(bytes);
        self.congestion.app_state(utilization.min(1.0));
        Ok(())
    }

    pub fn timeout_download_slot(&mut self, peer: PeerId, block: BlockIndex) -> Result<()> {
        let conn = self.connected_mut(peer)?;
        conn.download.release_slot(block)?;
        conn.stats.timeouts += 1;
        self.congestion.app_state(-1.0);
        debug!(file = %self.file, peer = %peer, block, "download slot timed out");
        Ok(())
    }

    /// Frees a download slot without reporting an outcome (the request was
    /// withdrawn locally).
    pub fn abort_download_slot(&mut self, peer: PeerId, block: BlockIndex) -> Result<()> {
        self.connected_mut(peer)?.download.release_slot(block)?;
        Ok(())
    }

    pub fn available_upload_slot(&self, peer: PeerId) -> Result<bool> {
        Ok(self.connected_ref(peer)?.upload.available_slot())
    }

    pub fn use_upload_slot(&mut self, peer: PeerId, block: BlockIndex) -> Result<()> {
        self.connected_mut(peer)?.upload.use_slot(block)
    }

    /// Frees an upload slot. Returns a provisioning acknowledgment that became
    /// due with this release and must be sent to the peer.
    pub fn release_upload_slot(&mut self, peer: PeerId, block: BlockIndex, bytes: u64) -> Result<Option<ProvisionAck>> {
        let conn = self.connected_mut(peer)?;
        let fired = conn.upload.release_slot(block)?;
        conn.stats.uploaded += bytes;
        self.upload_speed.record(bytes);
        Ok(fired)
    }

    /// Asks `peer` for a new download ceiling, capped by the configuration.
    pub fn request_provision(&mut self, peer: PeerId, slots: u32) -> Result<ProvisionRequest> {
        let slots = slots.clamp(1, self.config.max_download_slots.max(1));
        let event = self.ids.event_id();
        let conn = self.connected_mut(peer)?;
        let request = conn.provision.request(event, slots)?;
        let effective = conn.provision.effective();
        conn.download.set_provisioned(effective);
        Ok(request)
    }

    /// Serving side: applies a ceiling requested by a downloader.
    pub fn on_provision(&mut self, request: ProvisionRequest) -> Result<ProvisionReply> {
        if request.file != self.file {
            return Err(EngineError::InvalidTransition(format!("provision for foreign file {}", request.file)));
        }
        let cap = self.config.max_upload_slots;
        let conn = self.connected_mut(request.from)?;
        let granted = ProvisionRequest {
            slots: request.slots.min(cap),
            ..request
        };
        conn.upload.provision(granted)
    }

    /// Downloading side: applies the acknowledgment and returns the new ceiling.
    pub fn on_provision_ack(&mut self, ack: ProvisionAck) -> Result<u32> {
        let conn = self.connected_mut(ack.from)?;
        let effective = conn.provision.on_ack(ack)?;
        conn.download.set_provisioned(effective);
        Ok(effective)
    }

    /// Per-peer ceilings that follow from the congestion window, for peers whose
    /// current ceiling differs and that have no request outstanding.
    pub fn provision_targets(&self) -> Vec<(PeerId, u32)> {
        let connected = self.connected_peers().count();
        if connected == 0 {
            return Vec::new();
        }
        let max = self.config.max_download_slots.max(1);
        let per_peer = (self.total_cwnd() / connected as f64).ceil();
        let target = if per_peer.is_finite() { (per_peer as u32).clamp(1, max) } else { max };
        let mut out: Vec<(PeerId, u32)> = self
            .peers
            .iter()
            .filter(|(_, c)| c.phase == Phase::Connected && !c.provision.is_waiting())
            .filter(|(_, c)| c.provision.effective() != target)
            .map(|(id, _)| (*id, target))
            .collect();
        out.sort();
        out
    }

    pub fn download_in_use(&self, peer: PeerId) -> u32 {
        self.peers.get(&peer).map(|c| c.download.in_use()).unwrap_or(0)
    }

    pub fn download_ceiling(&self, peer: PeerId) -> u32 {
        self.peers.get(&peer).map(|c| c.download.provisioned()).unwrap_or(0)
    }

    pub fn upload_in_use(&self, peer: PeerId) -> u32 {
        self.peers.get(&peer).map(|c| c.upload.in_use()).unwrap_or(0)
    }

    pub fn upload_ceiling(&self, peer: PeerId) -> u32 {
        self.peers.get(&peer).map(|c| c.upload.provisioned()).unwrap_or(0)
    }

    pub fn peer_stats(&self, peer: PeerId) -> Option<PeerStats> {
        self.peers.get(&peer).map(|c| c.stats)
    }

    /// Download rate in bytes per second.
    pub fn speed(&self) -> f64 {
        self.download_speed.rate()
    }

    pub fn upload_speed(&self) -> f64 {
        self.upload_speed.rate()
    }

    pub fn total_downloaded(&self) -> u64 {
        self.download_speed.total()
    }

    pub fn total_uploaded(&self) -> u64 {
        self.upload_speed.total()
    }

    pub fn total_cwnd(&self) -> f64 {
        self.congestion.total_cwnd()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::SocketAddr;
    use vodswarm_proto::FILE_ID_LEN;

    pub(crate) struct FixedPartners(pub Vec<PeerAddress>);

    impl PartnerSource for FixedPartners {
        fn random_partner(&mut self) -> Option<PeerAddress> {
            self.0.pop()
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingCwnd {
        pub cwnd: f64,
        pub reports: Vec<f64>,
    }

    impl CongestionSignal for RecordingCwnd {
        fn app_state(&mut self, adjustment: f64) {
            self.reports.push(adjustment);
        }

        fn total_cwnd(&self) -> f64 {
            self.cwnd
        }
    }

    pub(crate) fn addr(id: u64) -> PeerAddress {
        let sa: SocketAddr = format!("127.0.0.1:{}", 7000 + id).parse().unwrap();
        PeerAddress::new(PeerId(id), sa)
    }

    const FILE: FileId = FileId([1u8; FILE_ID_LEN]);

    fn facade() -> TransferConnection<FixedPartners, RecordingCwnd> {
        let config = EngineConfig {
            initial_slots: 2,
            max_download_slots: 8,
            max_upload_slots: 3,
            ..EngineConfig::default()
        };
        TransferConnection::new(
            FILE,
            PeerId(100),
            Arc::new(IdFactory::starting_at(1000)),
            config,
            FixedPartners(vec![addr(2), addr(1), addr(100)]),
            RecordingCwnd { cwnd: 6.0, ..Default::default() },
        )
    }

    fn connect(f: &mut TransferConnection<FixedPartners, RecordingCwnd>, id: u64) {
        f.connecting(addr(id)).unwrap();
        f.connected(PeerId(id)).unwrap();
    }

    #[test]
    fn test_state_machine() {
        let mut f = facade();
        let p = PeerId(1);
        assert_eq!(f.state(p), ConnectionState::Disconnected);
        f.connecting(addr(1)).unwrap();
        assert_eq!(f.state(p), ConnectionState::Connecting);
        assert!(matches!(f.use_download_slot(p, 0), Err(EngineError::NotConnected(_))));
        assert!(f.connecting(addr(1)).is_err());

        f.connected(p).unwrap();
        assert_eq!(f.state(p), ConnectionState::Connected(Activity::Idle));
        f.use_download_slot(p, 0).unwrap();
        assert_eq!(f.state(p), ConnectionState::Connected(Activity::Active));
        assert!(matches!(f.close(p), Err(EngineError::ConnectionActive(_))));

        f.success_download_slot(p, 0, 100).unwrap();
        f.close(p).unwrap();
        assert_eq!(f.state(p), ConnectionState::Disconnecting);
        assert!(matches!(f.use_upload_slot(p, 1), Err(EngineError::NotConnected(_))));
        f.closed(p).unwrap();
        assert_eq!(f.state(p), ConnectionState::Disconnected);
        assert!(matches!(f.use_download_slot(p, 0), Err(EngineError::UnknownPeer(_))));
    }

    #[test]
    fn test_random_partner_skips_known_and_self() {
        let mut f = facade();
        // the source yields self (100) first, then 1
        assert_eq!(f.random_partner().map(|a| a.id), Some(PeerId(1)));
        connect(&mut f, 2);
        assert_eq!(f.random_partner(), None);
    }

    #[test]
    fn test_download_slots_and_congestion_feed() {
        let mut f = facade();
        connect(&mut f, 1);
        connect(&mut f, 2);
        f.use_download_slot(PeerId(1), 0).unwrap();
        // peer 2 has more room
        assert_eq!(f.available_download_slot(), Some((PeerId(2), 2)));
        f.use_download_slot(PeerId(2), 1).unwrap();
        f.use_download_slot(PeerId(2), 2).unwrap();
        assert_eq!(f.available_download_slot(), Some((PeerId(1), 1)));
        f.use_download_slot(PeerId(1), 3).unwrap();
        assert_eq!(f.available_download_slot(), None);

        f.success_download_slot(PeerId(2), 1, 1000).unwrap();
        f.timeout_download_slot(PeerId(1), 0).unwrap();
        assert_eq!(f.congestion.reports, vec![1.0, -1.0]);
        assert_eq!(f.peer_stats(PeerId(1)).unwrap().timeouts, 1);
        assert_eq!(f.total_downloaded(), 1000);
        assert!(f.speed() > 0.0);
        assert!(matches!(f.success_download_slot(PeerId(2), 1, 10), Err(EngineError::SlotNotInUse(1))));
    }

    #[test]
    fn test_disconnect_returns_in_flight() {
        let mut f = facade();
        connect(&mut f, 1);
        f.use_download_slot(PeerId(1), 7).unwrap();
        f.use_download_slot(PeerId(1), 3).unwrap();
        f.use_upload_slot(PeerId(1), 9).unwrap();
        f.request_provision(PeerId(1), 5).unwrap();

        let cancelled = f.disconnect(PeerId(1));
        assert_eq!(cancelled.downloads, vec![3, 7]);
        assert_eq!(cancelled.uploads, vec![9]);
        assert_eq!(f.state(PeerId(1)), ConnectionState::Disconnected);
        assert_eq!(f.disconnect(PeerId(1)), Cancelled::default());
    }

    #[test]
    fn test_provisioning_between_two_facades() {
        let mut downloader = facade();
        let mut server = TransferConnection::new(
            FILE,
            PeerId(1),
            Arc::new(IdFactory::new()),
            EngineConfig {
                initial_slots: 2,
                max_upload_slots: 3,
                ..EngineConfig::default()
            },
            FixedPartners(Vec::new()),
            RecordingCwnd::default(),
        );
        connect(&mut downloader, 1);
        connect(&mut server, 100);

        // growth: effective immediately, capped by the server
        let req = downloader.request_provision(PeerId(1), 6).unwrap();
        assert_eq!(downloader.download_ceiling(PeerId(1)), 6);
        assert!(matches!(downloader.request_provision(PeerId(1), 7), Err(EngineError::ProvisionPending(_))));
        let ProvisionReply::Ack(ack) = server.on_provision(req).unwrap() else {
            panic!("growth must ack immediately");
        };
        assert_eq!(ack.slots, 3);
        assert_eq!(downloader.on_provision_ack(ack).unwrap(), 3);
        assert_eq!(downloader.download_ceiling(PeerId(1)), 3);

        // shrink below usage on the server: ack waits for releases
        for b in 0..3 {
            server.use_upload_slot(PeerId(100), b).unwrap();
        }
        let req = downloader.request_provision(PeerId(1), 1).unwrap();
        assert_eq!(downloader.download_ceiling(PeerId(1)), 3);
        assert_eq!(server.on_provision(req).unwrap(), ProvisionReply::Deferred(req.event));
        assert_eq!(server.release_upload_slot(PeerId(100), 0, 10).unwrap(), None);
        let fired = server.release_upload_slot(PeerId(100), 1, 10).unwrap().expect("fires at ceiling");
        assert_eq!(server.release_upload_slot(PeerId(100), 2, 0).unwrap(), None);
        assert_eq!(downloader.on_provision_ack(fired).unwrap(), 1);
        assert!(downloader.on_provision_ack(fired).is_err());
        assert_eq!(server.total_uploaded(), 20);
    }

    #[test]
    fn test_provision_targets_follow_cwnd() {
        let mut f = facade();
        connect(&mut f, 1);
        connect(&mut f, 2);
        // cwnd 6 over two peers: 3 each
        assert_eq!(f.provision_targets(), vec![(PeerId(1), 3), (PeerId(2), 3)]);
        f.request_provision(PeerId(1), 3).unwrap();
        assert_eq!(f.provision_targets(), vec![(PeerId(2), 3)]);
    }
}
