//! Per (file, peer) accounting of in-flight transfer slots.

use std::collections::BTreeSet;
use tracing::debug;
use vodswarm_proto::{BlockIndex, EventId, FileId, PeerId, ProvisionAck, ProvisionRequest};

use crate::error::{EngineError, Result};

/// Outcome of applying a provisioning request on the serving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionReply {
    /// The new ceiling already covers every in-flight slot.
    Ack(ProvisionAck),
    /// The ceiling shrank below current usage. The acknowledgment for this
    /// event is returned by the `release_slot` call that brings usage down to
    /// the ceiling, and nowhere else.
    Deferred(EventId),
}

#[derive(Debug)]
pub struct SlotLedger {
    file: FileId,
    local: PeerId,
    remote: PeerId,
    provisioned: u32,
    in_flight: BTreeSet<BlockIndex>,
    pending: Option<ProvisionRequest>,
}

impl SlotLedger {
    pub fn new(file: FileId, local: PeerId, remote: PeerId, provisioned: u32) -> Self {
        Self {
            file,
            local,
            remote,
            provisioned,
            in_flight: BTreeSet::new(),
            pending: None,
        }
    }

    pub fn available_slot(&self) -> bool {
        self.in_use() < self.provisioned
    }

    pub fn free_slots(&self) -> u32 {
        self.provisioned.saturating_sub(self.in_use())
    }

    pub fn use_slot(&mut self, block: BlockIndex) -> Result<()> {
        if !self.available_slot() {
            return Err(EngineError::NoSlotAvailable(block));
        }
        if !self.in_flight.insert(block) {
            return Err(EngineError::BlockInFlight(block));
        }
        Ok(())
    }

    /// Frees the slot held by `block`. Returns the acknowledgment that was
    /// released by this call, if any.
    pub fn release_slot(&mut self, block: BlockIndex) -> Result<Option<ProvisionAck>> {
        if !self.in_flight.remove(&block) {
            return Err(EngineError::SlotNotInUse(block));
        }
        Ok(self.fire_if_satisfied())
    }

    pub fn is_active(&self) -> bool {
        !self.in_flight.is_empty()
    }

    pub fn in_use(&self) -> u32 {
        self.in_flight.len() as u32
    }

    pub fn provisioned(&self) -> u32 {
        self.provisioned
    }

    pub fn holds(&self, block: BlockIndex) -> bool {
        self.in_flight.contains(&block)
    }

    pub fn has_pending_provision(&self) -> bool {
        self.pending.is_some()
    }

    /// Sets the ceiling directly. Used on the downloading side, where the ceiling
    /// follows the provisioning channel rather than incoming requests.
    pub fn set_provisioned(&mut self, slots: u32) {
        self.provisioned = slots;
    }

    /// Applies a ceiling requested by the remote peer.
    pub fn provision(&mut self, request: ProvisionRequest) -> Result<ProvisionReply> {
        if let Some(p) = &self.pending {
            return Err(EngineError::ProvisionPending(p.event));
        }
        self.provisioned = request.slots;
        if self.in_use() <= request.slots {
            debug!(file = %self.file, peer = %self.remote, slots = request.slots, "provisioned");
            return Ok(ProvisionReply::Ack(request.ack(self.local, request.slots)));
        }
        debug!(
            file = %self.file,
            peer = %self.remote,
            slots = request.slots,
            in_use = self.in_use(),
            "provision deferred until slots drain"
        );
        self.pending = Some(request);
        Ok(ProvisionReply::Deferred(request.event))
    }

    fn fire_if_satisfied(&mut self) -> Option<ProvisionAck> {
        if self.in_use() > self.provisioned {
            return None;
        }
        let request = self.pending.take()?;
        let ack = request.ack(self.local, self.provisioned);
        debug!(file = %self.file, peer = %self.remote, slots = ack.slots, "deferred provision acknowledged");
        Some(ack)
    }

    /// Cancels everything in flight. Returns the affected blocks in ascending
    /// order; a deferred acknowledgment is dropped without firing.
    pub fn drain(&mut self) -> Vec<BlockIndex> {
        if let Some(p) = self.pending.take() {
            debug!(file = %self.file, peer = %self.remote, event = %p.event, "dropping deferred provision");
        }
        std::mem::take(&mut self.in_flight).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use vodswarm_proto::{EventId, FILE_ID_LEN};

    const FILE: FileId = FileId([3u8; FILE_ID_LEN]);

    fn ledger(slots: u32) -> SlotLedger {
        SlotLedger::new(FILE, PeerId(1), PeerId(2), slots)
    }

    fn request(event: u64, slots: u32) -> ProvisionRequest {
        ProvisionRequest::new(EventId(event), FILE, PeerId(2), slots)
    }

    #[test]
    fn test_use_and_release() {
        let mut l = ledger(2);
        assert!(l.available_slot());
        l.use_slot(10).unwrap();
        l.use_slot(11).unwrap();
        assert!(!l.available_slot());
        assert!(matches!(l.use_slot(12), Err(EngineError::NoSlotAvailable(12))));
        assert!(l.is_active());

        assert_eq!(l.release_slot(10).unwrap(), None);
        assert!(matches!(l.use_slot(11), Err(EngineError::BlockInFlight(11))));
        assert!(matches!(l.release_slot(10), Err(EngineError::SlotNotInUse(10))));
        l.release_slot(11).unwrap();
        assert!(!l.is_active());
    }

    #[test]
    fn test_random_interleavings_stay_bounded() {
        let mut rng = rand::thread_rng();
        let mut l = ledger(4);
        let mut held: Vec<BlockIndex> = Vec::new();
        for step in 0..2000u32 {
            if rng.gen_bool(0.5) {
                if l.available_slot() {
                    l.use_slot(step).unwrap();
                    held.push(step);
                } else {
                    assert!(l.use_slot(step).is_err());
                }
            } else if !held.is_empty() {
                let idx = rng.gen_range(0..held.len());
                l.release_slot(held.swap_remove(idx)).unwrap();
            }
            assert_eq!(l.in_use() as usize, held.len());
            assert!(l.in_use() <= l.provisioned());
            if l.in_use() == l.provisioned() {
                assert!(!l.available_slot());
            }
        }
    }

    #[test]
    fn test_increase_acks_immediately() {
        let mut l = ledger(2);
        l.use_slot(0).unwrap();
        match l.provision(request(1, 5)).unwrap() {
            ProvisionReply::Ack(ack) => {
                assert_eq!(ack.slots, 5);
                assert_eq!(ack.from, PeerId(1));
            }
            ProvisionReply::Deferred(_) => panic!("increase must not defer"),
        }
        assert_eq!(l.free_slots(), 4);
    }

    #[test]
    fn test_satisfied_decrease_acks_immediately() {
        let mut l = ledger(6);
        l.use_slot(0).unwrap();
        l.use_slot(1).unwrap();
        assert!(matches!(l.provision(request(1, 2)).unwrap(), ProvisionReply::Ack(_)));
        assert!(!l.available_slot());
    }

    #[test]
    fn test_shrink_defers_until_released() {
        let mut l = ledger(4);
        for b in 0..4 {
            l.use_slot(b).unwrap();
        }
        assert_eq!(l.provision(request(7, 1)).unwrap(), ProvisionReply::Deferred(EventId(7)));
        assert!(l.has_pending_provision());
        assert!(matches!(l.provision(request(8, 3)), Err(EngineError::ProvisionPending(EventId(7)))));

        assert_eq!(l.release_slot(0).unwrap(), None);
        assert_eq!(l.release_slot(1).unwrap(), None);

        let fired = l.release_slot(2).unwrap().expect("ack fires at the ceiling");
        assert_eq!(fired.event, EventId(7));
        assert_eq!(fired.slots, 1);
        assert!(!l.has_pending_provision());
        assert_eq!(l.release_slot(3).unwrap(), None);
    }

    #[test]
    fn test_deferred_ack_yielded_exactly_once() {
        let mut l = ledger(5);
        for b in 0..5 {
            l.use_slot(b).unwrap();
        }
        assert!(matches!(l.provision(request(4, 2)).unwrap(), ProvisionReply::Deferred(_)));
        let acks: Vec<ProvisionAck> = (0..5).filter_map(|b| l.release_slot(b).unwrap()).collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].event, EventId(4));

        // later traffic under the new ceiling never repeats it
        l.use_slot(10).unwrap();
        l.use_slot(11).unwrap();
        assert_eq!(l.release_slot(10).unwrap(), None);
        assert_eq!(l.release_slot(11).unwrap(), None);
    }

    #[test]
    fn test_drain_drops_deferred_ack() {
        let mut l = ledger(3);
        for b in [5, 1, 9] {
            l.use_slot(b).unwrap();
        }
        assert!(matches!(l.provision(request(2, 0)).unwrap(), ProvisionReply::Deferred(EventId(2))));
        assert_eq!(l.drain(), vec![1, 5, 9]);
        assert!(!l.is_active());
        assert!(!l.has_pending_provision());

        // the dropped ack does not resurface once the ledger is reused
        l.provision(request(3, 1)).unwrap();
        l.use_slot(0).unwrap();
        assert_eq!(l.release_slot(0).unwrap(), None);
    }
}
