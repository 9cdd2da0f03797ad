use tracing::debug;
use vodswarm_proto::{EventId, FileId, PeerId, ProvisionAck, ProvisionRequest};

use crate::error::{EngineError, Result};

/// Downloading side of the slot provisioning handshake for one (file, peer).
///
/// While a request is outstanding the usable ceiling is the larger of the
/// requested and the last acknowledged value, so a pending increase can be used
/// right away and a pending decrease does not cut in-flight work short.
#[derive(Debug)]
pub struct ProvisionChannel {
    file: FileId,
    local: PeerId,
    requested: u32,
    acknowledged: u32,
    waiting: Option<ProvisionRequest>,
}

impl ProvisionChannel {
    pub fn new(file: FileId, local: PeerId, initial: u32) -> Self {
        Self {
            file,
            local,
            requested: initial,
            acknowledged: initial,
            waiting: None,
        }
    }

    /// Starts a renegotiation towards `slots`.
    pub fn request(&mut self, event: EventId, slots: u32) -> Result<ProvisionRequest> {
        if let Some(w) = &self.waiting {
            return Err(EngineError::ProvisionPending(w.event));
        }
        let request = ProvisionRequest::new(event, self.file, self.local, slots);
        self.requested = slots;
        self.waiting = Some(request);
        debug!(file = %self.file, event = %event, slots, "provision requested");
        Ok(request)
    }

    /// Applies an acknowledgment and returns the new effective ceiling.
    pub fn on_ack(&mut self, ack: ProvisionAck) -> Result<u32> {
        match &self.waiting {
            Some(w) if ack.answers(w) => {}
            _ => return Err(EngineError::UnexpectedAck(ack.event)),
        }
        self.waiting = None;
        self.acknowledged = ack.slots;
        self.requested = ack.slots;
        debug!(file = %self.file, event = %ack.event, slots = ack.slots, "provision acknowledged");
        Ok(self.effective())
    }

    pub fn effective(&self) -> u32 {
        if self.waiting.is_some() {
            self.requested.max(self.acknowledged)
        } else {
            self.acknowledged
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.is_some()
    }

    pub fn acknowledged(&self) -> u32 {
        self.acknowledged
    }

    /// Forgets the outstanding request (peer went away). Its acknowledgment, if it
    /// ever arrives, will be rejected.
    pub fn abandon(&mut self) -> Option<ProvisionRequest> {
        let abandoned = self.waiting.take();
        self.requested = self.acknowledged;
        abandoned
    }
}
