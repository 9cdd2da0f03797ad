use serde::{Deserialize, Serialize};

use crate::ids::{EventId, FileId, PeerId};

/// Slot-ceiling renegotiation, sent by the downloading side of a (file, peer) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
	pub event: EventId,
	pub file: FileId,
	/// The peer that sent the request.
	pub from: PeerId,
	/// Requested ceiling of concurrently served blocks.
	pub slots: u32,
}

impl ProvisionRequest {
	pub fn new(event: EventId, file: FileId, from: PeerId, slots: u32) -> Self {
		Self { event, file, from, slots }
	}

	/// Builds the acknowledgment carrying the ceiling actually applied by `local`.
	pub fn ack(&self, local: PeerId, applied: u32) -> ProvisionAck {
		ProvisionAck {
			event: self.event,
			file: self.file,
			from: local,
			slots: applied,
		}
	}
}

/// Answer to a [`ProvisionRequest`]. There is no negative variant: a request is
/// always eventually acknowledged unless the connection goes away first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionAck {
	pub event: EventId,
	pub file: FileId,
	/// The peer that applied the ceiling.
	pub from: PeerId,
	pub slots: u32,
}

impl ProvisionAck {
	pub fn answers(&self, request: &ProvisionRequest) -> bool {
		self.event == request.event && self.file == request.file
	}
}
