use thiserror::Error;
use vodswarm_proto::{BlockIndex, EventId, PeerId, HASH_LEN};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid size: {0}")]
    InvalidSize(String),
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("hash mismatch: {0}")]
    HashMismatch(String),
    #[error("block {0} is not available locally")]
    BlockUnavailable(BlockIndex),
    #[error("block {index} out of range (file has {len} blocks)")]
    IndexOutOfRange { index: BlockIndex, len: u32 },
    #[error("no slot available for block {0}")]
    NoSlotAvailable(BlockIndex),
    #[error("block {0} is already in flight")]
    BlockInFlight(BlockIndex),
    #[error("block {0} does not hold a slot")]
    SlotNotInUse(BlockIndex),
    #[error("a provisioning request is already outstanding ({0})")]
    ProvisionPending(EventId),
    #[error("acknowledgment for {0} does not match any outstanding request")]
    UnexpectedAck(EventId),
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("peer {0} still has slots in flight")]
    ConnectionActive(PeerId),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("invalid connection transition: {0}")]
    InvalidTransition(String),
    #[error("invalid write: {0}")]
    InvalidWrite(String),
    #[error("writer has outstanding writes")]
    WriterBusy,
    #[error("writer is closed")]
    WriterClosed,
    #[error("destination lost: {0}")]
    DestinationLost(String),
}

impl EngineError {
    pub fn hash_mismatch(block: BlockIndex, expected: [u8; HASH_LEN], received: [u8; HASH_LEN]) -> Self {
        let msg = format!(
            "block={} expected={} received={}",
            block,
            hex::encode(expected),
            hex::encode(received)
        );
        Self::HashMismatch(msg)
    }

    /// Errors that indicate a broken caller invariant rather than an environmental
    /// condition. These are never worth retrying.
    pub fn is_logic_error(&self) -> bool {
        !matches!(
            self,
            Self::InvalidSize(_) | Self::Storage(_) | Self::HashMismatch(_)
                | Self::BlockUnavailable(_)
                | Self::DestinationLost(_)
        )
    }
}

impl Clone for EngineError {
    fn clone(&self) -> Self {
        match self {
            Self::InvalidSize(s) => Self::InvalidSize(s.clone()),
            Self::Storage(e) => Self::Storage(std::io::Error::new(e.kind(), e.to_string())),
            Self::HashMismatch(s) => Self::HashMismatch(s.clone()),
            Self::BlockUnavailable(b) => Self::BlockUnavailable(*b),
            Self::IndexOutOfRange { index, len } => Self::IndexOutOfRange { index: *index, len: *len },
            Self::NoSlotAvailable(b) => Self::NoSlotAvailable(*b),
            Self::BlockInFlight(b) => Self::BlockInFlight(*b),
            Self::SlotNotInUse(b) => Self::SlotNotInUse(*b),
            Self::ProvisionPending(e) => Self::ProvisionPending(*e),
            Self::UnexpectedAck(e) => Self::UnexpectedAck(*e),
            Self::NotConnected(p) => Self::NotConnected(*p),
            Self::ConnectionActive(p) => Self::ConnectionActive(*p),
            Self::UnknownPeer(p) => Self::UnknownPeer(*p),
            Self::InvalidTransition(s) => Self::InvalidTransition(s.clone()),
            Self::InvalidWrite(s) => Self::InvalidWrite(s.clone()),
            Self::WriterBusy => Self::WriterBusy,
            Self::WriterClosed => Self::WriterClosed,
            Self::DestinationLost(s) => Self::DestinationLost(s.clone()),
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
