pub mod ids;
pub mod provision;

pub use ids::{
	BlockIndex,
	FileId,
	PeerId,
	EventId,
	ReaderId,
	PeerAddress,
	IdFactory,
	IdError,
	FILE_ID_LEN,
};

pub use provision::{ProvisionAck, ProvisionRequest};

/// Default block size (16 KiB).
pub const BLOCK_SIZE: u32 = 16384;

/// Length of the SHA-1 digest used to verify blocks.
pub const HASH_LEN: usize = 20;
