use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub const FILE_ID_LEN: usize = 20;

/// Index of a block (component) within a file.
pub type BlockIndex = u32;

/// Identifies a file within an overlay. Opaque, fixed for the lifetime of a transfer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub [u8; FILE_ID_LEN]);

impl FileId {
	pub fn random() -> Self {
		let mut id = [0u8; FILE_ID_LEN];
		rand::thread_rng().fill(&mut id[..]);
		Self(id)
	}

	pub fn as_bytes(&self) -> &[u8; FILE_ID_LEN] {
		&self.0
	}
}

impl fmt::Display for FileId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for b in &self.0 {
			write!(f, "{b:02x}")?;
		}
		Ok(())
	}
}

impl fmt::Debug for FileId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "FileId({self})")
	}
}

impl FromStr for FileId {
	type Err = IdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.len() != FILE_ID_LEN * 2 {
			return Err(IdError::Length(s.len()));
		}
		let mut id = [0u8; FILE_ID_LEN];
		for (i, out) in id.iter_mut().enumerate() {
			let pair = &s[2 * i..2 * i + 2];
			*out = u8::from_str_radix(pair, 16).map_err(|_| IdError::Digit(pair.to_string()))?;
		}
		Ok(Self(id))
	}
}

macro_rules! counter_id {
	($(#[$meta:meta])* $name:ident, $tag:literal) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		pub struct $name(pub u64);

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, concat!($tag, "-{}"), self.0)
			}
		}
	};
}

counter_id!(
	/// A remote participant of a transfer.
	PeerId,
	"peer"
);
counter_id!(
	/// Correlates a provisioning request with its acknowledgment.
	EventId,
	"event"
);
counter_id!(
	/// A local consumer of cached reads (one per serving connection or player).
	ReaderId,
	"reader"
);

/// A peer as handed out by the membership view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
	pub id: PeerId,
	pub addr: SocketAddr,
}

impl PeerAddress {
	pub fn new(id: PeerId, addr: SocketAddr) -> Self {
		Self { id, addr }
	}
}

/// Allocates identifiers. One factory is created per engine instance and passed to
/// whatever needs fresh ids, so independent instances never share a counter.
#[derive(Debug)]
pub struct IdFactory {
	next: AtomicU64,
}

impl IdFactory {
	pub fn new() -> Self {
		Self::starting_at(1)
	}

	pub fn starting_at(first: u64) -> Self {
		Self { next: AtomicU64::new(first) }
	}

	/// Starts from a random point so ids from separate processes rarely collide.
	pub fn with_random_base() -> Self {
		let base: u32 = rand::thread_rng().gen();
		Self::starting_at((base as u64) << 32)
	}

	fn next(&self) -> u64 {
		self.next.fetch_add(1, Ordering::Relaxed)
	}

	pub fn peer_id(&self) -> PeerId {
		PeerId(self.next())
	}

	pub fn event_id(&self) -> EventId {
		EventId(self.next())
	}

	pub fn reader_id(&self) -> ReaderId {
		ReaderId(self.next())
	}
}

impl Default for IdFactory {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
	#[error("invalid file id length: {0}")]
	Length(usize),
	#[error("invalid hex digits: {0}")]
	Digit(String),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn file_id_hex_roundtrip() {
		let id = FileId([0xab; FILE_ID_LEN]);
		let text = id.to_string();
		assert_eq!(text.len(), FILE_ID_LEN * 2);
		assert!(text.starts_with("abab"));
		assert_eq!(text.parse::<FileId>().expect("parse"), id);
	}

	#[test]
	fn file_id_rejects_bad_input() {
		assert_eq!("abc".parse::<FileId>(), Err(IdError::Length(3)));
		let bad = "zz".repeat(FILE_ID_LEN);
		assert_eq!(bad.parse::<FileId>(), Err(IdError::Digit("zz".to_string())));
	}

	#[test]
	fn factories_are_independent() {
		let a = IdFactory::new();
		let b = IdFactory::new();
		assert_eq!(a.peer_id(), PeerId(1));
		assert_eq!(a.event_id(), EventId(2));
		assert_eq!(b.peer_id(), PeerId(1));
		assert_eq!(a.reader_id().to_string(), "reader-3");
	}
}
