pub mod cache;
pub mod completion;
pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod layout;
pub mod provision;
pub mod selection;
pub mod slots;
pub mod speed;
pub mod storage;
pub mod transfer;
pub mod writer;

pub use cache::{CacheStats, ReadCache};
pub use completion::CompletionTracker;
pub use config::EngineConfig;
pub use connection::{Activity, Cancelled, CongestionSignal, ConnectionState, PartnerSource, PeerStats, TransferConnection};
pub use error::{EngineError, Result};
pub use fanout::{FanOut, FanOutResult};
pub use layout::BlockLayout;
pub use provision::ProvisionChannel;
pub use selection::{RarestFirstSelection, SelectionPolicy, SequentialSelection};
pub use slots::{ProvisionReply, SlotLedger};
pub use speed::SpeedMeter;
pub use storage::{LocalFileStream, MemoryStream, StorageStream};
pub use transfer::{block_hash, BlockHash, FileTransfer, ServeRead, TransferStats};
pub use writer::{BufferedWriter, WriteTicket};
