//! Backing stores behind the buffered writer and the read cache.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

mod local;
mod memory;

pub use local::LocalFileStream;
pub use memory::MemoryStream;

/// Uniform contract of an append-only destination stream. Every call may fail
/// independently; queuing of concurrent calls is up to the implementation.
#[async_trait]
pub trait StorageStream: Send + Sync {
    /// Appends `data` at the end of the stream and returns the number of bytes written.
    async fn append(&self, data: Bytes) -> io::Result<u64>;

    async fn read(&self, range: Range<u64>) -> io::Result<Bytes>;

    async fn exists(&self) -> io::Result<bool>;

    async fn size(&self) -> io::Result<u64>;

    /// True when no operation is outstanding.
    fn is_idle(&self) -> bool;

    async fn close(&self) -> io::Result<()>;

    /// Short label for logs.
    fn name(&self) -> String;
}

/// Counts an operation as outstanding for as long as the guard lives.
pub(crate) struct OpGuard<'a>(&'a AtomicUsize);

impl<'a> OpGuard<'a> {
    pub(crate) fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) fn invalid_range(range: &Range<u64>, size: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("read {}..{} exceeds stream size {}", range.start, range.end, size),
    )
}
