use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{invalid_range, OpGuard, StorageStream};

/// In-memory append stream. Failures and latency can be injected, which is what
/// the simulation and the tests use it for.
#[derive(Debug, Default)]
pub struct MemoryStream {
    name: String,
    data: Mutex<Vec<u8>>,
    outstanding: AtomicUsize,
    fail_appends: AtomicUsize,
    fail_reads: AtomicUsize,
    tear_appends: AtomicUsize,
    fail_sizes: AtomicUsize,
    append_delay_ms: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryStream {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_contents(name: impl Into<String>, data: &[u8]) -> Self {
        let stream = Self::new(name);
        if let Ok(mut buf) = stream.data.lock() {
            buf.extend_from_slice(data);
        }
        stream
    }

    /// Makes the next `n` appends fail without writing anything.
    pub fn fail_next_appends(&self, n: usize) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` appends keep the first half of their data and then fail,
    /// the way a file write interrupted midway does.
    pub fn tear_next_appends(&self, n: usize) {
        self.tear_appends.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_sizes(&self, n: usize) {
        self.fail_sizes.store(n, Ordering::SeqCst);
    }

    pub fn set_append_delay(&self, delay: Duration) {
        self.append_delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn poisoned() -> io::Error {
        io::Error::new(io::ErrorKind::Other, "memory stream lock poisoned")
    }
}

#[async_trait]
impl StorageStream for MemoryStream {
    async fn append(&self, data: Bytes) -> io::Result<u64> {
        let _op = OpGuard::enter(&self.outstanding);
        let delay = self.append_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"));
        }
        if Self::take_failure(&self.fail_appends) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected append failure"));
        }
        if Self::take_failure(&self.tear_appends) {
            let kept = data.len() / 2;
            self.data.lock().map_err(|_| Self::poisoned())?.extend_from_slice(&data[..kept]);
            return Err(io::Error::new(io::ErrorKind::Interrupted, format!("torn append after {kept} bytes")));
        }
        self.data.lock().map_err(|_| Self::poisoned())?.extend_from_slice(&data);
        Ok(data.len() as u64)
    }

    async fn read(&self, range: Range<u64>) -> io::Result<Bytes> {
        let _op = OpGuard::enter(&self.outstanding);
        if Self::take_failure(&self.fail_reads) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
        }
        let data = self.data.lock().map_err(|_| Self::poisoned())?;
        let size = data.len() as u64;
        if range.start > range.end || range.end > size {
            return Err(invalid_range(&range, size));
        }
        Ok(Bytes::copy_from_slice(&data[range.start as usize..range.end as usize]))
    }

    async fn exists(&self) -> io::Result<bool> {
        Ok(true)
    }

    async fn size(&self) -> io::Result<u64> {
        if Self::take_failure(&self.fail_sizes) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected size failure"));
        }
        Ok(self.data.lock().map_err(|_| Self::poisoned())?.len() as u64)
    }

    fn is_idle(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
