//! Buffered write path mirroring every block to all configured destinations.

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::fanout::FanOut;
use crate::storage::StorageStream;

type Destinations = Arc<Vec<Arc<dyn StorageStream>>>;

struct PendingWrite {
    data: Bytes,
    done: oneshot::Sender<Result<()>>,
}

struct WriterState {
    /// Bytes known to be appended, per destination.
    dest_pos: Vec<u64>,
    /// End of the prefix every destination acknowledged; the next run starts here.
    acked: u64,
    /// Writes waiting for the gap before them to fill, keyed by position.
    buffered: BTreeMap<u64, PendingWrite>,
    /// End of the run currently being flushed; positions below it are taken.
    reserved_until: u64,
    /// Set once a destination's contents can no longer be trusted.
    lost: Option<String>,
    flushing: bool,
    closed: bool,
}

impl WriterState {
    /// Removes the run of buffered writes that starts exactly at the acknowledged position.
    fn take_contiguous(&mut self) -> Vec<(u64, PendingWrite)> {
        let mut next = self.acked;
        let mut run = Vec::new();
        while let Some(write) = self.buffered.remove(&next) {
            let len = write.data.len() as u64;
            run.push((next, write));
            next += len;
        }
        self.reserved_until = next;
        run
    }

    fn mark_lost(&mut self, reason: String) {
        if self.lost.is_none() {
            warn!(%reason, "destination lost, failing every further write");
            self.lost = Some(reason);
        }
    }
}

/// Completion handle for a submitted write.
#[derive(Debug)]
pub struct WriteTicket {
    rx: oneshot::Receiver<Result<()>>,
}

impl WriteTicket {
    /// Resolves once every destination holds the bytes, or with the first failure.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(EngineError::WriterClosed))
    }
}

/// Accepts `(position, bytes)` writes in any order and appends them to every
/// destination in position order. A write completes when all destinations have
/// acknowledged it, or fails with the first destination error.
#[derive(Clone)]
pub struct BufferedWriter {
    destinations: Destinations,
    state: Arc<Mutex<WriterState>>,
}

impl BufferedWriter {
    /// Creates a writer whose destinations already hold `append_pos` bytes.
    pub fn new(destinations: Vec<Arc<dyn StorageStream>>, append_pos: u64) -> Result<Self> {
        if destinations.is_empty() {
            return Err(EngineError::InvalidSize("writer needs at least one destination".to_string()));
        }
        let state = WriterState {
            dest_pos: vec![append_pos; destinations.len()],
            acked: append_pos,
            buffered: BTreeMap::new(),
            reserved_until: 0,
            lost: None,
            flushing: false,
            closed: false,
        };
        Ok(Self {
            destinations: Arc::new(destinations),
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Creates a writer positioned at the current size of each destination.
    pub async fn open(destinations: Vec<Arc<dyn StorageStream>>) -> Result<Self> {
        let mut sizes = Vec::with_capacity(destinations.len());
        for dest in &destinations {
            sizes.push(dest.size().await?);
        }
        let writer = Self::new(destinations, 0)?;
        if sizes.windows(2).any(|w| w[0] != w[1]) {
            warn!(?sizes, "destinations disagree on size, resuming each at its own end");
        }
        {
            let mut st = writer.lock();
            st.acked = sizes.iter().copied().min().unwrap_or(0);
            st.dest_pos = sizes;
        }
        Ok(writer)
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues a write and starts flushing if it closes the gap at the append position.
    pub fn submit(&self, position: u64, data: Bytes) -> Result<WriteTicket> {
        let (tx, rx) = oneshot::channel();
        let start_flush = {
            let mut st = self.lock();
            if st.closed {
                return Err(EngineError::WriterClosed);
            }
            if let Some(reason) = &st.lost {
                return Err(EngineError::DestinationLost(reason.clone()));
            }
            if data.is_empty() {
                return Err(EngineError::InvalidWrite(format!("empty write at {position}")));
            }
            let floor = st.acked.max(st.reserved_until);
            if position < floor {
                return Err(EngineError::InvalidWrite(format!(
                    "write at {position} is behind append position {floor}"
                )));
            }
            let end = position + data.len() as u64;
            let overlaps_prev = st
                .buffered
                .range(..=position)
                .next_back()
                .is_some_and(|(p, w)| p + w.data.len() as u64 > position);
            let overlaps_next = st.buffered.range(position..end).next().is_some();
            if overlaps_prev || overlaps_next {
                return Err(EngineError::InvalidWrite(format!(
                    "write {position}..{end} overlaps a buffered write"
                )));
            }
            st.buffered.insert(position, PendingWrite { data, done: tx });
            let ready = !st.flushing && position == st.acked;
            if ready {
                st.flushing = true;
            }
            ready
        };
        if start_flush {
            tokio::spawn(flush_loop(self.destinations.clone(), self.state.clone()));
        }
        Ok(WriteTicket { rx })
    }

    /// Submits a write and waits for its completion.
    pub async fn write(&self, position: u64, data: Bytes) -> Result<()> {
        self.submit(position, data)?.wait().await
    }

    /// Lowest position not yet appended to every destination.
    pub fn append_position(&self) -> u64 {
        self.lock().acked
    }

    pub fn buffered_writes(&self) -> usize {
        self.lock().buffered.len()
    }

    pub fn destinations(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_idle(&self) -> bool {
        let busy = {
            let st = self.lock();
            st.flushing || !st.buffered.is_empty()
        };
        !busy && self.destinations.iter().all(|d| d.is_idle())
    }

    /// Closes every destination. Fails with `WriterBusy` while writes are outstanding.
    pub async fn close(&self) -> Result<()> {
        if !self.is_idle() {
            return Err(EngineError::WriterBusy);
        }
        {
            let mut st = self.lock();
            if st.closed {
                return Ok(());
            }
            st.closed = true;
        }
        let mut first_err = None;
        for dest in self.destinations.iter() {
            if let Err(e) = dest.close().await {
                warn!(destination = %dest.name(), error = %e, "failed to close destination");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

async fn flush_loop(destinations: Destinations, state: Arc<Mutex<WriterState>>) {
    loop {
        let (start, run, dest_pos) = {
            let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
            let start = st.acked;
            let run = st.take_contiguous();
            if run.is_empty() {
                st.flushing = false;
                return;
            }
            (start, run, st.dest_pos.clone())
        };

        let payload = if run.len() == 1 {
            run[0].1.data.clone()
        } else {
            let total = run.iter().map(|(_, w)| w.data.len()).sum();
            let mut buf = BytesMut::with_capacity(total);
            for (_, w) in &run {
                buf.extend_from_slice(&w.data);
            }
            buf.freeze()
        };
        let end = start + payload.len() as u64;
        debug!(start, end, writes = run.len(), destinations = destinations.len(), "flushing");

        let (fan, result) = FanOut::new(destinations.len());
        let fan = Arc::new(Mutex::new(fan));
        let mut tasks = Vec::with_capacity(destinations.len());
        for (idx, dest) in destinations.iter().enumerate() {
            // a destination may already hold part of the run after an earlier failure
            let from = dest_pos[idx].clamp(start, end);
            let dest = dest.clone();
            let fan = fan.clone();
            let state = state.clone();
            let tail = payload.slice((from - start) as usize..);
            tasks.push(tokio::spawn(async move {
                let outcome = if tail.is_empty() {
                    Ok(())
                } else {
                    match append_exact(dest.as_ref(), tail).await {
                        Ok(appended) => {
                            state.lock().unwrap_or_else(|e| e.into_inner()).dest_pos[idx] = from + appended;
                            Ok(())
                        }
                        Err(e) => {
                            resync(dest.as_ref(), &state, idx, from, end).await;
                            Err(e)
                        }
                    }
                };
                fan.lock().unwrap_or_else(|e| e.into_inner()).complete(outcome);
            }));
        }

        let outcome = result.wait().await;
        {
            let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
            match &outcome {
                Ok(()) => st.acked = end,
                Err(e) => {
                    warn!(start, end, error = %e, "flush failed");
                    // the failed range may be written again right away
                    st.reserved_until = start;
                }
            }
        }
        for (_, write) in run {
            let _ = write.done.send(outcome.clone());
        }

        // drain the remaining destinations before touching them again
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "destination task aborted");
            }
        }

        let abandoned = {
            let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
            match st.lost.clone() {
                Some(reason) => {
                    st.flushing = false;
                    Some((reason, std::mem::take(&mut st.buffered)))
                }
                None => None,
            }
        };
        if let Some((reason, buffered)) = abandoned {
            for (_, write) in buffered {
                let _ = write.done.send(Err(EngineError::DestinationLost(reason.clone())));
            }
            return;
        }
    }
}

/// Re-reads a destination's size after a failed append. A partial append leaves
/// a prefix of the tail in place; the next attempt resumes after it. Any other
/// size means the destination no longer matches the writer's view.
async fn resync(dest: &dyn StorageStream, state: &Mutex<WriterState>, idx: usize, from: u64, end: u64) {
    let size = dest.size().await;
    let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
    match size {
        Ok(size) if (from..=end).contains(&size) => {
            if size > from {
                debug!(destination = %dest.name(), kept = size - from, "partial append kept");
            }
            st.dest_pos[idx] = size;
        }
        Ok(size) => st.mark_lost(format!("{} holds {size} bytes, expected {from}..={end}", dest.name())),
        Err(e) => st.mark_lost(format!("{} size unreadable: {e}", dest.name())),
    }
}

async fn append_exact(dest: &dyn StorageStream, data: Bytes) -> Result<u64> {
    let expected = data.len() as u64;
    let written = dest.append(data).await?;
    if written != expected {
        return Err(EngineError::Storage(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!("{} appended {written} of {expected} bytes", dest.name()),
        )));
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStream;
    use rand::seq::SliceRandom;
    use rand::RngCore;
    use std::time::Duration;

    fn mirrors(n: usize) -> (Vec<Arc<MemoryStream>>, Vec<Arc<dyn StorageStream>>) {
        let streams: Vec<Arc<MemoryStream>> = (0..n).map(|i| Arc::new(MemoryStream::new(format!("m{i}")))).collect();
        let dyns = streams.iter().map(|s| s.clone() as Arc<dyn StorageStream>).collect();
        (streams, dyns)
    }

    fn random_data(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    #[tokio::test]
    async fn single_destination_in_order() {
        let (streams, dyns) = mirrors(1);
        let writer = BufferedWriter::new(dyns, 0).unwrap();
        writer.write(0, Bytes::from_static(b"hello ")).await.unwrap();
        writer.write(6, Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(streams[0].contents(), b"hello world");
        assert_eq!(writer.append_position(), 11);
        assert!(writer.is_idle());
    }

    #[tokio::test]
    async fn out_of_order_writes_mirror_to_all() {
        let (streams, dyns) = mirrors(3);
        streams[1].set_append_delay(Duration::from_millis(5));
        let writer = BufferedWriter::new(dyns, 0).unwrap();
        let data = random_data(10 * 16);
        let mut blocks: Vec<usize> = (0..10).collect();
        blocks.shuffle(&mut rand::thread_rng());

        let mut tickets = Vec::new();
        for b in blocks {
            let chunk = Bytes::copy_from_slice(&data[b * 16..(b + 1) * 16]);
            tickets.push(writer.submit((b * 16) as u64, chunk).unwrap());
        }
        for t in tickets {
            t.wait().await.unwrap();
        }
        for s in &streams {
            assert_eq!(s.contents(), data);
        }
        assert_eq!(writer.append_position(), 160);
        assert_eq!(writer.buffered_writes(), 0);
    }

    #[tokio::test]
    async fn gap_keeps_writer_busy() {
        let (_streams, dyns) = mirrors(2);
        let writer = BufferedWriter::new(dyns, 0).unwrap();
        let later = writer.submit(4, Bytes::from_static(b"5678")).unwrap();
        assert!(!writer.is_idle());
        assert!(matches!(writer.close().await, Err(EngineError::WriterBusy)));

        writer.write(0, Bytes::from_static(b"1234")).await.unwrap();
        later.wait().await.unwrap();
        assert!(writer.is_idle());
        writer.close().await.unwrap();
        assert!(matches!(writer.submit(8, Bytes::from_static(b"x")), Err(EngineError::WriterClosed)));
    }

    #[tokio::test]
    async fn first_failure_reported_and_retry_heals_mirrors() {
        let (streams, dyns) = mirrors(2);
        let writer = BufferedWriter::new(dyns, 0).unwrap();
        streams[1].fail_next_appends(1);

        let err = writer.write(0, Bytes::from_static(b"abcd")).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
        assert_eq!(writer.append_position(), 0);
        assert_eq!(streams[0].contents(), b"abcd");
        assert!(streams[1].contents().is_empty());

        // rewriting tops up only the destination that missed it
        writer.write(0, Bytes::from_static(b"abcd")).await.unwrap();
        writer.write(4, Bytes::from_static(b"efgh")).await.unwrap();
        assert_eq!(streams[0].contents(), b"abcdefgh");
        assert_eq!(streams[1].contents(), b"abcdefgh");
    }

    #[tokio::test]
    async fn torn_append_resumes_after_kept_prefix() {
        let (streams, dyns) = mirrors(1);
        let writer = BufferedWriter::new(dyns, 0).unwrap();
        streams[0].tear_next_appends(1);

        assert!(writer.write(0, Bytes::from_static(b"abcd")).await.is_err());
        assert_eq!(streams[0].contents(), b"ab");
        assert_eq!(writer.append_position(), 0);

        writer.write(0, Bytes::from_static(b"abcd")).await.unwrap();
        writer.write(4, Bytes::from_static(b"efgh")).await.unwrap();
        assert_eq!(streams[0].contents(), b"abcdefgh");
        assert_eq!(writer.append_position(), 8);
    }

    #[tokio::test]
    async fn torn_mirror_is_topped_up() {
        let (streams, dyns) = mirrors(2);
        let writer = BufferedWriter::new(dyns, 0).unwrap();
        streams[1].tear_next_appends(1);

        assert!(writer.write(0, Bytes::from_static(b"abcdefgh")).await.is_err());
        assert_eq!(streams[1].contents(), b"abcd");
        writer.write(0, Bytes::from_static(b"abcdefgh")).await.unwrap();
        assert_eq!(streams[0].contents(), b"abcdefgh");
        assert_eq!(streams[1].contents(), b"abcdefgh");
    }

    #[tokio::test]
    async fn unreadable_destination_fails_pending_and_later_writes() {
        let (streams, dyns) = mirrors(2);
        let writer = BufferedWriter::new(dyns, 0).unwrap();
        streams[1].fail_next_appends(1);
        streams[1].fail_next_sizes(1);

        let later = writer.submit(8, Bytes::from_static(b"ijkl")).unwrap();
        let err = writer.write(0, Bytes::from_static(b"abcd")).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
        assert!(matches!(later.wait().await, Err(EngineError::DestinationLost(_))));
        assert!(matches!(
            writer.submit(0, Bytes::from_static(b"abcd")),
            Err(EngineError::DestinationLost(_))
        ));
        assert!(writer.is_idle());
    }

    #[tokio::test]
    async fn invalid_writes_rejected() {
        let (_streams, dyns) = mirrors(1);
        let writer = BufferedWriter::new(dyns, 8).unwrap();
        assert!(matches!(writer.submit(0, Bytes::from_static(b"x")), Err(EngineError::InvalidWrite(_))));
        assert!(matches!(writer.submit(9, Bytes::new()), Err(EngineError::InvalidWrite(_))));
        let _pending = writer.submit(12, Bytes::from_static(b"abcd")).unwrap();
        assert!(matches!(writer.submit(14, Bytes::from_static(b"zz")), Err(EngineError::InvalidWrite(_))));
        assert!(matches!(writer.submit(10, Bytes::from_static(b"zzz")), Err(EngineError::InvalidWrite(_))));
        assert!(BufferedWriter::new(Vec::new(), 0).is_err());
    }

    #[tokio::test]
    async fn open_resumes_at_destination_size() {
        let stream = Arc::new(MemoryStream::with_contents("m", b"0123"));
        let writer = BufferedWriter::open(vec![stream.clone() as Arc<dyn StorageStream>]).await.unwrap();
        assert_eq!(writer.append_position(), 4);
        writer.write(4, Bytes::from_static(b"45")).await.unwrap();
        assert_eq!(stream.contents(), b"012345");
    }
}
