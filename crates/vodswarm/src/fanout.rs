use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{EngineError, Result};

/// Aggregates the completions of one operation mirrored to several destinations.
///
/// The outcome is reported exactly once: as soon as one destination fails, or
/// after the last destination succeeds. Completions arriving after a failure are
/// still counted so the operation is known to be drained.
#[derive(Debug)]
pub struct FanOut {
    remaining: usize,
    failed: bool,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl FanOut {
    pub fn new(destinations: usize) -> (Self, FanOutResult) {
        let (tx, rx) = oneshot::channel();
        let mut fan = Self {
            remaining: destinations,
            failed: false,
            done: Some(tx),
        };
        if destinations == 0 {
            fan.report(Ok(()));
        }
        (fan, FanOutResult { rx })
    }

    /// Records one destination's outcome. Returns true if this call reported the
    /// aggregate result.
    pub fn complete(&mut self, outcome: Result<()>) -> bool {
        if self.remaining == 0 {
            warn!("completion after all destinations reported");
            return false;
        }
        self.remaining -= 1;
        match outcome {
            Err(e) if !self.failed => {
                self.failed = true;
                self.report(Err(e))
            }
            Err(_) => false,
            Ok(()) if self.remaining == 0 && !self.failed => self.report(Ok(())),
            Ok(()) => false,
        }
    }

    fn report(&mut self, outcome: Result<()>) -> bool {
        match self.done.take() {
            Some(tx) => {
                // a dropped receiver means nobody is waiting any more
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn is_drained(&self) -> bool {
        self.remaining == 0
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }
}

/// Receiving end of a [`FanOut`].
#[derive(Debug)]
pub struct FanOutResult {
    rx: oneshot::Receiver<Result<()>>,
}

impl FanOutResult {
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(EngineError::WriterClosed))
    }

    /// The outcome if it has already been reported.
    pub fn try_result(&mut self) -> Option<Result<()>> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 0 {
            return vec![Vec::new()];
        }
        let mut out = Vec::new();
        for rest in permutations(n - 1) {
            for pos in 0..=rest.len() {
                let mut p = rest.clone();
                p.insert(pos, n - 1);
                out.push(p);
            }
        }
        out
    }

    fn failure() -> EngineError {
        EngineError::Storage(io::Error::new(io::ErrorKind::Other, "disk gone"))
    }

    #[test]
    fn test_every_order_and_failure_pattern() {
        for m in 1..=4usize {
            let orders = permutations(m);
            assert_eq!(orders.len(), (1..=m).product::<usize>());
            for failing_mask in 0..(1u32 << m) {
                for order in &orders {
                    let (mut fan, mut result) = FanOut::new(m);
                    let mut reports = 0;
                    let mut reported_at = None;
                    for (step, &dest) in order.iter().enumerate() {
                        let fails = failing_mask & (1 << dest) != 0;
                        let outcome = if fails { Err(failure()) } else { Ok(()) };
                        if fan.complete(outcome) {
                            reports += 1;
                            reported_at.get_or_insert(step);
                        }
                    }
                    assert_eq!(reports, 1, "m={m} mask={failing_mask:b} order={order:?}");
                    assert!(fan.is_drained());

                    let outcome = result.try_result().expect("reported");
                    if failing_mask == 0 {
                        assert!(outcome.is_ok());
                        assert_eq!(reported_at, Some(m - 1));
                    } else {
                        assert!(outcome.is_err());
                        let first_fail = order
                            .iter()
                            .position(|&d| failing_mask & (1 << d) != 0)
                            .unwrap();
                        assert_eq!(reported_at, Some(first_fail));
                    }
                }
            }
        }
    }

    #[test]
    fn test_extra_completion_ignored() {
        let (mut fan, _result) = FanOut::new(1);
        assert!(fan.complete(Ok(())));
        assert!(!fan.complete(Err(failure())));
        assert!(!fan.has_failed());
    }

    #[tokio::test]
    async fn test_zero_destinations_succeed() {
        let (fan, result) = FanOut::new(0);
        assert!(fan.is_drained());
        assert!(result.wait().await.is_ok());
    }
}
