// THEORY:
// The perception source is the mission loop's only suspension point. The
// scheduler asks for the next batch with a deadline and must get an answer by
// then, either a batch or "no sample". That bound is what keeps the reset check
// at the top of each cycle running at a predictable cadence.
//
// Two adapters cover the usual wiring: a bounded tokio channel fed by the
// vision process, and any `futures::Stream` of batches. A source that has shut
// down still waits out the timeout, so a dead camera slows nothing down and
// speeds nothing up. A timeout too large to turn into a deadline means "wait
// as long as it takes".

use crate::core_modules::detection::DetectionBatch;
use futures::{Stream, StreamExt, future};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

/// Where detection batches come from.
pub trait PerceptionSource {
    /// Waits at most `timeout` for the next batch.
    fn poll(&mut self, timeout: Duration) -> impl Future<Output = Option<DetectionBatch>>;
}

/// Sending half of a `ChannelPerception`, handed to the vision side.
#[derive(Debug, Clone)]
pub struct PerceptionFeed {
    tx: mpsc::Sender<DetectionBatch>,
}

impl PerceptionFeed {
    pub async fn send(&self, batch: DetectionBatch) -> Result<(), mpsc::error::SendError<DetectionBatch>> {
        self.tx.send(batch).await
    }

    /// Fails if the buffer is full or the mission side is gone.
    pub fn try_send(&self, batch: DetectionBatch) -> Result<(), mpsc::error::TrySendError<DetectionBatch>> {
        self.tx.try_send(batch)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Batches delivered over a bounded tokio channel, oldest first.
#[derive(Debug)]
pub struct ChannelPerception {
    rx: mpsc::Receiver<DetectionBatch>,
}

impl ChannelPerception {
    pub fn new(capacity: usize) -> (PerceptionFeed, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (PerceptionFeed { tx }, Self { rx })
    }
}

impl PerceptionSource for ChannelPerception {
    async fn poll(&mut self, timeout: Duration) -> Option<DetectionBatch> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return match self.rx.recv().await {
                Some(batch) => Some(batch),
                None => future::pending().await,
            };
        };
        match time::timeout_at(deadline, self.rx.recv()).await {
            Ok(Some(batch)) => Some(batch),
            Ok(None) => {
                time::sleep_until(deadline).await;
                None
            }
            Err(_) => None,
        }
    }
}

/// Batches pulled from any stream.
pub struct StreamPerception<S> {
    stream: S,
    exhausted: bool,
}

impl<S> StreamPerception<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            exhausted: false,
        }
    }
}

impl<S> PerceptionSource for StreamPerception<S>
where
    S: Stream<Item = DetectionBatch> + Unpin,
{
    async fn poll(&mut self, timeout: Duration) -> Option<DetectionBatch> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            if !self.exhausted {
                if let Some(batch) = self.stream.next().await {
                    return Some(batch);
                }
                self.exhausted = true;
            }
            return future::pending().await;
        };
        if !self.exhausted {
            match time::timeout_at(deadline, self.stream.next()).await {
                Ok(Some(batch)) => return Some(batch),
                Ok(None) => self.exhausted = true,
                Err(_) => return None,
            }
        }
        time::sleep_until(deadline).await;
        None
    }
}
