//! Reconfigurable points queue.
//!
//! A [`PointsChannel`] is a level of indirection over a bounded tokio `mpsc`
//! lane. The lane can be swapped at runtime ([`PointsChannel::resize`])
//! while producers keep sending and readers keep consuming:
//!
//! - producers always send into the lane that is current when they send;
//! - readers ([`Subscription`]) select on their lane and on the swap
//!   notification, and move to the new lane as soon as they see it;
//! - the retired lane is drained into the new one by a forwarder task once
//!   every sender that was in flight at the swap has finished.
//!
//! Each batch therefore lands exactly once in either the old or the new lane.
//! FIFO order across the swap boundary is not preserved.
//!
//! Closing the queue, explicitly or by dropping its last handle, stops new
//! sends. Readers still get every batch accepted before that and then see
//! the end of the queue.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};

use crate::error::{QueueError, Result};
use crate::points::Points;
use crate::signal::ExitListener;
use crate::throttle::Throttle;

/// Default lane capacity for worker queues.
pub const WORKER_QUEUE_CAPACITY: usize = 32;

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Points>>>;

/// One concrete bounded queue.
///
/// `tx` is taken out when the queue is closed, so the lane ends once the
/// senders still in flight finish and its buffer is drained.
#[derive(Debug, Clone)]
struct Lane {
    tx: Option<mpsc::Sender<Points>>,
    rx: SharedReceiver,
}

impl Lane {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Some(tx),
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

/// Owner of the lane slot. Dropped with the last [`PointsChannel`] clone.
#[derive(Debug)]
struct Shared {
    current: watch::Sender<Lane>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Subscriptions keep the watched lane alive, sender included
        self.current.send_modify(|lane| lane.tx = None);
    }
}

/// A swappable handle to the current lane.
///
/// Cloning is cheap and every clone refers to the same queue.
#[derive(Debug, Clone)]
pub struct PointsChannel {
    shared: Arc<Shared>,
}

impl PointsChannel {
    /// Creates a queue holding at most `capacity` batches (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (current, _) = watch::channel(Lane::new(capacity));
        Self {
            shared: Arc::new(Shared { current }),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Points>> {
        self.shared
            .current
            .borrow()
            .tx
            .clone()
            .ok_or_else(|| QueueError::Closed.into())
    }

    /// Capacity of the current lane, 0 once closed.
    pub fn capacity(&self) -> usize {
        self.shared
            .current
            .borrow()
            .tx
            .as_ref()
            .map_or(0, mpsc::Sender::max_capacity)
    }

    /// Number of batches waiting in the current lane, 0 once closed.
    pub fn pending(&self) -> usize {
        self.shared
            .current
            .borrow()
            .tx
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    /// Returns `true` after [`PointsChannel::close`].
    pub fn is_closed(&self) -> bool {
        self.shared.current.borrow().tx.is_none()
    }

    /// Sends a batch into the current lane, waiting for space.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the queue was closed or the lane has
    /// no receiver left.
    pub async fn send(&self, points: Points) -> Result<()> {
        let tx = self.sender()?;
        tx.send(points).await.map_err(|_| QueueError::Closed.into())
    }

    /// Sends a batch without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] if the lane is at capacity and
    /// [`QueueError::Closed`] if the queue was closed or the lane has no
    /// receiver left.
    pub fn try_send(&self, points: Points) -> Result<()> {
        let tx = self.sender()?;
        tx.try_send(points).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full.into(),
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed.into(),
        })
    }

    /// Returns a sender pinned to the current lane.
    ///
    /// The sender does not follow later swaps; it is meant for queues that
    /// are never resized, such as the private queue of a worker. The lane
    /// stays open while the pinned sender lives, even after
    /// [`PointsChannel::close`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the queue was closed.
    pub fn pinned_sender(&self) -> Result<PinnedSender> {
        Ok(PinnedSender { tx: self.sender()? })
    }

    /// Creates a reader that follows swaps.
    pub fn subscribe(&self) -> Subscription {
        let changes = self.shared.current.subscribe();
        let rx = changes.borrow().rx.clone();
        Subscription {
            rx,
            changes: Some(changes),
        }
    }

    /// Stops accepting batches on every clone of this queue.
    ///
    /// Batches already queued, and sends already in flight, are still
    /// delivered. Subscriptions return `None` after the last of them.
    /// Calling it again is a no-op.
    pub fn close(&self) {
        let mut closed = false;
        self.shared.current.send_if_modified(|lane| {
            closed = lane.tx.take().is_some();
            closed
        });
        if closed {
            tracing::debug!("points queue closed");
        }
    }

    /// Swaps in a fresh lane of `capacity`. A closed queue stays closed.
    ///
    /// Batches still queued in the old lane, and batches that producers were
    /// sending into it at the moment of the swap, are forwarded to the new
    /// lane by a background task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime on an open queue.
    pub fn resize(&self, capacity: usize) {
        let lane = Lane::new(capacity);
        let forward_to = lane.tx.clone();
        let mut retired = None;
        self.shared.current.send_if_modified(|current| {
            if current.tx.is_none() {
                return false;
            }
            retired = Some(std::mem::replace(current, lane));
            true
        });

        let (Some(Lane { tx, rx }), Some(forward_to)) = (retired, forward_to) else {
            tracing::debug!(capacity, "ignoring resize of a closed points queue");
            return;
        };
        drop(tx);

        tracing::debug!(capacity, "points queue resized");

        tokio::spawn(async move {
            let mut retired = rx.lock().await;
            while let Some(points) = retired.recv().await {
                if forward_to.send(points).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Returns a queue releasing at most `rate` batches per second from this one.
    ///
    /// `rate == 0` disables throttling and returns this queue unchanged.
    /// Closing this queue ends the throttled one once it has drained.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the queue was closed.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime when `rate > 0`.
    pub fn throttled_out(&self, rate: u32, exit: ExitListener) -> Result<PointsChannel> {
        match Throttle::new(rate) {
            Some(throttle) => throttle.wrap(self, exit),
            None => Ok(self.clone()),
        }
    }

    #[cfg(test)]
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }
}

/// Sender fixed to one lane.
#[derive(Debug, Clone)]
pub struct PinnedSender {
    tx: mpsc::Sender<Points>,
}

impl PinnedSender {
    /// Sends a batch, waiting for space.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the lane has no receiver left.
    pub async fn send(&self, points: Points) -> Result<()> {
        self.tx
            .send(points)
            .await
            .map_err(|_| QueueError::Closed.into())
    }
}

/// Reader side of a [`PointsChannel`] that follows lane swaps.
#[derive(Debug)]
pub struct Subscription {
    rx: SharedReceiver,
    changes: Option<watch::Receiver<Lane>>,
}

impl Subscription {
    /// Receives the next batch.
    ///
    /// Returns `None` once the queue has been closed, or its last handle
    /// dropped, and the lane is drained. Cancel safe: a batch is never lost
    /// when the future is dropped.
    pub async fn recv(&mut self) -> Option<Points> {
        loop {
            let Some(changes) = self.changes.as_mut() else {
                return self.rx.lock().await.recv().await;
            };

            tokio::select! {
                biased;

                changed = changes.changed() => match changed {
                    Ok(()) => self.rx = changes.borrow_and_update().rx.clone(),
                    Err(_) => self.changes = None,
                },
                points = recv_lane(&self.rx) => return points,
            }
        }
    }
}

async fn recv_lane(rx: &Mutex<mpsc::Receiver<Points>>) -> Option<Points> {
    rx.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    #[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
    fn batch(i: usize) -> Points {
        Points::one_point(format!("m.{i}"), i as f64, 1_700_000_000 + i as i64)
    }

    #[tokio::test]
    async fn test_send_and_receive_in_order() {
        let channel = PointsChannel::new(8);
        let mut sub = channel.subscribe();

        for i in 0..5 {
            channel.send(batch(i)).await.unwrap();
        }
        assert_eq!(channel.pending(), 5);

        for i in 0..5 {
            assert_eq!(sub.recv().await.unwrap().metric, format!("m.{i}"));
        }
        assert_eq!(channel.pending(), 0);
    }

    #[tokio::test]
    async fn test_try_send_full() {
        let channel = PointsChannel::new(1);
        channel.try_send(batch(0)).unwrap();
        let err = channel.try_send(batch(1)).unwrap_err();
        assert!(err.to_string().contains("full"));
    }

    #[tokio::test]
    async fn test_resize_keeps_queued_batches() {
        let channel = PointsChannel::new(4);
        for i in 0..4 {
            channel.send(batch(i)).await.unwrap();
        }

        channel.resize(16);
        assert_eq!(channel.capacity(), 16);
        channel.send(batch(4)).await.unwrap();

        let mut sub = channel.subscribe();
        let mut seen = HashSet::new();
        for _ in 0..5 {
            let points = tokio::time::timeout(Duration::from_secs(1), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(seen.insert(points.metric));
        }
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resize_under_load_loses_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 500;

        let channel = PointsChannel::new(8);
        let mut sub = channel.subscribe();

        let consumer = tokio::spawn(async move {
            let mut seen = HashSet::new();
            while seen.len() < PRODUCERS * PER_PRODUCER {
                let points = sub.recv().await.unwrap();
                assert!(seen.insert(points.metric), "batch delivered twice");
            }
            seen.len()
        });

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let channel = channel.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..PER_PRODUCER {
                    channel.send(batch(p * PER_PRODUCER + i)).await.unwrap();
                }
            }));
        }

        for capacity in [2, 64, 1, 32] {
            tokio::time::sleep(Duration::from_millis(2)).await;
            channel.resize(capacity);
        }

        for producer in producers {
            producer.await.unwrap();
        }
        let delivered = tokio::time::timeout(Duration::from_secs(10), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, PRODUCERS * PER_PRODUCER);
    }

    #[tokio::test]
    async fn test_subscription_ends_when_channel_dropped() {
        let channel = PointsChannel::new(4);
        let mut sub = channel.subscribe();
        channel.send(batch(0)).await.unwrap();
        drop(channel);

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pinned_sender_stays_on_its_lane() {
        let channel = PointsChannel::new(4);
        let pinned = channel.pinned_sender().unwrap();
        let mut sub = channel.subscribe();

        pinned.send(batch(0)).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().metric, "m.0");

        // A closed queue still delivers through senders pinned before the close
        channel.close();
        assert!(channel.pinned_sender().is_err());
        pinned.send(batch(1)).await.unwrap();
        drop(pinned);
        assert_eq!(sub.recv().await.unwrap().metric, "m.1");
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_every_subscription_ends_when_channel_dropped() {
        let channel = PointsChannel::new(4);
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();
        channel.send(batch(0)).await.unwrap();
        drop(channel);

        // `second` stays idle while `first` drains the lane
        let limit = Duration::from_secs(1);
        assert!(tokio::time::timeout(limit, first.recv()).await.unwrap().is_some());
        assert!(tokio::time::timeout(limit, first.recv()).await.unwrap().is_none());
        assert!(tokio::time::timeout(limit, second.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_delivers_queued_then_ends() {
        let channel = PointsChannel::new(8);
        let producer = channel.clone();
        let mut sub = channel.subscribe();
        for i in 0..3 {
            channel.send(batch(i)).await.unwrap();
        }

        channel.close();
        channel.close();
        assert!(producer.is_closed());
        assert_eq!(producer.pending(), 0);
        assert!(producer.send(batch(3)).await.is_err());
        assert!(producer.try_send(batch(3)).unwrap_err().to_string().contains("closed"));

        // Resizing a closed queue must not reopen it
        channel.resize(16);
        assert!(channel.is_closed());
        assert_eq!(channel.capacity(), 0);

        let limit = Duration::from_secs(1);
        for i in 0..3 {
            let points = tokio::time::timeout(limit, sub.recv()).await.unwrap().unwrap();
            assert_eq!(points.metric, format!("m.{i}"));
        }
        assert!(tokio::time::timeout(limit, sub.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_after_resize_drains_both_lanes() {
        let channel = PointsChannel::new(4);
        let mut sub = channel.subscribe();
        for i in 0..4 {
            channel.send(batch(i)).await.unwrap();
        }
        channel.resize(8);
        channel.send(batch(4)).await.unwrap();
        channel.close();

        let mut seen = HashSet::new();
        let limit = Duration::from_secs(1);
        while let Some(points) = tokio::time::timeout(limit, sub.recv()).await.unwrap() {
            assert!(seen.insert(points.metric));
        }
        assert_eq!(seen.len(), 5);
    }
}
