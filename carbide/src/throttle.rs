//! Rate limiting between the inbound queue and the persister.
//!
//! The throttle never drops a batch. A pump task pulls from the source only
//! when a release slot is due, so anything over the budget stays queued in
//! the source and bounded producers block on it.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::error::{QueueError, Result};
use crate::points::Points;
use crate::queue::{PinnedSender, PointsChannel, Subscription};
use crate::signal::ExitListener;

/// Releases at most `rate` batches per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    rate: u32,
}

impl Throttle {
    /// Creates a throttle, or `None` when `rate` is 0 (unlimited).
    pub fn new(rate: u32) -> Option<Self> {
        (rate > 0).then_some(Self { rate })
    }

    /// Batches per second.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Spacing between two releases.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use carbide::throttle::Throttle;
    /// use std::time::Duration;
    ///
    /// let throttle = Throttle::new(4).unwrap();
    /// assert_eq!(throttle.period(), Duration::from_millis(250));
    /// ```
    pub fn period(&self) -> Duration {
        (Duration::from_secs(1) / self.rate).max(Duration::from_nanos(1))
    }

    /// Returns a new queue fed from `source` at this throttle's rate.
    ///
    /// The pump follows swaps of `source` and stops on exit. Once `source`
    /// is closed and drained, the returned queue ends too.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`](crate::error::QueueError::Closed) if
    /// `source` is already closed.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn wrap(&self, source: &PointsChannel, exit: ExitListener) -> Result<PointsChannel> {
        if source.is_closed() {
            return Err(QueueError::Closed.into());
        }
        let out = PointsChannel::new(1);
        self.spawn(source.subscribe(), out.pinned_sender()?, exit);
        Ok(out)
    }

    fn spawn(&self, source: Subscription, out: PinnedSender, exit: ExitListener) -> JoinHandle<()> {
        tracing::info!(rate = self.rate, "throttling enabled");
        tokio::spawn(pump(source, out, self.period(), exit))
    }
}

async fn pump(mut source: Subscription, out: PinnedSender, period: Duration, mut exit: ExitListener) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = exit.wait() => break,
            _ = ticker.tick() => {}
        }

        let points: Points = tokio::select! {
            () = exit.wait() => break,
            next = source.recv() => match next {
                Some(points) => points,
                None => break,
            },
        };

        tokio::select! {
            () = exit.wait() => break,
            sent = out.send(points) => if sent.is_err() {
                break;
            },
        }
    }

    tracing::debug!("throttle pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::ExitSignal;

    #[test]
    fn test_zero_rate_disables() {
        assert!(Throttle::new(0).is_none());
        assert_eq!(Throttle::new(10).unwrap().rate(), 10);
        assert_eq!(Throttle::new(u32::MAX).unwrap().period(), Duration::from_nanos(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_paced_not_dropped() {
        const RATE: u32 = 10;
        let total = (RATE * 10) as usize;

        let exit = ExitSignal::new();
        let source = PointsChannel::new(16);
        let throttled = source.throttled_out(RATE, exit.listener()).unwrap();
        let mut sub = throttled.subscribe();

        let started = time::Instant::now();
        let producer = tokio::spawn(async move {
            for i in 0..total {
                #[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
                let points = Points::one_point(format!("m.{i}"), i as f64, i as i64);
                source.send(points).await.unwrap();
            }
        });

        for i in 0..total {
            let points = sub.recv().await.unwrap();
            assert_eq!(points.metric, format!("m.{i}"));
        }
        producer.await.unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(9), "drained too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(11), "drained too slow: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_zero_rate_is_pass_through() {
        let exit = ExitSignal::new();
        let source = PointsChannel::new(4);
        let same = source.throttled_out(0, exit.listener()).unwrap();
        let mut sub = same.subscribe();

        source.send(Points::one_point("a", 1.0, 1)).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().metric, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_stops_on_exit() {
        let exit = ExitSignal::new();
        let source = PointsChannel::new(4);
        let throttle = Throttle::new(1).unwrap();
        let handle = throttle.spawn(source.subscribe(), PointsChannel::new(1).pinned_sender().unwrap(), exit.listener());

        exit.fire();
        time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_source_ends_throttled_queue() {
        let exit = ExitSignal::new();
        let source = PointsChannel::new(8);
        let throttled = source.throttled_out(100, exit.listener()).unwrap();
        let mut sub = throttled.subscribe();
        drop(throttled);

        for i in 0..3 {
            source.send(Points::one_point(format!("m.{i}"), 1.0, i)).await.unwrap();
        }
        source.close();
        assert!(source.throttled_out(100, exit.listener()).is_err());

        for i in 0..3 {
            assert_eq!(sub.recv().await.unwrap().metric, format!("m.{i}"));
        }
        assert!(time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap().is_none());
    }
}
