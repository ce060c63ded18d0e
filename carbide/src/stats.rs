//! Operational counters and the periodic checkpoint that reports them.
//!
//! Workers bump the counters on every store; the checkpoint timer snapshots
//! and resets them once per period and feeds the snapshot back into the
//! inbound queue as ordinary metrics under `<prefix>persister.`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};

use crate::clock::Clock;
use crate::points::Points;
use crate::queue::PointsChannel;
use crate::signal::ExitListener;

/// Write-path counters shared by all workers.
///
/// A reset subtracts the value it observed rather than storing zero, so
/// increments racing a reset are carried into the next period instead of
/// being overwritten.
#[derive(Debug, Default)]
pub struct Stats {
    committed_writes: AtomicU64,
    committed_points: AtomicU64,
    created_files: AtomicU64,
}

impl Stats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one append attempt of `points` samples.
    pub fn record_write(&self, points: usize) {
        self.committed_points
            .fetch_add(points as u64, Ordering::Relaxed);
        self.committed_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one newly created archive file.
    pub fn record_created(&self) {
        self.created_files.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values without resetting.
    pub fn peek(&self) -> Checkpoint {
        Checkpoint {
            committed_writes: self.committed_writes.load(Ordering::Relaxed),
            committed_points: self.committed_points.load(Ordering::Relaxed),
            created_files: self.created_files.load(Ordering::Relaxed),
        }
    }

    /// Reads and resets every counter.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            committed_writes: take(&self.committed_writes),
            committed_points: take(&self.committed_points),
            created_files: take(&self.created_files),
        }
    }
}

fn take(counter: &AtomicU64) -> u64 {
    let observed = counter.load(Ordering::Relaxed);
    counter.fetch_sub(observed, Ordering::Relaxed);
    observed
}

/// Counter values for one checkpoint period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checkpoint {
    /// Append attempts, including ones that failed.
    pub committed_writes: u64,
    /// Samples handed to append attempts.
    pub committed_points: u64,
    /// Archive files created.
    pub created_files: u64,
}

impl Checkpoint {
    /// Average batch size; 0 when nothing was written.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use carbide::stats::Checkpoint;
    ///
    /// let idle = Checkpoint::default();
    /// assert_eq!(idle.points_per_update(), 0.0);
    ///
    /// let busy = Checkpoint { committed_writes: 4, committed_points: 40, created_files: 0 };
    /// assert_eq!(busy.points_per_update(), 10.0);
    /// ```
    #[allow(clippy::cast_precision_loss)] // counters stay far below 2^52 per period
    pub fn points_per_update(&self) -> f64 {
        if self.committed_writes == 0 {
            return 0.0;
        }
        self.committed_points as f64 / self.committed_writes as f64
    }

    /// Converts the snapshot into self-reported metrics.
    #[allow(clippy::cast_precision_loss)]
    pub fn to_points(&self, prefix: &str, now: i64) -> Vec<Points> {
        let metric = |name: &str| format!("{prefix}persister.{name}");
        vec![
            Points::one_point(metric("updateOperations"), self.committed_writes as f64, now),
            Points::one_point(metric("commitedPoints"), self.committed_points as f64, now),
            Points::one_point(metric("pointsPerUpdate"), self.points_per_update(), now),
            Points::one_point(metric("created"), self.created_files as f64, now),
        ]
    }
}

/// Periodic snapshot-and-emit loop.
pub struct CheckpointTimer {
    /// Counters to snapshot.
    pub stats: Arc<Stats>,
    /// Queue the snapshot is fed back into.
    pub input: PointsChannel,
    /// Source of timestamps for emitted points.
    pub clock: Arc<dyn Clock>,
    /// Metric name prefix.
    pub prefix: String,
    /// Time between checkpoints.
    pub interval: Duration,
}

impl CheckpointTimer {
    /// Runs until `exit` fires. The first checkpoint happens one interval
    /// after start.
    pub async fn run(self, mut exit: ExitListener) {
        let period = self.interval.max(Duration::from_millis(1));
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = exit.wait() => break,
                _ = ticker.tick() => self.checkpoint(&exit),
            }
        }

        tracing::debug!("checkpoint timer stopped");
    }

    /// Snapshots the counters, logs them, and emits them without waiting.
    ///
    /// Emission runs on its own task so a full or throttled queue can never
    /// stall the timer. The task gives up on whatever it has not sent yet
    /// once `exit` fires.
    pub fn checkpoint(&self, exit: &ExitListener) {
        let snapshot = self.stats.checkpoint();

        tracing::info!(
            update_operations = snapshot.committed_writes,
            commited_points = snapshot.committed_points,
            points_per_update = snapshot.points_per_update(),
            created = snapshot.created_files,
            "persister checkpoint"
        );

        let points = snapshot.to_points(&self.prefix, self.clock.now_unix());
        let input = self.input.clone();
        let mut exit = exit.clone();
        tokio::spawn(async move {
            for p in points {
                tokio::select! {
                    biased;

                    () = exit.wait() => {
                        tracing::debug!("persister stats abandoned on exit");
                        break;
                    }
                    sent = input.send(p) => if let Err(e) = sent {
                        tracing::warn!("dropping persister stat: {e}");
                        break;
                    },
                }
            }
        });
    }
}
