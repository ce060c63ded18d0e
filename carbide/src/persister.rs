//! The persister engine: workers, dispatcher, throttle and checkpoint timer.
//!
//! ```text
//!                 ┌──────────┐       ┌────────────┐      ┌──────────┐
//!  PointsChannel ─┤ throttle ├──────►│ dispatcher ├─────►│ worker 0 │──► StoreWriter
//!   (inbound)     │(optional)│       │ crc32 % N  ├─────►│ worker 1 │──► StoreWriter
//!       ▲         └──────────┘       └────────────┘  ...  └──────────┘
//!       │
//!  checkpoint timer (synthetic stats)
//! ```
//!
//! With one worker the dispatcher is skipped and the worker reads the
//! inbound (possibly throttled) queue directly.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::archive::ArchiveFactory;
use crate::clock::Clock;
use crate::config::PersisterConfig;
use crate::error::{LifecycleError, QueueError, Result};
use crate::queue::{PinnedSender, PointsChannel, Subscription, WORKER_QUEUE_CAPACITY};
use crate::schema::MetricRouter;
use crate::signal::{ExitListener, ExitSignal};
use crate::stats::{CheckpointTimer, Stats};
use crate::writer::StoreWriter;

/// Selects the worker for a metric.
///
/// Stable for the life of the process, so every batch of one metric lands on
/// the same worker. Returns 0 when `workers` is 0 or 1.
///
/// # Examples
///
/// ```rust
/// use carbide::persister::shard_index;
///
/// let index = shard_index("servers.web1.cpu", 8);
/// assert!(index < 8);
/// assert_eq!(index, shard_index("servers.web1.cpu", 8));
/// assert_eq!(shard_index("servers.web1.cpu", 1), 0);
/// ```
pub fn shard_index(metric: &str, workers: usize) -> usize {
    if workers <= 1 {
        return 0;
    }
    crc32fast::hash(metric.as_bytes()) as usize % workers
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopped,
}

/// Drains the inbound queue into per-metric archive files.
pub struct Persister {
    config: PersisterConfig,
    input: PointsChannel,
    router: Arc<dyn MetricRouter>,
    factory: Arc<dyn ArchiveFactory>,
    clock: Arc<dyn Clock>,
    stats: Arc<Stats>,
    exit: ExitSignal,
    state: State,
    pipeline: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl Persister {
    /// Creates an idle persister reading from `input`.
    pub fn new(
        config: PersisterConfig,
        input: PointsChannel,
        router: Arc<dyn MetricRouter>,
        factory: Arc<dyn ArchiveFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            input,
            router,
            factory,
            clock,
            stats: Arc::new(Stats::new()),
            exit: ExitSignal::new(),
            state: State::Idle,
            pipeline: Vec::new(),
            timer: None,
        }
    }

    /// Write counters for the current checkpoint period.
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Returns `true` between a successful `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    /// Launches the worker tasks.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AlreadyRunning`] if already started,
    /// [`LifecycleError::Stopped`] after [`Persister::stop`], and
    /// [`QueueError::Closed`] if the inbound queue is already closed.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            State::Idle => {}
            State::Running => return Err(LifecycleError::AlreadyRunning.into()),
            State::Stopped => return Err(LifecycleError::Stopped.into()),
        }
        if self.input.is_closed() {
            return Err(QueueError::Closed.into());
        }

        let writer = Arc::new(StoreWriter::new(
            self.config.data_dir.clone(),
            Arc::clone(&self.router),
            Arc::clone(&self.factory),
            Arc::clone(&self.stats),
        ));

        let timer = CheckpointTimer {
            stats: Arc::clone(&self.stats),
            input: self.input.clone(),
            clock: Arc::clone(&self.clock),
            prefix: self.config.graph_prefix.clone(),
            interval: self.config.stat_interval,
        };
        let inbound = self
            .input
            .throttled_out(self.config.max_updates_per_second, self.exit.listener())?
            .subscribe();
        self.timer = Some(tokio::spawn(timer.run(self.exit.listener())));

        let workers = self.config.workers.max(1);
        if workers == 1 {
            self.pipeline.push(tokio::spawn(run_worker(
                0,
                inbound,
                Arc::clone(&writer),
                self.exit.listener(),
            )));
        } else {
            let mut senders = Vec::with_capacity(workers);
            for index in 0..workers {
                let queue = PointsChannel::new(WORKER_QUEUE_CAPACITY);
                senders.push(queue.pinned_sender()?);
                self.pipeline.push(tokio::spawn(run_worker(
                    index,
                    queue.subscribe(),
                    Arc::clone(&writer),
                    self.exit.listener(),
                )));
            }
            self.pipeline
                .push(tokio::spawn(run_dispatcher(inbound, senders, self.exit.listener())));
        }

        tracing::info!(
            data_dir = %self.config.data_dir.display(),
            workers,
            max_updates_per_second = self.config.max_updates_per_second,
            "persister started"
        );

        self.state = State::Running;
        Ok(())
    }

    /// Signals every task to exit. Does not wait for in-flight batches, and
    /// batches still queued are abandoned; see [`Persister::drain`] for a
    /// graceful shutdown. Calling it again is a no-op.
    pub fn stop(&mut self) {
        if self.state != State::Stopped {
            tracing::info!("persister stopping");
        }
        self.exit.fire();
        self.state = State::Stopped;
    }

    /// Closes the inbound queue and waits until every batch accepted before
    /// the close has been stored, then stops the persister.
    ///
    /// Batches a worker has already taken off a queue count as accepted, so
    /// nothing in flight is abandoned. Cancel safe: dropping the future
    /// leaves the persister running with its queue closed, and a later
    /// `drain`, `stop` or `join` picks up from there.
    pub async fn drain(&mut self) {
        if self.state == State::Running {
            tracing::info!(pending = self.input.pending(), "persister draining");
            self.input.close();
            join_all(&mut self.pipeline).await;
        }
        self.stop();
        self.join().await;
    }

    /// Waits for every task launched by `start` to finish.
    ///
    /// Only returns once [`Persister::stop`] has been called (or the inbound
    /// queue has closed and the timer was stopped). Cancel safe.
    pub async fn join(&mut self) {
        join_all(&mut self.pipeline).await;
        if let Some(timer) = self.timer.as_mut() {
            let outcome = timer.await;
            self.timer = None;
            if let Err(e) = outcome {
                tracing::error!("checkpoint timer failed: {e}");
            }
        }
    }
}

async fn join_all(tasks: &mut Vec<JoinHandle<()>>) {
    while let Some(task) = tasks.last_mut() {
        let outcome = task.await;
        tasks.pop();
        if let Err(e) = outcome {
            tracing::error!("persister task failed: {e}");
        }
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        self.exit.fire();
    }
}

impl std::fmt::Debug for Persister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persister")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

async fn run_worker(
    index: usize,
    mut queue: Subscription,
    writer: Arc<StoreWriter>,
    mut exit: ExitListener,
) {
    loop {
        let points = tokio::select! {
            biased;

            () = exit.wait() => break,
            next = queue.recv() => match next {
                Some(points) => points,
                None => break,
            },
        };

        let writer = Arc::clone(&writer);
        if let Err(e) = tokio::task::spawn_blocking(move || writer.store(&points)).await {
            tracing::error!(worker = index, "store task failed: {e}");
        }
    }

    tracing::debug!(worker = index, "worker stopped");
}

async fn run_dispatcher(mut inbound: Subscription, workers: Vec<PinnedSender>, mut exit: ExitListener) {
    loop {
        let points = tokio::select! {
            biased;

            () = exit.wait() => break,
            next = inbound.recv() => match next {
                Some(points) => points,
                None => break,
            },
        };

        let worker = &workers[shard_index(&points.metric, workers.len())];
        tokio::select! {
            biased;

            () = exit.wait() => break,
            sent = worker.send(points) => if sent.is_err() {
                break;
            },
        }
    }

    tracing::debug!("dispatcher stopped");
}
