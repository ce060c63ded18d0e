//! # carbide
//!
//! Write path of a Graphite-compatible metrics daemon.
//!
//! carbide drains batches of `(timestamp, value)` samples from an inbound
//! queue and appends them to one fixed-size round-robin archive file per
//! metric. Files are created on first write from a configured retention
//! ladder and aggregation rule. Work is spread over a pool of workers by a
//! stable hash of the metric name, so every metric is written by exactly one
//! worker and in arrival order.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Per-metric write order, parallel across metrics
//! - Optional global rate limit with backpressure instead of drops
//! - Faults (including panics) in one append never stop the pipeline
//! - Self-reported write counters fed back in as ordinary metrics
//! - The inbound queue can be resized while running without losing batches
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use carbide::{DiskArchives, Persister, PersisterConfig, Points, PointsChannel, SchemaRouter, StorageRule, SystemClock};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let router = SchemaRouter::from_rules(
//!     &[StorageRule::new("default", ".*", "60s:30d,1h:5y")],
//!     &[],
//! )?;
//!
//! let input = PointsChannel::new(10_000);
//! let mut persister = Persister::new(
//!     PersisterConfig {
//!         data_dir: "./whisper".into(),
//!         workers: 4,
//!         ..PersisterConfig::default()
//!     },
//!     input.clone(),
//!     Arc::new(router),
//!     Arc::new(DiskArchives),
//!     Arc::new(SystemClock),
//! );
//! persister.start()?;
//!
//! input.send(Points::one_point("servers.web1.cpu", 42.0, 1_700_000_000)).await?;
//!
//! // Stores everything already queued, then stops
//! persister.drain().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`persister`]: Engine lifecycle, dispatcher and workers
//! - [`writer`]: Open-or-create and append for one batch
//! - [`archive`]: Archive file format and the backing-store traits
//! - [`schema`]: Retention ladders, aggregation methods and rule routing
//! - [`queue`]: Resizable points queue
//! - [`throttle`]: Batch rate limiting
//! - [`stats`]: Write counters and the checkpoint timer
//! - [`config`]: Daemon configuration file
//! - [`points`]: Sample and batch types
//! - [`clock`]: Injectable time source
//! - [`signal`]: Exit broadcast
//! - [`error`]: Error types

pub mod archive;
pub mod clock;
pub mod config;
pub mod error;
pub mod persister;
pub mod points;
pub mod queue;
pub mod schema;
pub mod signal;
pub mod stats;
pub mod throttle;
pub mod writer;

// Re-export primary API types at crate root for convenience.
pub use archive::{ArchiveFactory, ArchiveFile, ArchiveHandle, DiskArchives};
pub use clock::{Clock, SystemClock};
pub use config::{Config, PersisterConfig};
pub use error::{CarbideError, Result};
pub use persister::Persister;
pub use points::{DataPoint, Points};
pub use queue::PointsChannel;
pub use schema::{
    AggregationMethod, AggregationRule, MetricRouter, Retention, SchemaRouter, StorageRule,
};
pub use stats::Stats;
pub use writer::StoreWriter;
