//! Daemon configuration.
//!
//! Loaded from a JSON file. Every field has a default, so an empty object
//! `{}` is a valid (if useless, having no storage rules) configuration.
//!
//! ```json
//! {
//!   "common": { "log_level": "info" },
//!   "whisper": {
//!     "data_dir": "/var/lib/carbide/whisper",
//!     "workers": 4,
//!     "max_updates_per_second": 0,
//!     "stat_interval": 60.0,
//!     "graph_prefix": "carbon.agents.host1."
//!   },
//!   "input": { "capacity": 50000 },
//!   "schemas": [
//!     { "name": "default", "pattern": ".*", "retentions": "60s:30d,1h:5y" }
//!   ],
//!   "aggregation": [
//!     { "name": "default", "pattern": ".*", "x_files_factor": 0.5, "aggregation_method": "average" }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::schema::{AggregationRule, SchemaRouter, StorageRule};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Process-wide settings.
    pub common: CommonConfig,
    /// Persister settings.
    pub whisper: PersisterConfig,
    /// Inbound queue settings.
    pub input: InputConfig,
    /// Storage rules, first match wins.
    pub schemas: Vec<StorageRule>,
    /// Aggregation rules, first match wins.
    pub aggregation: Vec<AggregationRule>,
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Persister settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersisterConfig {
    /// Root of the archive tree.
    pub data_dir: PathBuf,
    /// Number of parallel workers. 0 and 1 both mean a single worker with no
    /// dispatcher.
    pub workers: usize,
    /// Batches released per second; 0 disables throttling.
    pub max_updates_per_second: u32,
    /// Time between persister checkpoints.
    #[serde(with = "duration_serde")]
    pub stat_interval: Duration,
    /// Prefix for self-reported metrics, usually ending in `.`.
    pub graph_prefix: String,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/carbide/whisper"),
            workers: 1,
            max_updates_per_second: 0,
            stat_interval: Duration::from_secs(60),
            graph_prefix: String::new(),
        }
    }
}

/// Inbound queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Batches the inbound queue holds before producers block.
    pub capacity: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self { capacity: 50_000 }
    }
}

impl Config {
    /// Reads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, and any
    /// error from [`Config::validate`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges and compiles every rule once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for out-of-range values and
    /// [`crate::error::SchemaError`] for the first rule that does not compile.
    pub fn validate(&self) -> Result<()> {
        if self.whisper.data_dir.as_os_str().is_empty() {
            return Err(invalid("whisper.data_dir", "must not be empty"));
        }
        if self.whisper.stat_interval.is_zero() {
            return Err(invalid("whisper.stat_interval", "must be positive"));
        }
        if self.input.capacity == 0 {
            return Err(invalid("input.capacity", "must be at least 1"));
        }
        self.router().map(|_| ())
    }

    /// Compiles the rule lists into a router.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::SchemaError`] for the first rule that does not
    /// compile.
    pub fn router(&self) -> Result<SchemaRouter> {
        SchemaRouter::from_rules(&self.schemas, &self.aggregation)
    }
}

fn invalid(field: &'static str, reason: &str) -> crate::error::CarbideError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
    .into()
}

/// Durations as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(D::Error::custom)
    }
}
