//! Error types for the carbide write path.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all carbide operations.
///
/// Errors on the write path itself are logged and swallowed by the store
/// writer; this type surfaces from configuration loading, archive file
/// access, queue plumbing and engine lifecycle calls.
#[derive(Error, Debug)]
pub enum CarbideError {
    /// Error creating, opening or writing an archive file.
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Error in a storage or aggregation rule.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Error loading or validating the daemon configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error sending into a points queue.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Error driving the persister lifecycle.
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

/// Errors raised by archive files.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The archive file could not be opened.
    #[error("failed to open archive '{}': {source}", path.display())]
    Open {
        /// The archive path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The archive file could not be created.
    #[error("failed to create archive '{}': {source}", path.display())]
    Create {
        /// The archive path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Memory mapping failed.
    #[error("memory mapping failed for archive '{}': {source}", path.display())]
    MemoryMap {
        /// The archive path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to sync the archive to disk.
    #[error("failed to sync archive '{}': {source}", path.display())]
    Sync {
        /// The archive path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The archive header or size is invalid.
    #[error("archive '{}' is corrupted: {reason}", path.display())]
    Corrupted {
        /// The archive path.
        path: PathBuf,
        /// Description of the corruption.
        reason: String,
    },

    /// The requested archive index does not exist in the file.
    #[error("archive index {index} out of range: file has {count} archives")]
    NoSuchArchive {
        /// The requested index.
        index: usize,
        /// Number of archives in the file.
        count: usize,
    },
}

/// Errors in storage or aggregation rules.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// A retention definition could not be parsed.
    #[error("invalid retention '{input}': {reason}")]
    InvalidRetention {
        /// The offending text.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A retention ladder is inconsistent.
    #[error("invalid retention ladder for schema '{schema}': {reason}")]
    InvalidLadder {
        /// Name of the schema.
        schema: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A rule pattern is not a valid regular expression.
    #[error("invalid pattern '{pattern}' in rule '{rule}': {source}")]
    InvalidPattern {
        /// Name of the rule.
        rule: String,
        /// The pattern text.
        pattern: String,
        /// The regex compilation error.
        #[source]
        source: regex::Error,
    },

    /// The aggregation method name is unknown.
    #[error("unknown aggregation method '{0}'")]
    UnknownAggregationMethod(String),

    /// The x-files-factor is outside `[0, 1]`.
    #[error("x_files_factor {value} in rule '{rule}' must be within [0, 1]")]
    InvalidXFilesFactor {
        /// Name of the rule.
        rule: String,
        /// The offending value.
        value: f32,
    },
}

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`crate::config::Config`].
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config path.
        path: PathBuf,
        /// The JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A configuration value is out of range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// The dotted field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors sending into a points queue.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The queue was closed, or every receiver of it is gone.
    #[error("points queue is closed")]
    Closed,

    /// The queue is at capacity (non-blocking send only).
    #[error("points queue is full")]
    Full,
}

/// Errors driving the persister lifecycle.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// `start` was called on a running persister.
    #[error("persister is already running")]
    AlreadyRunning,

    /// The persister was stopped and cannot be restarted.
    #[error("persister was stopped; construct a new one to run again")]
    Stopped,
}

/// Type alias for `Result<T, CarbideError>`.
pub type Result<T> = std::result::Result<T, CarbideError>;
