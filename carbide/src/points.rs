//! Data points and same-metric batches flowing through the write path.

use serde::{Deserialize, Serialize};

/// A single `(timestamp, value)` sample.
///
/// Timestamps are unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Sample value.
    pub value: f64,
}

impl DataPoint {
    /// Creates a new data point.
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A batch of samples for one metric, stored together in one write.
///
/// Order of `data` is preserved all the way to the archive append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Points {
    /// Dotted metric name, e.g. `servers.web1.cpu`.
    pub metric: String,
    /// Samples in submission order.
    pub data: Vec<DataPoint>,
}

impl Points {
    /// Creates an empty batch for `metric`.
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            data: Vec::new(),
        }
    }

    /// Creates a batch holding a single sample.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use carbide::points::Points;
    ///
    /// let p = Points::one_point("carbon.agents.a.persister.created", 2.0, 1_700_000_000);
    /// assert_eq!(p.len(), 1);
    /// assert_eq!(p.data[0].value, 2.0);
    /// ```
    pub fn one_point(metric: impl Into<String>, value: f64, timestamp: i64) -> Self {
        Self {
            metric: metric.into(),
            data: vec![DataPoint::new(timestamp, value)],
        }
    }

    /// Appends a sample, returning the batch for chaining.
    #[must_use]
    pub fn add(mut self, value: f64, timestamp: i64) -> Self {
        self.data.push(DataPoint::new(timestamp, value));
        self
    }

    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the batch has no samples.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Parses one plaintext line: `metric value timestamp`.
    ///
    /// Returns `None` for blank or malformed lines and for non-finite values.
    pub fn parse_plain(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let metric = fields.next()?;
        let value: f64 = fields.next()?.parse().ok()?;
        let timestamp: f64 = fields.next()?.parse().ok()?;
        if fields.next().is_some() || !value.is_finite() || !timestamp.is_finite() {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)] // sub-second precision is discarded
        let timestamp = timestamp as i64;
        Some(Self::one_point(metric, value, timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let p = Points::new("a.b").add(1.0, 10).add(2.0, 20);
        assert_eq!(p.metric, "a.b");
        assert_eq!(p.len(), 2);
        assert_eq!(p.data[1], DataPoint::new(20, 2.0));
        assert!(!p.is_empty());
        assert!(Points::new("x").is_empty());
    }

    #[test]
    fn test_parse_plain() {
        let p = Points::parse_plain("servers.web1.cpu 42.5 1700000000\n").unwrap();
        assert_eq!(p.metric, "servers.web1.cpu");
        assert_eq!(p.data, vec![DataPoint::new(1_700_000_000, 42.5)]);

        // Fractional timestamps are truncated
        let p = Points::parse_plain("m 1 1700000000.9").unwrap();
        assert_eq!(p.data[0].timestamp, 1_700_000_000);

        assert!(Points::parse_plain("").is_none());
        assert!(Points::parse_plain("m 1").is_none());
        assert!(Points::parse_plain("m x 10").is_none());
        assert!(Points::parse_plain("m 1 10 extra").is_none());
        assert!(Points::parse_plain("m NaN 10").is_none());
    }
}
