//! Storage and aggregation rules, and the router that maps metric names to them.
//!
//! A storage rule decides the retention ladder of a new archive file; an
//! aggregation rule decides how lower-precision archives consolidate and how
//! much coverage they need. Both are consulted only when a file is created.
//!
//! Rules are evaluated in configuration order and the first whose pattern
//! matches the metric name wins.
//!
//! # Example
//!
//! ```rust
//! use carbide::schema::{AggregationRule, MetricRouter, SchemaRouter, StorageRule};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let router = SchemaRouter::from_rules(
//!     &[StorageRule::new("carbon", "^carbon\\.", "60:90d")],
//!     &[AggregationRule::default()],
//! )?;
//!
//! let policy = router.storage_policy("carbon.agents.a.created").unwrap();
//! assert_eq!(policy.retentions[0].seconds_per_point, 60);
//! assert!(router.storage_policy("servers.web1.cpu").is_none());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchemaError};

/// Largest number of points allowed in a single archive.
///
/// Keeps a typo such as `1s:100y` from producing a multi-gigabyte file.
const MAX_POINTS_PER_ARCHIVE: u64 = 50_000_000;

/// One rung of a retention ladder: `points` slots of `seconds_per_point` each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Retention {
    /// Width of one slot in seconds.
    pub seconds_per_point: u32,
    /// Number of slots.
    pub points: u32,
}

impl Retention {
    /// Creates a retention rung.
    pub fn new(seconds_per_point: u32, points: u32) -> Self {
        Self {
            seconds_per_point,
            points,
        }
    }

    /// Total time covered by this rung, in seconds.
    pub fn max_retention(&self) -> u64 {
        u64::from(self.seconds_per_point) * u64::from(self.points)
    }
}

impl fmt::Display for Retention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seconds_per_point, self.points)
    }
}

impl FromStr for Retention {
    type Err = SchemaError;

    /// Parses `precision:duration`.
    ///
    /// Either side may carry a unit (`s`, `m`/`min`, `h`, `d`, `w`, `y`). A bare
    /// number is seconds on the left and a point count on the right, so
    /// `60:1440` and `1m:1d` describe the same rung.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = |reason: &str| SchemaError::InvalidRetention {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (precision, duration) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| invalid("expected 'precision:duration'"))?;

        let (spp, _) = parse_amount(precision).ok_or_else(|| invalid("bad precision"))?;
        if spp == 0 {
            return Err(invalid("precision must be positive"));
        }

        let points = match parse_amount(duration).ok_or_else(|| invalid("bad duration"))? {
            (count, false) => count,
            (seconds, true) => seconds / spp,
        };
        if points == 0 {
            return Err(invalid("duration is shorter than precision"));
        }
        if points > MAX_POINTS_PER_ARCHIVE {
            return Err(invalid(&format!(
                "{points} points exceeds the limit of {MAX_POINTS_PER_ARCHIVE}"
            )));
        }

        let seconds_per_point =
            u32::try_from(spp).map_err(|_| invalid("precision is too large"))?;
        let points = u32::try_from(points).map_err(|_| invalid("too many points"))?;
        Ok(Self::new(seconds_per_point, points))
    }
}

/// Parses `<number><unit?>`, returning the amount in seconds (when a unit was
/// given) and whether a unit was present.
fn parse_amount(text: &str) -> Option<(u64, bool)> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().ok()?;

    let multiplier = match unit {
        "" => return Some((value, false)),
        "s" | "sec" => 1,
        "m" | "min" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        "y" => 31_536_000,
        _ => return None,
    };
    value.checked_mul(multiplier).map(|secs| (secs, true))
}

/// Parses a comma separated retention ladder such as `"60s:30d,1h:5y"`.
///
/// # Errors
///
/// Returns [`SchemaError::InvalidRetention`] if any rung fails to parse.
pub fn parse_retentions(text: &str) -> Result<Vec<Retention>> {
    text.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| part.parse::<Retention>().map_err(Into::into))
        .collect()
}

/// Checks that a ladder can back an archive file.
///
/// Rungs must go from highest to lowest precision, each precision must divide
/// the next, each rung must cover more time than the one before, and a rung
/// must hold enough points to consolidate into at least one slot of the next.
///
/// # Errors
///
/// Returns [`SchemaError::InvalidLadder`] describing the first violation.
pub fn validate_retentions(schema: &str, retentions: &[Retention]) -> Result<()> {
    let invalid = |reason: String| SchemaError::InvalidLadder {
        schema: schema.to_string(),
        reason,
    };

    if retentions.is_empty() {
        return Err(invalid("at least one retention is required".to_string()).into());
    }

    for (i, pair) in retentions.windows(2).enumerate() {
        let (high, low) = (pair[0], pair[1]);

        if high.seconds_per_point >= low.seconds_per_point {
            return Err(invalid(format!(
                "rung {} ({high}) must have finer precision than rung {} ({low})",
                i,
                i + 1
            ))
            .into());
        }

        if low.seconds_per_point % high.seconds_per_point != 0 {
            return Err(invalid(format!(
                "precision {}s of rung {} is not a multiple of {}s",
                low.seconds_per_point,
                i + 1,
                high.seconds_per_point
            ))
            .into());
        }

        if high.max_retention() >= low.max_retention() {
            return Err(invalid(format!(
                "rung {} must retain more than rung {}",
                i + 1,
                i
            ))
            .into());
        }

        if high.points < low.seconds_per_point / high.seconds_per_point {
            return Err(invalid(format!(
                "rung {i} has too few points to consolidate into rung {}",
                i + 1
            ))
            .into());
        }
    }

    Ok(())
}

/// How lower-precision archives consolidate samples from the archive above.
///
/// NaN values are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    /// Arithmetic mean.
    Average,
    /// Sum.
    Sum,
    /// Most recent value.
    Last,
    /// Maximum.
    Max,
    /// Minimum.
    Min,
}

impl AggregationMethod {
    /// Consolidates `values`, ignoring NaN. Returns NaN if nothing is left.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use carbide::schema::AggregationMethod;
    ///
    /// let values = [1.0, f64::NAN, 5.0];
    /// assert_eq!(AggregationMethod::Average.apply(&values), 3.0);
    /// assert_eq!(AggregationMethod::Last.apply(&values), 5.0);
    /// ```
    #[allow(clippy::cast_precision_loss)] // slot counts are far below 2^52
    pub fn apply(self, values: &[f64]) -> f64 {
        let mut known = values.iter().copied().filter(|v| !v.is_nan()).peekable();
        if known.peek().is_none() {
            return f64::NAN;
        }

        match self {
            Self::Average => {
                let (sum, count) = known.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
                sum / count as f64
            }
            Self::Sum => known.sum(),
            Self::Last => known.last().unwrap_or(f64::NAN),
            Self::Max => known.fold(f64::NEG_INFINITY, f64::max),
            Self::Min => known.fold(f64::INFINITY, f64::min),
        }
    }

    /// Numeric code stored in archive headers.
    pub fn code(self) -> u32 {
        match self {
            Self::Average => 1,
            Self::Sum => 2,
            Self::Last => 3,
            Self::Max => 4,
            Self::Min => 5,
        }
    }

    /// Inverse of [`AggregationMethod::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Average),
            2 => Some(Self::Sum),
            3 => Some(Self::Last),
            4 => Some(Self::Max),
            5 => Some(Self::Min),
            _ => None,
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Average => "average",
            Self::Sum => "sum",
            Self::Last => "last",
            Self::Max => "max",
            Self::Min => "min",
        };
        f.write_str(name)
    }
}

impl FromStr for AggregationMethod {
    type Err = SchemaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "average" | "avg" => Ok(Self::Average),
            "sum" => Ok(Self::Sum),
            "last" => Ok(Self::Last),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            other => Err(SchemaError::UnknownAggregationMethod(other.to_string())),
        }
    }
}

/// A storage rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRule {
    /// Rule name, used in logs.
    pub name: String,
    /// Regular expression matched against the metric name.
    pub pattern: String,
    /// Retention ladder, e.g. `"60s:30d,1h:5y"`.
    pub retentions: String,
}

impl StorageRule {
    /// Creates a storage rule.
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        retentions: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            retentions: retentions.into(),
        }
    }
}

/// An aggregation rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRule {
    /// Rule name, used in logs.
    pub name: String,
    /// Regular expression matched against the metric name.
    pub pattern: String,
    /// Fraction of known values required to write a consolidated slot.
    #[serde(default = "default_x_files_factor")]
    pub x_files_factor: f32,
    /// Consolidation method.
    #[serde(default = "default_aggregation_method")]
    pub aggregation_method: AggregationMethod,
}

fn default_x_files_factor() -> f32 {
    0.5
}

fn default_aggregation_method() -> AggregationMethod {
    AggregationMethod::Average
}

impl Default for AggregationRule {
    /// The catch-all rule: average with half coverage.
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            pattern: ".*".to_string(),
            x_files_factor: default_x_files_factor(),
            aggregation_method: default_aggregation_method(),
        }
    }
}

fn compile_pattern(rule: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| {
        SchemaError::InvalidPattern {
            rule: rule.to_string(),
            pattern: pattern.to_string(),
            source,
        }
        .into()
    })
}

/// A compiled storage rule.
#[derive(Debug, Clone)]
pub struct StoragePolicy {
    /// Rule name.
    pub name: String,
    /// Compiled pattern.
    pub pattern: Regex,
    /// Retention ladder from highest to lowest precision.
    pub retentions: Vec<Retention>,
    /// The ladder as configured, kept for logs.
    pub retentions_text: String,
}

impl StoragePolicy {
    /// Compiles and validates a storage rule.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if the pattern or the ladder is invalid.
    pub fn compile(rule: &StorageRule) -> Result<Self> {
        let pattern = compile_pattern(&rule.name, &rule.pattern)?;
        let retentions = parse_retentions(&rule.retentions)?;
        validate_retentions(&rule.name, &retentions)?;

        Ok(Self {
            name: rule.name.clone(),
            pattern,
            retentions,
            retentions_text: rule.retentions.clone(),
        })
    }
}

/// A compiled aggregation rule.
#[derive(Debug, Clone)]
pub struct AggregationPolicy {
    /// Rule name.
    pub name: String,
    /// Compiled pattern.
    pub pattern: Regex,
    /// Consolidation method.
    pub method: AggregationMethod,
    /// Required coverage fraction, within `[0, 1]`.
    pub x_files_factor: f32,
}

impl AggregationPolicy {
    /// Compiles and validates an aggregation rule.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if the pattern is invalid or the x-files-factor
    /// is outside `[0, 1]`.
    pub fn compile(rule: &AggregationRule) -> Result<Self> {
        if !(0.0..=1.0).contains(&rule.x_files_factor) {
            return Err(SchemaError::InvalidXFilesFactor {
                rule: rule.name.clone(),
                value: rule.x_files_factor,
            }
            .into());
        }

        Ok(Self {
            name: rule.name.clone(),
            pattern: compile_pattern(&rule.name, &rule.pattern)?,
            method: rule.aggregation_method,
            x_files_factor: rule.x_files_factor,
        })
    }
}

/// Maps a metric name to the policies used when its file is created.
///
/// Implementations must be pure: no I/O, no interior state changes. `None`
/// means the metric is not covered by configuration, which is an expected
/// outcome rather than a failure.
pub trait MetricRouter: Send + Sync {
    /// Storage policy for `metric`, if any rule matches.
    fn storage_policy(&self, metric: &str) -> Option<&StoragePolicy>;

    /// Aggregation policy for `metric`, if any rule matches.
    fn aggregation_policy(&self, metric: &str) -> Option<&AggregationPolicy>;
}

/// First-match router over ordered rule lists.
#[derive(Debug, Clone, Default)]
pub struct SchemaRouter {
    storage: Vec<StoragePolicy>,
    aggregation: Vec<AggregationPolicy>,
}

impl SchemaRouter {
    /// Creates a router from compiled policies.
    pub fn new(storage: Vec<StoragePolicy>, aggregation: Vec<AggregationPolicy>) -> Self {
        Self {
            storage,
            aggregation,
        }
    }

    /// Compiles rule lists into a router.
    ///
    /// An empty aggregation list is replaced by the catch-all
    /// [`AggregationRule::default`].
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] for the first rule that fails to compile.
    pub fn from_rules(storage: &[StorageRule], aggregation: &[AggregationRule]) -> Result<Self> {
        let storage = storage
            .iter()
            .map(StoragePolicy::compile)
            .collect::<Result<Vec<_>>>()?;

        let aggregation = if aggregation.is_empty() {
            vec![AggregationPolicy::compile(&AggregationRule::default())?]
        } else {
            aggregation
                .iter()
                .map(AggregationPolicy::compile)
                .collect::<Result<Vec<_>>>()?
        };

        Ok(Self::new(storage, aggregation))
    }

    /// Number of storage rules.
    pub fn storage_rule_count(&self) -> usize {
        self.storage.len()
    }

    /// Number of aggregation rules.
    pub fn aggregation_rule_count(&self) -> usize {
        self.aggregation.len()
    }
}

impl MetricRouter for SchemaRouter {
    fn storage_policy(&self, metric: &str) -> Option<&StoragePolicy> {
        self.storage.iter().find(|s| s.pattern.is_match(metric))
    }

    fn aggregation_policy(&self, metric: &str) -> Option<&AggregationPolicy> {
        self.aggregation.iter().find(|a| a.pattern.is_match(metric))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retention_units() {
        assert_eq!("60s:1d".parse::<Retention>().unwrap(), Retention::new(60, 1440));
        assert_eq!("1m:1d".parse::<Retention>().unwrap(), Retention::new(60, 1440));
        assert_eq!("60:1440".parse::<Retention>().unwrap(), Retention::new(60, 1440));
        assert_eq!("1h:1w".parse::<Retention>().unwrap(), Retention::new(3600, 168));
        assert_eq!("1d:1y".parse::<Retention>().unwrap(), Retention::new(86400, 365));
        assert_eq!("10:6h".parse::<Retention>().unwrap(), Retention::new(10, 2160));
    }

    #[test]
    fn test_parse_retention_errors() {
        assert!("60".parse::<Retention>().is_err());
        assert!("0:10".parse::<Retention>().is_err());
        assert!("1h:1m".parse::<Retention>().is_err());
        assert!("1x:1d".parse::<Retention>().is_err());
        assert!("1s:100y".parse::<Retention>().is_err());
    }

    #[test]
    fn test_parse_ladder() {
        let ladder = parse_retentions("60s:30d, 1h:5y").unwrap();
        assert_eq!(
            ladder,
            vec![Retention::new(60, 43_200), Retention::new(3600, 43_800)]
        );
        assert!(validate_retentions("default", &ladder).is_ok());
    }

    #[test]
    fn test_validate_ladder() {
        // Precision not increasing
        let ladder = vec![Retention::new(60, 100), Retention::new(60, 200)];
        assert!(validate_retentions("t", &ladder).is_err());

        // 90 is not a multiple of 60
        let ladder = vec![Retention::new(60, 100), Retention::new(90, 200)];
        assert!(validate_retentions("t", &ladder).is_err());

        // Lower rung retains less
        let ladder = vec![Retention::new(60, 1000), Retention::new(120, 100)];
        assert!(validate_retentions("t", &ladder).is_err());

        // Not enough points to consolidate 1h from 60s slots
        let ladder = vec![Retention::new(60, 30), Retention::new(3600, 100)];
        assert!(validate_retentions("t", &ladder).is_err());

        assert!(validate_retentions("t", &[]).is_err());
        assert!(validate_retentions("t", &[Retention::new(1, 1)]).is_ok());
    }

    #[test]
    fn test_aggregation_methods() {
        let values = [1.0, 4.0, f64::NAN, 3.0];
        assert!((AggregationMethod::Average.apply(&values) - 8.0 / 3.0).abs() < 1e-12);
        assert_eq!(AggregationMethod::Sum.apply(&values), 8.0);
        assert_eq!(AggregationMethod::Last.apply(&values), 3.0);
        assert_eq!(AggregationMethod::Max.apply(&values), 4.0);
        assert_eq!(AggregationMethod::Min.apply(&values), 1.0);
        assert!(AggregationMethod::Sum.apply(&[f64::NAN]).is_nan());
        assert!(AggregationMethod::Average.apply(&[]).is_nan());

        for method in [
            AggregationMethod::Average,
            AggregationMethod::Sum,
            AggregationMethod::Last,
            AggregationMethod::Max,
            AggregationMethod::Min,
        ] {
            assert_eq!(AggregationMethod::from_code(method.code()), Some(method));
            assert_eq!(method.to_string().parse::<AggregationMethod>().unwrap(), method);
        }
        assert!("median".parse::<AggregationMethod>().is_err());
    }

    #[test]
    fn test_router_first_match_wins() {
        let router = SchemaRouter::from_rules(
            &[
                StorageRule::new("carbon", "^carbon\\.", "60:90d"),
                StorageRule::new("default", ".*", "10s:1d,1m:30d"),
            ],
            &[AggregationRule {
                name: "max".to_string(),
                pattern: "\\.max$".to_string(),
                x_files_factor: 0.1,
                aggregation_method: AggregationMethod::Max,
            }],
        )
        .unwrap();

        assert_eq!(router.storage_policy("carbon.agents.x").unwrap().name, "carbon");
        assert_eq!(router.storage_policy("servers.web1.cpu").unwrap().name, "default");

        let aggr = router.aggregation_policy("latency.max").unwrap();
        assert_eq!(aggr.method, AggregationMethod::Max);
        assert!(router.aggregation_policy("latency.avg").is_none());
    }

    #[test]
    fn test_router_default_aggregation() {
        let router = SchemaRouter::from_rules(&[], &[]).unwrap();
        assert_eq!(router.storage_rule_count(), 0);
        assert_eq!(router.aggregation_rule_count(), 1);
        assert!(router.storage_policy("anything").is_none());

        let aggr = router.aggregation_policy("anything").unwrap();
        assert_eq!(aggr.method, AggregationMethod::Average);
        assert!((aggr.x_files_factor - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_rule_compile_errors() {
        assert!(StoragePolicy::compile(&StorageRule::new("bad", "(", "60:10")).is_err());
        assert!(StoragePolicy::compile(&StorageRule::new("bad", ".*", "nope")).is_err());

        let rule = AggregationRule {
            x_files_factor: 1.5,
            ..AggregationRule::default()
        };
        let err = AggregationPolicy::compile(&rule).unwrap_err();
        assert!(err.to_string().contains("x_files_factor"));
    }

    #[test]
    fn test_aggregation_rule_serde_defaults() {
        let rule: AggregationRule =
            serde_json::from_str(r#"{"name": "sum", "pattern": "\\.count$", "aggregation_method": "sum"}"#)
                .unwrap();
        assert_eq!(rule.aggregation_method, AggregationMethod::Sum);
        assert!((rule.x_files_factor - 0.5).abs() < f32::EPSILON);
    }
}
