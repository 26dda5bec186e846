//! Storage for finished report runs.
//!
//! A run is stored as a cache *instance* identified by `(report_id,
//! instance_id)`: the report's code name and a fingerprint of its inputs.
//! The cache consumes a run's row stream, numbers the rows, stores the
//! finalized footer, and serves rows back sorted and paged.
//!
//! # Instance lifecycle
//!
//! ```text
//! absent -> locked (being written) -> finished -> expired
//! ```
//!
//! Writing an instance that is locked or finished and unexpired is rejected
//! with [`CacheError::InstanceLocked`] or [`CacheError::InstanceExists`].
//! Reading an instance that is not finished fails with
//! [`CacheError::InstanceIncomplete`]. None of these are retried.
//!
//! # Sorting
//!
//! Every backend sorts the same way: each cell is projected to a number,
//! or to text for alphabetical sorts, empty cells first when ascending, and
//! ties broken by row id.

mod hash;
mod local;
mod memory;

pub use hash::input_fingerprint;
pub use local::LocalCache;
pub use memory::MemoryCache;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ReportError, ReportResult};
use crate::row::Row;
use crate::value::Value;

/// Longest cache lifetime honoured; longer TTLs are clamped.
const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("instance {report_id}/{instance_id} is already being written")]
    InstanceLocked {
        report_id: String,
        instance_id: String,
    },

    #[error("instance {report_id}/{instance_id} is already cached")]
    InstanceExists {
        report_id: String,
        instance_id: String,
    },

    #[error("instance {report_id}/{instance_id} is not finished")]
    InstanceIncomplete {
        report_id: String,
        instance_id: String,
    },

    #[error("cannot sort on unknown column {0}")]
    UnknownColumn(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to determine cache directory")]
    NoCacheDir,

    /// The row stream failed while the instance was being written.
    #[error("report run failed: {0}")]
    Stream(Box<ReportError>),
}

impl CacheError {
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::InstanceLocked { .. })
    }

    pub fn is_exists(&self) -> bool {
        matches!(self, Self::InstanceExists { .. })
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::InstanceIncomplete { .. })
    }

    pub(crate) fn locked(report_id: &str, instance_id: &str) -> Self {
        Self::InstanceLocked {
            report_id: report_id.to_string(),
            instance_id: instance_id.to_string(),
        }
    }

    pub(crate) fn exists(report_id: &str, instance_id: &str) -> Self {
        Self::InstanceExists {
            report_id: report_id.to_string(),
            instance_id: instance_id.to_string(),
        }
    }

    pub(crate) fn incomplete(report_id: &str, instance_id: &str) -> Self {
        Self::InstanceIncomplete {
            report_id: report_id.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

impl From<ReportError> for CacheError {
    fn from(err: ReportError) -> Self {
        Self::Stream(Box::new(err))
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

// ============================================================================
// Queries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(format!("unknown sort direction: {other}")),
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        })
    }
}

/// A column to sort by and its direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub column: String,
    pub direction: SortDirection,
}

impl Sort {
    pub fn new(column: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            column: column.into(),
            direction,
        }
    }

    pub fn asc(column: impl Into<String>) -> Self {
        Self::new(column, SortDirection::Asc)
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self::new(column, SortDirection::Desc)
    }
}

/// Which cached rows to return and in what order.
///
/// The default returns every row in emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowQuery {
    /// Restrict to these row ids.
    pub selected: Option<Vec<i64>>,
    pub sort: Option<Sort>,
    pub limit: Option<usize>,
    pub offset: usize,
    /// Compare the sort column as text rather than as a number.
    pub alpha: bool,
}

impl RowQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_selected(mut self, ids: Vec<i64>) -> Self {
        self.selected = Some(ids);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_alpha(mut self, alpha: bool) -> Self {
        self.alpha = alpha;
        self
    }
}

/// A stored row with its id (1-based, in emission order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRow {
    pub id: i64,
    pub row: Row,
}

/// Summary of one cache instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub report_id: String,
    pub instance_id: String,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub finished: bool,
    pub row_count: usize,
}

// ============================================================================
// Interfaces
// ============================================================================

/// A report run as the cache consumes it.
///
/// The footer is only available once every row has been pulled.
pub trait RowStream: Iterator<Item = ReportResult<Row>> {
    /// Declared columns, in order.
    fn column_names(&self) -> Vec<String>;

    /// The finalized footer. Fails with
    /// [`ReportError::FooterNotReady`] until the stream is exhausted.
    fn finalize_footer(&mut self) -> ReportResult<Row>;
}

/// Backend storing finished report runs.
pub trait ReportCache: Send + Sync {
    /// Consumes `rows` into a new instance that expires after `ttl`.
    ///
    /// The instance is locked while it is written. If the stream fails the
    /// partial instance is removed and the error returned as
    /// [`CacheError::Stream`].
    fn create_instance(
        &self,
        report_id: &str,
        instance_id: &str,
        rows: &mut dyn RowStream,
        ttl: Duration,
    ) -> CacheResult<()>;

    fn kill_instance_cache(&self, report_id: &str, instance_id: &str) -> CacheResult<()>;

    /// Removes every instance of a report.
    fn kill_report_cache(&self, report_id: &str) -> CacheResult<()>;

    /// Whether the instance is being written or finished and unexpired.
    fn is_instance_started(&self, report_id: &str, instance_id: &str) -> CacheResult<bool>;

    /// Whether the instance is finished and unexpired.
    fn is_instance_finished(&self, report_id: &str, instance_id: &str) -> CacheResult<bool>;

    fn instance_row_count(&self, report_id: &str, instance_id: &str) -> CacheResult<usize>;

    /// When the finished instance was created.
    fn instance_timestamp(&self, report_id: &str, instance_id: &str)
        -> CacheResult<DateTime<Utc>>;

    fn instance_rows(
        &self,
        report_id: &str,
        instance_id: &str,
        query: &RowQuery,
    ) -> CacheResult<Vec<CachedRow>>;

    fn instance_footer(&self, report_id: &str, instance_id: &str) -> CacheResult<Row>;

    /// Drops expired instances, returning how many were removed.
    fn purge_expired(&self) -> CacheResult<usize>;

    fn list_instances(&self) -> CacheResult<Vec<InstanceInfo>>;
}

pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let secs = i64::try_from(ttl.as_secs()).unwrap_or(MAX_TTL_SECS).min(MAX_TTL_SECS);
    now + chrono::Duration::seconds(secs)
}

// ============================================================================
// Sort projection
// ============================================================================

static NUMERIC_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?").unwrap());

/// A cell as the sort sees it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SortValue {
    Null,
    Real(f64),
    Text(String),
}

impl SortValue {
    /// Projects a cell the way SQLite casts its stored form: numbers and
    /// dates as reals, or everything as text for alphabetical sorts. Text
    /// cast to a number keeps its leading numeric prefix, else zero.
    pub(crate) fn of(cell: Option<&Value>, alpha: bool) -> Self {
        use rusqlite::types::Value as Sql;
        let Some(cell) = cell else {
            return Self::Null;
        };
        match (cell.to_sql(), alpha) {
            (Sql::Null, _) => Self::Null,
            (Sql::Integer(i), false) => Self::Real(i as f64),
            (Sql::Real(f), false) => Self::Real(f),
            (Sql::Text(s), false) => Self::Real(numeric_prefix(&s)),
            (Sql::Integer(i), true) => Self::Text(i.to_string()),
            (Sql::Real(f), true) => Self::Text(real_text(f)),
            (Sql::Text(s), true) => Self::Text(s),
            (Sql::Blob(_), false) => Self::Real(0.0),
            (Sql::Blob(b), true) => Self::Text(String::from_utf8_lossy(&b).into_owned()),
        }
    }
}

impl Eq for SortValue {}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Null, _) => Ordering::Less,
            (_, Self::Null) => Ordering::Greater,
            (Self::Real(a), Self::Real(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Real(_), Self::Text(_)) => Ordering::Less,
            (Self::Text(_), Self::Real(_)) => Ordering::Greater,
        }
    }
}

fn numeric_prefix(s: &str) -> f64 {
    NUMERIC_PREFIX
        .find(s)
        .and_then(|m| m.as_str().trim().parse().ok())
        .unwrap_or(0.0)
}

fn real_text(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

/// Orders two stored rows for `query`: the sort key in the requested
/// direction, then ascending row id.
pub(crate) fn compare_rows(
    a: (&SortValue, i64),
    b: (&SortValue, i64),
    direction: SortDirection,
) -> Ordering {
    let by_value = match direction {
        SortDirection::Asc => a.0.cmp(b.0),
        SortDirection::Desc => b.0.cmp(a.0),
    };
    by_value.then(a.1.cmp(&b.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_numeric_projection() {
        assert_eq!(SortValue::of(None, false), SortValue::Null);
        assert_eq!(SortValue::of(Some(&Value::Int(3)), false), SortValue::Real(3.0));
        assert_eq!(
            SortValue::of(Some(&Value::Decimal(Decimal::new(125, 2))), false),
            SortValue::Real(1.25)
        );
        assert_eq!(SortValue::of(Some(&Value::from("12abc")), false), SortValue::Real(12.0));
        assert_eq!(SortValue::of(Some(&Value::from("abc")), false), SortValue::Real(0.0));
    }

    #[test]
    fn test_alpha_projection_compares_text() {
        let ten = SortValue::of(Some(&Value::Int(10)), true);
        let nine = SortValue::of(Some(&Value::Int(9)), true);
        assert!(ten < nine);
        assert_eq!(SortValue::of(Some(&Value::Float(2.0)), true), SortValue::Text("2.0".into()));
    }

    #[test]
    fn test_nulls_first_ascending_and_ties_by_id() {
        let null = SortValue::Null;
        let one = SortValue::Real(1.0);
        assert_eq!(compare_rows((&null, 2), (&one, 1), SortDirection::Asc), Ordering::Less);
        assert_eq!(compare_rows((&null, 2), (&one, 1), SortDirection::Desc), Ordering::Greater);
        assert_eq!(compare_rows((&one, 1), (&one, 2), SortDirection::Desc), Ordering::Less);
    }

    #[test]
    fn test_sort_direction_parse() {
        assert_eq!("ASC".parse::<SortDirection>(), Ok(SortDirection::Asc));
        assert_eq!("desc".parse::<SortDirection>(), Ok(SortDirection::Desc));
        assert!("sideways".parse::<SortDirection>().is_err());
    }

    #[test]
    fn test_state_predicates() {
        assert!(CacheError::locked("r", "i").is_locked());
        assert!(CacheError::exists("r", "i").is_exists());
        assert!(CacheError::incomplete("r", "i").is_incomplete());
        assert!(!CacheError::NoCacheDir.is_locked());
    }
}
