use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

/// A measured quantity parsed from a table cell.
///
/// `Known` always holds a finite, non-negative value; anything else collapses
/// to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Metric {
    Known(f64),
    #[default]
    Unknown,
}

impl Metric {
    pub fn known(value: f64) -> Self {
        if value.is_finite() && value >= 0.0 {
            Metric::Known(value)
        } else {
            Metric::Unknown
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            Metric::Known(v) => Some(v),
            Metric::Unknown => None,
        }
    }

    pub fn is_known(self) -> bool {
        matches!(self, Metric::Known(_))
    }

    /// Descending order with `Unknown` after every known value.
    pub fn cmp_desc(self, other: Self) -> Ordering {
        match (self, other) {
            (Metric::Known(a), Metric::Known(b)) => b.total_cmp(&a),
            (Metric::Known(_), Metric::Unknown) => Ordering::Less,
            (Metric::Unknown, Metric::Known(_)) => Ordering::Greater,
            (Metric::Unknown, Metric::Unknown) => Ordering::Equal,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Known(v) => write!(f, "{v}"),
            Metric::Unknown => f.write_str("unknown"),
        }
    }
}

impl Serialize for Metric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Metric::Known(v) => serializer.serialize_f64(*v),
            Metric::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

/// Cell values pulled out of one table row by a column mapping, before any
/// validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    /// 0-based position among the table's data rows.
    pub position: usize,
    pub line: Option<String>,
    pub address: String,
    pub packet_loss: Option<String>,
    pub latency: Option<String>,
    pub speed: Option<String>,
    pub bandwidth: Option<String>,
    pub link: Option<String>,
    pub observed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub line: Option<String>,
    pub address: String,
    pub packet_loss: Metric,
    pub latency_ms: Metric,
    pub speed_mbps: Metric,
    pub bandwidth_mb: Metric,
    pub source_link: Option<String>,
    pub observed_at: Option<String>,
    pub rank: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidAddress,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::InvalidAddress => "invalid-address",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub position: usize,
    pub value: String,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default)]
pub struct TargetCounts {
    pub rows_seen: usize,
    pub rows_skipped: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub duplicates_dropped: usize,
    pub selected: usize,
}
