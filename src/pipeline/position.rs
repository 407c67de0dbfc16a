//! Ingest Positions
//!
//! Where a dump unit or an incremental stream stands. Positions are
//! persisted as tagged JSON and shared between the task advancing them and
//! the checkpoint persister.

use std::cmp::Ordering;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Progress marker of one dump unit or incremental stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestPosition {
    /// Not yet assigned
    #[default]
    Placeholder,
    /// Inclusive range over an integer unique key
    IntegerPrimaryKey { lower_bound: i64, upper_bound: i64 },
    /// Range over a string unique key; open ends are None
    StringPrimaryKey {
        lower_bound: Option<String>,
        upper_bound: Option<String>,
    },
    /// Unique key type cannot be ranged; the table is streamed whole
    UnsupportedKey,
    /// Nothing left to dump
    Finished,
    /// Replication log coordinates
    Binlog { file_name: String, position: u64 },
}

impl IngestPosition {
    pub fn integer(lower_bound: i64, upper_bound: i64) -> Self {
        IngestPosition::IntegerPrimaryKey {
            lower_bound,
            upper_bound,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, IngestPosition::Finished)
    }

    /// Bounds of an integer range position
    pub fn integer_bounds(&self) -> Option<(i64, i64)> {
        match self {
            IngestPosition::IntegerPrimaryKey {
                lower_bound,
                upper_bound,
            } => Some((*lower_bound, *upper_bound)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::InvalidPosition(format!("'{}': {}", text, e)))
    }
}

impl PartialOrd for IngestPosition {
    /// Integer ranges order by `(lower, upper)`; other kinds only compare equal
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        match (self.integer_bounds(), other.integer_bounds()) {
            (Some(left), Some(right)) => Some(left.cmp(&right)),
            _ => None,
        }
    }
}

impl std::fmt::Display for IngestPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestPosition::Placeholder => write!(f, "placeholder"),
            IngestPosition::IntegerPrimaryKey {
                lower_bound,
                upper_bound,
            } => write!(f, "i[{},{}]", lower_bound, upper_bound),
            IngestPosition::StringPrimaryKey {
                lower_bound,
                upper_bound,
            } => write!(
                f,
                "s[{},{}]",
                lower_bound.as_deref().unwrap_or(""),
                upper_bound.as_deref().unwrap_or("")
            ),
            IngestPosition::UnsupportedKey => write!(f, "unsupported"),
            IngestPosition::Finished => write!(f, "finished"),
            IngestPosition::Binlog {
                file_name,
                position,
            } => write!(f, "binlog[{}:{}]", file_name, position),
        }
    }
}

/// Split `[minimum, maximum]` into `ceil(estimated_rows / shard_size)` ranges.
///
/// Ranges are contiguous, non-overlapping and together cover the whole
/// interval; the last one absorbs the truncation remainder. Fewer ranges come
/// back when the key span is narrower than the shard count. An empty table
/// yields a single `[0, 0]` range.
pub fn split_integer_range(
    minimum: i64,
    maximum: i64,
    estimated_rows: u64,
    shard_size: u64,
) -> Vec<IngestPosition> {
    if estimated_rows == 0 {
        return vec![IngestPosition::integer(0, 0)];
    }
    let (minimum, maximum) = if minimum <= maximum {
        (minimum, maximum)
    } else {
        (maximum, minimum)
    };
    let shard_size = shard_size.max(1);
    let split_count = estimated_rows.div_ceil(shard_size) as i128;
    let span = maximum as i128 - minimum as i128;
    let interval = (span / split_count).max(1);

    let mut result = Vec::new();
    let mut lower = minimum as i128;
    for index in 0..split_count {
        if lower > maximum as i128 {
            break;
        }
        let upper = if index == split_count - 1 {
            maximum as i128
        } else {
            (lower + interval - 1).min(maximum as i128)
        };
        result.push(IngestPosition::integer(lower as i64, upper as i64));
        lower = upper + 1;
    }
    result
}

/// Shared, mutable position of one task
#[derive(Debug, Clone, Default)]
pub struct PositionCell(Arc<RwLock<IngestPosition>>);

impl PositionCell {
    pub fn new(position: IngestPosition) -> Self {
        Self(Arc::new(RwLock::new(position)))
    }

    pub fn get(&self) -> IngestPosition {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, position: IngestPosition) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = position;
    }

    pub fn is_finished(&self) -> bool {
        self.0.read().unwrap_or_else(|e| e.into_inner()).is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(positions: &[IngestPosition]) -> Vec<(i64, i64)> {
        positions.iter().filter_map(|p| p.integer_bounds()).collect()
    }

    fn assert_covers(positions: &[IngestPosition], minimum: i64, maximum: i64) {
        let ranges = bounds(positions);
        assert_eq!(ranges.first().unwrap().0, minimum);
        assert_eq!(ranges.last().unwrap().1, maximum);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0, "gap or overlap in {:?}", ranges);
        }
    }

    #[test]
    fn test_split_ten_million_rows() {
        let positions = split_integer_range(1, 10_000_000, 10_000_000, 1_000_000);
        assert_eq!(positions.len(), 10);
        assert_covers(&positions, 1, 10_000_000);
    }

    #[test]
    fn test_split_count_is_ceiling() {
        let positions = split_integer_range(0, 999, 1_001, 100);
        assert_eq!(positions.len(), 11);
        assert_covers(&positions, 0, 999);

        let positions = split_integer_range(-500, 500, 50, 100);
        assert_eq!(bounds(&positions), vec![(-500, 500)]);
    }

    #[test]
    fn test_split_narrow_key_span_yields_fewer_ranges() {
        let positions = split_integer_range(1, 3, 100, 10);
        assert_eq!(bounds(&positions), vec![(1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn test_split_empty_table() {
        assert_eq!(split_integer_range(5, 9, 0, 10), vec![IngestPosition::integer(0, 0)]);
    }

    #[test]
    fn test_split_extreme_bounds() {
        let positions = split_integer_range(i64::MIN, i64::MAX, 4, 1);
        assert_eq!(positions.len(), 4);
        assert_covers(&positions, i64::MIN, i64::MAX);
    }

    #[test]
    fn test_ordering_compares_integer_bounds() {
        assert!(IngestPosition::integer(1, 10) < IngestPosition::integer(2, 5));
        assert!(IngestPosition::integer(1, 10) < IngestPosition::integer(1, 11));
        assert_eq!(
            IngestPosition::Finished.partial_cmp(&IngestPosition::Finished),
            Some(Ordering::Equal)
        );
        assert_eq!(IngestPosition::Finished.partial_cmp(&IngestPosition::integer(0, 0)), None);
    }

    #[test]
    fn test_json_shape() {
        let json = IngestPosition::integer(1, 100).to_json().unwrap();
        assert_eq!(json, r#"{"type":"integer_primary_key","lower_bound":1,"upper_bound":100}"#);
        assert!(IngestPosition::from_json("{\"type\":\"nope\"}").is_err());
        assert_eq!(
            IngestPosition::from_json(r#"{"type":"finished"}"#).unwrap(),
            IngestPosition::Finished
        );
    }

    #[test]
    fn test_position_cell_is_shared() {
        let cell = PositionCell::new(IngestPosition::integer(1, 10));
        let reader = cell.clone();
        cell.set(IngestPosition::Finished);
        assert!(reader.is_finished());
    }
}
