use std::cmp::Ordering;
use std::fmt;

use chrono::{Datelike, Days, NaiveDate};

use crate::error::{Error, Result};

/// Runtime type of a column. The set is closed: per-type behavior lives in
/// match arms on `Column`, not behind trait objects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    /// Days since the Unix epoch, stored as u16.
    Date,
    /// Seconds since the Unix epoch, stored as u32.
    DateTime,
    FixedString(usize),
    String,
    Array(Box<DataType>),
    Tuple(Vec<DataType>),
    /// In-progress aggregation state. The payload is the function
    /// description, e.g. "sum(UInt64)", sufficient to rebuild the function.
    AggregateState(std::string::String),
}

impl DataType {
    /// Textual name, also used in columns.txt and the block wire format.
    pub fn name(&self) -> String {
        match self {
            DataType::UInt8 => "UInt8".into(),
            DataType::UInt16 => "UInt16".into(),
            DataType::UInt32 => "UInt32".into(),
            DataType::UInt64 => "UInt64".into(),
            DataType::Int8 => "Int8".into(),
            DataType::Int16 => "Int16".into(),
            DataType::Int32 => "Int32".into(),
            DataType::Int64 => "Int64".into(),
            DataType::Float32 => "Float32".into(),
            DataType::Float64 => "Float64".into(),
            DataType::Date => "Date".into(),
            DataType::DateTime => "DateTime".into(),
            DataType::FixedString(n) => format!("FixedString({n})"),
            DataType::String => "String".into(),
            DataType::Array(inner) => format!("Array({})", inner.name()),
            DataType::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(|t| t.name()).collect();
                format!("Tuple({})", inner.join(", "))
            }
            DataType::AggregateState(desc) => format!("AggregateFunction({desc})"),
        }
    }

    /// Parses a type name produced by [`DataType::name`].
    pub fn parse(s: &str) -> Result<DataType> {
        let s = s.trim();
        match s {
            "UInt8" => return Ok(DataType::UInt8),
            "UInt16" => return Ok(DataType::UInt16),
            "UInt32" => return Ok(DataType::UInt32),
            "UInt64" => return Ok(DataType::UInt64),
            "Int8" => return Ok(DataType::Int8),
            "Int16" => return Ok(DataType::Int16),
            "Int32" => return Ok(DataType::Int32),
            "Int64" => return Ok(DataType::Int64),
            "Float32" => return Ok(DataType::Float32),
            "Float64" => return Ok(DataType::Float64),
            "Date" => return Ok(DataType::Date),
            "DateTime" => return Ok(DataType::DateTime),
            "String" => return Ok(DataType::String),
            _ => {}
        }
        if let Some(inner) = strip_call(s, "FixedString") {
            let n: usize = inner
                .trim()
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("bad FixedString size: {inner}")))?;
            return Ok(DataType::FixedString(n));
        }
        if let Some(inner) = strip_call(s, "Array") {
            return Ok(DataType::Array(Box::new(DataType::parse(inner)?)));
        }
        if let Some(inner) = strip_call(s, "Tuple") {
            let mut items = Vec::new();
            for piece in split_top_level(inner) {
                items.push(DataType::parse(piece)?);
            }
            return Ok(DataType::Tuple(items));
        }
        if let Some(inner) = strip_call(s, "AggregateFunction") {
            return Ok(DataType::AggregateState(inner.trim().to_string()));
        }
        Err(Error::InvalidArgument(format!("unknown type name: {s}")))
    }

    /// Numeric here means "orderable fixed-width scalar", which includes
    /// dates: they are plain day/second counters.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64
                | DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::Float32
                | DataType::Float64
                | DataType::Date
                | DataType::DateTime
        )
    }

    /// Byte width of one value for fixed-width types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            DataType::UInt8 | DataType::Int8 => Some(1),
            DataType::UInt16 | DataType::Int16 | DataType::Date => Some(2),
            DataType::UInt32 | DataType::Int32 | DataType::Float32 | DataType::DateTime => Some(4),
            DataType::UInt64 | DataType::Int64 | DataType::Float64 => Some(8),
            DataType::FixedString(n) => Some(*n),
            _ => None,
        }
    }

    pub fn default_value(&self) -> Value {
        match self {
            DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Date
            | DataType::DateTime => Value::UInt64(0),
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => Value::Int64(0),
            DataType::Float32 | DataType::Float64 => Value::Float64(0.0),
            DataType::FixedString(n) => Value::Bytes(vec![0u8; *n]),
            DataType::String => Value::Bytes(Vec::new()),
            DataType::Array(_) => Value::Array(Vec::new()),
            DataType::Tuple(items) => Value::Tuple(items.iter().map(|t| t.default_value()).collect()),
            DataType::AggregateState(_) => Value::Bytes(Vec::new()),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub(crate) fn strip_call<'a>(s: &'a str, name: &str) -> Option<&'a str> {
    s.strip_prefix(name)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

/// Splits "a, Tuple(b, c), d" into top-level comma pieces.
pub(crate) fn split_top_level(s: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                pieces.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if !s[start..].trim().is_empty() {
        pieces.push(&s[start..]);
    }
    pieces
}

/// A single scalar value. Integer widths are collapsed to 64 bits; the
/// owning column's type decides the on-disk encoding.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    UInt64(u64),
    Int64(i64),
    Float64(f64),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Tuple(Vec<Value>),
}

impl Value {
    pub fn as_u64(&self) -> Result<u64> {
        match self {
            Value::UInt64(v) => Ok(*v),
            Value::Int64(v) if *v >= 0 => Ok(*v as u64),
            other => Err(Error::InvalidArgument(format!("expected unsigned value, got {other:?}"))),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Int64(v) => Ok(*v),
            Value::UInt64(v) => Ok(*v as i64),
            other => Err(Error::InvalidArgument(format!("expected integer value, got {other:?}"))),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Float64(v) => Ok(*v),
            Value::UInt64(v) => Ok(*v as f64),
            Value::Int64(v) => Ok(*v as f64),
            other => Err(Error::InvalidArgument(format!("expected float value, got {other:?}"))),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => Err(Error::InvalidArgument(format!("expected bytes value, got {other:?}"))),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::UInt64(_) => 0,
            Value::Int64(_) => 1,
            Value::Float64(_) => 2,
            Value::Bytes(_) => 3,
            Value::Array(_) => 4,
            Value::Tuple(_) => 5,
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::UInt64(a), Value::UInt64(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => a.cmp(b),
            (Value::Tuple(a), Value::Tuple(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Value::UInt64(v) => v.hash(state),
            Value::Int64(v) => v.hash(state),
            Value::Float64(v) => v.to_bits().hash(state),
            Value::Bytes(v) => v.hash(state),
            Value::Array(v) | Value::Tuple(v) => {
                state.write_usize(v.len());
                for item in v {
                    item.hash(state);
                }
            }
        }
    }
}

/// Converts a day count to its calendar date. NaiveDate::default() is the
/// Unix epoch.
pub fn date_from_days(days: u16) -> NaiveDate {
    NaiveDate::default()
        .checked_add_days(Days::new(days as u64))
        .unwrap_or(NaiveDate::MAX)
}

/// Month bucket of a day count, as year * 12 + (month - 1).
pub fn month_of_days(days: u16) -> u32 {
    let date = date_from_days(days);
    date.year() as u32 * 12 + date.month0()
}

/// Formats a day count as YYYYMMDD, the form used in part names.
pub fn format_compact_date(days: u16) -> String {
    date_from_days(days).format("%Y%m%d").to_string()
}

/// Parses a YYYYMMDD string back into a day count.
pub fn parse_compact_date(s: &str) -> Result<u16> {
    let date = NaiveDate::parse_from_str(s, "%Y%m%d")
        .map_err(|_| Error::InvalidArgument(format!("bad date in part name: {s}")))?;
    let days = date.signed_duration_since(NaiveDate::default()).num_days();
    if !(0..=u16::MAX as i64).contains(&days) {
        return Err(Error::InvalidArgument(format!("date out of range: {s}")));
    }
    Ok(days as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_name_roundtrip() {
        let types = vec![
            DataType::UInt8,
            DataType::Int64,
            DataType::Float32,
            DataType::Date,
            DataType::DateTime,
            DataType::String,
            DataType::FixedString(16),
            DataType::Array(Box::new(DataType::UInt32)),
            DataType::Array(Box::new(DataType::Array(Box::new(DataType::String)))),
            DataType::Tuple(vec![DataType::UInt64, DataType::String]),
            DataType::AggregateState("sum(UInt64)".into()),
        ];
        for t in types {
            let name = t.name();
            assert_eq!(DataType::parse(&name).unwrap(), t, "roundtrip of {name}");
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DataType::parse("Unknown").is_err());
        assert!(DataType::parse("FixedString(x)").is_err());
    }

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(DataType::UInt8.fixed_size(), Some(1));
        assert_eq!(DataType::Date.fixed_size(), Some(2));
        assert_eq!(DataType::DateTime.fixed_size(), Some(4));
        assert_eq!(DataType::Float64.fixed_size(), Some(8));
        assert_eq!(DataType::FixedString(10).fixed_size(), Some(10));
        assert_eq!(DataType::String.fixed_size(), None);
    }

    #[test]
    fn test_compact_dates() {
        // 2014-03-17 is 16146 days after the epoch.
        assert_eq!(format_compact_date(16146), "20140317");
        assert_eq!(parse_compact_date("20140317").unwrap(), 16146);
        assert_eq!(month_of_days(16146), 2014 * 12 + 2);
        // The first and last day of one month land in the same bucket.
        assert_eq!(
            month_of_days(parse_compact_date("20140301").unwrap()),
            month_of_days(parse_compact_date("20140331").unwrap())
        );
        assert_ne!(
            month_of_days(parse_compact_date("20140331").unwrap()),
            month_of_days(parse_compact_date("20140401").unwrap())
        );
    }

    #[test]
    fn test_value_ordering() {
        assert!(Value::UInt64(1) < Value::UInt64(2));
        assert!(Value::Float64(f64::NAN) > Value::Float64(1e300));
        assert!(Value::Bytes(b"a".to_vec()) < Value::Bytes(b"ab".to_vec()));
    }
}
