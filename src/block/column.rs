use std::cmp::Ordering;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::aggregate::state::AggregateStateColumn;
use crate::block::types::{DataType, Value};
use crate::error::{Error, Result};
use crate::io::checksum::Hash128;
use crate::io::varint;

/// One fixed-width element type. The trait carries everything the column
/// needs to stay generic over the twelve numeric variants.
pub trait Primitive: Copy + PartialEq + Send + Sync + 'static {
    const SIZE: usize;
    fn zero() -> Self;
    fn to_value(self) -> Value;
    fn from_value(value: &Value) -> Result<Self>;
    fn compare(a: Self, b: Self, nan_direction: i8) -> Ordering;
    fn write<W: Write>(self, w: &mut W) -> std::io::Result<()>;
    fn read<R: Read>(r: &mut R) -> std::io::Result<Self>;
    /// Raw bits widened to 64, used as the KEY_64 aggregation key.
    fn key_bits(self) -> u64;
    fn from_key_bits(bits: u64) -> Self;
    fn raw_bytes(self, out: &mut Vec<u8>);
    fn from_raw_bytes(bytes: &[u8]) -> Self;
    /// Addition for the summing merge mode; integers wrap.
    fn sum_add(a: Self, b: Self) -> Self;
    fn is_nan(self) -> bool {
        false
    }
}

macro_rules! impl_primitive_uint {
    ($t:ty, $size:expr, $read:ident, $write:ident) => {
        impl Primitive for $t {
            const SIZE: usize = $size;
            fn zero() -> Self {
                0
            }
            fn to_value(self) -> Value {
                Value::UInt64(self as u64)
            }
            fn from_value(value: &Value) -> Result<Self> {
                let v = value.as_u64()?;
                if v > <$t>::MAX as u64 {
                    return Err(Error::InvalidArgument(format!(
                        "value {v} does not fit in {}",
                        stringify!($t)
                    )));
                }
                Ok(v as $t)
            }
            fn compare(a: Self, b: Self, _nan_direction: i8) -> Ordering {
                a.cmp(&b)
            }
            fn write<W: Write>(self, w: &mut W) -> std::io::Result<()> {
                w.$write::<LittleEndian>(self)
            }
            fn read<R: Read>(r: &mut R) -> std::io::Result<Self> {
                r.$read::<LittleEndian>()
            }
            fn key_bits(self) -> u64 {
                self as u64
            }
            fn from_key_bits(bits: u64) -> Self {
                bits as $t
            }
            fn raw_bytes(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn from_raw_bytes(bytes: &[u8]) -> Self {
                let mut arr = [0u8; $size];
                arr.copy_from_slice(&bytes[..$size]);
                <$t>::from_le_bytes(arr)
            }
            fn sum_add(a: Self, b: Self) -> Self {
                a.wrapping_add(b)
            }
        }
    };
}

macro_rules! impl_primitive_int {
    ($t:ty, $size:expr, $read:ident, $write:ident) => {
        impl Primitive for $t {
            const SIZE: usize = $size;
            fn zero() -> Self {
                0
            }
            fn to_value(self) -> Value {
                Value::Int64(self as i64)
            }
            fn from_value(value: &Value) -> Result<Self> {
                let v = value.as_i64()?;
                if v < <$t>::MIN as i64 || v > <$t>::MAX as i64 {
                    return Err(Error::InvalidArgument(format!(
                        "value {v} does not fit in {}",
                        stringify!($t)
                    )));
                }
                Ok(v as $t)
            }
            fn compare(a: Self, b: Self, _nan_direction: i8) -> Ordering {
                a.cmp(&b)
            }
            fn write<W: Write>(self, w: &mut W) -> std::io::Result<()> {
                w.$write::<LittleEndian>(self)
            }
            fn read<R: Read>(r: &mut R) -> std::io::Result<Self> {
                r.$read::<LittleEndian>()
            }
            fn key_bits(self) -> u64 {
                self as u64
            }
            fn from_key_bits(bits: u64) -> Self {
                bits as $t
            }
            fn raw_bytes(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn from_raw_bytes(bytes: &[u8]) -> Self {
                let mut arr = [0u8; $size];
                arr.copy_from_slice(&bytes[..$size]);
                <$t>::from_le_bytes(arr)
            }
            fn sum_add(a: Self, b: Self) -> Self {
                a.wrapping_add(b)
            }
        }
    };
}

macro_rules! impl_primitive_float {
    ($t:ty, $bits:ty, $size:expr, $read:ident, $write:ident) => {
        impl Primitive for $t {
            const SIZE: usize = $size;
            fn zero() -> Self {
                0.0
            }
            fn to_value(self) -> Value {
                Value::Float64(self as f64)
            }
            fn from_value(value: &Value) -> Result<Self> {
                Ok(value.as_f64()? as $t)
            }
            fn compare(a: Self, b: Self, nan_direction: i8) -> Ordering {
                match (a.is_nan(), b.is_nan()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => {
                        if nan_direction > 0 {
                            Ordering::Greater
                        } else {
                            Ordering::Less
                        }
                    }
                    (false, true) => {
                        if nan_direction > 0 {
                            Ordering::Less
                        } else {
                            Ordering::Greater
                        }
                    }
                    (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                }
            }
            fn write<W: Write>(self, w: &mut W) -> std::io::Result<()> {
                w.$write::<LittleEndian>(self)
            }
            fn read<R: Read>(r: &mut R) -> std::io::Result<Self> {
                r.$read::<LittleEndian>()
            }
            fn key_bits(self) -> u64 {
                self.to_bits() as u64
            }
            fn from_key_bits(bits: u64) -> Self {
                <$t>::from_bits(bits as $bits)
            }
            fn raw_bytes(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn from_raw_bytes(bytes: &[u8]) -> Self {
                let mut arr = [0u8; $size];
                arr.copy_from_slice(&bytes[..$size]);
                <$t>::from_le_bytes(arr)
            }
            fn sum_add(a: Self, b: Self) -> Self {
                a + b
            }
            fn is_nan(self) -> bool {
                self.is_nan()
            }
        }
    };
}

impl Primitive for u8 {
    const SIZE: usize = 1;
    fn zero() -> Self {
        0
    }
    fn to_value(self) -> Value {
        Value::UInt64(self as u64)
    }
    fn from_value(value: &Value) -> Result<Self> {
        let v = value.as_u64()?;
        if v > u8::MAX as u64 {
            return Err(Error::InvalidArgument(format!("value {v} does not fit in u8")));
        }
        Ok(v as u8)
    }
    fn compare(a: Self, b: Self, _nan_direction: i8) -> Ordering {
        a.cmp(&b)
    }
    fn write<W: Write>(self, w: &mut W) -> std::io::Result<()> {
        w.write_u8(self)
    }
    fn read<R: Read>(r: &mut R) -> std::io::Result<Self> {
        r.read_u8()
    }
    fn key_bits(self) -> u64 {
        self as u64
    }
    fn from_key_bits(bits: u64) -> Self {
        bits as u8
    }
    fn raw_bytes(self, out: &mut Vec<u8>) {
        out.push(self);
    }
    fn from_raw_bytes(bytes: &[u8]) -> Self {
        bytes[0]
    }
    fn sum_add(a: Self, b: Self) -> Self {
        a.wrapping_add(b)
    }
}

impl Primitive for i8 {
    const SIZE: usize = 1;
    fn zero() -> Self {
        0
    }
    fn to_value(self) -> Value {
        Value::Int64(self as i64)
    }
    fn from_value(value: &Value) -> Result<Self> {
        let v = value.as_i64()?;
        if v < i8::MIN as i64 || v > i8::MAX as i64 {
            return Err(Error::InvalidArgument(format!("value {v} does not fit in i8")));
        }
        Ok(v as i8)
    }
    fn compare(a: Self, b: Self, _nan_direction: i8) -> Ordering {
        a.cmp(&b)
    }
    fn write<W: Write>(self, w: &mut W) -> std::io::Result<()> {
        w.write_i8(self)
    }
    fn read<R: Read>(r: &mut R) -> std::io::Result<Self> {
        r.read_i8()
    }
    fn key_bits(self) -> u64 {
        self as u64
    }
    fn from_key_bits(bits: u64) -> Self {
        bits as i8
    }
    fn raw_bytes(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }
    fn from_raw_bytes(bytes: &[u8]) -> Self {
        bytes[0] as i8
    }
    fn sum_add(a: Self, b: Self) -> Self {
        a.wrapping_add(b)
    }
}

impl_primitive_uint!(u16, 2, read_u16, write_u16);
impl_primitive_uint!(u32, 4, read_u32, write_u32);
impl_primitive_uint!(u64, 8, read_u64, write_u64);
impl_primitive_int!(i16, 2, read_i16, write_i16);
impl_primitive_int!(i32, 4, read_i32, write_i32);
impl_primitive_int!(i64, 8, read_i64, write_i64);
impl_primitive_float!(f32, u32, 4, read_f32, write_f32);
impl_primitive_float!(f64, u64, 8, read_f64, write_f64);

/// A typed, contiguous sequence of values of one type. The unit every
/// operator works in terms of, always inside a [`super::Block`].
#[derive(Clone, Debug)]
pub enum Column {
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Date(Vec<u16>),
    DateTime(Vec<u32>),
    FixedString { n: usize, data: Vec<u8> },
    String { offsets: Vec<u64>, data: Vec<u8> },
    /// offsets[i] is the end of row i inside `values`.
    Array { offsets: Vec<u64>, values: Box<Column> },
    Tuple(Vec<Column>),
    AggregateState(AggregateStateColumn),
    /// A single repeated value; materializable to a full column on demand.
    Const { data_type: DataType, value: Value, len: usize },
}

/// Generates a match rewrapping each numeric variant after applying `$e` to
/// its data vector.
macro_rules! map_numeric {
    ($col:expr, $v:ident => $e:expr, $other:pat => $fallback:expr) => {
        match $col {
            Column::UInt8($v) => Column::UInt8($e),
            Column::UInt16($v) => Column::UInt16($e),
            Column::UInt32($v) => Column::UInt32($e),
            Column::UInt64($v) => Column::UInt64($e),
            Column::Int8($v) => Column::Int8($e),
            Column::Int16($v) => Column::Int16($e),
            Column::Int32($v) => Column::Int32($e),
            Column::Int64($v) => Column::Int64($e),
            Column::Float32($v) => Column::Float32($e),
            Column::Float64($v) => Column::Float64($e),
            Column::Date($v) => Column::Date($e),
            Column::DateTime($v) => Column::DateTime($e),
            $other => $fallback,
        }
    };
}

/// Generates a match applying `$e` to each numeric variant's data vector.
macro_rules! with_numeric {
    ($col:expr, $v:ident => $e:expr, $other:pat => $fallback:expr) => {
        match $col {
            Column::UInt8($v) => $e,
            Column::UInt16($v) => $e,
            Column::UInt32($v) => $e,
            Column::UInt64($v) => $e,
            Column::Int8($v) => $e,
            Column::Int16($v) => $e,
            Column::Int32($v) => $e,
            Column::Int64($v) => $e,
            Column::Float32($v) => $e,
            Column::Float64($v) => $e,
            Column::Date($v) => $e,
            Column::DateTime($v) => $e,
            $other => $fallback,
        }
    };
}

/// Generates a match over two columns of the same numeric variant.
macro_rules! zip_numeric {
    ($a:expr, $b:expr, $x:ident, $y:ident => $e:expr, $other:pat => $fallback:expr) => {
        match ($a, $b) {
            (Column::UInt8($x), Column::UInt8($y)) => $e,
            (Column::UInt16($x), Column::UInt16($y)) => $e,
            (Column::UInt32($x), Column::UInt32($y)) => $e,
            (Column::UInt64($x), Column::UInt64($y)) => $e,
            (Column::Int8($x), Column::Int8($y)) => $e,
            (Column::Int16($x), Column::Int16($y)) => $e,
            (Column::Int32($x), Column::Int32($y)) => $e,
            (Column::Int64($x), Column::Int64($y)) => $e,
            (Column::Float32($x), Column::Float32($y)) => $e,
            (Column::Float64($x), Column::Float64($y)) => $e,
            (Column::Date($x), Column::Date($y)) => $e,
            (Column::DateTime($x), Column::DateTime($y)) => $e,
            $other => $fallback,
        }
    };
}

fn filter_vec<T: Copy>(values: &[T], mask: &[u8]) -> Vec<T> {
    values
        .iter()
        .zip(mask.iter())
        .filter_map(|(v, m)| (*m != 0).then_some(*v))
        .collect()
}

fn permute_vec<T: Copy>(values: &[T], perm: &[usize], limit: usize) -> Vec<T> {
    perm[..limit].iter().map(|&i| values[i]).collect()
}

fn replicate_vec<T: Copy>(values: &[T], offsets: &[u64]) -> Vec<T> {
    let mut result = Vec::with_capacity(offsets.last().copied().unwrap_or(0) as usize);
    let mut prev = 0u64;
    for (value, &end) in values.iter().zip(offsets.iter()) {
        for _ in prev..end {
            result.push(*value);
        }
        prev = end;
    }
    result
}

fn extremes_vec<T: Primitive>(values: &[T]) -> (Value, Value) {
    let mut min: Option<T> = None;
    let mut max: Option<T> = None;
    for &v in values {
        if v.is_nan() {
            continue;
        }
        min = Some(match min {
            Some(m) if T::compare(m, v, 1) != Ordering::Greater => m,
            _ => v,
        });
        max = Some(match max {
            Some(m) if T::compare(m, v, -1) != Ordering::Less => m,
            _ => v,
        });
    }
    (
        min.map(T::to_value).unwrap_or_else(|| T::zero().to_value()),
        max.map(T::to_value).unwrap_or_else(|| T::zero().to_value()),
    )
}

fn serialize_vec<T: Primitive, W: Write>(values: &[T], start: usize, len: usize, w: &mut W) -> Result<()> {
    for &v in &values[start..start + len] {
        v.write(w)?;
    }
    Ok(())
}

fn deserialize_vec<T: Primitive, R: Read>(rows: usize, r: &mut R) -> Result<Vec<T>> {
    let mut values = Vec::with_capacity(rows);
    for _ in 0..rows {
        values.push(T::read(r)?);
    }
    Ok(values)
}

impl Column {
    /// Creates an empty column of the given type. Aggregate-state columns
    /// cannot be constructed from a type name alone; they are produced by
    /// the aggregator or deserialized with their function attached.
    pub fn new(data_type: &DataType) -> Result<Column> {
        Ok(match data_type {
            DataType::UInt8 => Column::UInt8(Vec::new()),
            DataType::UInt16 => Column::UInt16(Vec::new()),
            DataType::UInt32 => Column::UInt32(Vec::new()),
            DataType::UInt64 => Column::UInt64(Vec::new()),
            DataType::Int8 => Column::Int8(Vec::new()),
            DataType::Int16 => Column::Int16(Vec::new()),
            DataType::Int32 => Column::Int32(Vec::new()),
            DataType::Int64 => Column::Int64(Vec::new()),
            DataType::Float32 => Column::Float32(Vec::new()),
            DataType::Float64 => Column::Float64(Vec::new()),
            DataType::Date => Column::Date(Vec::new()),
            DataType::DateTime => Column::DateTime(Vec::new()),
            DataType::FixedString(n) => Column::FixedString { n: *n, data: Vec::new() },
            DataType::String => Column::String { offsets: Vec::new(), data: Vec::new() },
            DataType::Array(inner) => Column::Array {
                offsets: Vec::new(),
                values: Box::new(Column::new(inner)?),
            },
            DataType::Tuple(items) => {
                let mut columns = Vec::with_capacity(items.len());
                for item in items {
                    columns.push(Column::new(item)?);
                }
                Column::Tuple(columns)
            }
            DataType::AggregateState(desc) => {
                return Err(Error::InvalidArgument(format!(
                    "aggregate state column {desc} cannot be created from its type alone"
                )))
            }
        })
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Column::UInt8(_) => DataType::UInt8,
            Column::UInt16(_) => DataType::UInt16,
            Column::UInt32(_) => DataType::UInt32,
            Column::UInt64(_) => DataType::UInt64,
            Column::Int8(_) => DataType::Int8,
            Column::Int16(_) => DataType::Int16,
            Column::Int32(_) => DataType::Int32,
            Column::Int64(_) => DataType::Int64,
            Column::Float32(_) => DataType::Float32,
            Column::Float64(_) => DataType::Float64,
            Column::Date(_) => DataType::Date,
            Column::DateTime(_) => DataType::DateTime,
            Column::FixedString { n, .. } => DataType::FixedString(*n),
            Column::String { .. } => DataType::String,
            Column::Array { values, .. } => DataType::Array(Box::new(values.data_type())),
            Column::Tuple(columns) => DataType::Tuple(columns.iter().map(|c| c.data_type()).collect()),
            Column::AggregateState(col) => DataType::AggregateState(col.description()),
            Column::Const { data_type, .. } => data_type.clone(),
        }
    }

    pub fn len(&self) -> usize {
        with_numeric!(self, v => v.len(), other => match other {
            Column::FixedString { n, data } => if *n == 0 { 0 } else { data.len() / n },
            Column::String { offsets, .. } => offsets.len(),
            Column::Array { offsets, .. } => offsets.len(),
            Column::Tuple(columns) => columns.first().map_or(0, |c| c.len()),
            Column::AggregateState(col) => col.len(),
            Column::Const { len, .. } => *len,
            _ => unreachable!(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_size(&self) -> usize {
        with_numeric!(self, v => std::mem::size_of_val(v.as_slice()), other => match other {
            Column::FixedString { data, .. } => data.len(),
            Column::String { offsets, data } => data.len() + offsets.len() * 8,
            Column::Array { offsets, values } => values.byte_size() + offsets.len() * 8,
            Column::Tuple(columns) => columns.iter().map(|c| c.byte_size()).sum(),
            Column::AggregateState(col) => col.byte_size(),
            Column::Const { .. } => 0,
            _ => unreachable!(),
        })
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Column::Const { .. })
    }

    /// Expands a constant column into a full one; other columns pass
    /// through unchanged.
    pub fn materialize(&self) -> Result<Column> {
        match self {
            Column::Const { data_type, value, len } => {
                let mut column = Column::new(data_type)?;
                for _ in 0..*len {
                    column.push_value(value)?;
                }
                Ok(column)
            }
            other => Ok(other.clone()),
        }
    }

    pub fn push_default(&mut self) {
        match self {
            Column::UInt8(v) => v.push(0),
            Column::UInt16(v) => v.push(0),
            Column::UInt32(v) => v.push(0),
            Column::UInt64(v) => v.push(0),
            Column::Int8(v) => v.push(0),
            Column::Int16(v) => v.push(0),
            Column::Int32(v) => v.push(0),
            Column::Int64(v) => v.push(0),
            Column::Float32(v) => v.push(0.0),
            Column::Float64(v) => v.push(0.0),
            Column::Date(v) => v.push(0),
            Column::DateTime(v) => v.push(0),
            Column::FixedString { n, data } => data.extend(std::iter::repeat(0u8).take(*n)),
            Column::String { offsets, data } => offsets.push(data.len() as u64),
            Column::Array { offsets, values } => {
                let end = values.len() as u64;
                offsets.push(end);
            }
            Column::Tuple(columns) => {
                for column in columns {
                    column.push_default();
                }
            }
            Column::AggregateState(col) => col.push_null(),
            Column::Const { len, .. } => *len += 1,
        }
    }

    pub fn push_value(&mut self, value: &Value) -> Result<()> {
        match self {
            Column::UInt8(v) => v.push(u8::from_value(value)?),
            Column::UInt16(v) => v.push(u16::from_value(value)?),
            Column::UInt32(v) => v.push(u32::from_value(value)?),
            Column::UInt64(v) => v.push(u64::from_value(value)?),
            Column::Int8(v) => v.push(i8::from_value(value)?),
            Column::Int16(v) => v.push(i16::from_value(value)?),
            Column::Int32(v) => v.push(i32::from_value(value)?),
            Column::Int64(v) => v.push(i64::from_value(value)?),
            Column::Float32(v) => v.push(f32::from_value(value)?),
            Column::Float64(v) => v.push(f64::from_value(value)?),
            Column::Date(v) => v.push(u16::from_value(value)?),
            Column::DateTime(v) => v.push(u32::from_value(value)?),
            Column::FixedString { n, data } => {
                let bytes = value.as_bytes()?;
                if bytes.len() > *n {
                    return Err(Error::InvalidArgument(format!(
                        "string of {} bytes does not fit in FixedString({n})",
                        bytes.len()
                    )));
                }
                data.extend_from_slice(bytes);
                data.extend(std::iter::repeat(0u8).take(*n - bytes.len()));
            }
            Column::String { offsets, data } => {
                data.extend_from_slice(value.as_bytes()?);
                offsets.push(data.len() as u64);
            }
            Column::Array { offsets, values } => {
                let items = match value {
                    Value::Array(items) => items,
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "expected array value, got {other:?}"
                        )))
                    }
                };
                for item in items {
                    values.push_value(item)?;
                }
                offsets.push(values.len() as u64);
            }
            Column::Tuple(columns) => {
                let items = match value {
                    Value::Tuple(items) if items.len() == columns.len() => items,
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "expected tuple of {} values, got {other:?}",
                            columns.len()
                        )))
                    }
                };
                for (column, item) in columns.iter_mut().zip(items.iter()) {
                    column.push_value(item)?;
                }
            }
            Column::AggregateState(_) => {
                return Err(Error::InvalidArgument(
                    "cannot push a plain value into an aggregate state column".into(),
                ))
            }
            Column::Const { value: own, len, .. } => {
                if own != value {
                    return Err(Error::InvalidArgument(
                        "cannot push a different value into a constant column".into(),
                    ));
                }
                *len += 1;
            }
        }
        Ok(())
    }

    /// Appends row `i` of another column of the same type.
    pub fn push_from(&mut self, other: &Column, i: usize) -> Result<()> {
        zip_numeric!(self, other, dst, src => {
            dst.push(src[i]);
            Ok(())
        }, pair => match pair {
            (Column::FixedString { n, data }, Column::FixedString { n: m, data: src }) if n == m => {
                data.extend_from_slice(&src[i * *n..(i + 1) * *n]);
                Ok(())
            }
            (Column::String { offsets, data }, Column::String { offsets: so, data: sd }) => {
                let begin = if i == 0 { 0 } else { so[i - 1] as usize };
                let end = so[i] as usize;
                data.extend_from_slice(&sd[begin..end]);
                offsets.push(data.len() as u64);
                Ok(())
            }
            (Column::Array { offsets, values }, Column::Array { offsets: so, values: sv }) => {
                let begin = if i == 0 { 0 } else { so[i - 1] as usize };
                let end = so[i] as usize;
                values.append_rows(sv, begin, end - begin)?;
                offsets.push(values.len() as u64);
                Ok(())
            }
            (Column::Tuple(dst), Column::Tuple(src)) if dst.len() == src.len() => {
                for (d, s) in dst.iter_mut().zip(src.iter()) {
                    d.push_from(s, i)?;
                }
                Ok(())
            }
            (Column::AggregateState(dst), Column::AggregateState(src)) => dst.push_from(src, i),
            (dst, src @ Column::Const { .. }) => dst.push_value(&src.get(i)),
            (dst, src) => Err(Error::InvalidArgument(format!(
                "cannot append a {} row to a {} column",
                src.data_type(),
                dst.data_type()
            ))),
        })
    }

    /// Appends `len` consecutive rows of another column of the same type.
    pub fn append_rows(&mut self, other: &Column, start: usize, len: usize) -> Result<()> {
        zip_numeric!(self, other, dst, src => {
            dst.extend_from_slice(&src[start..start + len]);
            Ok(())
        }, pair => {
            let (dst, src) = pair;
            for i in start..start + len {
                dst.push_from(src, i)?;
            }
            Ok(())
        })
    }

    pub fn get(&self, i: usize) -> Value {
        with_numeric!(self, v => v[i].to_value(), other => match other {
            Column::FixedString { n, data } => Value::Bytes(data[i * n..(i + 1) * n].to_vec()),
            Column::String { offsets, data } => {
                let begin = if i == 0 { 0 } else { offsets[i - 1] as usize };
                Value::Bytes(data[begin..offsets[i] as usize].to_vec())
            }
            Column::Array { offsets, values } => {
                let begin = if i == 0 { 0 } else { offsets[i - 1] as usize };
                Value::Array((begin..offsets[i] as usize).map(|j| values.get(j)).collect())
            }
            Column::Tuple(columns) => Value::Tuple(columns.iter().map(|c| c.get(i)).collect()),
            // Opaque in-progress state has no scalar representation.
            Column::AggregateState(_) => Value::Bytes(Vec::new()),
            Column::Const { value, .. } => value.clone(),
            _ => unreachable!(),
        })
    }

    /// Raw bytes of row `i` without copying: the memory image of one
    /// fixed-width value (native byte order, which is the little-endian
    /// wire image on little-endian machines), or the byte content of a
    /// string. Compound rows have no flat representation and are rejected.
    pub fn get_data_at(&self, i: usize) -> Result<&[u8]> {
        fn element_bytes<T: Primitive>(values: &[T], i: usize) -> &[u8] {
            let value = &values[i];
            // Safety: every Primitive is a plain fixed-width scalar of
            // T::SIZE bytes with no interior padding; one element's memory
            // stays inside the vector's allocation.
            unsafe { std::slice::from_raw_parts(value as *const T as *const u8, T::SIZE) }
        }
        with_numeric!(self, v => Ok(element_bytes(v, i)), other => match other {
            Column::FixedString { n, data } => Ok(&data[i * n..(i + 1) * n]),
            Column::String { offsets, data } => {
                let begin = if i == 0 { 0 } else { offsets[i - 1] as usize };
                Ok(&data[begin..offsets[i] as usize])
            }
            Column::Const { value: Value::Bytes(bytes), .. } => Ok(bytes.as_slice()),
            other => Err(Error::InvalidArgument(format!(
                "no flat byte representation for {} rows",
                other.data_type()
            ))),
        })
    }

    /// Copying variant of [`Column::get_data_at`] with a guaranteed
    /// little-endian image, used to build packed aggregation keys.
    pub fn append_raw(&self, i: usize, out: &mut Vec<u8>) -> Result<()> {
        with_numeric!(self, v => {
            v[i].raw_bytes(out);
            Ok(())
        }, other => match other {
            Column::FixedString { n, data } => {
                out.extend_from_slice(&data[i * n..(i + 1) * n]);
                Ok(())
            }
            Column::String { offsets, data } => {
                let begin = if i == 0 { 0 } else { offsets[i - 1] as usize };
                out.extend_from_slice(&data[begin..offsets[i] as usize]);
                Ok(())
            }
            Column::Const { data_type, value, .. } => match (data_type.fixed_size(), value) {
                (_, Value::Bytes(b)) => {
                    out.extend_from_slice(b);
                    Ok(())
                }
                _ => {
                    let mut column = Column::new(data_type)?;
                    column.push_value(value)?;
                    column.append_raw(0, out)
                }
            },
            other => Err(Error::InvalidArgument(format!(
                "no raw byte representation for {} rows",
                other.data_type()
            ))),
        })
    }

    /// Feeds row `i` into a 128-bit hash. Variable-length values get a
    /// terminating zero so adjacent fields cannot alias; the fingerprint is
    /// still approximate when values embed NULs themselves.
    pub fn update_hash_row(&self, i: usize, hash: &mut Hash128) -> Result<()> {
        match self {
            Column::String { .. } => {
                hash.update(self.get_data_at(i)?);
                hash.update(&[0u8]);
                Ok(())
            }
            Column::Array { offsets, values } => {
                let begin = if i == 0 { 0 } else { offsets[i - 1] as usize };
                let end = offsets[i] as usize;
                hash.update(&((end - begin) as u64).to_le_bytes());
                for j in begin..end {
                    values.update_hash_row(j, hash)?;
                }
                Ok(())
            }
            Column::Tuple(columns) => {
                for column in columns {
                    column.update_hash_row(i, hash)?;
                }
                Ok(())
            }
            Column::Const { .. } => {
                let mut buf = Vec::new();
                self.append_raw(i, &mut buf)?;
                hash.update(&buf);
                hash.update(&[0u8]);
                Ok(())
            }
            // Fixed-width scalars and fixed strings hash their flat bytes;
            // rows without one (aggregate states) are rejected inside.
            other => {
                hash.update(other.get_data_at(i)?);
                Ok(())
            }
        }
    }

    /// Keeps the rows whose mask byte is non-zero.
    pub fn filter(&self, mask: &[u8]) -> Result<Column> {
        if mask.len() != self.len() {
            return Err(Error::SizeMismatch(format!(
                "filter mask of {} entries applied to a column of {} rows",
                mask.len(),
                self.len()
            )));
        }
        Ok(map_numeric!(self, v => filter_vec(v, mask), other => match other {
            Column::FixedString { n, data } => {
                let mut out = Vec::new();
                for (i, &m) in mask.iter().enumerate() {
                    if m != 0 {
                        out.extend_from_slice(&data[i * n..(i + 1) * n]);
                    }
                }
                Column::FixedString { n: *n, data: out }
            }
            Column::String { .. } | Column::Array { .. } => {
                let mut out = self.clone_empty();
                for (i, &m) in mask.iter().enumerate() {
                    if m != 0 {
                        out.push_from(self, i)?;
                    }
                }
                out
            }
            Column::Tuple(columns) => {
                let mut filtered = Vec::with_capacity(columns.len());
                for column in columns {
                    filtered.push(column.filter(mask)?);
                }
                Column::Tuple(filtered)
            }
            Column::AggregateState(col) => Column::AggregateState(col.filter(mask)),
            Column::Const { data_type, value, .. } => Column::Const {
                data_type: data_type.clone(),
                value: value.clone(),
                len: mask.iter().filter(|&&m| m != 0).count(),
            },
            _ => unreachable!(),
        }))
    }

    /// Reorders rows by the permutation, truncated to `limit` rows
    /// (0 = all of `perm`).
    pub fn permute(&self, perm: &[usize], limit: usize) -> Result<Column> {
        let limit = if limit == 0 { perm.len() } else { limit.min(perm.len()) };
        if limit > self.len() && !self.is_const() {
            return Err(Error::SizeMismatch(format!(
                "permutation of {limit} rows applied to a column of {} rows",
                self.len()
            )));
        }
        Ok(map_numeric!(self, v => permute_vec(v, perm, limit), other => match other {
            Column::Tuple(columns) => {
                let mut permuted = Vec::with_capacity(columns.len());
                for column in columns {
                    permuted.push(column.permute(perm, limit)?);
                }
                Column::Tuple(permuted)
            }
            Column::AggregateState(col) => Column::AggregateState(col.permute(perm, limit)),
            Column::Const { data_type, value, .. } => Column::Const {
                data_type: data_type.clone(),
                value: value.clone(),
                len: limit,
            },
            _ => {
                let mut out = self.clone_empty();
                for &i in &perm[..limit] {
                    out.push_from(self, i)?;
                }
                out
            }
        }))
    }

    /// Repeats each row i `offsets[i] - offsets[i-1]` times.
    pub fn replicate(&self, offsets: &[u64]) -> Result<Column> {
        if offsets.len() != self.len() {
            return Err(Error::SizeMismatch(format!(
                "replicate offsets of {} entries applied to a column of {} rows",
                offsets.len(),
                self.len()
            )));
        }
        Ok(map_numeric!(self, v => replicate_vec(v, offsets), other => match other {
            Column::Const { data_type, value, .. } => Column::Const {
                data_type: data_type.clone(),
                value: value.clone(),
                len: offsets.last().copied().unwrap_or(0) as usize,
            },
            _ => {
                let mut out = self.clone_empty();
                let mut prev = 0u64;
                for (i, &end) in offsets.iter().enumerate() {
                    for _ in prev..end {
                        out.push_from(self, i)?;
                    }
                    prev = end;
                }
                out
            }
        }))
    }

    /// Compares row `i` with row `j` of another column of the same type.
    /// Floats order NaNs to the end given by `nan_direction` (+1 greatest,
    /// -1 smallest). Columns must be type-checked up front; mismatched
    /// variants compare equal.
    pub fn compare_at(&self, i: usize, other: &Column, j: usize, nan_direction: i8) -> Ordering {
        zip_numeric!(self, other, a, b => Primitive::compare(a[i], b[j], nan_direction), pair => match pair {
            (Column::FixedString { n, data }, Column::FixedString { n: m, data: od }) if n == m => {
                data[i * n..(i + 1) * n].cmp(&od[j * n..(j + 1) * n])
            }
            (Column::String { .. }, Column::String { .. })
            | (Column::Array { .. }, Column::Array { .. })
            | (Column::Tuple(_), Column::Tuple(_)) => self.get(i).cmp(&other.get(j)),
            (Column::Const { value: a, .. }, Column::Const { value: b, .. }) => a.cmp(b),
            (Column::Const { .. }, _) => self.get(i).cmp(&other.get(j)),
            (_, Column::Const { .. }) => self.get(i).cmp(&other.get(j)),
            _ => Ordering::Equal,
        })
    }

    /// Minimum and maximum of the column, NaNs skipped.
    pub fn extremes(&self) -> (Value, Value) {
        with_numeric!(self, v => extremes_vec(v), other => match other {
            Column::FixedString { .. } | Column::String { .. } => {
                let mut min: Option<Value> = None;
                let mut max: Option<Value> = None;
                for i in 0..self.len() {
                    let v = self.get(i);
                    if min.as_ref().map_or(true, |m| v < *m) {
                        min = Some(v.clone());
                    }
                    if max.as_ref().map_or(true, |m| v > *m) {
                        max = Some(v);
                    }
                }
                let default = self.data_type().default_value();
                (min.unwrap_or_else(|| default.clone()), max.unwrap_or(default))
            }
            Column::Const { value, len, .. } if *len > 0 => (value.clone(), value.clone()),
            other => {
                let default = other.data_type().default_value();
                (default.clone(), default)
            }
        })
    }

    pub fn clone_empty(&self) -> Column {
        map_numeric!(self, _v => Vec::new(), other => match other {
            Column::FixedString { n, .. } => Column::FixedString { n: *n, data: Vec::new() },
            Column::String { .. } => Column::String { offsets: Vec::new(), data: Vec::new() },
            Column::Array { values, .. } => Column::Array {
                offsets: Vec::new(),
                values: Box::new(values.clone_empty()),
            },
            Column::Tuple(columns) => Column::Tuple(columns.iter().map(|c| c.clone_empty()).collect()),
            Column::AggregateState(col) => Column::AggregateState(col.clone_empty()),
            Column::Const { data_type, value, .. } => Column::Const {
                data_type: data_type.clone(),
                value: value.clone(),
                len: 0,
            },
            _ => unreachable!(),
        })
    }

    pub fn cut(&self, offset: usize, len: usize) -> Result<Column> {
        let len = len.min(self.len().saturating_sub(offset));
        match self {
            Column::Const { data_type, value, .. } => Ok(Column::Const {
                data_type: data_type.clone(),
                value: value.clone(),
                len,
            }),
            _ => {
                let mut out = self.clone_empty();
                out.append_rows(self, offset, len)?;
                Ok(out)
            }
        }
    }

    /// Appends the low bytes of a KEY_64 aggregation key as a value.
    pub fn push_key_bits(&mut self, bits: u64) -> Result<()> {
        match self {
            Column::UInt8(v) => v.push(u8::from_key_bits(bits)),
            Column::UInt16(v) => v.push(u16::from_key_bits(bits)),
            Column::UInt32(v) => v.push(u32::from_key_bits(bits)),
            Column::UInt64(v) => v.push(u64::from_key_bits(bits)),
            Column::Int8(v) => v.push(i8::from_key_bits(bits)),
            Column::Int16(v) => v.push(i16::from_key_bits(bits)),
            Column::Int32(v) => v.push(i32::from_key_bits(bits)),
            Column::Int64(v) => v.push(i64::from_key_bits(bits)),
            Column::Float32(v) => v.push(f32::from_key_bits(bits)),
            Column::Float64(v) => v.push(f64::from_key_bits(bits)),
            Column::Date(v) => v.push(u16::from_key_bits(bits)),
            Column::DateTime(v) => v.push(u32::from_key_bits(bits)),
            other => {
                return Err(Error::Logical(format!(
                    "KEY_64 bits pushed into a {} column",
                    other.data_type()
                )))
            }
        }
        Ok(())
    }

    /// Widens row `i` of a fixed-width column to its raw 64 key bits.
    pub fn key_bits(&self, i: usize) -> Result<u64> {
        with_numeric!(self, v => Ok(v[i].key_bits()), other => Err(Error::Logical(format!(
            "KEY_64 requested for a {} column",
            other.data_type()
        ))))
    }

    /// Appends a value from its little-endian raw bytes, the inverse of
    /// [`Column::append_raw`] for fixed-width types.
    pub fn push_raw(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Column::UInt8(v) => v.push(u8::from_raw_bytes(bytes)),
            Column::UInt16(v) => v.push(u16::from_raw_bytes(bytes)),
            Column::UInt32(v) => v.push(u32::from_raw_bytes(bytes)),
            Column::UInt64(v) => v.push(u64::from_raw_bytes(bytes)),
            Column::Int8(v) => v.push(i8::from_raw_bytes(bytes)),
            Column::Int16(v) => v.push(i16::from_raw_bytes(bytes)),
            Column::Int32(v) => v.push(i32::from_raw_bytes(bytes)),
            Column::Int64(v) => v.push(i64::from_raw_bytes(bytes)),
            Column::Float32(v) => v.push(f32::from_raw_bytes(bytes)),
            Column::Float64(v) => v.push(f64::from_raw_bytes(bytes)),
            Column::Date(v) => v.push(u16::from_raw_bytes(bytes)),
            Column::DateTime(v) => v.push(u32::from_raw_bytes(bytes)),
            Column::FixedString { n, data } => {
                if bytes.len() < *n {
                    return Err(Error::Logical(format!(
                        "{} raw bytes pushed into FixedString({n})",
                        bytes.len()
                    )));
                }
                data.extend_from_slice(&bytes[..*n]);
            }
            other => {
                return Err(Error::Logical(format!(
                    "raw bytes pushed into a {} column",
                    other.data_type()
                )))
            }
        }
        Ok(())
    }

    /// Serializes rows [start, start+len) in the column's binary format.
    /// Array offsets precede the inner data.
    pub fn serialize_rows<W: Write>(&self, start: usize, len: usize, w: &mut W) -> Result<()> {
        with_numeric!(self, v => serialize_vec(v, start, len, w), other => match other {
            Column::FixedString { n, data } => {
                w.write_all(&data[start * n..(start + len) * n])?;
                Ok(())
            }
            Column::String { offsets, data } => {
                for i in start..start + len {
                    let begin = if i == 0 { 0 } else { offsets[i - 1] as usize };
                    varint::write_bytes(w, &data[begin..offsets[i] as usize])?;
                }
                Ok(())
            }
            Column::Array { offsets, values } => {
                let base = if start == 0 { 0 } else { offsets[start - 1] };
                for i in start..start + len {
                    w.write_u64::<LittleEndian>(offsets[i] - base)?;
                }
                let end = if len == 0 { base } else { offsets[start + len - 1] };
                values.serialize_rows(base as usize, (end - base) as usize, w)
            }
            Column::Tuple(columns) => {
                for column in columns {
                    column.serialize_rows(start, len, w)?;
                }
                Ok(())
            }
            Column::AggregateState(col) => col.serialize_rows(start, len, w),
            Column::Const { .. } => self.materialize()?.serialize_rows(start, len, w),
            _ => unreachable!(),
        })
    }

    /// Reads `rows` values of the given type, the inverse of
    /// [`Column::serialize_rows`].
    pub fn deserialize_rows<R: Read>(data_type: &DataType, rows: usize, r: &mut R) -> Result<Column> {
        Ok(match data_type {
            DataType::UInt8 => Column::UInt8(deserialize_vec(rows, r)?),
            DataType::UInt16 => Column::UInt16(deserialize_vec(rows, r)?),
            DataType::UInt32 => Column::UInt32(deserialize_vec(rows, r)?),
            DataType::UInt64 => Column::UInt64(deserialize_vec(rows, r)?),
            DataType::Int8 => Column::Int8(deserialize_vec(rows, r)?),
            DataType::Int16 => Column::Int16(deserialize_vec(rows, r)?),
            DataType::Int32 => Column::Int32(deserialize_vec(rows, r)?),
            DataType::Int64 => Column::Int64(deserialize_vec(rows, r)?),
            DataType::Float32 => Column::Float32(deserialize_vec(rows, r)?),
            DataType::Float64 => Column::Float64(deserialize_vec(rows, r)?),
            DataType::Date => Column::Date(deserialize_vec(rows, r)?),
            DataType::DateTime => Column::DateTime(deserialize_vec(rows, r)?),
            DataType::FixedString(n) => {
                let mut data = vec![0u8; rows * n];
                r.read_exact(&mut data)?;
                Column::FixedString { n: *n, data }
            }
            DataType::String => {
                let mut offsets = Vec::with_capacity(rows);
                let mut data = Vec::new();
                for _ in 0..rows {
                    let bytes = varint::read_bytes(r)?;
                    data.extend_from_slice(&bytes);
                    offsets.push(data.len() as u64);
                }
                Column::String { offsets, data }
            }
            DataType::Array(inner) => {
                let mut offsets = Vec::with_capacity(rows);
                for _ in 0..rows {
                    offsets.push(r.read_u64::<LittleEndian>()?);
                }
                let total = offsets.last().copied().unwrap_or(0) as usize;
                let values = Column::deserialize_rows(inner, total, r)?;
                Column::Array { offsets, values: Box::new(values) }
            }
            DataType::Tuple(items) => {
                let mut columns = Vec::with_capacity(items.len());
                for item in items {
                    columns.push(Column::deserialize_rows(item, rows, r)?);
                }
                Column::Tuple(columns)
            }
            DataType::AggregateState(desc) => {
                Column::AggregateState(AggregateStateColumn::deserialize_rows(desc, rows, r)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn string_column(values: &[&str]) -> Column {
        let mut col = Column::String { offsets: Vec::new(), data: Vec::new() };
        for v in values {
            col.push_value(&Value::Bytes(v.as_bytes().to_vec())).unwrap();
        }
        col
    }

    #[test]
    fn test_filter_numeric_and_string() {
        let col = Column::UInt32(vec![1, 2, 3, 4, 5]);
        let filtered = col.filter(&[1, 0, 1, 0, 1]).unwrap();
        assert!(matches!(filtered, Column::UInt32(ref v) if v == &vec![1, 3, 5]));

        let col = string_column(&["a", "bb", "ccc", "dddd"]);
        let filtered = col.filter(&[0, 1, 1, 0]).unwrap();
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.get(0), Value::Bytes(b"bb".to_vec()));
        assert_eq!(filtered.get(1), Value::Bytes(b"ccc".to_vec()));
    }

    #[test]
    fn test_filter_size_mismatch() {
        let col = Column::UInt32(vec![1, 2, 3]);
        assert!(matches!(col.filter(&[1, 0]), Err(Error::SizeMismatch(_))));
    }

    #[test]
    fn test_permute_with_limit() {
        let col = Column::Int64(vec![10, 20, 30, 40]);
        let permuted = col.permute(&[3, 0, 2, 1], 2).unwrap();
        assert!(matches!(permuted, Column::Int64(ref v) if v == &vec![40, 10]));
    }

    #[test]
    fn test_replicate() {
        let col = string_column(&["x", "y", "z"]);
        let replicated = col.replicate(&[2, 2, 5]).unwrap();
        assert_eq!(replicated.len(), 5);
        assert_eq!(replicated.get(0), Value::Bytes(b"x".to_vec()));
        assert_eq!(replicated.get(1), Value::Bytes(b"x".to_vec()));
        assert_eq!(replicated.get(2), Value::Bytes(b"z".to_vec()));
    }

    #[test]
    fn test_get_data_at() {
        let col = Column::UInt32(vec![7, 0xdead_beef]);
        let bytes = col.get_data_at(1).unwrap();
        assert_eq!(bytes.len(), 4);
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        assert_eq!(u32::from_ne_bytes(arr), 0xdead_beef);

        let col = string_column(&["ab", ""]);
        assert_eq!(col.get_data_at(0).unwrap(), b"ab");
        assert_eq!(col.get_data_at(1).unwrap(), b"");

        let mut fixed = Column::new(&DataType::FixedString(3)).unwrap();
        fixed.push_value(&Value::Bytes(b"xy".to_vec())).unwrap();
        assert_eq!(fixed.get_data_at(0).unwrap(), b"xy\0");

        // Compound rows have no flat byte image.
        let mut arrays = Column::new(&DataType::Array(Box::new(DataType::UInt8))).unwrap();
        arrays.push_value(&Value::Array(vec![Value::UInt64(1)])).unwrap();
        assert!(matches!(arrays.get_data_at(0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_compare_at_nan_direction() {
        let col = Column::Float64(vec![1.0, f64::NAN]);
        assert_eq!(col.compare_at(0, &col, 1, 1), Ordering::Less);
        assert_eq!(col.compare_at(0, &col, 1, -1), Ordering::Greater);
        assert_eq!(col.compare_at(1, &col, 1, 1), Ordering::Equal);
    }

    #[test]
    fn test_extremes_skip_nan() {
        let col = Column::Float64(vec![f64::NAN, 3.0, -1.0, 2.0]);
        let (min, max) = col.extremes();
        assert_eq!(min, Value::Float64(-1.0));
        assert_eq!(max, Value::Float64(3.0));
    }

    #[test]
    fn test_const_materialize() {
        let col = Column::Const {
            data_type: DataType::UInt16,
            value: Value::UInt64(7),
            len: 3,
        };
        let full = col.materialize().unwrap();
        assert!(matches!(full, Column::UInt16(ref v) if v == &vec![7, 7, 7]));
    }

    #[test]
    fn test_array_roundtrip() {
        let mut col = Column::new(&DataType::Array(Box::new(DataType::UInt32))).unwrap();
        col.push_value(&Value::Array(vec![Value::UInt64(1), Value::UInt64(2)])).unwrap();
        col.push_value(&Value::Array(vec![])).unwrap();
        col.push_value(&Value::Array(vec![Value::UInt64(9)])).unwrap();

        let mut buf = Vec::new();
        col.serialize_rows(0, 3, &mut buf).unwrap();
        let back =
            Column::deserialize_rows(&DataType::Array(Box::new(DataType::UInt32)), 3, &mut Cursor::new(&buf))
                .unwrap();
        assert_eq!(back.get(0), Value::Array(vec![Value::UInt64(1), Value::UInt64(2)]));
        assert_eq!(back.get(1), Value::Array(vec![]));
        assert_eq!(back.get(2), Value::Array(vec![Value::UInt64(9)]));
    }

    #[test]
    fn test_array_partial_serialize_rebases_offsets() {
        let mut col = Column::new(&DataType::Array(Box::new(DataType::UInt32))).unwrap();
        col.push_value(&Value::Array(vec![Value::UInt64(1)])).unwrap();
        col.push_value(&Value::Array(vec![Value::UInt64(2), Value::UInt64(3)])).unwrap();

        let mut buf = Vec::new();
        col.serialize_rows(1, 1, &mut buf).unwrap();
        let back =
            Column::deserialize_rows(&DataType::Array(Box::new(DataType::UInt32)), 1, &mut Cursor::new(&buf))
                .unwrap();
        assert_eq!(back.get(0), Value::Array(vec![Value::UInt64(2), Value::UInt64(3)]));
    }

    #[test]
    fn test_string_serialize_roundtrip() {
        let col = string_column(&["", "hello", "worlds"]);
        let mut buf = Vec::new();
        col.serialize_rows(0, 3, &mut buf).unwrap();
        let back = Column::deserialize_rows(&DataType::String, 3, &mut Cursor::new(&buf)).unwrap();
        for i in 0..3 {
            assert_eq!(back.get(i), col.get(i));
        }
    }

    #[test]
    fn test_key_bits_roundtrip() {
        let col = Column::Int32(vec![-5, 0, 7]);
        let mut out = Column::new(&DataType::Int32).unwrap();
        for i in 0..3 {
            out.push_key_bits(col.key_bits(i).unwrap()).unwrap();
        }
        assert!(matches!(out, Column::Int32(ref v) if v == &vec![-5, 0, 7]));
    }

    #[test]
    fn test_push_from_and_cut() {
        let col = string_column(&["a", "bb", "ccc"]);
        let cut = col.cut(1, 2).unwrap();
        assert_eq!(cut.len(), 2);
        assert_eq!(cut.get(0), Value::Bytes(b"bb".to_vec()));

        let mut dst = col.clone_empty();
        dst.push_from(&col, 2).unwrap();
        assert_eq!(dst.get(0), Value::Bytes(b"ccc".to_vec()));
    }
}
