//! Aggregate functions over per-group byte states.
//!
//! A state is a fixed-size region of bytes inside an arena. The function
//! constructs it, folds rows or other states into it, serializes it for
//! shipping, finalizes it into a result column and destroys it. All
//! functions here keep plain-bytes states except `uniqExact`, whose state
//! holds a boxed hash set behind a stored pointer and therefore carries a
//! real destructor.

use std::collections::HashSet;
use std::hash::BuildHasherDefault;
use std::sync::Arc;

use crate::block::types::{split_top_level, strip_call, DataType, Value};
use crate::block::Column;
use crate::error::{Error, Result};
use crate::io::checksum::Hash128;
use crate::io::varint;

type DeterministicSet = HashSet<u64, BuildHasherDefault<ahash::AHasher>>;

pub trait AggregateFunction: Send + Sync {
    fn name(&self) -> &'static str;

    /// Self-describing form, e.g. "sum(UInt64)". Round-trips through
    /// [`create_from_description`] so states can travel over the wire.
    fn description(&self) -> String;

    fn result_type(&self) -> DataType;

    fn state_size(&self) -> usize;

    fn has_trivial_destructor(&self) -> bool {
        true
    }

    /// Initializes a zeroed state region. May fail; the caller rolls back
    /// already-created sibling states.
    fn create(&self, state: &mut [u8]) -> Result<()>;

    fn destroy(&self, _state: &mut [u8]) {}

    fn add(&self, state: &mut [u8], args: &[&Column], row: usize) -> Result<()>;

    /// Folds another state of the same function into this one.
    fn merge(&self, state: &mut [u8], other: &[u8]) -> Result<()>;

    /// Fast path for counting functions: account for `rows` rows at once.
    /// Returns false when the function has no such shortcut.
    fn add_delta(&self, _state: &mut [u8], _rows: u64) -> bool {
        false
    }

    fn serialize(&self, state: &[u8], out: &mut Vec<u8>) -> Result<()>;

    fn deserialize(&self, state: &mut [u8], input: &[u8]) -> Result<()>;

    fn insert_result(&self, state: &[u8], out: &mut Column) -> Result<()>;
}

fn read_u64(state: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&state[..8]);
    u64::from_le_bytes(bytes)
}

fn write_u64(state: &mut [u8], value: u64) {
    state[..8].copy_from_slice(&value.to_le_bytes());
}

/// Numeric accumulator family: which 8-byte representation a state uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NumericKind {
    Unsigned,
    Signed,
    Float,
}

impl NumericKind {
    fn of(data_type: &DataType) -> Result<NumericKind> {
        match data_type {
            DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Date
            | DataType::DateTime => Ok(NumericKind::Unsigned),
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
                Ok(NumericKind::Signed)
            }
            DataType::Float32 | DataType::Float64 => Ok(NumericKind::Float),
            other => Err(Error::InvalidArgument(format!(
                "numeric argument expected, got {other}"
            ))),
        }
    }

    fn result_type(&self) -> DataType {
        match self {
            NumericKind::Unsigned => DataType::UInt64,
            NumericKind::Signed => DataType::Int64,
            NumericKind::Float => DataType::Float64,
        }
    }

    fn value_bits(&self, value: &Value) -> Result<u64> {
        Ok(match self {
            NumericKind::Unsigned => value.as_u64()?,
            NumericKind::Signed => value.as_i64()? as u64,
            NumericKind::Float => value.as_f64()?.to_bits(),
        })
    }

    fn bits_to_value(&self, bits: u64) -> Value {
        match self {
            NumericKind::Unsigned => Value::UInt64(bits),
            NumericKind::Signed => Value::Int64(bits as i64),
            NumericKind::Float => Value::Float64(f64::from_bits(bits)),
        }
    }

    fn add_bits(&self, a: u64, b: u64) -> u64 {
        match self {
            NumericKind::Unsigned => a.wrapping_add(b),
            NumericKind::Signed => (a as i64).wrapping_add(b as i64) as u64,
            NumericKind::Float => (f64::from_bits(a) + f64::from_bits(b)).to_bits(),
        }
    }

    fn less_bits(&self, a: u64, b: u64) -> bool {
        match self {
            NumericKind::Unsigned => a < b,
            NumericKind::Signed => (a as i64) < (b as i64),
            NumericKind::Float => f64::from_bits(a).total_cmp(&f64::from_bits(b)).is_lt(),
        }
    }
}

/// count() - number of rows. State: u64.
pub struct Count;

impl AggregateFunction for Count {
    fn name(&self) -> &'static str {
        "count"
    }

    fn description(&self) -> String {
        "count()".into()
    }

    fn result_type(&self) -> DataType {
        DataType::UInt64
    }

    fn state_size(&self) -> usize {
        8
    }

    fn create(&self, state: &mut [u8]) -> Result<()> {
        write_u64(state, 0);
        Ok(())
    }

    fn add(&self, state: &mut [u8], _args: &[&Column], _row: usize) -> Result<()> {
        write_u64(state, read_u64(state) + 1);
        Ok(())
    }

    fn merge(&self, state: &mut [u8], other: &[u8]) -> Result<()> {
        write_u64(state, read_u64(state) + read_u64(other));
        Ok(())
    }

    fn add_delta(&self, state: &mut [u8], rows: u64) -> bool {
        write_u64(state, read_u64(state) + rows);
        true
    }

    fn serialize(&self, state: &[u8], out: &mut Vec<u8>) -> Result<()> {
        varint::write_varuint(out, read_u64(state))
    }

    fn deserialize(&self, state: &mut [u8], input: &[u8]) -> Result<()> {
        let mut cursor = std::io::Cursor::new(input);
        write_u64(state, varint::read_varuint(&mut cursor)?);
        Ok(())
    }

    fn insert_result(&self, state: &[u8], out: &mut Column) -> Result<()> {
        out.push_value(&Value::UInt64(read_u64(state)))
    }
}

/// sum(x) over a numeric column. State: one accumulator of the argument's
/// numeric kind; integers wrap on overflow.
pub struct Sum {
    arg_type: DataType,
    kind: NumericKind,
}

impl Sum {
    pub fn new(args: &[DataType]) -> Result<Self> {
        let [arg_type] = args else {
            return Err(Error::InvalidArgument(format!(
                "sum takes one argument, got {}",
                args.len()
            )));
        };
        Ok(Self { arg_type: arg_type.clone(), kind: NumericKind::of(arg_type)? })
    }
}

impl AggregateFunction for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn description(&self) -> String {
        format!("sum({})", self.arg_type.name())
    }

    fn result_type(&self) -> DataType {
        self.kind.result_type()
    }

    fn state_size(&self) -> usize {
        8
    }

    fn create(&self, state: &mut [u8]) -> Result<()> {
        // An all-zero accumulator is the zero of every numeric kind.
        write_u64(state, 0);
        Ok(())
    }

    fn add(&self, state: &mut [u8], args: &[&Column], row: usize) -> Result<()> {
        let bits = self.kind.value_bits(&args[0].get(row))?;
        write_u64(state, self.kind.add_bits(read_u64(state), bits));
        Ok(())
    }

    fn merge(&self, state: &mut [u8], other: &[u8]) -> Result<()> {
        write_u64(state, self.kind.add_bits(read_u64(state), read_u64(other)));
        Ok(())
    }

    fn serialize(&self, state: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&state[..8]);
        Ok(())
    }

    fn deserialize(&self, state: &mut [u8], input: &[u8]) -> Result<()> {
        if input.len() != 8 {
            return Err(Error::Corruption(format!(
                "sum state of {} bytes, expected 8",
                input.len()
            )));
        }
        state[..8].copy_from_slice(input);
        Ok(())
    }

    fn insert_result(&self, state: &[u8], out: &mut Column) -> Result<()> {
        out.push_value(&self.kind.bits_to_value(read_u64(state)))
    }
}

/// min(x) / max(x) over a numeric column. State: a seen flag and the best
/// value so far.
pub struct MinMax {
    arg_type: DataType,
    kind: NumericKind,
    is_min: bool,
}

impl MinMax {
    pub fn new(args: &[DataType], is_min: bool) -> Result<Self> {
        let name = if is_min { "min" } else { "max" };
        let [arg_type] = args else {
            return Err(Error::InvalidArgument(format!(
                "{name} takes one argument, got {}",
                args.len()
            )));
        };
        Ok(Self { arg_type: arg_type.clone(), kind: NumericKind::of(arg_type)?, is_min })
    }

    fn better(&self, candidate: u64, current: u64) -> bool {
        if self.is_min {
            self.kind.less_bits(candidate, current)
        } else {
            self.kind.less_bits(current, candidate)
        }
    }
}

impl AggregateFunction for MinMax {
    fn name(&self) -> &'static str {
        if self.is_min {
            "min"
        } else {
            "max"
        }
    }

    fn description(&self) -> String {
        format!("{}({})", self.name(), self.arg_type.name())
    }

    fn result_type(&self) -> DataType {
        self.kind.result_type()
    }

    fn state_size(&self) -> usize {
        9
    }

    fn create(&self, state: &mut [u8]) -> Result<()> {
        state[0] = 0;
        write_u64(&mut state[1..], 0);
        Ok(())
    }

    fn add(&self, state: &mut [u8], args: &[&Column], row: usize) -> Result<()> {
        let bits = self.kind.value_bits(&args[0].get(row))?;
        if state[0] == 0 || self.better(bits, read_u64(&state[1..])) {
            state[0] = 1;
            write_u64(&mut state[1..], bits);
        }
        Ok(())
    }

    fn merge(&self, state: &mut [u8], other: &[u8]) -> Result<()> {
        if other[0] == 0 {
            return Ok(());
        }
        let bits = read_u64(&other[1..]);
        if state[0] == 0 || self.better(bits, read_u64(&state[1..])) {
            state[0] = 1;
            write_u64(&mut state[1..], bits);
        }
        Ok(())
    }

    fn serialize(&self, state: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&state[..9]);
        Ok(())
    }

    fn deserialize(&self, state: &mut [u8], input: &[u8]) -> Result<()> {
        if input.len() != 9 {
            return Err(Error::Corruption(format!(
                "{} state of {} bytes, expected 9",
                self.name(),
                input.len()
            )));
        }
        state[..9].copy_from_slice(input);
        Ok(())
    }

    fn insert_result(&self, state: &[u8], out: &mut Column) -> Result<()> {
        let bits = if state[0] == 0 { 0 } else { read_u64(&state[1..]) };
        out.push_value(&self.kind.bits_to_value(bits))
    }
}

/// avg(x). State: sum accumulator of the argument's kind plus a row count;
/// finalizes to Float64.
pub struct Avg {
    arg_type: DataType,
    kind: NumericKind,
}

impl Avg {
    pub fn new(args: &[DataType]) -> Result<Self> {
        let [arg_type] = args else {
            return Err(Error::InvalidArgument(format!(
                "avg takes one argument, got {}",
                args.len()
            )));
        };
        Ok(Self { arg_type: arg_type.clone(), kind: NumericKind::of(arg_type)? })
    }
}

impl AggregateFunction for Avg {
    fn name(&self) -> &'static str {
        "avg"
    }

    fn description(&self) -> String {
        format!("avg({})", self.arg_type.name())
    }

    fn result_type(&self) -> DataType {
        DataType::Float64
    }

    fn state_size(&self) -> usize {
        16
    }

    fn create(&self, state: &mut [u8]) -> Result<()> {
        write_u64(state, 0);
        write_u64(&mut state[8..], 0);
        Ok(())
    }

    fn add(&self, state: &mut [u8], args: &[&Column], row: usize) -> Result<()> {
        let bits = self.kind.value_bits(&args[0].get(row))?;
        write_u64(state, self.kind.add_bits(read_u64(state), bits));
        let count = read_u64(&state[8..]);
        write_u64(&mut state[8..], count + 1);
        Ok(())
    }

    fn merge(&self, state: &mut [u8], other: &[u8]) -> Result<()> {
        write_u64(state, self.kind.add_bits(read_u64(state), read_u64(other)));
        let count = read_u64(&state[8..]) + read_u64(&other[8..]);
        write_u64(&mut state[8..], count);
        Ok(())
    }

    fn serialize(&self, state: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&state[..16]);
        Ok(())
    }

    fn deserialize(&self, state: &mut [u8], input: &[u8]) -> Result<()> {
        if input.len() != 16 {
            return Err(Error::Corruption(format!(
                "avg state of {} bytes, expected 16",
                input.len()
            )));
        }
        state[..16].copy_from_slice(input);
        Ok(())
    }

    fn insert_result(&self, state: &[u8], out: &mut Column) -> Result<()> {
        let count = read_u64(&state[8..]);
        let sum = match self.kind.bits_to_value(read_u64(state)) {
            Value::UInt64(v) => v as f64,
            Value::Int64(v) => v as f64,
            Value::Float64(v) => v,
            _ => 0.0,
        };
        let avg = if count == 0 { 0.0 } else { sum / count as f64 };
        out.push_value(&Value::Float64(avg))
    }
}

/// uniqExact(x, ...) - exact count of distinct argument tuples, tracked by
/// their 64-bit hashes. State: a pointer to a boxed hash set, so this is
/// the one function without a trivial destructor.
pub struct UniqExact {
    arg_types: Vec<DataType>,
}

impl UniqExact {
    pub fn new(args: &[DataType]) -> Result<Self> {
        if args.is_empty() {
            return Err(Error::InvalidArgument("uniqExact takes at least one argument".into()));
        }
        Ok(Self { arg_types: args.to_vec() })
    }

    /// The state bytes hold the address of a `Box<DeterministicSet>`.
    /// Invariant: between create() and destroy() the address is either a
    /// live box or zero (never constructed).
    fn set_mut(state: &mut [u8]) -> Option<&mut DeterministicSet> {
        let addr = read_u64(state) as usize;
        if addr == 0 {
            return None;
        }
        // Safety: the address was produced by Box::into_raw in create() and
        // is unique to this state; destroy() zeroes it before freeing.
        Some(unsafe { &mut *(addr as *mut DeterministicSet) })
    }

    fn set_ref(state: &[u8]) -> Option<&DeterministicSet> {
        let addr = read_u64(state) as usize;
        if addr == 0 {
            return None;
        }
        // Safety: see set_mut.
        Some(unsafe { &*(addr as *const DeterministicSet) })
    }

    fn hash_row(&self, args: &[&Column], row: usize) -> Result<u64> {
        let mut hash = Hash128::new();
        for arg in args {
            arg.update_hash_row(row, &mut hash)?;
        }
        Ok(hash.finish() as u64)
    }
}

impl AggregateFunction for UniqExact {
    fn name(&self) -> &'static str {
        "uniqExact"
    }

    fn description(&self) -> String {
        let args: Vec<String> = self.arg_types.iter().map(|t| t.name()).collect();
        format!("uniqExact({})", args.join(", "))
    }

    fn result_type(&self) -> DataType {
        DataType::UInt64
    }

    fn state_size(&self) -> usize {
        8
    }

    fn has_trivial_destructor(&self) -> bool {
        false
    }

    fn create(&self, state: &mut [u8]) -> Result<()> {
        let set: Box<DeterministicSet> = Box::default();
        write_u64(state, Box::into_raw(set) as usize as u64);
        Ok(())
    }

    fn destroy(&self, state: &mut [u8]) {
        let addr = read_u64(state) as usize;
        if addr != 0 {
            // Safety: create() stored a unique Box address here; zeroing
            // first keeps a second destroy() from double-freeing.
            write_u64(state, 0);
            drop(unsafe { Box::from_raw(addr as *mut DeterministicSet) });
        }
    }

    fn add(&self, state: &mut [u8], args: &[&Column], row: usize) -> Result<()> {
        let hash = self.hash_row(args, row)?;
        match Self::set_mut(state) {
            Some(set) => {
                set.insert(hash);
                Ok(())
            }
            None => Err(Error::Logical("uniqExact state used before create".into())),
        }
    }

    fn merge(&self, state: &mut [u8], other: &[u8]) -> Result<()> {
        let other_values: Vec<u64> = match Self::set_ref(other) {
            Some(set) => set.iter().copied().collect(),
            None => return Ok(()),
        };
        match Self::set_mut(state) {
            Some(set) => {
                set.extend(other_values);
                Ok(())
            }
            None => Err(Error::Logical("uniqExact state used before create".into())),
        }
    }

    fn serialize(&self, state: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let mut values: Vec<u64> = match Self::set_ref(state) {
            Some(set) => set.iter().copied().collect(),
            None => Vec::new(),
        };
        values.sort_unstable();
        varint::write_varuint(out, values.len() as u64)?;
        for value in values {
            out.extend_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    fn deserialize(&self, state: &mut [u8], input: &[u8]) -> Result<()> {
        let mut cursor = std::io::Cursor::new(input);
        let count = varint::read_varuint(&mut cursor)? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let mut bytes = [0u8; 8];
            std::io::Read::read_exact(&mut cursor, &mut bytes)?;
            values.push(u64::from_le_bytes(bytes));
        }
        match Self::set_mut(state) {
            Some(set) => {
                set.extend(values);
                Ok(())
            }
            None => Err(Error::Logical("uniqExact state used before create".into())),
        }
    }

    fn insert_result(&self, state: &[u8], out: &mut Column) -> Result<()> {
        let count = Self::set_ref(state).map_or(0, |set| set.len());
        out.push_value(&Value::UInt64(count as u64))
    }
}

/// Creates an aggregate function by name and argument types.
pub fn create_function(name: &str, args: &[DataType]) -> Result<Arc<dyn AggregateFunction>> {
    Ok(match name {
        "count" => Arc::new(Count),
        "sum" => Arc::new(Sum::new(args)?),
        "min" => Arc::new(MinMax::new(args, true)?),
        "max" => Arc::new(MinMax::new(args, false)?),
        "avg" => Arc::new(Avg::new(args)?),
        "uniqExact" => Arc::new(UniqExact::new(args)?),
        other => return Err(Error::InvalidArgument(format!("unknown aggregate function: {other}"))),
    })
}

/// Rebuilds a function from its [`AggregateFunction::description`].
pub fn create_from_description(desc: &str) -> Result<Arc<dyn AggregateFunction>> {
    let desc = desc.trim();
    let open = desc
        .find('(')
        .ok_or_else(|| Error::InvalidArgument(format!("bad aggregate description: {desc}")))?;
    let name = &desc[..open];
    let inner = strip_call(desc, name)
        .ok_or_else(|| Error::InvalidArgument(format!("bad aggregate description: {desc}")))?;
    let mut args = Vec::new();
    for piece in split_top_level(inner) {
        args.push(DataType::parse(piece)?);
    }
    create_function(name, &args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_state<F: FnOnce(&mut [u8], &dyn AggregateFunction)>(f: &dyn AggregateFunction, body: F) {
        let mut state = vec![0u8; f.state_size()];
        f.create(&mut state).unwrap();
        body(&mut state, f);
        f.destroy(&mut state);
    }

    fn result_value(f: &dyn AggregateFunction, state: &[u8]) -> Value {
        let mut col = Column::new(&f.result_type()).unwrap();
        f.insert_result(state, &mut col).unwrap();
        col.get(0)
    }

    #[test]
    fn test_count_add_and_delta() {
        run_state(&Count, |state, f| {
            let args: Vec<&Column> = vec![];
            f.add(state, &args, 0).unwrap();
            f.add(state, &args, 1).unwrap();
            assert!(f.add_delta(state, 40));
            assert_eq!(result_value(f, state), Value::UInt64(42));
        });
    }

    #[test]
    fn test_sum_kinds() {
        let col = Column::Int32(vec![5, -3, 10]);
        let f = Sum::new(&[DataType::Int32]).unwrap();
        run_state(&f, |state, f| {
            for i in 0..3 {
                f.add(state, &[&col], i).unwrap();
            }
            assert_eq!(result_value(f, state), Value::Int64(12));
        });

        let col = Column::Float64(vec![0.5, 1.5]);
        let f = Sum::new(&[DataType::Float64]).unwrap();
        run_state(&f, |state, f| {
            for i in 0..2 {
                f.add(state, &[&col], i).unwrap();
            }
            assert_eq!(result_value(f, state), Value::Float64(2.0));
        });
    }

    #[test]
    fn test_min_max_merge() {
        let col = Column::UInt64(vec![7, 3, 9]);
        let min = MinMax::new(&[DataType::UInt64], true).unwrap();
        let max = MinMax::new(&[DataType::UInt64], false).unwrap();

        let mut a = vec![0u8; min.state_size()];
        let mut b = vec![0u8; min.state_size()];
        min.create(&mut a).unwrap();
        min.create(&mut b).unwrap();
        min.add(&mut a, &[&col], 0).unwrap();
        min.add(&mut b, &[&col], 1).unwrap();
        min.merge(&mut a, &b).unwrap();
        assert_eq!(result_value(&min, &a), Value::UInt64(3));

        run_state(&max, |state, f| {
            for i in 0..3 {
                f.add(state, &[&col], i).unwrap();
            }
            assert_eq!(result_value(f, state), Value::UInt64(9));
        });
    }

    #[test]
    fn test_avg() {
        let col = Column::UInt8(vec![2, 4, 6, 8]);
        let f = Avg::new(&[DataType::UInt8]).unwrap();
        run_state(&f, |state, f| {
            for i in 0..4 {
                f.add(state, &[&col], i).unwrap();
            }
            assert_eq!(result_value(f, state), Value::Float64(5.0));
        });
    }

    #[test]
    fn test_uniq_exact_roundtrip() {
        let col = Column::UInt32(vec![1, 2, 2, 3, 1]);
        let f = UniqExact::new(&[DataType::UInt32]).unwrap();

        let mut state = vec![0u8; f.state_size()];
        f.create(&mut state).unwrap();
        for i in 0..5 {
            f.add(&mut state, &[&col], i).unwrap();
        }
        assert_eq!(result_value(&f, &state), Value::UInt64(3));

        // Ship the state and fold it into a fresh one.
        let mut payload = Vec::new();
        f.serialize(&state, &mut payload).unwrap();
        let mut other = vec![0u8; f.state_size()];
        f.create(&mut other).unwrap();
        f.deserialize(&mut other, &payload).unwrap();
        assert_eq!(result_value(&f, &other), Value::UInt64(3));

        f.destroy(&mut state);
        f.destroy(&mut other);
        // A second destroy is a no-op, not a double free.
        f.destroy(&mut state);
    }

    #[test]
    fn test_description_roundtrip() {
        let descriptions = ["count()", "sum(UInt64)", "min(Float32)", "avg(Int16)", "uniqExact(String, UInt8)"];
        for desc in descriptions {
            let f = create_from_description(desc).unwrap();
            assert_eq!(f.description(), desc);
        }
        assert!(create_from_description("nope(UInt8)").is_err());
    }

    #[test]
    fn test_wrong_arity_rejected() {
        assert!(Sum::new(&[]).is_err());
        assert!(Sum::new(&[DataType::UInt8, DataType::UInt8]).is_err());
        assert!(Sum::new(&[DataType::String]).is_err());
    }
}
