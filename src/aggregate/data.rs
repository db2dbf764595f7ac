//! Aggregation method variants and their hash tables.
//!
//! The method is chosen once, from the key columns of the first block, and
//! owns a hash table from its native key representation to the group's
//! state region. Iteration order is deterministic: the maps use a
//! fixed-key hasher, so a fixed method and insert order reproduce the same
//! output order.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::Arc;

use crate::aggregate::arena::{Arena, StatePtr};
use crate::aggregate::function::AggregateFunction;
use crate::block::{Column, Value};
use crate::error::{Error, Result};
use crate::io::checksum::Hash128;

pub type DeterministicState = BuildHasherDefault<ahash::AHasher>;

/// Which key strategy a result was aggregated with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodKind {
    WithoutKey,
    Key64,
    Keys128,
    KeyString,
    KeyFixedString,
    Hashed,
}

impl MethodKind {
    pub fn name(&self) -> &'static str {
        match self {
            MethodKind::WithoutKey => "WITHOUT_KEY",
            MethodKind::Key64 => "KEY_64",
            MethodKind::Keys128 => "KEYS_128",
            MethodKind::KeyString => "KEY_STRING",
            MethodKind::KeyFixedString => "KEY_FIXED_STRING",
            MethodKind::Hashed => "HASHED",
        }
    }
}

/// The hash table of one aggregation, keyed by the method's native key.
/// HASHED keeps the original key tuple next to the state pointer so key
/// columns can be re-emitted; two tuples with one 128-bit hash are treated
/// as equal.
pub enum Method {
    WithoutKey,
    Key64(HashMap<u64, StatePtr, DeterministicState>),
    Keys128(HashMap<u128, StatePtr, DeterministicState>),
    KeyString(HashMap<Vec<u8>, StatePtr, DeterministicState>),
    KeyFixedString(HashMap<Vec<u8>, StatePtr, DeterministicState>),
    Hashed(HashMap<u128, (Vec<Value>, StatePtr), DeterministicState>),
}

impl Method {
    pub fn new(kind: MethodKind) -> Method {
        match kind {
            MethodKind::WithoutKey => Method::WithoutKey,
            MethodKind::Key64 => Method::Key64(HashMap::default()),
            MethodKind::Keys128 => Method::Keys128(HashMap::default()),
            MethodKind::KeyString => Method::KeyString(HashMap::default()),
            MethodKind::KeyFixedString => Method::KeyFixedString(HashMap::default()),
            MethodKind::Hashed => Method::Hashed(HashMap::default()),
        }
    }

    pub fn kind(&self) -> MethodKind {
        match self {
            Method::WithoutKey => MethodKind::WithoutKey,
            Method::Key64(_) => MethodKind::Key64,
            Method::Keys128(_) => MethodKind::Keys128,
            Method::KeyString(_) => MethodKind::KeyString,
            Method::KeyFixedString(_) => MethodKind::KeyFixedString,
            Method::Hashed(_) => MethodKind::Hashed,
        }
    }

    /// Number of groups in the table.
    pub fn len(&self) -> usize {
        match self {
            Method::WithoutKey => 0,
            Method::Key64(map) => map.len(),
            Method::Keys128(map) => map.len(),
            Method::KeyString(map) => map.len(),
            Method::KeyFixedString(map) => map.len(),
            Method::Hashed(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// State pointers of every group, in iteration order.
    pub fn group_ptrs(&self) -> Vec<StatePtr> {
        match self {
            Method::WithoutKey => Vec::new(),
            Method::Key64(map) => map.values().copied().collect(),
            Method::Keys128(map) => map.values().copied().collect(),
            Method::KeyString(map) => map.values().copied().collect(),
            Method::KeyFixedString(map) => map.values().copied().collect(),
            Method::Hashed(map) => map.values().map(|(_, p)| *p).collect(),
        }
    }
}

/// Selects the method for a set of key columns, filling `key_sizes` for
/// the packed variant.
pub fn choose_method(key_columns: &[&Column], key_sizes: &mut Vec<usize>) -> MethodKind {
    let mut keys_fit_128_bits = true;
    let mut keys_bytes = 0usize;
    key_sizes.clear();
    for column in key_columns {
        match column.data_type().fixed_size() {
            Some(size) => {
                key_sizes.push(size);
                keys_bytes += size;
            }
            None => {
                keys_fit_128_bits = false;
                break;
            }
        }
    }
    if keys_bytes > 16 {
        keys_fit_128_bits = false;
    }

    if key_columns.is_empty() {
        return MethodKind::WithoutKey;
    }
    if key_columns.len() == 1 && key_columns[0].data_type().is_numeric() {
        return MethodKind::Key64;
    }
    if keys_fit_128_bits {
        return MethodKind::Keys128;
    }
    if key_columns.len() == 1 {
        if let Column::String { .. } = key_columns[0] {
            return MethodKind::KeyString;
        }
        if let Column::FixedString { .. } = key_columns[0] {
            return MethodKind::KeyFixedString;
        }
    }
    MethodKind::Hashed
}

/// Packs fixed-width keys into one 128-bit integer, laid out back to back.
pub fn pack128(key_columns: &[&Column], row: usize, key_sizes: &[usize]) -> Result<u128> {
    let mut bytes = Vec::with_capacity(16);
    for (column, &size) in key_columns.iter().zip(key_sizes.iter()) {
        let before = bytes.len();
        column.append_raw(row, &mut bytes)?;
        if bytes.len() - before != size {
            return Err(Error::Logical(format!(
                "fixed key of {} bytes, expected {size}",
                bytes.len() - before
            )));
        }
    }
    let mut buf = [0u8; 16];
    buf[..bytes.len()].copy_from_slice(&bytes);
    Ok(u128::from_le_bytes(buf))
}

/// 128-bit hash of the whole key tuple, the HASHED method's key.
pub fn hash128_key(key_columns: &[&Column], row: usize) -> Result<u128> {
    let mut hash = Hash128::new();
    for column in key_columns {
        column.update_hash_row(row, &mut hash)?;
    }
    Ok(hash.finish())
}

/// One aggregation result: the method table, the arena holding the state
/// regions, and the optional keyless/overflow sentinel state.
pub struct AggregatedData {
    pub method: Option<Method>,
    pub arena: Arena,
    /// The WITHOUT_KEY state, doubling as the overflow row's sentinel
    /// group when `overflow_row` is set.
    pub without_key: Option<StatePtr>,
    pub key_sizes: Vec<usize>,
    /// Set once groups were handed to result columns; suppresses the
    /// destructor walk.
    pub owns_states: bool,
    pub no_more_keys: bool,

    functions: Vec<Arc<dyn AggregateFunction>>,
    offsets: Vec<usize>,
    total_size: usize,
    all_trivial: bool,
    bound: bool,
}

impl AggregatedData {
    pub fn new() -> Self {
        Self {
            method: None,
            arena: Arena::new(),
            without_key: None,
            key_sizes: Vec::new(),
            owns_states: true,
            no_more_keys: false,
            functions: Vec::new(),
            offsets: Vec::new(),
            total_size: 0,
            all_trivial: true,
            bound: false,
        }
    }

    /// Attaches the destruction layout. Called by the aggregator before
    /// the first state is created.
    pub fn bind(
        &mut self,
        functions: Vec<Arc<dyn AggregateFunction>>,
        offsets: Vec<usize>,
        total_size: usize,
        all_trivial: bool,
    ) {
        if !self.bound {
            self.functions = functions;
            self.offsets = offsets;
            self.total_size = total_size;
            self.all_trivial = all_trivial;
            self.bound = true;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.method.is_none() && self.without_key.is_none()
    }

    /// Number of result rows: groups plus the sentinel row if present.
    pub fn size(&self) -> usize {
        self.method.as_ref().map_or(0, |m| m.len()) + self.without_key.map_or(0, |_| 1)
    }

    pub fn kind(&self) -> Option<MethodKind> {
        self.method.as_ref().map(|m| m.kind())
    }

    fn destroy_region(
        arena: &mut Arena,
        functions: &[Arc<dyn AggregateFunction>],
        offsets: &[usize],
        total_size: usize,
        ptr: StatePtr,
    ) {
        if ptr.is_null() {
            return;
        }
        for (function, &offset) in functions.iter().zip(offsets.iter()) {
            if function.has_trivial_destructor() {
                continue;
            }
            let size = function.state_size();
            let region = arena.slice_mut(ptr, total_size);
            function.destroy(&mut region[offset..offset + size]);
        }
    }

    /// Destroys every group's states. Safe to call once; the destructor
    /// calls it unless ownership moved to result columns.
    pub fn destroy_states(&mut self) {
        if !self.owns_states || self.all_trivial {
            self.owns_states = false;
            return;
        }
        let ptrs = self.method.as_ref().map(|m| m.group_ptrs()).unwrap_or_default();
        for ptr in ptrs {
            Self::destroy_region(&mut self.arena, &self.functions, &self.offsets, self.total_size, ptr);
        }
        if let Some(ptr) = self.without_key.take() {
            Self::destroy_region(&mut self.arena, &self.functions, &self.offsets, self.total_size, ptr);
        }
        self.owns_states = false;
    }
}

impl Default for AggregatedData {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AggregatedData {
    fn drop(&mut self) {
        self.destroy_states();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::DataType;

    #[test]
    fn test_choose_method() {
        let mut sizes = Vec::new();

        assert_eq!(choose_method(&[], &mut sizes), MethodKind::WithoutKey);

        let num = Column::UInt32(vec![]);
        assert_eq!(choose_method(&[&num], &mut sizes), MethodKind::Key64);

        let date = Column::Date(vec![]);
        assert_eq!(choose_method(&[&date, &num], &mut sizes), MethodKind::Keys128);
        assert_eq!(sizes, vec![2, 4]);

        let s = Column::new(&DataType::String).unwrap();
        assert_eq!(choose_method(&[&s], &mut sizes), MethodKind::KeyString);

        let fs = Column::new(&DataType::FixedString(8)).unwrap();
        assert_eq!(choose_method(&[&fs], &mut sizes), MethodKind::KeyFixedString);

        // A string next to a number cannot pack: fall back to hashing.
        assert_eq!(choose_method(&[&num, &s], &mut sizes), MethodKind::Hashed);

        // Wide fixed keys exceed 128 bits.
        let wide = Column::new(&DataType::FixedString(20)).unwrap();
        let eight = Column::UInt64(vec![]);
        assert_eq!(choose_method(&[&wide, &eight], &mut sizes), MethodKind::Hashed);
    }

    #[test]
    fn test_pack128_layout() {
        let a = Column::UInt16(vec![0x1234]);
        let b = Column::UInt8(vec![0x56]);
        let packed = pack128(&[&a, &b], 0, &[2, 1]).unwrap();
        assert_eq!(packed, u128::from_le_bytes([0x34, 0x12, 0x56, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]));
    }

    #[test]
    fn test_hashed_key_distinguishes_boundaries() {
        let mut a = Column::new(&DataType::String).unwrap();
        let mut b = Column::new(&DataType::String).unwrap();
        a.push_value(&Value::Bytes(b"ab".to_vec())).unwrap();
        b.push_value(&Value::Bytes(b"a".to_vec())).unwrap();
        let mut a2 = Column::new(&DataType::String).unwrap();
        let mut b2 = Column::new(&DataType::String).unwrap();
        a2.push_value(&Value::Bytes(b"a".to_vec())).unwrap();
        b2.push_value(&Value::Bytes(b"b".to_vec())).unwrap();
        // ("ab", "") style splits must not collide thanks to terminators.
        assert_ne!(
            hash128_key(&[&a, &b], 0).unwrap(),
            hash128_key(&[&a2, &b2], 0).unwrap()
        );
    }
}
