//! Shared ownership of aggregate states.
//!
//! A non-final aggregation result hands its states to the output columns:
//! every aggregate-state column holds an `Arc` of the holder that owns the
//! arena, and the last reference destroys the non-trivial states. This is
//! the reference-counted replacement for back-pointers into the arena.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use crate::aggregate::arena::{Arena, StatePtr};
use crate::aggregate::function::{create_from_description, AggregateFunction};
use crate::error::{Error, Result};
use crate::io::varint;

/// Owns an arena of state regions and destroys them exactly once.
pub struct StatesHolder {
    arena: Arena,
    groups: Vec<StatePtr>,
    functions: Vec<Arc<dyn AggregateFunction>>,
    offsets: Vec<usize>,
    total_size: usize,
}

impl StatesHolder {
    pub fn new(
        arena: Arena,
        groups: Vec<StatePtr>,
        functions: Vec<Arc<dyn AggregateFunction>>,
        offsets: Vec<usize>,
        total_size: usize,
    ) -> Self {
        Self { arena, groups, functions, offsets, total_size }
    }

    /// Bytes of one function's state inside a group region.
    pub fn state(&self, ptr: StatePtr, offset: usize, size: usize) -> &[u8] {
        &self.arena.slice(ptr, offset + size)[offset..]
    }
}

impl Drop for StatesHolder {
    fn drop(&mut self) {
        for i in 0..self.groups.len() {
            let ptr = self.groups[i];
            // Null means state construction failed mid-insert; skip.
            if ptr.is_null() {
                continue;
            }
            for (function, &offset) in self.functions.iter().zip(self.offsets.iter()) {
                if function.has_trivial_destructor() {
                    continue;
                }
                let size = function.state_size();
                let region = self.arena.slice_mut(ptr, self.total_size);
                function.destroy(&mut region[offset..offset + size]);
            }
        }
    }
}

/// Row address of a state: which holder, which region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateRef {
    pub holder: u32,
    pub ptr: StatePtr,
}

/// Column of in-progress aggregation states for one function. Rows
/// reference regions in one or more shared holders; appending a row from
/// another column just shares its holder.
#[derive(Clone)]
pub struct AggregateStateColumn {
    function: Arc<dyn AggregateFunction>,
    offset: usize,
    holders: Vec<Arc<StatesHolder>>,
    states: Vec<StateRef>,
}

impl AggregateStateColumn {
    pub fn new(
        function: Arc<dyn AggregateFunction>,
        offset: usize,
        holder: Arc<StatesHolder>,
        groups: Vec<StatePtr>,
    ) -> Self {
        let states = groups.into_iter().map(|ptr| StateRef { holder: 0, ptr }).collect();
        Self { function, offset, holders: vec![holder], states }
    }

    pub fn description(&self) -> String {
        self.function.description()
    }

    pub fn function(&self) -> &Arc<dyn AggregateFunction> {
        &self.function
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.states.len() * (std::mem::size_of::<StateRef>() + self.function.state_size())
    }

    /// The serialized-state bytes of one row.
    pub fn state_bytes(&self, row: usize) -> Result<&[u8]> {
        let state = self.states[row];
        if state.ptr.is_null() {
            return Err(Error::Logical("aggregate state read before construction".into()));
        }
        let holder = self
            .holders
            .get(state.holder as usize)
            .ok_or_else(|| Error::Logical("aggregate state references an unknown holder".into()))?;
        Ok(holder.state(state.ptr, self.offset, self.function.state_size()))
    }

    pub fn push_null(&mut self) {
        self.states.push(StateRef { holder: 0, ptr: StatePtr::NULL });
    }

    pub fn push_from(&mut self, other: &AggregateStateColumn, row: usize) -> Result<()> {
        if self.function.description() != other.function.description() {
            return Err(Error::InvalidArgument(format!(
                "cannot append a {} state to a {} column",
                other.function.description(),
                self.function.description()
            )));
        }
        let state = other.states[row];
        if state.ptr.is_null() {
            self.push_null();
            return Ok(());
        }
        let source = &other.holders[state.holder as usize];
        let holder = match self.holders.iter().position(|h| Arc::ptr_eq(h, source)) {
            Some(index) => index as u32,
            None => {
                self.holders.push(source.clone());
                (self.holders.len() - 1) as u32
            }
        };
        self.states.push(StateRef { holder, ptr: state.ptr });
        Ok(())
    }

    pub fn filter(&self, mask: &[u8]) -> AggregateStateColumn {
        let states = self
            .states
            .iter()
            .zip(mask.iter())
            .filter_map(|(s, m)| (*m != 0).then_some(*s))
            .collect();
        AggregateStateColumn {
            function: self.function.clone(),
            offset: self.offset,
            holders: self.holders.clone(),
            states,
        }
    }

    pub fn permute(&self, perm: &[usize], limit: usize) -> AggregateStateColumn {
        let limit = if limit == 0 { perm.len() } else { limit.min(perm.len()) };
        AggregateStateColumn {
            function: self.function.clone(),
            offset: self.offset,
            holders: self.holders.clone(),
            states: perm[..limit].iter().map(|&i| self.states[i]).collect(),
        }
    }

    pub fn clone_empty(&self) -> AggregateStateColumn {
        AggregateStateColumn {
            function: self.function.clone(),
            offset: self.offset,
            holders: Vec::new(),
            states: Vec::new(),
        }
    }

    /// Length-prefixed writeout of each row's state.
    pub fn serialize_rows<W: Write>(&self, start: usize, len: usize, w: &mut W) -> Result<()> {
        for row in start..start + len {
            let mut payload = Vec::new();
            self.function.serialize(self.state_bytes(row)?, &mut payload)?;
            varint::write_bytes(w, &payload)?;
        }
        Ok(())
    }

    /// Reads `rows` serialized states into a fresh holder.
    pub fn deserialize_rows<R: std::io::Read>(
        description: &str,
        rows: usize,
        r: &mut R,
    ) -> Result<AggregateStateColumn> {
        let function = create_from_description(description)?;
        let size = function.state_size();

        let mut arena = Arena::new();
        let mut groups: Vec<StatePtr> = Vec::with_capacity(rows);
        let outcome = (|| -> Result<()> {
            for _ in 0..rows {
                let ptr = arena.alloc(size);
                function.create(arena.slice_mut(ptr, size))?;
                groups.push(ptr);
                let payload = varint::read_bytes(r)?;
                function.deserialize(arena.slice_mut(ptr, size), &payload)?;
            }
            Ok(())
        })();
        if let Err(e) = outcome {
            for ptr in &groups {
                function.destroy(arena.slice_mut(*ptr, size));
            }
            return Err(e);
        }

        let holder = Arc::new(StatesHolder::new(
            arena,
            groups.clone(),
            vec![function.clone()],
            vec![0],
            size,
        ));
        Ok(AggregateStateColumn::new(function, 0, holder, groups))
    }
}

impl fmt::Debug for AggregateStateColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateStateColumn")
            .field("function", &self.function.description())
            .field("len", &self.states.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Column, Value};
    use std::io::Cursor;

    fn sum_column(values: &[u64]) -> AggregateStateColumn {
        let function = create_from_description("sum(UInt64)").unwrap();
        let size = function.state_size();
        let mut arena = Arena::new();
        let mut groups = Vec::new();
        let col = Column::UInt64(values.to_vec());
        for i in 0..values.len() {
            let ptr = arena.alloc(size);
            function.create(arena.slice_mut(ptr, size)).unwrap();
            function.add(arena.slice_mut(ptr, size), &[&col], i).unwrap();
            groups.push(ptr);
        }
        let holder = Arc::new(StatesHolder::new(
            arena,
            groups.clone(),
            vec![function.clone()],
            vec![0],
            size,
        ));
        AggregateStateColumn::new(function, 0, holder, groups)
    }

    fn finalize(col: &AggregateStateColumn) -> Vec<Value> {
        let mut out = Column::new(&col.function().result_type()).unwrap();
        for i in 0..col.len() {
            col.function().insert_result(col.state_bytes(i).unwrap(), &mut out).unwrap();
        }
        (0..out.len()).map(|i| out.get(i)).collect()
    }

    #[test]
    fn test_serialize_roundtrip() {
        let col = sum_column(&[5, 10, 15]);
        let mut buf = Vec::new();
        col.serialize_rows(0, 3, &mut buf).unwrap();

        let back =
            AggregateStateColumn::deserialize_rows("sum(UInt64)", 3, &mut Cursor::new(&buf)).unwrap();
        assert_eq!(
            finalize(&back),
            vec![Value::UInt64(5), Value::UInt64(10), Value::UInt64(15)]
        );
    }

    #[test]
    fn test_push_from_shares_holder() {
        let src = sum_column(&[1, 2, 3]);
        let mut dst = src.clone_empty();
        dst.push_from(&src, 2).unwrap();
        dst.push_from(&src, 0).unwrap();
        assert_eq!(finalize(&dst), vec![Value::UInt64(3), Value::UInt64(1)]);
        // Sharing, not copying: one holder serves both columns.
        assert_eq!(dst.holders.len(), 1);
    }

    #[test]
    fn test_filter_and_permute() {
        let col = sum_column(&[1, 2, 3, 4]);
        let filtered = col.filter(&[0, 1, 0, 1]);
        assert_eq!(finalize(&filtered), vec![Value::UInt64(2), Value::UInt64(4)]);

        let permuted = col.permute(&[3, 1], 0);
        assert_eq!(finalize(&permuted), vec![Value::UInt64(4), Value::UInt64(2)]);
    }

    #[test]
    fn test_non_trivial_states_survive_sharing() {
        // uniqExact states hold heap sets; dropping one sharer must not
        // free states still visible through the other.
        let function = create_from_description("uniqExact(UInt32)").unwrap();
        let size = function.state_size();
        let mut arena = Arena::new();
        let col = Column::UInt32(vec![1, 2, 2, 7]);
        let ptr = arena.alloc(size);
        function.create(arena.slice_mut(ptr, size)).unwrap();
        for i in 0..4 {
            function.add(arena.slice_mut(ptr, size), &[&col], i).unwrap();
        }
        let holder = Arc::new(StatesHolder::new(
            arena,
            vec![ptr],
            vec![function.clone()],
            vec![0],
            size,
        ));
        let first = AggregateStateColumn::new(function, 0, holder, vec![ptr]);

        let mut second = first.clone_empty();
        second.push_from(&first, 0).unwrap();
        drop(first);

        assert_eq!(finalize(&second), vec![Value::UInt64(3)]);
    }
}
