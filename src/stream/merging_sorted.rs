//! K-way merging of sorted block streams.
//!
//! `MergingSortedStream` merges N inputs already sorted by the same
//! description into one sorted stream. On top of it sit the MergeTree
//! merge modes: collapsing (sign cancellation), summing and aggregating,
//! each folding runs of rows with an identical primary key.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::aggregate::arena::{Arena, StatePtr};
use crate::aggregate::function::AggregateFunction;
use crate::aggregate::state::{AggregateStateColumn, StatesHolder};
use crate::block::{Block, Column, Value};
use crate::error::{Error, Result};
use crate::stream::sort::SortDescription;
use crate::stream::{BlockStream, CancelFlag};

struct Cursor {
    block: Block,
    pos: usize,
    /// Key column positions with descending flags, resolved per block.
    keys: Vec<(usize, bool)>,
}

/// Merges sorted inputs into one sorted stream of `block_size`-row blocks.
/// Ties go to the lower input index, which keeps the merge stable.
pub struct MergingSortedStream {
    inputs: Vec<Box<dyn BlockStream>>,
    description: SortDescription,
    block_size: usize,
    cursors: Vec<Option<Cursor>>,
    started: bool,
    done: bool,
    template: Option<Block>,
    cancelled: CancelFlag,
}

impl MergingSortedStream {
    pub fn new(inputs: Vec<Box<dyn BlockStream>>, description: SortDescription, block_size: usize) -> Self {
        let cursors = (0..inputs.len()).map(|_| None).collect();
        Self {
            inputs,
            description,
            block_size: block_size.max(1),
            cursors,
            started: false,
            done: false,
            template: None,
            cancelled: CancelFlag::new(),
        }
    }

    fn resolve_keys(&self, block: &Block) -> Result<Vec<(usize, bool)>> {
        let mut keys = Vec::with_capacity(self.description.len());
        for d in &self.description {
            keys.push((block.position_by_name(&d.column)?, d.descending));
        }
        Ok(keys)
    }

    fn refill(&mut self, index: usize) -> Result<()> {
        let block = self.inputs[index].read()?;
        if block.is_empty() {
            self.cursors[index] = None;
            return Ok(());
        }
        let block = block.materialize()?;
        let keys = self.resolve_keys(&block)?;
        if self.template.is_none() {
            self.template = Some(block.clone_empty());
        }
        self.cursors[index] = Some(Cursor { block, pos: 0, keys });
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        for i in 0..self.inputs.len() {
            self.refill(i)?;
        }
        self.started = true;
        Ok(())
    }

    fn compare_cursors(&self, a: &Cursor, b: &Cursor) -> Ordering {
        for (&(pa, desc), &(pb, _)) in a.keys.iter().zip(b.keys.iter()) {
            let ca = &a.block.at(pa).column;
            let cb = &b.block.at(pb).column;
            let nan_direction = if desc { -1 } else { 1 };
            let ord = ca.compare_at(a.pos, cb, b.pos, nan_direction);
            let ord = if desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// The input index holding the smallest current row, if any.
    fn min_cursor(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, cursor) in self.cursors.iter().enumerate() {
            let Some(cursor) = cursor else { continue };
            match best {
                None => best = Some(i),
                Some(b) => {
                    let current = match &self.cursors[b] {
                        Some(c) => c,
                        None => continue,
                    };
                    if self.compare_cursors(cursor, current) == Ordering::Less {
                        best = Some(i);
                    }
                }
            }
        }
        best
    }
}

impl BlockStream for MergingSortedStream {
    fn name(&self) -> &'static str {
        "MergingSorted"
    }

    fn read(&mut self) -> Result<Block> {
        if self.done || self.cancelled.get() {
            return Ok(Block::new());
        }
        if !self.started {
            self.start()?;
        }
        let mut out = match &self.template {
            Some(t) => t.clone_empty(),
            None => {
                self.done = true;
                return Ok(Block::new());
            }
        };
        while out.rows() < self.block_size {
            let Some(index) = self.min_cursor() else {
                self.done = true;
                break;
            };
            {
                let cursor = match &self.cursors[index] {
                    Some(c) => c,
                    None => return Err(Error::Logical("merge cursor vanished".into())),
                };
                out.append_rows(&cursor.block, cursor.pos, 1)?;
            }
            let exhausted = {
                let cursor = match &mut self.cursors[index] {
                    Some(c) => c,
                    None => return Err(Error::Logical("merge cursor vanished".into())),
                };
                cursor.pos += 1;
                cursor.pos == cursor.block.rows()
            };
            if exhausted {
                self.refill(index)?;
            }
        }
        if out.rows() == 0 {
            self.done = true;
            return Ok(Block::new());
        }
        Ok(out)
    }

    fn read_prefix(&mut self) -> Result<()> {
        for input in &mut self.inputs {
            input.read_prefix()?;
        }
        Ok(())
    }

    fn read_suffix(&mut self) -> Result<()> {
        for input in &mut self.inputs {
            input.read_suffix()?;
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.set();
        for input in &self.inputs {
            input.cancel();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// The sort key of one row, extracted as owned values so groups can span
/// block boundaries.
fn key_of(block: &Block, keys: &[usize], row: usize) -> Vec<Value> {
    keys.iter().map(|&p| block.at(p).column.get(row)).collect()
}

fn key_positions(block: &Block, description: &SortDescription) -> Result<Vec<usize>> {
    description
        .iter()
        .map(|d| block.position_by_name(&d.column))
        .collect()
}

/// Collapsing merge: rows with the same primary key and opposite values of
/// the sign column cancel out. Of an unbalanced group, the surplus row
/// survives: the last positive or the first negative.
pub struct CollapsingMergedStream {
    inner: MergingSortedStream,
    description: SortDescription,
    sign_column: String,
    block_size: usize,
    group_key: Option<Vec<Value>>,
    first_negative: Option<Block>,
    last_positive: Option<Block>,
    positives: usize,
    negatives: usize,
    done: bool,
    cancelled: CancelFlag,
}

impl CollapsingMergedStream {
    pub fn new(
        inputs: Vec<Box<dyn BlockStream>>,
        description: SortDescription,
        sign_column: impl Into<String>,
        block_size: usize,
    ) -> Self {
        let inner = MergingSortedStream::new(inputs, description.clone(), block_size);
        Self {
            inner,
            description,
            sign_column: sign_column.into(),
            block_size: block_size.max(1),
            group_key: None,
            first_negative: None,
            last_positive: None,
            positives: 0,
            negatives: 0,
            done: false,
            cancelled: CancelFlag::new(),
        }
    }

    fn flush_group(&mut self, out: &mut Block) -> Result<()> {
        if self.group_key.is_none() {
            return Ok(());
        }
        if self.positives == self.negatives {
            // Fully cancelled.
        } else if self.positives == self.negatives + 1 {
            if let Some(row) = &self.last_positive {
                out.append_rows(row, 0, 1)?;
            }
        } else if self.negatives == self.positives + 1 {
            if let Some(row) = &self.first_negative {
                out.append_rows(row, 0, 1)?;
            }
        } else {
            tracing::warn!(
                positives = self.positives,
                negatives = self.negatives,
                "incorrect data: imbalanced signs for one primary key, keeping the surplus row"
            );
            let row = if self.positives > self.negatives {
                &self.last_positive
            } else {
                &self.first_negative
            };
            if let Some(row) = row {
                out.append_rows(row, 0, 1)?;
            }
        }
        self.group_key = None;
        self.first_negative = None;
        self.last_positive = None;
        self.positives = 0;
        self.negatives = 0;
        Ok(())
    }
}

impl BlockStream for CollapsingMergedStream {
    fn name(&self) -> &'static str {
        "CollapsingMerged"
    }

    fn read(&mut self) -> Result<Block> {
        if self.done || self.cancelled.get() {
            return Ok(Block::new());
        }
        let mut out: Option<Block> = None;
        loop {
            let block = self.inner.read()?;
            if block.is_empty() {
                let mut tail = match out.take() {
                    Some(b) => b,
                    None => {
                        // Need a template even when everything cancelled.
                        match &self.inner.template {
                            Some(t) => t.clone_empty(),
                            None => {
                                self.done = true;
                                return Ok(Block::new());
                            }
                        }
                    }
                };
                self.flush_group(&mut tail)?;
                self.done = true;
                if tail.rows() == 0 {
                    return Ok(Block::new());
                }
                return Ok(tail);
            }

            let keys = key_positions(&block, &self.description)?;
            let sign_position = block.position_by_name(&self.sign_column)?;
            let mut builder = match out.take() {
                Some(b) => b,
                None => block.clone_empty(),
            };
            for row in 0..block.rows() {
                let key = key_of(&block, &keys, row);
                if self.group_key.as_ref() != Some(&key) {
                    self.flush_group(&mut builder)?;
                    self.group_key = Some(key);
                }
                let sign = block.at(sign_position).column.get(row).as_i64()?;
                if sign > 0 {
                    self.positives += 1;
                    self.last_positive = Some(block.cut(row, 1)?);
                } else {
                    self.negatives += 1;
                    if self.first_negative.is_none() {
                        self.first_negative = Some(block.cut(row, 1)?);
                    }
                }
            }
            if builder.rows() >= self.block_size {
                return Ok(builder);
            }
            out = Some(builder);
        }
    }

    fn read_prefix(&mut self) -> Result<()> {
        self.inner.read_prefix()
    }

    fn read_suffix(&mut self) -> Result<()> {
        self.inner.read_suffix()
    }

    fn cancel(&self) {
        self.cancelled.set();
        self.inner.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Summing merge: runs of rows with one primary key collapse into a single
/// row whose non-key numeric columns are summed.
pub struct SummingMergedStream {
    inner: MergingSortedStream,
    description: SortDescription,
    block_size: usize,
    group_key: Option<Vec<Value>>,
    /// Accumulated row: one value per column.
    current: Vec<Value>,
    done: bool,
    cancelled: CancelFlag,
}

impl SummingMergedStream {
    pub fn new(inputs: Vec<Box<dyn BlockStream>>, description: SortDescription, block_size: usize) -> Self {
        let inner = MergingSortedStream::new(inputs, description.clone(), block_size);
        Self {
            inner,
            description,
            block_size: block_size.max(1),
            group_key: None,
            current: Vec::new(),
            done: false,
            cancelled: CancelFlag::new(),
        }
    }

    fn value_add(a: &Value, b: &Value) -> Value {
        match (a, b) {
            (Value::UInt64(x), Value::UInt64(y)) => Value::UInt64(x.wrapping_add(*y)),
            (Value::Int64(x), Value::Int64(y)) => Value::Int64(x.wrapping_add(*y)),
            (Value::Float64(x), Value::Float64(y)) => Value::Float64(x + y),
            _ => a.clone(),
        }
    }

    fn flush_group(&mut self, out: &mut Block) -> Result<()> {
        if self.group_key.is_none() {
            return Ok(());
        }
        for (position, value) in self.current.iter().enumerate() {
            out.at_mut(position).column.push_value(value)?;
        }
        self.group_key = None;
        self.current.clear();
        Ok(())
    }
}

impl BlockStream for SummingMergedStream {
    fn name(&self) -> &'static str {
        "SummingMerged"
    }

    fn read(&mut self) -> Result<Block> {
        if self.done || self.cancelled.get() {
            return Ok(Block::new());
        }
        let mut out: Option<Block> = None;
        loop {
            let block = self.inner.read()?;
            if block.is_empty() {
                let mut tail = match out.take() {
                    Some(b) => b,
                    None => match &self.inner.template {
                        Some(t) => t.clone_empty(),
                        None => {
                            self.done = true;
                            return Ok(Block::new());
                        }
                    },
                };
                self.flush_group(&mut tail)?;
                self.done = true;
                if tail.rows() == 0 {
                    return Ok(Block::new());
                }
                return Ok(tail);
            }

            let keys = key_positions(&block, &self.description)?;
            let summable: Vec<bool> = block
                .iter()
                .enumerate()
                .map(|(i, c)| !keys.contains(&i) && c.data_type.is_numeric())
                .collect();
            let mut builder = match out.take() {
                Some(b) => b,
                None => block.clone_empty(),
            };
            for row in 0..block.rows() {
                let key = key_of(&block, &keys, row);
                if self.group_key.as_ref() != Some(&key) {
                    self.flush_group(&mut builder)?;
                    self.group_key = Some(key);
                    self.current = (0..block.columns()).map(|c| block.at(c).column.get(row)).collect();
                } else {
                    for (position, value) in self.current.iter_mut().enumerate() {
                        if summable[position] {
                            *value = Self::value_add(value, &block.at(position).column.get(row));
                        }
                    }
                }
            }
            if builder.rows() >= self.block_size {
                return Ok(builder);
            }
            out = Some(builder);
        }
    }

    fn read_prefix(&mut self) -> Result<()> {
        self.inner.read_prefix()
    }

    fn read_suffix(&mut self) -> Result<()> {
        self.inner.read_suffix()
    }

    fn cancel(&self) {
        self.cancelled.set();
        self.inner.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Aggregating merge: runs of rows with one primary key collapse, merging
/// the aggregate-state columns through their function's merge operator.
/// Other non-key columns keep the first row's values.
pub struct AggregatingMergedStream {
    inner: MergingSortedStream,
    description: SortDescription,
    block_size: usize,
    /// Aggregate column positions and their functions, resolved from the
    /// first merged block.
    layout: Option<(Vec<usize>, Vec<Arc<dyn AggregateFunction>>)>,
    group_key: Option<Vec<Value>>,
    /// First row of the open group; supplies key and plain columns.
    group_row: Option<Block>,
    /// In-progress merged state per aggregate column. Lives outside the
    /// arenas so an emitted block never contains a half-merged group.
    group_states: Vec<Vec<u8>>,
    /// One arena/groups pair per aggregate column for the block being built.
    block_arenas: Vec<Arena>,
    block_groups: Vec<Vec<StatePtr>>,
    rows_in_builder: usize,
    done: bool,
    cancelled: CancelFlag,
}

impl AggregatingMergedStream {
    pub fn new(inputs: Vec<Box<dyn BlockStream>>, description: SortDescription, block_size: usize) -> Self {
        let inner = MergingSortedStream::new(inputs, description.clone(), block_size);
        Self {
            inner,
            description,
            block_size: block_size.max(1),
            layout: None,
            group_key: None,
            group_row: None,
            group_states: Vec::new(),
            block_arenas: Vec::new(),
            block_groups: Vec::new(),
            rows_in_builder: 0,
            done: false,
            cancelled: CancelFlag::new(),
        }
    }

    fn state_column<'a>(block: &'a Block, position: usize) -> Result<&'a AggregateStateColumn> {
        match &block.at(position).column {
            Column::AggregateState(col) => Ok(col),
            other => Err(Error::Logical(format!(
                "aggregating merge expected a state column, got {}",
                other.data_type()
            ))),
        }
    }

    fn resolve_layout(&mut self, block: &Block) -> Result<()> {
        if self.layout.is_some() {
            return Ok(());
        }
        let positions: Vec<usize> = block
            .iter()
            .enumerate()
            .filter_map(|(i, c)| matches!(c.column, Column::AggregateState(_)).then_some(i))
            .collect();
        let mut functions = Vec::with_capacity(positions.len());
        for &p in &positions {
            functions.push(Self::state_column(block, p)?.function().clone());
        }
        self.block_arenas = (0..positions.len()).map(|_| Arena::new()).collect();
        self.block_groups = (0..positions.len()).map(|_| Vec::new()).collect();
        self.layout = Some((positions, functions));
        Ok(())
    }

    /// Moves the open group's merged states into the block arenas and
    /// appends the representative row's plain columns to the builder.
    fn flush_group(&mut self, out: &mut Block) -> Result<()> {
        let Some(row) = self.group_row.take() else { return Ok(()) };
        let (positions, _) = match &self.layout {
            Some(l) => l,
            None => return Err(Error::Logical("aggregating merge flushed before first block".into())),
        };
        for (slot, state) in self.group_states.iter().enumerate() {
            let size = state.len();
            let ptr = self.block_arenas[slot].alloc(size);
            // The byte copy transfers state ownership into the arena; the
            // temporary buffer is cleared, not destroyed.
            self.block_arenas[slot].slice_mut(ptr, size).copy_from_slice(state);
            self.block_groups[slot].push(ptr);
        }
        self.group_states.clear();
        for (position, column) in row.iter().enumerate() {
            if !positions.contains(&position) {
                out.at_mut(position).column.push_from(&column.column, 0)?;
            }
        }
        self.rows_in_builder += 1;
        self.group_key = None;
        Ok(())
    }

    /// Wraps the accumulated arenas into holders and installs the state
    /// columns into the builder block.
    fn seal_block(&mut self, mut out: Block) -> Result<Block> {
        let (positions, functions) = match &self.layout {
            Some(l) => l.clone(),
            None => return Ok(out),
        };
        for (slot, &position) in positions.iter().enumerate() {
            let arena = std::mem::take(&mut self.block_arenas[slot]);
            let groups = std::mem::take(&mut self.block_groups[slot]);
            let function = functions[slot].clone();
            let holder = Arc::new(StatesHolder::new(
                arena,
                groups.clone(),
                vec![function.clone()],
                vec![0],
                function.state_size(),
            ));
            out.at_mut(position).column =
                Column::AggregateState(AggregateStateColumn::new(function, 0, holder, groups));
        }
        self.block_arenas = (0..positions.len()).map(|_| Arena::new()).collect();
        self.block_groups = (0..positions.len()).map(|_| Vec::new()).collect();
        self.rows_in_builder = 0;
        Ok(out)
    }
}

impl BlockStream for AggregatingMergedStream {
    fn name(&self) -> &'static str {
        "AggregatingMerged"
    }

    fn read(&mut self) -> Result<Block> {
        if self.done || self.cancelled.get() {
            return Ok(Block::new());
        }
        let mut out: Option<Block> = None;
        loop {
            let block = self.inner.read()?;
            if block.is_empty() {
                let mut tail = match out.take() {
                    Some(b) => b,
                    None => match &self.inner.template {
                        Some(t) => t.clone_empty(),
                        None => {
                            self.done = true;
                            return Ok(Block::new());
                        }
                    },
                };
                self.resolve_layout(&tail)?;
                self.flush_group(&mut tail)?;
                self.done = true;
                let rows = self.rows_in_builder;
                let sealed = self.seal_block(tail)?;
                if rows == 0 {
                    return Ok(Block::new());
                }
                return Ok(sealed);
            }

            let keys = key_positions(&block, &self.description)?;
            self.resolve_layout(&block)?;
            let mut builder = match out.take() {
                Some(b) => b,
                None => block.clone_empty(),
            };
            for row in 0..block.rows() {
                let key = key_of(&block, &keys, row);
                if self.group_key.as_ref() != Some(&key) {
                    self.flush_group(&mut builder)?;
                    self.group_key = Some(key);
                    self.group_row = Some(block.cut(row, 1)?);
                    let (positions, functions) = match &self.layout {
                        Some(l) => l,
                        None => return Err(Error::Logical("aggregate layout missing".into())),
                    };
                    self.group_states.clear();
                    for (slot, &position) in positions.iter().enumerate() {
                        let column = Self::state_column(&block, position)?;
                        let function = &functions[slot];
                        let mut state = vec![0u8; function.state_size()];
                        function.create(&mut state)?;
                        function.merge(&mut state, column.state_bytes(row)?)?;
                        self.group_states.push(state);
                    }
                } else {
                    let (positions, functions) = match &self.layout {
                        Some(l) => l,
                        None => return Err(Error::Logical("aggregate layout missing".into())),
                    };
                    for (slot, &position) in positions.iter().enumerate() {
                        let column = Self::state_column(&block, position)?;
                        functions[slot].merge(&mut self.group_states[slot], column.state_bytes(row)?)?;
                    }
                }
            }
            if self.rows_in_builder >= self.block_size {
                return self.seal_block(builder);
            }
            out = Some(builder);
        }
    }

    fn read_prefix(&mut self) -> Result<()> {
        self.inner.read_prefix()
    }

    fn read_suffix(&mut self) -> Result<()> {
        self.inner.read_suffix()
    }

    fn cancel(&self) {
        self.cancelled.set();
        self.inner.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

impl Drop for AggregatingMergedStream {
    fn drop(&mut self) {
        // An open group's temporary states own heap allocations for
        // functions with real destructors; release them on abandon.
        if let Some((_, functions)) = &self.layout {
            for (slot, state) in self.group_states.iter_mut().enumerate() {
                if !functions[slot].has_trivial_destructor() {
                    functions[slot].destroy(state);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{ColumnWithTypeAndName, DataType};
    use crate::stream::sort::SortColumnDescription;
    use crate::stream::BlocksStream;

    fn sorted_block(keys: Vec<u64>, values: Vec<i64>) -> Block {
        Block::with_columns(vec![
            ColumnWithTypeAndName::new("k", DataType::UInt64, Column::UInt64(keys)),
            ColumnWithTypeAndName::new("v", DataType::Int64, Column::Int64(values)),
        ])
        .unwrap()
    }

    fn keys_and_values(blocks: &[Block]) -> (Vec<u64>, Vec<i64>) {
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for block in blocks {
            for i in 0..block.rows() {
                keys.push(block.at(0).column.get(i).as_u64().unwrap());
                values.push(block.at(1).column.get(i).as_i64().unwrap());
            }
        }
        (keys, values)
    }

    #[test]
    fn test_merging_sorted() {
        let a = BlocksStream::new(vec![sorted_block(vec![1, 4, 7], vec![1, 4, 7])]);
        let b = BlocksStream::new(vec![sorted_block(vec![2, 4, 9], vec![2, 40, 9])]);
        let mut stream = MergingSortedStream::new(
            vec![Box::new(a), Box::new(b)],
            vec![SortColumnDescription::asc("k")],
            4,
        );
        let blocks = crate::stream::read_all(&mut stream).unwrap();
        let (keys, _) = keys_and_values(&blocks);
        assert_eq!(keys, vec![1, 2, 4, 4, 7, 9]);
        assert!(blocks[0].rows() <= 4);
    }

    #[test]
    fn test_merging_sorted_ties_prefer_first_input() {
        let a = BlocksStream::new(vec![sorted_block(vec![5], vec![100])]);
        let b = BlocksStream::new(vec![sorted_block(vec![5], vec![200])]);
        let mut stream = MergingSortedStream::new(
            vec![Box::new(a), Box::new(b)],
            vec![SortColumnDescription::asc("k")],
            8,
        );
        let blocks = crate::stream::read_all(&mut stream).unwrap();
        let (_, values) = keys_and_values(&blocks);
        assert_eq!(values, vec![100, 200]);
    }

    fn signed_block(keys: Vec<u64>, signs: Vec<i64>) -> Block {
        let values = keys.iter().map(|&k| k as i64 * 10).collect();
        let mut block = sorted_block(keys, values);
        block.insert(ColumnWithTypeAndName::new(
            "sign",
            DataType::Int8,
            Column::Int8(signs.into_iter().map(|s| s as i8).collect()),
        ));
        block
    }

    #[test]
    fn test_collapsing_cancels_pairs() {
        let a = BlocksStream::new(vec![signed_block(vec![1, 2], vec![1, 1])]);
        let b = BlocksStream::new(vec![signed_block(vec![1, 3], vec![-1, 1])]);
        let mut stream = CollapsingMergedStream::new(
            vec![Box::new(a), Box::new(b)],
            vec![SortColumnDescription::asc("k")],
            "sign",
            8,
        );
        let blocks = crate::stream::read_all(&mut stream).unwrap();
        let (keys, _) = keys_and_values(&blocks);
        // Key 1 cancels; keys 2 and 3 survive.
        assert_eq!(keys, vec![2, 3]);
    }

    #[test]
    fn test_summing_collapses_groups() {
        let a = BlocksStream::new(vec![sorted_block(vec![1, 2, 2], vec![5, 10, 20])]);
        let b = BlocksStream::new(vec![sorted_block(vec![2, 3], vec![30, 7])]);
        let mut stream = SummingMergedStream::new(
            vec![Box::new(a), Box::new(b)],
            vec![SortColumnDescription::asc("k")],
            8,
        );
        let blocks = crate::stream::read_all(&mut stream).unwrap();
        let (keys, values) = keys_and_values(&blocks);
        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(values, vec![5, 60, 7]);
    }

    #[test]
    fn test_aggregating_merges_states() {
        use crate::aggregate::state::AggregateStateColumn;
        use std::io::Cursor;

        // Build two inputs whose "s" column carries sum(UInt64) states.
        fn state_block(keys: Vec<u64>, sums: Vec<u64>) -> Block {
            let function = crate::aggregate::function::create_from_description("sum(UInt64)").unwrap();
            let mut buf = Vec::new();
            {
                let source = Column::UInt64(sums.clone());
                let mut arena = Arena::new();
                let mut payload = Vec::new();
                for i in 0..sums.len() {
                    let ptr = arena.alloc(function.state_size());
                    function.create(arena.slice_mut(ptr, function.state_size())).unwrap();
                    function
                        .add(arena.slice_mut(ptr, function.state_size()), &[&source], i)
                        .unwrap();
                    payload.clear();
                    function
                        .serialize(arena.slice(ptr, function.state_size()), &mut payload)
                        .unwrap();
                    crate::io::varint::write_bytes(&mut buf, &payload).unwrap();
                }
            }
            let states =
                AggregateStateColumn::deserialize_rows("sum(UInt64)", sums.len(), &mut Cursor::new(&buf))
                    .unwrap();
            Block::with_columns(vec![
                ColumnWithTypeAndName::new("k", DataType::UInt64, Column::UInt64(keys)),
                ColumnWithTypeAndName::new(
                    "s",
                    DataType::AggregateState("sum(UInt64)".into()),
                    Column::AggregateState(states),
                ),
            ])
            .unwrap()
        }

        let a = BlocksStream::new(vec![state_block(vec![1, 2], vec![10, 20])]);
        let b = BlocksStream::new(vec![state_block(vec![2, 3], vec![5, 7])]);
        let mut stream = AggregatingMergedStream::new(
            vec![Box::new(a), Box::new(b)],
            vec![SortColumnDescription::asc("k")],
            8,
        );
        let blocks = crate::stream::read_all(&mut stream).unwrap();
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.rows(), 3);

        let states = match &block.at(1).column {
            Column::AggregateState(c) => c,
            other => panic!("unexpected column {other:?}"),
        };
        let function = states.function().clone();
        let mut result = Column::new(&function.result_type()).unwrap();
        for i in 0..3 {
            function.insert_result(states.state_bytes(i).unwrap(), &mut result).unwrap();
        }
        assert_eq!(result.get(0), Value::UInt64(10));
        assert_eq!(result.get(1), Value::UInt64(25));
        assert_eq!(result.get(2), Value::UInt64(7));
    }
}
