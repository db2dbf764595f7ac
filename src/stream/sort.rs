use std::cmp::Ordering;

use crate::block::Block;
use crate::error::{Error, Result};
use crate::stream::{BlockStream, CancelFlag};

/// How one column participates in a sort.
#[derive(Clone, Debug)]
pub struct SortColumnDescription {
    pub column: String,
    pub descending: bool,
}

impl SortColumnDescription {
    pub fn asc(column: impl Into<String>) -> Self {
        Self { column: column.into(), descending: false }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self { column: column.into(), descending: true }
    }
}

pub type SortDescription = Vec<SortColumnDescription>;

/// Resolves the description against a block, validating column types match
/// across uses.
fn key_positions(block: &Block, description: &SortDescription) -> Result<Vec<(usize, bool)>> {
    let mut keys = Vec::with_capacity(description.len());
    for d in description {
        keys.push((block.position_by_name(&d.column)?, d.descending));
    }
    Ok(keys)
}

/// Compares two rows of one block under a sort description.
fn compare_rows(block: &Block, keys: &[(usize, bool)], a: usize, b: usize) -> Ordering {
    for &(position, descending) in keys {
        let column = &block.at(position).column;
        // NaNs go to the end of the requested direction.
        let nan_direction = if descending { -1 } else { 1 };
        let ord = column.compare_at(a, column, b, nan_direction);
        let ord = if descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Produces the permutation that sorts `block`. With a non-zero limit only
/// the first `limit` entries are ordered (partial sort).
pub fn sort_permutation(block: &Block, description: &SortDescription, limit: usize) -> Result<Vec<usize>> {
    let keys = key_positions(block, description)?;
    let rows = block.rows();
    let mut perm: Vec<usize> = (0..rows).collect();
    if limit != 0 && limit < rows {
        perm.select_nth_unstable_by(limit - 1, |&a, &b| compare_rows(block, &keys, a, b));
        perm[..limit].sort_by(|&a, &b| compare_rows(block, &keys, a, b));
        perm.truncate(limit);
    } else {
        // Stable, so equal keys keep their input order.
        perm.sort_by(|&a, &b| compare_rows(block, &keys, a, b));
    }
    Ok(perm)
}

/// Sorts one block, truncating to `limit` rows when non-zero.
pub fn sort_block(block: &Block, description: &SortDescription, limit: usize) -> Result<Block> {
    let block = block.materialize()?;
    let perm = sort_permutation(&block, description, limit)?;
    block.permute(&perm, 0)
}

/// Checks whether a block is already ordered by the description.
pub fn is_sorted(block: &Block, description: &SortDescription) -> Result<bool> {
    let keys = key_positions(block, description)?;
    for i in 1..block.rows() {
        if compare_rows(block, &keys, i - 1, i) == Ordering::Greater {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Sorts every block independently. A cheap first phase before merging.
pub struct PartialSortingStream {
    input: Box<dyn BlockStream>,
    description: SortDescription,
    limit: usize,
    cancelled: CancelFlag,
}

impl PartialSortingStream {
    pub fn new(input: Box<dyn BlockStream>, description: SortDescription, limit: usize) -> Self {
        Self { input, description, limit, cancelled: CancelFlag::new() }
    }
}

impl BlockStream for PartialSortingStream {
    fn name(&self) -> &'static str {
        "PartialSorting"
    }

    fn read(&mut self) -> Result<Block> {
        if self.cancelled.get() {
            return Ok(Block::new());
        }
        let block = self.input.read()?;
        if block.is_empty() {
            return Ok(block);
        }
        sort_block(&block, &self.description, self.limit)
    }

    fn read_prefix(&mut self) -> Result<()> {
        self.input.read_prefix()
    }

    fn read_suffix(&mut self) -> Result<()> {
        self.input.read_suffix()
    }

    fn cancel(&self) {
        self.cancelled.set();
        self.input.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Pipeline breaker: accumulates the whole input, sorts it once, then
/// emits the result in blocks of `block_size` rows.
pub struct MergeSortingStream {
    input: Box<dyn BlockStream>,
    description: SortDescription,
    limit: usize,
    block_size: usize,
    sorted: Option<Block>,
    position: usize,
    cancelled: CancelFlag,
}

impl MergeSortingStream {
    pub fn new(
        input: Box<dyn BlockStream>,
        description: SortDescription,
        limit: usize,
        block_size: usize,
    ) -> Self {
        Self {
            input,
            description,
            limit,
            block_size: block_size.max(1),
            sorted: None,
            position: 0,
            cancelled: CancelFlag::new(),
        }
    }

    fn accumulate_and_sort(&mut self) -> Result<Block> {
        let mut accumulated: Option<Block> = None;
        loop {
            if self.cancelled.get() {
                return Ok(Block::new());
            }
            let block = self.input.read()?;
            if block.is_empty() {
                break;
            }
            let block = block.materialize()?;
            match &mut accumulated {
                None => accumulated = Some(block),
                Some(acc) => acc.append_rows(&block, 0, block.rows())?,
            }
        }
        match accumulated {
            None => Ok(Block::new()),
            Some(block) => sort_block(&block, &self.description, self.limit),
        }
    }
}

impl BlockStream for MergeSortingStream {
    fn name(&self) -> &'static str {
        "MergeSorting"
    }

    fn read(&mut self) -> Result<Block> {
        if self.cancelled.get() {
            return Ok(Block::new());
        }
        if self.sorted.is_none() {
            self.sorted = Some(self.accumulate_and_sort()?);
        }
        let sorted = match &self.sorted {
            Some(s) => s,
            None => return Err(Error::Logical("sorted data missing after accumulation".into())),
        };
        if self.position >= sorted.rows() {
            return Ok(Block::new());
        }
        let chunk = sorted.cut(self.position, self.block_size)?;
        self.position += chunk.rows();
        Ok(chunk)
    }

    fn read_prefix(&mut self) -> Result<()> {
        self.input.read_prefix()
    }

    fn read_suffix(&mut self) -> Result<()> {
        self.input.read_suffix()
    }

    fn cancel(&self) {
        self.cancelled.set();
        self.input.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Column, ColumnWithTypeAndName, DataType, Value};
    use crate::stream::{read_all, BlocksStream};

    fn block(keys: Vec<i64>, values: Vec<u64>) -> Block {
        Block::with_columns(vec![
            ColumnWithTypeAndName::new("k", DataType::Int64, Column::Int64(keys)),
            ColumnWithTypeAndName::new("v", DataType::UInt64, Column::UInt64(values)),
        ])
        .unwrap()
    }

    fn key_column(b: &Block) -> Vec<i64> {
        (0..b.rows())
            .map(|i| match b.at(0).column.get(i) {
                Value::Int64(v) => v,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_sort_block_roundtrip() {
        let b = block(vec![3, 1, 2, 1], vec![30, 10, 20, 11]);
        let sorted = sort_block(&b, &vec![SortColumnDescription::asc("k")], 0).unwrap();
        assert_eq!(key_column(&sorted), vec![1, 1, 2, 3]);
        // Stability: the two k=1 rows keep their input order.
        assert_eq!(sorted.at(1).column.get(0), Value::UInt64(10));
        assert_eq!(sorted.at(1).column.get(1), Value::UInt64(11));
        assert!(is_sorted(&sorted, &vec![SortColumnDescription::asc("k")]).unwrap());
    }

    #[test]
    fn test_sort_descending_with_limit() {
        let b = block(vec![5, 9, 1, 7, 3], vec![0; 5]);
        let sorted = sort_block(&b, &vec![SortColumnDescription::desc("k")], 2).unwrap();
        assert_eq!(key_column(&sorted), vec![9, 7]);
    }

    #[test]
    fn test_merge_sorting_stream_across_blocks() {
        let input = BlocksStream::new(vec![
            block(vec![5, 2], vec![0, 0]),
            block(vec![9, 1], vec![0, 0]),
            block(vec![4], vec![0]),
        ]);
        let mut stream = MergeSortingStream::new(
            Box::new(input),
            vec![SortColumnDescription::asc("k")],
            0,
            2,
        );
        let blocks = read_all(&mut stream).unwrap();
        let mut all = Vec::new();
        for b in &blocks {
            all.extend(key_column(b));
        }
        assert_eq!(all, vec![1, 2, 4, 5, 9]);
        // Emitted in block_size chunks.
        assert_eq!(blocks[0].rows(), 2);
    }

    #[test]
    fn test_nan_ordering() {
        let b = Block::with_columns(vec![ColumnWithTypeAndName::new(
            "f",
            DataType::Float64,
            Column::Float64(vec![2.0, f64::NAN, 1.0]),
        )])
        .unwrap();
        let sorted = sort_block(&b, &vec![SortColumnDescription::asc("f")], 0).unwrap();
        // Ascending puts NaN last.
        assert!(matches!(sorted.at(0).column.get(2), Value::Float64(v) if v.is_nan()));
    }
}
