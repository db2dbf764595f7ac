use std::collections::HashSet;
use std::hash::BuildHasherDefault;

use crate::block::Block;
use crate::config::OverflowMode;
use crate::error::{Error, Result};
use crate::io::checksum::Hash128;
use crate::stream::{BlockStream, CancelFlag};

type FingerprintSet = HashSet<u128, BuildHasherDefault<ahash::AHasher>>;

/// Leaves only the first occurrence of each distinct row.
///
/// Uniqueness is tracked by a 128-bit fingerprint of the selected columns,
/// hashed with terminating zeros between variable-length fields. The result
/// is approximate: a fingerprint collision or embedded NUL bytes can merge
/// rows that differ.
pub struct DistinctStream {
    input: Box<dyn BlockStream>,
    /// Empty means all columns.
    columns: Vec<String>,
    /// Stop emitting once this many distinct rows were produced (0 = no cap).
    limit: usize,
    max_rows: usize,
    max_bytes: usize,
    overflow_mode: OverflowMode,
    set: FingerprintSet,
    cancelled: CancelFlag,
}

impl DistinctStream {
    pub fn new(
        input: Box<dyn BlockStream>,
        columns: Vec<String>,
        limit: usize,
        max_rows: usize,
        max_bytes: usize,
        overflow_mode: OverflowMode,
    ) -> Self {
        Self {
            input,
            columns,
            limit,
            max_rows,
            max_bytes,
            overflow_mode,
            set: FingerprintSet::default(),
            cancelled: CancelFlag::new(),
        }
    }

    fn within_limits(&self) -> bool {
        if self.max_rows != 0 && self.set.len() > self.max_rows {
            return false;
        }
        if self.max_bytes != 0 && self.set.len() * 16 > self.max_bytes {
            return false;
        }
        true
    }
}

impl BlockStream for DistinctStream {
    fn name(&self) -> &'static str {
        "Distinct"
    }

    fn read(&mut self) -> Result<Block> {
        loop {
            if self.cancelled.get() {
                return Ok(Block::new());
            }
            if self.limit != 0 && self.set.len() >= self.limit {
                self.input.cancel();
                return Ok(Block::new());
            }
            let block = self.input.read()?;
            if block.is_empty() {
                return Ok(block);
            }

            let rows = block.rows();
            let key_columns: Vec<_> = if self.columns.is_empty() {
                block.iter().collect()
            } else {
                let mut selected = Vec::with_capacity(self.columns.len());
                for name in &self.columns {
                    selected.push(block.by_name(name)?);
                }
                selected
            };

            let mut mask = vec![0u8; rows];
            let old_size = self.set.len();
            for i in 0..rows {
                let mut hash = Hash128::new();
                for column in &key_columns {
                    column.column.update_hash_row(i, &mut hash)?;
                }
                mask[i] = self.set.insert(hash.finish()) as u8;
                if self.limit != 0 && self.set.len() == self.limit {
                    break;
                }
            }

            // Nothing new in this block: move on to the next one.
            if self.set.len() == old_size {
                continue;
            }

            if !self.within_limits() {
                match self.overflow_mode {
                    OverflowMode::Throw => {
                        return Err(Error::LimitExceeded(format!(
                            "DISTINCT set of {} rows exceeds the configured cap",
                            self.set.len()
                        )))
                    }
                    OverflowMode::Break => return Ok(Block::new()),
                    OverflowMode::Any => {
                        return Err(Error::Logical("unknown overflow mode for DISTINCT".into()))
                    }
                }
            }

            return block.filter(&mask);
        }
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

    fn two_column_block() -> Block {
        let mut strings = Column::new(&DataType::String).unwrap();
        for s in ["p", "p", "p", "q", "q"] {
            strings.push_value(&Value::Bytes(s.as_bytes().to_vec())).unwrap();
        }
        Block::with_columns(vec![
            ColumnWithTypeAndName::new("x", DataType::UInt64, Column::UInt64(vec![1, 1, 2, 2, 3])),
            ColumnWithTypeAndName::new("y", DataType::String, strings),
        ])
        .unwrap()
    }

    fn rows_of(block: &Block) -> Vec<(u64, Vec<u8>)> {
        (0..block.rows())
            .map(|i| {
                let x = match block.at(0).column.get(i) {
                    Value::UInt64(v) => v,
                    other => panic!("unexpected {other:?}"),
                };
                let y = match block.at(1).column.get(i) {
                    Value::Bytes(b) => b,
                    other => panic!("unexpected {other:?}"),
                };
                (x, y)
            })
            .collect()
    }

    #[test]
    fn test_distinct_over_both_columns() {
        let input = BlocksStream::new(vec![two_column_block()]);
        let mut stream =
            DistinctStream::new(Box::new(input), vec![], 0, 0, 0, OverflowMode::Throw);
        let blocks = read_all(&mut stream).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(
            rows_of(&blocks[0]),
            vec![
                (1, b"p".to_vec()),
                (2, b"p".to_vec()),
                (2, b"q".to_vec()),
                (3, b"q".to_vec()),
            ]
        );
    }

    #[test]
    fn test_distinct_across_blocks() {
        let input = BlocksStream::new(vec![two_column_block(), two_column_block()]);
        let mut stream =
            DistinctStream::new(Box::new(input), vec![], 0, 0, 0, OverflowMode::Throw);
        let blocks = read_all(&mut stream).unwrap();
        // The second block repeats the first one exactly and is skipped.
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].rows(), 4);
    }

    #[test]
    fn test_distinct_single_column() {
        let input = BlocksStream::new(vec![two_column_block()]);
        let mut stream =
            DistinctStream::new(Box::new(input), vec!["x".into()], 0, 0, 0, OverflowMode::Throw);
        let blocks = read_all(&mut stream).unwrap();
        assert_eq!(blocks[0].rows(), 3);
    }

    #[test]
    fn test_distinct_overflow_throw_and_break() {
        let input = BlocksStream::new(vec![two_column_block()]);
        let mut stream =
            DistinctStream::new(Box::new(input), vec![], 0, 2, 0, OverflowMode::Throw);
        assert!(matches!(stream.read(), Err(Error::LimitExceeded(_))));

        let input = BlocksStream::new(vec![two_column_block()]);
        let mut stream =
            DistinctStream::new(Box::new(input), vec![], 0, 2, 0, OverflowMode::Break);
        assert!(stream.read().unwrap().is_empty());
    }

    #[test]
    fn test_distinct_limit_short_circuits() {
        let input = BlocksStream::new(vec![two_column_block(), two_column_block()]);
        let mut stream =
            DistinctStream::new(Box::new(input), vec![], 2, 0, 0, OverflowMode::Throw);
        let blocks = read_all(&mut stream).unwrap();
        let total: usize = blocks.iter().map(|b| b.rows()).sum();
        assert_eq!(total, 2);
    }
}
