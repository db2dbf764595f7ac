use crate::block::{Block, Column};
use crate::error::{Error, Result};
use crate::stream::{BlockStream, CancelFlag};

/// Keeps the rows whose value in a UInt8 mask column is non-zero. Every
/// column of the block is filtered in lockstep.
pub struct FilterStream {
    input: Box<dyn BlockStream>,
    filter_column: String,
    remove_filter_column: bool,
    cancelled: CancelFlag,
}

impl FilterStream {
    pub fn new(input: Box<dyn BlockStream>, filter_column: impl Into<String>) -> Self {
        Self {
            input,
            filter_column: filter_column.into(),
            remove_filter_column: false,
            cancelled: CancelFlag::new(),
        }
    }

    /// Drop the mask column from output blocks.
    pub fn remove_filter_column(mut self) -> Self {
        self.remove_filter_column = true;
        self
    }

    fn mask_of(&self, block: &Block) -> Result<Vec<u8>> {
        let column = block.by_name(&self.filter_column)?;
        match column.column.materialize()? {
            Column::UInt8(mask) => Ok(mask),
            other => Err(Error::InvalidArgument(format!(
                "filter column {} must be UInt8, got {}",
                self.filter_column,
                other.data_type()
            ))),
        }
    }
}

impl BlockStream for FilterStream {
    fn name(&self) -> &'static str {
        "Filter"
    }

    fn read(&mut self) -> Result<Block> {
        loop {
            if self.cancelled.get() {
                return Ok(Block::new());
            }
            let block = self.input.read()?;
            if block.is_empty() {
                return Ok(block);
            }
            let mask = self.mask_of(&block)?;
            let mut filtered = block.filter(&mask)?;
            if self.remove_filter_column {
                let position = filtered.position_by_name(&self.filter_column)?;
                filtered.erase(position)?;
            }
            if filtered.rows() == 0 {
                continue;
            }
            return Ok(filtered);
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
    use crate::block::{ColumnWithTypeAndName, DataType, Value};
    use crate::stream::{read_all, BlocksStream};

    fn block_with_mask(values: Vec<u64>, mask: Vec<u8>) -> Block {
        let mut block = Block::new();
        block.insert(ColumnWithTypeAndName::new(
            "v",
            DataType::UInt64,
            Column::UInt64(values),
        ));
        block.insert(ColumnWithTypeAndName::new("m", DataType::UInt8, Column::UInt8(mask)));
        block
    }

    #[test]
    fn test_filter_drops_zero_rows() {
        let input = BlocksStream::new(vec![block_with_mask(vec![1, 2, 3, 4], vec![1, 0, 0, 1])]);
        let mut stream = FilterStream::new(Box::new(input), "m").remove_filter_column();
        let blocks = read_all(&mut stream).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].columns(), 1);
        assert_eq!(blocks[0].at(0).column.get(0), Value::UInt64(1));
        assert_eq!(blocks[0].at(0).column.get(1), Value::UInt64(4));
    }

    #[test]
    fn test_all_filtered_blocks_are_skipped() {
        let input = BlocksStream::new(vec![
            block_with_mask(vec![1, 2], vec![0, 0]),
            block_with_mask(vec![3], vec![1]),
        ]);
        let mut stream = FilterStream::new(Box::new(input), "m");
        let blocks = read_all(&mut stream).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].rows(), 1);
    }

    #[test]
    fn test_mask_size_mismatch_is_fatal() {
        // A ragged block: the mask is shorter than the data column.
        let mut block = Block::new();
        block.insert(ColumnWithTypeAndName::new(
            "v",
            DataType::UInt64,
            Column::UInt64(vec![1, 2, 3]),
        ));
        block.insert(ColumnWithTypeAndName::new("m", DataType::UInt8, Column::UInt8(vec![1, 0])));

        let mut stream = FilterStream::new(Box::new(BlocksStream::new(vec![block])), "m");
        assert!(matches!(stream.read(), Err(Error::SizeMismatch(_))));
    }

    #[test]
    fn test_non_uint8_mask_rejected() {
        let mut block = Block::new();
        block.insert(ColumnWithTypeAndName::new(
            "m",
            DataType::UInt64,
            Column::UInt64(vec![1, 0]),
        ));
        let mut stream = FilterStream::new(Box::new(BlocksStream::new(vec![block])), "m");
        assert!(matches!(stream.read(), Err(Error::InvalidArgument(_))));
    }
}
