use std::sync::{Arc, Mutex};

use crate::block::{Block, DataType};
use crate::error::Result;
use crate::stream::{BlockOutput, BlockStream, BlocksStream};

/// A table fully resident in memory: a list of blocks behind a mutex.
/// Reads snapshot the current list; writes append.
pub struct MemoryStorage {
    name: String,
    columns: Vec<(String, DataType)>,
    data: Mutex<Vec<Block>>,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>, columns: Vec<(String, DataType)>) -> Arc<Self> {
        Arc::new(Self { name: name.into(), columns, data: Mutex::new(Vec::new()) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[(String, DataType)] {
        &self.columns
    }

    pub fn append(&self, block: Block) -> Result<()> {
        block.check_sizes()?;
        self.data.lock()?.push(block);
        Ok(())
    }

    /// A stream over a snapshot of the table's blocks.
    pub fn read(&self) -> Result<Box<dyn BlockStream>> {
        let blocks = self.data.lock()?.clone();
        Ok(Box::new(BlocksStream::new(blocks)))
    }

    pub fn rows(&self) -> Result<usize> {
        Ok(self.data.lock()?.iter().map(|b| b.rows()).sum())
    }

    pub fn output(self: &Arc<Self>) -> MemoryOutput {
        MemoryOutput { storage: self.clone() }
    }
}

/// Block sink appending into a [`MemoryStorage`].
pub struct MemoryOutput {
    storage: Arc<MemoryStorage>,
}

impl BlockOutput for MemoryOutput {
    fn write(&mut self, block: &Block) -> Result<()> {
        self.storage.append(block.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Column, ColumnWithTypeAndName};
    use crate::stream::read_all;

    #[test]
    fn test_append_and_read_back() {
        let storage = MemoryStorage::new("t", vec![("x".into(), DataType::UInt64)]);
        let block = Block::with_columns(vec![ColumnWithTypeAndName::new(
            "x",
            DataType::UInt64,
            Column::UInt64(vec![1, 2, 3]),
        )])
        .unwrap();
        storage.append(block).unwrap();
        assert_eq!(storage.rows().unwrap(), 3);

        let mut stream = storage.read().unwrap();
        let blocks = read_all(stream.as_mut()).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].rows(), 3);
    }
}
