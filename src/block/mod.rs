//! The columnar block model.
//!
//! A block is the unit of data flow: a horizontal slice of typed columns,
//! all of equal length, streamed through pull-based operators. Columns are
//! a closed tagged enum; per-type behavior is dispatched by match, not by
//! trait objects.

pub mod column;
pub mod types;

pub use column::{Column, Primitive};
pub use types::{DataType, Value};

use crate::error::{Error, Result};

impl DataType {
    /// Serializes one scalar in this type's binary format. Used by the
    /// sparse primary index, where values are written outside any column.
    pub fn serialize_value<W: std::io::Write>(&self, value: &Value, w: &mut W) -> Result<()> {
        let mut column = Column::new(self)?;
        column.push_value(value)?;
        column.serialize_rows(0, 1, w)
    }

    pub fn deserialize_value<R: std::io::Read>(&self, r: &mut R) -> Result<Value> {
        let column = Column::deserialize_rows(self, 1, r)?;
        Ok(column.get(0))
    }
}

/// One column together with its name and type.
#[derive(Clone, Debug)]
pub struct ColumnWithTypeAndName {
    pub name: String,
    pub data_type: DataType,
    pub column: Column,
}

impl ColumnWithTypeAndName {
    pub fn new(name: impl Into<String>, data_type: DataType, column: Column) -> Self {
        Self { name: name.into(), data_type, column }
    }

    pub fn clone_empty(&self) -> Self {
        Self {
            name: self.name.clone(),
            data_type: self.data_type.clone(),
            column: self.column.clone_empty(),
        }
    }
}

/// An ordered list of (name, type, column) triples of equal length. An
/// empty block (no columns) is the end-of-stream marker.
#[derive(Clone, Debug, Default)]
pub struct Block {
    columns: Vec<ColumnWithTypeAndName>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns(columns: Vec<ColumnWithTypeAndName>) -> Result<Block> {
        let block = Block { columns };
        block.check_sizes()?;
        Ok(block)
    }

    /// End-of-stream marker check: a block with no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> usize {
        self.columns.len()
    }

    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.column.len())
    }

    pub fn bytes(&self) -> usize {
        self.columns.iter().map(|c| c.column.byte_size()).sum()
    }

    pub fn insert(&mut self, column: ColumnWithTypeAndName) {
        self.columns.push(column);
    }

    pub fn erase(&mut self, position: usize) -> Result<()> {
        if position >= self.columns.len() {
            return Err(Error::InvalidArgument(format!(
                "erase position {position} in a block of {} columns",
                self.columns.len()
            )));
        }
        self.columns.remove(position);
        Ok(())
    }

    pub fn at(&self, position: usize) -> &ColumnWithTypeAndName {
        &self.columns[position]
    }

    pub fn at_mut(&mut self, position: usize) -> &mut ColumnWithTypeAndName {
        &mut self.columns[position]
    }

    pub fn position_by_name(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::InvalidArgument(format!("no column {name} in block")))
    }

    pub fn by_name(&self, name: &str) -> Result<&ColumnWithTypeAndName> {
        Ok(self.at(self.position_by_name(name)?))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ColumnWithTypeAndName> {
        self.columns.iter()
    }

    /// Every emitted block must keep all columns the same length.
    pub fn check_sizes(&self) -> Result<()> {
        let rows = self.rows();
        for c in &self.columns {
            if c.column.len() != rows {
                return Err(Error::SizeMismatch(format!(
                    "column {} has {} rows, block has {rows}",
                    c.name,
                    c.column.len()
                )));
            }
        }
        Ok(())
    }

    pub fn clone_empty(&self) -> Block {
        Block { columns: self.columns.iter().map(|c| c.clone_empty()).collect() }
    }

    /// Expands constant columns into full ones.
    pub fn materialize(&self) -> Result<Block> {
        let mut columns = Vec::with_capacity(self.columns.len());
        for c in &self.columns {
            columns.push(ColumnWithTypeAndName {
                name: c.name.clone(),
                data_type: c.data_type.clone(),
                column: c.column.materialize()?,
            });
        }
        Ok(Block { columns })
    }

    pub fn cut(&self, offset: usize, len: usize) -> Result<Block> {
        let mut columns = Vec::with_capacity(self.columns.len());
        for c in &self.columns {
            columns.push(ColumnWithTypeAndName {
                name: c.name.clone(),
                data_type: c.data_type.clone(),
                column: c.column.cut(offset, len)?,
            });
        }
        Ok(Block { columns })
    }

    /// Filters every column in lockstep with the mask.
    pub fn filter(&self, mask: &[u8]) -> Result<Block> {
        let mut columns = Vec::with_capacity(self.columns.len());
        for c in &self.columns {
            columns.push(ColumnWithTypeAndName {
                name: c.name.clone(),
                data_type: c.data_type.clone(),
                column: c.column.filter(mask)?,
            });
        }
        Ok(Block { columns })
    }

    /// Applies one permutation to every column.
    pub fn permute(&self, perm: &[usize], limit: usize) -> Result<Block> {
        let mut columns = Vec::with_capacity(self.columns.len());
        for c in &self.columns {
            columns.push(ColumnWithTypeAndName {
                name: c.name.clone(),
                data_type: c.data_type.clone(),
                column: c.column.permute(perm, limit)?,
            });
        }
        Ok(Block { columns })
    }

    /// Appends rows [start, start+len) of a block with the same layout.
    pub fn append_rows(&mut self, other: &Block, start: usize, len: usize) -> Result<()> {
        if self.columns.len() != other.columns.len() {
            return Err(Error::SizeMismatch(format!(
                "appending a block of {} columns to one of {}",
                other.columns.len(),
                self.columns.len()
            )));
        }
        for (dst, src) in self.columns.iter_mut().zip(other.columns.iter()) {
            dst.column.append_rows(&src.column, start, len)?;
        }
        Ok(())
    }

    /// Reorders columns to the requested name order. Used when injected
    /// read columns left the block in on-disk order.
    pub fn sort_columns(&self, order: &[String]) -> Result<Block> {
        let mut columns = Vec::with_capacity(order.len());
        for name in order {
            columns.push(self.by_name(name)?.clone());
        }
        Ok(Block { columns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        Block::with_columns(vec![
            ColumnWithTypeAndName::new("id", DataType::UInt32, Column::UInt32(vec![1, 2, 3])),
            ColumnWithTypeAndName::new(
                "name",
                DataType::String,
                {
                    let mut c = Column::new(&DataType::String).unwrap();
                    for s in ["a", "b", "c"] {
                        c.push_value(&Value::Bytes(s.as_bytes().to_vec())).unwrap();
                    }
                    c
                },
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_block_shape() {
        let block = sample_block();
        assert_eq!(block.rows(), 3);
        assert_eq!(block.columns(), 2);
        assert!(!block.is_empty());
        assert!(Block::new().is_empty());
    }

    #[test]
    fn test_size_check_rejects_ragged_columns() {
        let result = Block::with_columns(vec![
            ColumnWithTypeAndName::new("a", DataType::UInt8, Column::UInt8(vec![1, 2])),
            ColumnWithTypeAndName::new("b", DataType::UInt8, Column::UInt8(vec![1])),
        ]);
        assert!(matches!(result, Err(Error::SizeMismatch(_))));
    }

    #[test]
    fn test_filter_all_columns_in_lockstep() {
        let block = sample_block();
        let filtered = block.filter(&[1, 0, 1]).unwrap();
        assert_eq!(filtered.rows(), 2);
        assert_eq!(filtered.at(0).column.get(1), Value::UInt64(3));
        assert_eq!(filtered.at(1).column.get(1), Value::Bytes(b"c".to_vec()));
    }

    #[test]
    fn test_filter_identity_and_annihilation() {
        let block = sample_block();
        let same = block.filter(&[1, 1, 1]).unwrap();
        assert_eq!(same.rows(), block.rows());
        for i in 0..block.rows() {
            assert_eq!(same.at(0).column.get(i), block.at(0).column.get(i));
            assert_eq!(same.at(1).column.get(i), block.at(1).column.get(i));
        }
        let none = block.filter(&[0, 0, 0]).unwrap();
        assert_eq!(none.rows(), 0);
    }

    #[test]
    fn test_lookup_and_sort_columns() {
        let block = sample_block();
        assert_eq!(block.position_by_name("name").unwrap(), 1);
        assert!(block.position_by_name("missing").is_err());

        let reordered = block.sort_columns(&["name".into(), "id".into()]).unwrap();
        assert_eq!(reordered.at(0).name, "name");
        assert_eq!(reordered.at(1).name, "id");
    }

    #[test]
    fn test_cut_and_append() {
        let block = sample_block();
        let tail = block.cut(1, 2).unwrap();
        assert_eq!(tail.rows(), 2);
        assert_eq!(tail.at(0).column.get(0), Value::UInt64(2));

        let mut acc = block.clone_empty();
        acc.append_rows(&block, 0, 2).unwrap();
        acc.append_rows(&tail, 0, 1).unwrap();
        assert_eq!(acc.rows(), 3);
        assert_eq!(acc.at(0).column.get(2), Value::UInt64(2));
    }
}
