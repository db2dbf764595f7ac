//! The block wire format.
//!
//! ```text
//! varuint(columns) varuint(rows)
//! then per column:
//!   name:   varuint length + bytes
//!   type:   varuint length + bytes (textual type name)
//!   values: `rows` values in the column's binary serialization
//! ```
//!
//! Array offsets are serialized before the inner data; aggregate states are
//! length-prefixed per row and self-sufficient across machines of the same
//! endianness.

use std::io::{Read, Write};

use crate::block::{Block, Column, ColumnWithTypeAndName, DataType};
use crate::error::Result;
use crate::io::varint;

pub struct NativeBlockWriter<W: Write> {
    out: W,
}

impl<W: Write> NativeBlockWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write(&mut self, block: &Block) -> Result<()> {
        block.check_sizes()?;
        let rows = block.rows();
        varint::write_varuint(&mut self.out, block.columns() as u64)?;
        varint::write_varuint(&mut self.out, rows as u64)?;
        for column in block.iter() {
            varint::write_str(&mut self.out, &column.name)?;
            varint::write_str(&mut self.out, &column.data_type.name())?;
            column.column.serialize_rows(0, rows, &mut self.out)?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

pub struct NativeBlockReader<R: Read> {
    input: R,
}

impl<R: Read> NativeBlockReader<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }

    /// Reads the next block, or None at a clean end of stream.
    pub fn read(&mut self) -> Result<Option<Block>> {
        let columns = match self.try_read_varuint()? {
            Some(n) => n as usize,
            None => return Ok(None),
        };
        let rows = varint::read_varuint(&mut self.input)? as usize;
        let mut block = Block::new();
        for _ in 0..columns {
            let name = varint::read_str(&mut self.input)?;
            let type_name = varint::read_str(&mut self.input)?;
            let data_type = DataType::parse(&type_name)?;
            let column = Column::deserialize_rows(&data_type, rows, &mut self.input)?;
            block.insert(ColumnWithTypeAndName { name, data_type, column });
        }
        block.check_sizes()?;
        Ok(Some(block))
    }

    /// A varuint whose very first byte hits EOF means the stream ended
    /// between blocks; EOF anywhere else is corruption.
    fn try_read_varuint(&mut self) -> Result<Option<u64>> {
        let mut first = [0u8; 1];
        match self.input.read(&mut first)? {
            0 => return Ok(None),
            _ => {}
        }
        let mut value = (first[0] & 0x7f) as u64;
        let mut shift = 7u32;
        let mut more = first[0] & 0x80 != 0;
        while more {
            let mut byte = [0u8; 1];
            self.input.read_exact(&mut byte)?;
            value |= ((byte[0] & 0x7f) as u64) << shift;
            shift += 7;
            more = byte[0] & 0x80 != 0;
        }
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Value;
    use std::io::Cursor;

    fn sample_block() -> Block {
        let mut strings = Column::new(&DataType::String).unwrap();
        for s in ["one", "two", "three"] {
            strings.push_value(&Value::Bytes(s.as_bytes().to_vec())).unwrap();
        }
        let mut arrays = Column::new(&DataType::Array(Box::new(DataType::UInt16))).unwrap();
        arrays.push_value(&Value::Array(vec![Value::UInt64(1)])).unwrap();
        arrays.push_value(&Value::Array(vec![])).unwrap();
        arrays
            .push_value(&Value::Array(vec![Value::UInt64(2), Value::UInt64(3)]))
            .unwrap();

        Block::with_columns(vec![
            ColumnWithTypeAndName::new("n", DataType::UInt64, Column::UInt64(vec![10, 20, 30])),
            ColumnWithTypeAndName::new("s", DataType::String, strings),
            ColumnWithTypeAndName::new("a", DataType::Array(Box::new(DataType::UInt16)), arrays),
        ])
        .unwrap()
    }

    #[test]
    fn test_block_roundtrip() {
        let block = sample_block();
        let mut writer = NativeBlockWriter::new(Vec::new());
        writer.write(&block).unwrap();
        let buf = writer.into_inner();

        let mut reader = NativeBlockReader::new(Cursor::new(buf));
        let back = reader.read().unwrap().expect("one block");
        assert_eq!(back.rows(), 3);
        assert_eq!(back.columns(), 3);
        for (a, b) in back.iter().zip(block.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.data_type, b.data_type);
            for i in 0..3 {
                assert_eq!(a.column.get(i), b.column.get(i));
            }
        }
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn test_multiple_blocks_stream() {
        let block = sample_block();
        let mut writer = NativeBlockWriter::new(Vec::new());
        writer.write(&block).unwrap();
        writer.write(&block).unwrap();
        let mut reader = NativeBlockReader::new(Cursor::new(writer.into_inner()));
        assert!(reader.read().unwrap().is_some());
        assert!(reader.read().unwrap().is_some());
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn test_truncated_stream_is_corruption() {
        let block = sample_block();
        let mut writer = NativeBlockWriter::new(Vec::new());
        writer.write(&block).unwrap();
        let mut buf = writer.into_inner();
        buf.truncate(buf.len() / 2);
        let mut reader = NativeBlockReader::new(Cursor::new(buf));
        assert!(reader.read().is_err());
    }
}
