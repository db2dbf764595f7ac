//! The write path: blocks in, immutable sorted parts out.
//!
//! An incoming block is split by the date column into per-month
//! sub-blocks. Each sub-block is stably sorted by the primary key and
//! written into a `tmp_`-prefixed part directory: per-column `.bin`/`.mrk`
//! pairs, the sparse `primary.idx`, `columns.txt` and `checksums.txt`.
//! The caller then renames the directory into its final name and installs
//! the part into the working set.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};

use crate::block::types::month_of_days;
use crate::block::{Block, Column, DataType, Value};
use crate::error::{Error, Result};
use crate::io::checksum::{siphash128, Hash128};
use crate::io::compressed::CompressedWriter;
use crate::mergetree::checksums::Checksums;
use crate::mergetree::part::{columns_to_text, escape_for_file_name, DataPart, PartInfo};
use crate::mergetree::MergeTreeData;
use crate::stream::sort::{sort_block, SortColumnDescription};

pub(crate) struct ColumnFileWriter {
    escaped_name: String,
    suffix: String,
    writer: CompressedWriter<BufWriter<File>>,
    marks: Vec<(u64, u64)>,
    uncompressed_size: u64,
    uncompressed_hash: Hash128,
}

impl ColumnFileWriter {
    pub(crate) fn open(dir: &Path, name: &str, max_block: usize) -> Result<ColumnFileWriter> {
        Self::open_with_suffix(dir, name, "", max_block)
    }

    /// Opens with a file-name suffix, used by ALTER to stage `.tmp` files
    /// next to the live ones.
    pub(crate) fn open_with_suffix(
        dir: &Path,
        name: &str,
        suffix: &str,
        max_block: usize,
    ) -> Result<ColumnFileWriter> {
        let escaped_name = escape_for_file_name(name);
        let file = File::create(dir.join(format!("{escaped_name}.bin{suffix}")))?;
        Ok(ColumnFileWriter {
            escaped_name,
            suffix: suffix.to_string(),
            writer: CompressedWriter::new(BufWriter::new(file), max_block),
            marks: Vec::new(),
            uncompressed_size: 0,
            uncompressed_hash: Hash128::new(),
        })
    }

    pub(crate) fn mark(&mut self, min_block: usize) -> Result<()> {
        let mark = self.writer.mark(min_block)?;
        self.marks.push(mark);
        Ok(())
    }

    pub(crate) fn write_rows(&mut self, column: &Column, offset: usize, len: usize) -> Result<()> {
        let mut buf = Vec::new();
        column.serialize_rows(offset, len, &mut buf)?;
        self.uncompressed_hash.update(&buf);
        self.uncompressed_size += buf.len() as u64;
        self.writer.write_all(&buf)?;
        Ok(())
    }

    /// Finishes the bin file and writes the marks file. Returns
    /// (uncompressed_size, uncompressed_hash).
    pub(crate) fn finish(mut self, dir: &Path) -> Result<(String, u64, u128)> {
        self.writer.finish()?;
        let mut mrk = BufWriter::new(File::create(
            dir.join(format!("{}.mrk{}", self.escaped_name, self.suffix)),
        )?);
        for (compressed, decompressed) in &self.marks {
            mrk.write_u64::<BigEndian>(*compressed)?;
            mrk.write_u64::<BigEndian>(*decompressed)?;
        }
        mrk.flush()?;
        Ok((self.escaped_name, self.uncompressed_size, self.uncompressed_hash.finish()))
    }
}

/// Accumulates sorted blocks into one on-disk part directory.
pub struct PartBuilder {
    dir: PathBuf,
    granularity: usize,
    min_compress_block_size: usize,
    key_names: Vec<String>,
    columns: Vec<(String, DataType)>,
    writers: Vec<ColumnFileWriter>,
    index: Vec<Value>,
    rows_written: usize,
    rows_in_granule: usize,
    marks_count: usize,
}

impl PartBuilder {
    pub fn new(
        dir: PathBuf,
        columns: Vec<(String, DataType)>,
        key_names: Vec<String>,
        granularity: usize,
        min_compress_block_size: usize,
        max_compress_block_size: usize,
    ) -> Result<PartBuilder> {
        std::fs::create_dir_all(&dir)?;
        let mut writers = Vec::with_capacity(columns.len());
        for (name, _) in &columns {
            writers.push(ColumnFileWriter::open(&dir, name, max_compress_block_size)?);
        }
        Ok(PartBuilder {
            dir,
            granularity: granularity.max(1),
            min_compress_block_size,
            key_names,
            columns,
            writers,
            index: Vec::new(),
            rows_written: 0,
            rows_in_granule: 0,
            marks_count: 0,
        })
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Appends one block, already sorted by the primary key.
    pub fn write_block(&mut self, block: &Block) -> Result<()> {
        block.check_sizes()?;
        let rows = block.rows();
        // Resolve this block's column positions against the part layout.
        let mut positions = Vec::with_capacity(self.columns.len());
        for (name, _) in &self.columns {
            positions.push(block.position_by_name(name)?);
        }
        let key_positions: Vec<usize> = self
            .key_names
            .iter()
            .map(|name| block.position_by_name(name))
            .collect::<Result<_>>()?;

        let mut offset = 0usize;
        while offset < rows {
            if self.rows_in_granule == 0 {
                // A new granule: one index entry, one mark per column.
                for &key in &key_positions {
                    self.index.push(block.at(key).column.get(offset));
                }
                for writer in self.writers.iter_mut() {
                    writer.mark(self.min_compress_block_size)?;
                }
                self.marks_count += 1;
            }
            let take = (self.granularity - self.rows_in_granule).min(rows - offset);
            for (writer, &position) in self.writers.iter_mut().zip(positions.iter()) {
                writer.write_rows(&block.at(position).column, offset, take)?;
            }
            self.rows_in_granule = (self.rows_in_granule + take) % self.granularity;
            offset += take;
            self.rows_written += take;
        }
        Ok(())
    }

    /// Flushes everything and writes the metadata files. Returns the
    /// checksums, the index, and the mark count.
    pub fn finish(self) -> Result<(Checksums, Vec<Value>, usize, usize)> {
        let mut checksums = Checksums::default();
        let dir = self.dir.clone();

        for writer in self.writers {
            let (escaped, uncompressed_size, uncompressed_hash) = writer.finish(&dir)?;
            let bin_name = format!("{escaped}.bin");
            let (size, hash) = file_size_and_hash(&dir.join(&bin_name))?;
            checksums.add_compressed(bin_name, size, hash, uncompressed_size, uncompressed_hash);
            let mrk_name = format!("{escaped}.mrk");
            let (size, hash) = file_size_and_hash(&dir.join(&mrk_name))?;
            checksums.add_file(mrk_name, size, hash);
        }

        let mut index_bytes = Vec::new();
        let key_size = self.key_names.len();
        let key_types: Vec<DataType> = self
            .key_names
            .iter()
            .map(|name| {
                self.columns
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, t)| t.clone())
                    .ok_or_else(|| Error::Logical(format!("key column {name} missing from part layout")))
            })
            .collect::<Result<_>>()?;
        for (i, value) in self.index.iter().enumerate() {
            key_types[i % key_size.max(1)].serialize_value(value, &mut index_bytes)?;
        }
        std::fs::write(dir.join("primary.idx"), &index_bytes)?;
        checksums.add_file("primary.idx", index_bytes.len() as u64, siphash128(&index_bytes));

        let columns_text = columns_to_text(&self.columns);
        std::fs::write(dir.join("columns.txt"), &columns_text)?;
        checksums.add_file(
            "columns.txt",
            columns_text.len() as u64,
            siphash128(columns_text.as_bytes()),
        );

        std::fs::write(dir.join("checksums.txt"), checksums.to_text())?;

        Ok((checksums, self.index, self.marks_count, self.rows_written))
    }
}

pub(crate) fn file_size_and_hash(path: &Path) -> Result<(u64, u128)> {
    let mut file = File::open(path)?;
    let mut hash = Hash128::new();
    let mut size = 0u64;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hash.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hash.finish()))
}

/// Writes incoming blocks as new parts of a table.
pub struct MergeTreeWriter {
    data: Arc<MergeTreeData>,
}

impl MergeTreeWriter {
    pub fn new(data: Arc<MergeTreeData>) -> Self {
        Self { data }
    }

    /// Splits the block by month and writes one part per month. Returns
    /// the freshly installed parts.
    pub fn write(&self, block: &Block) -> Result<Vec<Arc<DataPart>>> {
        block.check_sizes()?;
        self.data.delay_insert_if_needed()?;
        let block = block.materialize()?;

        let date_position = block.position_by_name(self.data.date_column())?;
        let dates = match &block.at(date_position).column {
            Column::Date(values) => values.clone(),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "date column {} must be Date, got {}",
                    self.data.date_column(),
                    other.data_type()
                )))
            }
        };

        // Month buckets in deterministic order.
        let mut month_masks: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        for (i, &days) in dates.iter().enumerate() {
            let month = month_of_days(days);
            let mask = month_masks
                .entry(month)
                .or_insert_with(|| vec![0u8; block.rows()]);
            mask[i] = 1;
        }

        let mut parts = Vec::with_capacity(month_masks.len());
        for (_, mask) in month_masks {
            let sub_block = block.filter(&mask)?;
            let part = self.write_temp_part(&sub_block)?;
            let part = self.data.rename_temp_part_and_add(part, None)?;
            parts.push(part);
        }
        Ok(parts)
    }

    /// Writes one single-month sub-block into a temporary part directory.
    pub fn write_temp_part(&self, block: &Block) -> Result<DataPart> {
        let description: Vec<SortColumnDescription> = self
            .data
            .primary_key()
            .iter()
            .map(SortColumnDescription::asc)
            .collect();
        let sorted = sort_block(block, &description, 0)?;

        let (min_date, max_date) = match sorted.by_name(self.data.date_column())?.column.extremes() {
            (Value::UInt64(min), Value::UInt64(max)) => (min as u16, max as u16),
            _ => return Err(Error::Logical("date column extremes are not numeric".into())),
        };

        let id = self.data.next_part_id();
        let info = PartInfo { min_date, max_date, min_id: id, max_id: id, level: 0 };
        let columns: Vec<(String, DataType)> =
            sorted.iter().map(|c| (c.name.clone(), c.data_type.clone())).collect();

        let tmp_dir = self.data.path().join(format!("tmp_{}", info.name()));
        let mut builder = PartBuilder::new(
            tmp_dir,
            columns.clone(),
            self.data.primary_key().to_vec(),
            self.data.config.index_granularity,
            self.data.config.min_compress_block_size,
            self.data.config.max_compress_block_size,
        )?;
        builder.write_block(&sorted)?;
        let (checksums, index, marks_count, rows) = builder.finish()?;

        let tmp_path = self.data.path().join(format!("tmp_{}", info.name()));
        let bytes = DataPart::calc_total_size(&tmp_path)?;
        tracing::debug!(part = %info.name(), rows, bytes, "wrote temporary part");

        Ok(DataPart::new_temporary(
            info,
            self.data.path().to_path_buf(),
            marks_count,
            rows,
            bytes,
            index,
            checksums,
            columns,
        ))
    }
}
