//! Reading blocks out of parts.
//!
//! `PartRangeStream` reads one part's mark ranges for a column set,
//! granule by granule, with the PREWHERE split: the filter columns of a
//! granule are read and evaluated first, and the remaining columns are
//! only read when the granule has surviving rows.
//! `MergeTreeThreadStream` is the per-thread source that pulls tasks from
//! a [`ReadPool`].

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs::File;
use std::sync::Arc;

use crate::block::{Block, Column, ColumnWithTypeAndName, DataType};
use crate::error::{Error, Result};
use crate::expr::{cast_column, Expression};
use crate::io::compressed::CompressedReader;
use crate::mergetree::index::MarkRange;
use crate::mergetree::part::DataPart;
use crate::mergetree::read_pool;
use crate::stream::{BlockStream, CancelFlag};

struct ColumnFileReader {
    data_type: DataType,
    marks: Vec<(u64, u64)>,
    reader: CompressedReader<File>,
}

impl ColumnFileReader {
    fn open(part: &DataPart, name: &str, data_type: &DataType) -> Result<ColumnFileReader> {
        let marks = part.load_marks(name)?;
        let file = File::open(part.bin_file(name))?;
        Ok(ColumnFileReader { data_type: data_type.clone(), marks, reader: CompressedReader::new(file) })
    }

    fn read_granule(&mut self, mark: usize, rows: usize) -> Result<Column> {
        let (compressed, decompressed) = *self
            .marks
            .get(mark)
            .ok_or_else(|| Error::Corruption(format!("mark {mark} out of range")))?;
        self.reader.seek_to(compressed, decompressed)?;
        Column::deserialize_rows(&self.data_type, rows, &mut self.reader)
    }
}

/// Reads `[begin_mark, end_mark)` ranges of one part for a column set.
pub struct PartRangeStream {
    part: Arc<DataPart>,
    ranges: VecDeque<MarkRange>,
    columns: Vec<(String, DataType)>,
    pre_columns: Vec<(String, DataType)>,
    prewhere: Option<Arc<read_pool::PrewhereInfo>>,
    remove_prewhere_column: bool,
    ordered_names: Vec<String>,
    should_reorder: bool,
    granularity: usize,
    max_block_size: usize,
    /// DEFAULT expressions for columns a part predates.
    column_defaults: Arc<HashMap<String, Expression>>,
    readers: HashMap<String, ColumnFileReader>,
    cancelled: CancelFlag,
}

impl PartRangeStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        part: Arc<DataPart>,
        ranges: Vec<MarkRange>,
        columns: Vec<(String, DataType)>,
        granularity: usize,
        max_block_size: usize,
    ) -> Self {
        Self {
            part,
            ranges: ranges.into(),
            columns,
            pre_columns: Vec::new(),
            prewhere: None,
            remove_prewhere_column: false,
            ordered_names: Vec::new(),
            should_reorder: false,
            granularity: granularity.max(1),
            max_block_size: max_block_size.max(1),
            column_defaults: Arc::new(HashMap::new()),
            readers: HashMap::new(),
            cancelled: CancelFlag::new(),
        }
    }

    pub fn from_task(
        task: read_pool::ReadTask,
        prewhere: Option<Arc<read_pool::PrewhereInfo>>,
        column_defaults: Arc<HashMap<String, Expression>>,
        granularity: usize,
        max_block_size: usize,
    ) -> Self {
        Self {
            part: task.part,
            ranges: task.ranges.into(),
            columns: task.columns,
            pre_columns: task.pre_columns,
            prewhere,
            remove_prewhere_column: task.remove_prewhere_column,
            ordered_names: task.ordered_names,
            should_reorder: task.should_reorder,
            granularity: granularity.max(1),
            max_block_size: max_block_size.max(1),
            column_defaults,
            readers: HashMap::new(),
            cancelled: CancelFlag::new(),
        }
    }

    fn rows_at_mark(&self, mark: usize) -> usize {
        let before = mark * self.granularity;
        self.granularity.min(self.part.rows.saturating_sub(before))
    }

    /// Reads one granule of the given columns. Columns the part predates
    /// are filled afterwards from their DEFAULT expression, or with the
    /// type's default value.
    fn read_columns(
        part: &DataPart,
        readers: &mut HashMap<String, ColumnFileReader>,
        column_defaults: &HashMap<String, Expression>,
        columns: &[(String, DataType)],
        mark: usize,
        rows: usize,
    ) -> Result<Block> {
        let mut block = Block::new();
        let mut missing: Vec<&(String, DataType)> = Vec::new();
        for column in columns {
            let (name, data_type) = column;
            if !part.has_column_files(name) {
                missing.push(column);
                continue;
            }
            if !readers.contains_key(name) {
                readers.insert(name.clone(), ColumnFileReader::open(part, name, data_type)?);
            }
            let reader = readers
                .get_mut(name)
                .ok_or_else(|| Error::Logical("column reader vanished".into()))?;
            let column = reader.read_granule(mark, rows)?;
            block.insert(ColumnWithTypeAndName::new(name.clone(), data_type.clone(), column));
        }
        for (name, data_type) in missing {
            let column = match column_defaults.get(name) {
                Some(expression) => {
                    let evaluated = expression.evaluate(&block)?;
                    cast_column(&evaluated.column.materialize()?, data_type)?
                }
                None => {
                    let mut column = Column::new(data_type)?;
                    for _ in 0..rows {
                        column.push_default();
                    }
                    column
                }
            };
            block.insert(ColumnWithTypeAndName::new(name.clone(), data_type.clone(), column));
        }
        Ok(block)
    }

    /// Reads one granule, applying PREWHERE. None means every row of the
    /// granule was filtered out.
    fn read_granule(&mut self, mark: usize) -> Result<Option<Block>> {
        let rows = self.rows_at_mark(mark);
        if rows == 0 {
            return Ok(None);
        }
        let _read_guard = self
            .part
            .columns_lock
            .read()
            .map_err(|e| Error::IO(e.to_string()))?;

        let Some(prewhere) = self.prewhere.clone() else {
            let block = Self::read_columns(
                &self.part,
                &mut self.readers,
                &self.column_defaults,
                &self.columns,
                mark,
                rows,
            )?;
            block.check_sizes()?;
            return Ok(Some(block));
        };

        let mut pre_block = Self::read_columns(
            &self.part,
            &mut self.readers,
            &self.column_defaults,
            &self.pre_columns,
            mark,
            rows,
        )?;
        prewhere.actions.execute(&mut pre_block)?;
        let mask = match pre_block.by_name(&prewhere.column_name)?.column.materialize()? {
            Column::UInt8(mask) => mask,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "PREWHERE column {} must be UInt8, got {}",
                    prewhere.column_name,
                    other.data_type()
                )))
            }
        };
        // A fully filtered granule: the remaining columns are never read.
        if mask.iter().all(|&m| m == 0) {
            return Ok(None);
        }

        let post_block = Self::read_columns(
            &self.part,
            &mut self.readers,
            &self.column_defaults,
            &self.columns,
            mark,
            rows,
        )?;
        let mut block = pre_block;
        for column in post_block.iter() {
            block.insert(column.clone());
        }
        let mut block = block.filter(&mask)?;
        if self.remove_prewhere_column {
            if let Ok(position) = block.position_by_name(&prewhere.column_name) {
                block.erase(position)?;
            }
        }
        block.check_sizes()?;
        Ok(Some(block))
    }
}

impl BlockStream for PartRangeStream {
    fn name(&self) -> &'static str {
        "MergeTreePartRange"
    }

    fn read(&mut self) -> Result<Block> {
        let mut out: Option<Block> = None;
        let mut rows_read = 0usize;
        while rows_read < self.max_block_size {
            if self.cancelled.get() {
                return Ok(Block::new());
            }
            let Some(range) = self.ranges.front_mut() else { break };
            if range.begin == range.end {
                self.ranges.pop_front();
                continue;
            }
            let mark = range.begin;
            range.begin += 1;

            if let Some(granule) = self.read_granule(mark)? {
                rows_read += granule.rows();
                match &mut out {
                    None => out = Some(granule),
                    Some(block) => block.append_rows(&granule, 0, granule.rows())?,
                }
            }
        }
        let Some(block) = out else { return Ok(Block::new()) };
        if self.should_reorder && !self.ordered_names.is_empty() {
            let present: Vec<String> = self
                .ordered_names
                .iter()
                .filter(|n| block.has_column(n))
                .cloned()
                .collect();
            if !present.is_empty() {
                return block.sort_columns(&present);
            }
        }
        Ok(block)
    }

    fn cancel(&self) {
        self.cancelled.set();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// One worker thread's source: takes tasks from the pool until the pool
/// runs dry, optionally stealing other threads' shares.
pub struct MergeTreeThreadStream {
    pool: Arc<read_pool::ReadPool>,
    thread: usize,
    min_marks_to_read: usize,
    prewhere: Option<Arc<read_pool::PrewhereInfo>>,
    column_defaults: Arc<HashMap<String, Expression>>,
    granularity: usize,
    max_block_size: usize,
    current: Option<PartRangeStream>,
    cancelled: CancelFlag,
}

impl MergeTreeThreadStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<read_pool::ReadPool>,
        thread: usize,
        min_marks_to_read: usize,
        prewhere: Option<Arc<read_pool::PrewhereInfo>>,
        column_defaults: Arc<HashMap<String, Expression>>,
        granularity: usize,
        max_block_size: usize,
    ) -> Self {
        Self {
            pool,
            thread,
            min_marks_to_read: min_marks_to_read.max(1),
            prewhere,
            column_defaults,
            granularity,
            max_block_size,
            current: None,
            cancelled: CancelFlag::new(),
        }
    }
}

impl BlockStream for MergeTreeThreadStream {
    fn name(&self) -> &'static str {
        "MergeTreeThread"
    }

    fn read(&mut self) -> Result<Block> {
        loop {
            if self.cancelled.get() {
                return Ok(Block::new());
            }
            if self.current.is_none() {
                match self.pool.get_task(self.min_marks_to_read, self.thread)? {
                    Some(task) => {
                        self.current = Some(PartRangeStream::from_task(
                            task,
                            self.prewhere.clone(),
                            self.column_defaults.clone(),
                            self.granularity,
                            self.max_block_size,
                        ));
                    }
                    None => return Ok(Block::new()),
                }
            }
            let stream = match &mut self.current {
                Some(s) => s,
                None => return Err(Error::Logical("reader stream vanished".into())),
            };
            let block = stream.read()?;
            if block.is_empty() {
                self.current = None;
                continue;
            }
            return Ok(block);
        }
    }

    fn cancel(&self) {
        self.cancelled.set();
        if let Some(current) = &self.current {
            current.cancel();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}
