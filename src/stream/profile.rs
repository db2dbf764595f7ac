//! Execution profiling, progress propagation, limits and quotas.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::block::{Block, ColumnWithTypeAndName, Value};
use crate::config::{Limits, OverflowMode};
use crate::error::{Error, Result};
use crate::io::varint;
use crate::stream::{BlockStream, CancelFlag};

/// Per-stream accounting: rows, blocks, bytes and wall time.
#[derive(Clone, Debug, Default)]
pub struct ProfileInfo {
    pub rows: usize,
    pub blocks: usize,
    pub bytes: usize,
    pub total: Duration,
    pub applied_limit: bool,
    pub rows_before_limit: usize,
}

impl ProfileInfo {
    pub fn update(&mut self, block: &Block) {
        self.rows += block.rows();
        self.blocks += 1;
        self.bytes += block.bytes();
    }

    /// Binary form, sent alongside result streams.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        varint::write_varuint(w, self.rows as u64)?;
        varint::write_varuint(w, self.blocks as u64)?;
        varint::write_varuint(w, self.bytes as u64)?;
        w.write_all(&[self.applied_limit as u8])?;
        varint::write_varuint(w, self.rows_before_limit as u64)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<ProfileInfo> {
        let rows = varint::read_varuint(r)? as usize;
        let blocks = varint::read_varuint(r)? as usize;
        let bytes = varint::read_varuint(r)? as usize;
        let mut flag = [0u8; 1];
        r.read_exact(&mut flag)?;
        let rows_before_limit = varint::read_varuint(r)? as usize;
        Ok(ProfileInfo {
            rows,
            blocks,
            bytes,
            total: Duration::ZERO,
            applied_limit: flag[0] != 0,
            rows_before_limit,
        })
    }
}

struct QuotaUsage {
    interval_start: Instant,
    rows: usize,
    bytes: usize,
    errors: usize,
}

/// Resource quota tracked per time interval. Exceeding any bound raises.
pub struct Quota {
    interval: Duration,
    max_rows: usize,
    max_bytes: usize,
    max_errors: usize,
    usage: Mutex<QuotaUsage>,
}

impl Quota {
    pub fn new(interval: Duration, max_rows: usize, max_bytes: usize, max_errors: usize) -> Self {
        Self {
            interval,
            max_rows,
            max_bytes,
            max_errors,
            usage: Mutex::new(QuotaUsage {
                interval_start: Instant::now(),
                rows: 0,
                bytes: 0,
                errors: 0,
            }),
        }
    }

    fn refreshed(&self, usage: &mut QuotaUsage) {
        if !self.interval.is_zero() && usage.interval_start.elapsed() >= self.interval {
            usage.interval_start = Instant::now();
            usage.rows = 0;
            usage.bytes = 0;
            usage.errors = 0;
        }
    }

    pub fn add_progress(&self, rows: usize, bytes: usize) -> Result<()> {
        let mut usage = self.usage.lock()?;
        self.refreshed(&mut usage);
        usage.rows += rows;
        usage.bytes += bytes;
        if self.max_rows != 0 && usage.rows > self.max_rows {
            return Err(Error::LimitExceeded(format!(
                "quota exceeded: {} rows in interval, maximum {}",
                usage.rows, self.max_rows
            )));
        }
        if self.max_bytes != 0 && usage.bytes > self.max_bytes {
            return Err(Error::LimitExceeded(format!(
                "quota exceeded: {} bytes in interval, maximum {}",
                usage.bytes, self.max_bytes
            )));
        }
        Ok(())
    }

    pub fn add_error(&self) -> Result<()> {
        let mut usage = self.usage.lock()?;
        self.refreshed(&mut usage);
        usage.errors += 1;
        if self.max_errors != 0 && usage.errors > self.max_errors {
            return Err(Error::LimitExceeded(format!(
                "quota exceeded: {} errors in interval, maximum {}",
                usage.errors, self.max_errors
            )));
        }
        Ok(())
    }
}

/// Progress callback invoked at leaf streams with (rows, bytes) of each
/// block read from storage.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Per-query accumulator fed by every leaf stream. Enforces the limits
/// that only make sense against query-wide totals.
pub struct QueryProcess {
    start: Instant,
    rows: AtomicUsize,
    bytes: AtomicUsize,
    killed: AtomicBool,
    limits: Limits,
    quota: Option<Arc<Quota>>,
}

impl QueryProcess {
    pub fn new(limits: Limits, quota: Option<Arc<Quota>>) -> Self {
        Self {
            start: Instant::now(),
            rows: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            killed: AtomicBool::new(false),
            limits,
            quota,
        }
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn total_rows(&self) -> usize {
        self.rows.load(Ordering::SeqCst)
    }

    pub fn total_bytes(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Accounts for one block of leaf progress. Returns false when reading
    /// should stop quietly (break overflow modes).
    pub fn progress(&self, rows: usize, bytes: usize) -> Result<bool> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let total_rows = self.rows.fetch_add(rows, Ordering::SeqCst) + rows;
        let total_bytes = self.bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;

        if self.limits.max_rows_to_read != 0 && total_rows > self.limits.max_rows_to_read
            || self.limits.max_bytes_to_read != 0 && total_bytes > self.limits.max_bytes_to_read
        {
            match self.limits.read_overflow_mode {
                OverflowMode::Throw => {
                    return Err(Error::LimitExceeded(format!(
                        "too much data to read: {total_rows} rows, {total_bytes} bytes"
                    )))
                }
                _ => return Ok(false),
            }
        }

        let elapsed = self.start.elapsed();
        if !self.limits.max_execution_time.is_zero() && elapsed > self.limits.max_execution_time {
            match self.limits.timeout_overflow_mode {
                OverflowMode::Throw => {
                    return Err(Error::LimitExceeded(format!(
                        "query ran for {:.3}s, maximum {:.3}s",
                        elapsed.as_secs_f64(),
                        self.limits.max_execution_time.as_secs_f64()
                    )))
                }
                _ => return Ok(false),
            }
        }

        if self.limits.min_execution_speed != 0
            && elapsed > self.limits.timeout_before_checking_execution_speed
            && !elapsed.is_zero()
        {
            let speed = total_rows as f64 / elapsed.as_secs_f64();
            if speed < self.limits.min_execution_speed as f64 {
                return Err(Error::LimitExceeded(format!(
                    "query is too slow: {speed:.0} rows/sec, minimum {}",
                    self.limits.min_execution_speed
                )));
            }
        }

        if let Some(quota) = &self.quota {
            quota.add_progress(rows, bytes)?;
        }
        Ok(true)
    }
}

/// Running per-column minimum and maximum of everything that streamed by.
#[derive(Default)]
struct Extremes {
    columns: Vec<(String, crate::block::DataType, Value, Value)>,
}

impl Extremes {
    fn update(&mut self, block: &Block) {
        if self.columns.is_empty() {
            for c in block.iter() {
                let (min, max) = c.column.extremes();
                self.columns.push((c.name.clone(), c.data_type.clone(), min, max));
            }
            return;
        }
        for (slot, c) in self.columns.iter_mut().zip(block.iter()) {
            let (min, max) = c.column.extremes();
            if min < slot.2 {
                slot.2 = min;
            }
            if max > slot.3 {
                slot.3 = max;
            }
        }
    }

    /// Two-row block: minimums first, maximums second.
    fn to_block(&self) -> Result<Block> {
        let mut block = Block::new();
        for (name, data_type, min, max) in &self.columns {
            let mut column = crate::block::Column::new(data_type)?;
            column.push_value(min)?;
            column.push_value(max)?;
            block.insert(ColumnWithTypeAndName::new(name.clone(), data_type.clone(), column));
        }
        Ok(block)
    }
}

/// Wraps any stream with profiling, progress propagation, limit and quota
/// enforcement, and optional extremes calculation.
pub struct ProfilingStream {
    inner: Box<dyn BlockStream>,
    pub info: ProfileInfo,
    /// Leaves report progress; inner wrappers only account.
    leaf: bool,
    progress_callback: Option<ProgressCallback>,
    process: Option<Arc<QueryProcess>>,
    enabled_extremes: bool,
    extremes: Extremes,
    cancelled: CancelFlag,
    done: bool,
}

impl ProfilingStream {
    pub fn new(inner: Box<dyn BlockStream>) -> Self {
        Self {
            inner,
            info: ProfileInfo::default(),
            leaf: false,
            progress_callback: None,
            process: None,
            enabled_extremes: false,
            extremes: Extremes::default(),
            cancelled: CancelFlag::new(),
            done: false,
        }
    }

    /// Marks this wrapper as sitting over a leaf source: its blocks count
    /// as query progress.
    pub fn leaf(mut self) -> Self {
        self.leaf = true;
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn with_process(mut self, process: Arc<QueryProcess>) -> Self {
        self.process = Some(process);
        self
    }

    pub fn enable_extremes(mut self) -> Self {
        self.enabled_extremes = true;
        self
    }

    /// Two-row min/max block of everything read so far, if enabled.
    pub fn extremes_block(&self) -> Result<Option<Block>> {
        if !self.enabled_extremes || self.extremes.columns.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.extremes.to_block()?))
    }
}

impl BlockStream for ProfilingStream {
    fn name(&self) -> &'static str {
        "Profiling"
    }

    fn read(&mut self) -> Result<Block> {
        if self.done || self.cancelled.get() {
            return Ok(Block::new());
        }
        let started = Instant::now();
        let block = self.inner.read()?;
        self.info.total += started.elapsed();
        if block.is_empty() {
            self.done = true;
            return Ok(block);
        }

        self.info.update(&block);
        if self.enabled_extremes {
            self.extremes.update(&block);
        }

        if self.leaf {
            let (rows, bytes) = (block.rows(), block.bytes());
            if let Some(callback) = &self.progress_callback {
                callback(rows, bytes);
            }
            if let Some(process) = &self.process {
                if !process.progress(rows, bytes)? {
                    // Soft stop: the query hit a break-mode limit.
                    self.inner.cancel();
                    self.done = true;
                    return Ok(Block::new());
                }
            }
        }
        Ok(block)
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
