//! The MergeTree storage engine.
//!
//! A table is a set of sorted, date-partitioned immutable parts. Inserts
//! sort and write new parts; background merges combine adjacent parts of
//! one month into bigger ones; reads select mark ranges through the sparse
//! primary index and fan them out over worker threads.
//!
//! The working state is two part sets: `data_parts` holds the active parts
//! a query reads, `all_data_parts` additionally keeps recently merged
//! parts until their retention expires and no reader holds them.

pub mod alter;
pub mod checksums;
pub mod index;
pub mod merge_task;
pub mod merger;
pub mod part;
pub mod read_pool;
pub mod reader;
pub mod writer;

pub use alter::{AlterCommand, AlterDataPartTransaction};
pub use index::{KeyCondition, KeyRangeCondition, MarkRange, Unfiltered};
pub use merger::Merger;
pub use part::{DataPart, PartInfo};
pub use read_pool::{PrewhereInfo, RangesInDataPart, ReadPool, ReadTask};
pub use reader::{MergeTreeThreadStream, PartRangeStream};
pub use writer::MergeTreeWriter;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::block::DataType;
use crate::config::{MergeTreeConfig, Settings};
use crate::error::{Error, Result};
use crate::expr::Expression;
use crate::stream::BlockStream;

/// What a merge does with rows sharing one primary key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Plain merge sort.
    Ordinary,
    /// Pairs of rows with opposite signs cancel.
    Collapsing,
    /// Non-key numeric columns are summed.
    Summing,
    /// Aggregate-state columns are merged through their functions.
    Aggregating,
}

/// Invoked with a part name when its data fails validation. Can be wired
/// to request a replacement from a peer.
pub type BrokenPartCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Static description of a table: columns, partitioning and merge mode.
pub struct TableDefinition {
    pub columns: Vec<(String, DataType)>,
    pub date_column: String,
    pub primary_key: Vec<String>,
    pub mode: Mode,
    pub sign_column: Option<String>,
    pub column_defaults: HashMap<String, Expression>,
    /// Require checksums.txt and columns.txt in every part.
    pub require_part_metadata: bool,
}

impl TableDefinition {
    pub fn new(
        columns: Vec<(String, DataType)>,
        date_column: impl Into<String>,
        primary_key: Vec<String>,
    ) -> Self {
        Self {
            columns,
            date_column: date_column.into(),
            primary_key,
            mode: Mode::Ordinary,
            sign_column: None,
            column_defaults: HashMap::new(),
            require_part_metadata: true,
        }
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn sign_column(mut self, name: impl Into<String>) -> Self {
        self.sign_column = Some(name.into());
        self
    }

    pub fn column_default(mut self, name: impl Into<String>, expression: Expression) -> Self {
        self.column_defaults.insert(name.into(), expression);
        self
    }
}

pub struct MergeTreeData {
    path: PathBuf,
    columns: RwLock<Vec<(String, DataType)>>,
    date_column: String,
    primary_key: Vec<String>,
    column_defaults: HashMap<String, Expression>,
    pub mode: Mode,
    pub sign_column: Option<String>,
    pub config: MergeTreeConfig,
    require_part_metadata: bool,

    data_parts: Mutex<BTreeSet<Arc<DataPart>>>,
    all_data_parts: Mutex<BTreeSet<Arc<DataPart>>>,
    /// Shared for reads and writes, exclusive for ALTER.
    structure_lock: RwLock<()>,
    increment: AtomicU64,
    broken_part_callback: Option<BrokenPartCallback>,
    log_name: String,
}

impl MergeTreeData {
    /// Attaches a table at the given path, loading existing parts and
    /// reclaiming temporary directories left by a crash.
    pub fn open(
        path: impl Into<PathBuf>,
        definition: TableDefinition,
        config: MergeTreeConfig,
    ) -> Result<Arc<MergeTreeData>> {
        Self::open_with_callback(path, definition, config, None)
    }

    pub fn open_with_callback(
        path: impl Into<PathBuf>,
        definition: TableDefinition,
        config: MergeTreeConfig,
        broken_part_callback: Option<BrokenPartCallback>,
    ) -> Result<Arc<MergeTreeData>> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;
        for key in &definition.primary_key {
            if !definition.columns.iter().any(|(n, _)| n == key) {
                return Err(Error::InvalidArgument(format!("primary key column {key} is not a table column")));
            }
        }
        let log_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mergetree".into());

        let data = Arc::new(MergeTreeData {
            path,
            columns: RwLock::new(definition.columns),
            date_column: definition.date_column,
            primary_key: definition.primary_key,
            column_defaults: definition.column_defaults,
            mode: definition.mode,
            sign_column: definition.sign_column,
            config,
            require_part_metadata: definition.require_part_metadata,
            data_parts: Mutex::new(BTreeSet::new()),
            all_data_parts: Mutex::new(BTreeSet::new()),
            structure_lock: RwLock::new(()),
            increment: AtomicU64::new(1),
            broken_part_callback,
            log_name,
        });
        data.load_data_parts()?;
        Ok(data)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    pub fn date_column(&self) -> &str {
        &self.date_column
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn column_defaults(&self) -> &HashMap<String, Expression> {
        &self.column_defaults
    }

    pub fn columns_list(&self) -> Vec<(String, DataType)> {
        self.columns.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_columns_list(&self, columns: Vec<(String, DataType)>) {
        *self.columns.write().unwrap_or_else(|e| e.into_inner()) = columns;
    }

    /// Allocates the id of the next part.
    pub fn next_part_id(&self) -> u64 {
        self.increment.fetch_add(1, Ordering::SeqCst)
    }

    pub fn lock_structure_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.structure_lock.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn lock_structure_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.structure_lock.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn report_broken_part(&self, name: &str) {
        tracing::error!(table = %self.log_name, part = name, "part is broken");
        if let Some(callback) = &self.broken_part_callback {
            callback(name);
        }
    }

    /// Scans the table directory: reclaims tmp directories, loads parts,
    /// deactivates the ones covered by merged successors.
    fn load_data_parts(&self) -> Result<()> {
        let mut loaded: Vec<Arc<DataPart>> = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("tmp") {
                tracing::info!(table = %self.log_name, dir = %name, "removing leftover temporary directory");
                if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                    tracing::warn!(dir = %name, error = %e, "failed to remove temporary directory");
                }
                continue;
            }
            if PartInfo::parse(&name).is_err() {
                // Detached and foreign directories are left alone.
                continue;
            }
            let columns = self.columns_list();
            match DataPart::load(
                &self.path,
                &name,
                &columns,
                &self.primary_key,
                &self.date_column,
                self.require_part_metadata,
            ) {
                Ok(part) => loaded.push(Arc::new(part)),
                Err(e) => {
                    tracing::error!(table = %self.log_name, part = %name, error = %e, "cannot load part");
                    self.report_broken_part(&name);
                }
            }
        }

        let max_id = loaded.iter().map(|p| p.info.max_id).max().unwrap_or(0);
        self.increment.store(max_id + 1, Ordering::SeqCst);

        let mut all = self.all_data_parts.lock()?;
        let mut active = self.data_parts.lock()?;
        for part in &loaded {
            all.insert(part.clone());
        }
        for part in &loaded {
            let covered = loaded
                .iter()
                .any(|other| other.info != part.info && other.info.contains(&part.info));
            if covered {
                part.set_remove_time_now();
            } else {
                active.insert(part.clone());
            }
        }
        tracing::info!(
            table = %self.log_name,
            parts = active.len(),
            total = all.len(),
            "loaded data parts"
        );
        Ok(())
    }

    /// Snapshot of the active parts, ordered by (month, id range).
    pub fn get_data_parts(&self) -> Vec<Arc<DataPart>> {
        self.data_parts
            .lock()
            .map(|parts| parts.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_all_data_parts(&self) -> Vec<Arc<DataPart>> {
        self.all_data_parts
            .lock()
            .map(|parts| parts.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The largest number of active parts in any single month.
    pub fn max_parts_count_for_month(&self) -> usize {
        let mut counts: HashMap<u32, usize> = HashMap::new();
        for part in self.get_data_parts() {
            *counts.entry(part.info.month()).or_default() += 1;
        }
        counts.values().copied().max().unwrap_or(0)
    }

    /// Insert backpressure: with parts_to_delay_insert + k active parts in
    /// one month, sleeps insert_delay_step^k milliseconds so merges can
    /// catch up. Reads are never throttled.
    pub fn delay_insert_if_needed(&self) -> Result<()> {
        let parts_count = self.max_parts_count_for_month();
        if parts_count <= self.config.parts_to_delay_insert {
            return Ok(());
        }
        let excess = (parts_count - self.config.parts_to_delay_insert) as i32;
        let delay_ms = self.config.insert_delay_step.powi(excess).min(60_000.0);
        tracing::info!(
            table = %self.log_name,
            parts = parts_count,
            delay_ms = delay_ms as u64,
            "too many parts, delaying insert"
        );
        std::thread::sleep(Duration::from_millis(delay_ms as u64));
        Ok(())
    }

    /// The active part with the given name, or one covering it. With
    /// `including_inactive`, exact matches among retained parts also count.
    pub fn get_containing_part(&self, part_name: &str, including_inactive: bool) -> Option<Arc<DataPart>> {
        let info = PartInfo::parse(part_name).ok()?;
        if including_inactive {
            let all = self.all_data_parts.lock().ok()?;
            if let Some(part) = all.iter().find(|p| p.info == info) {
                return Some(part.clone());
            }
        }
        let active = self.data_parts.lock().ok()?;
        active
            .iter()
            .find(|p| p.info == info || p.info.contains(&info))
            .cloned()
    }

    /// Renames a temporary part to its final name and adds it to the
    /// working set. The part must not overlap any existing part.
    pub fn rename_temp_part_and_add<'a>(
        &'a self,
        part: DataPart,
        out_transaction: Option<&mut Transaction<'a>>,
    ) -> Result<Arc<DataPart>> {
        let (part, replaced) = self.rename_temp_part_and_replace(part, out_transaction)?;
        if !replaced.is_empty() {
            return Err(Error::Logical(format!(
                "freshly inserted part {} unexpectedly covers {} existing parts",
                part.name(),
                replaced.len()
            )));
        }
        Ok(part)
    }

    /// Renames a temporary part to its final name and installs it,
    /// deactivating every part it covers. Returns the covered parts in
    /// ascending order.
    pub fn rename_temp_part_and_replace<'a>(
        &'a self,
        part: DataPart,
        out_transaction: Option<&mut Transaction<'a>>,
    ) -> Result<(Arc<DataPart>, Vec<Arc<DataPart>>)> {
        let mut active = self.data_parts.lock()?;
        let mut all = self.all_data_parts.lock()?;

        part.make_permanent()?;
        let part = Arc::new(part);

        let covered: Vec<Arc<DataPart>> = active
            .iter()
            .filter(|existing| part.info.contains(&existing.info))
            .cloned()
            .collect();
        for existing in &covered {
            active.remove(existing);
            existing.set_remove_time_now();
        }
        active.insert(part.clone());
        all.insert(part.clone());

        if let Some(transaction) = out_transaction {
            transaction.data = Some(self);
            transaction.added.push(part.clone());
            transaction.removed.extend(covered.iter().cloned());
        }
        tracing::debug!(
            table = %self.log_name,
            part = %part.name(),
            replaced = covered.len(),
            "added part to working set"
        );
        Ok((part, covered))
    }

    /// Removes `remove` from the active set and restores `add`. The undo
    /// primitive behind [`Transaction`].
    pub fn replace_parts(
        &self,
        remove: &[Arc<DataPart>],
        add: &[Arc<DataPart>],
        clear_without_timeout: bool,
    ) -> Result<()> {
        let mut active = self.data_parts.lock()?;
        for part in remove {
            active.remove(part);
            if clear_without_timeout {
                part.remove_time.store(0, Ordering::SeqCst);
            } else {
                part.set_remove_time_now();
            }
        }
        for part in add {
            active.insert(part.clone());
            part.remove_time.store(i64::MAX, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Takes the part out of the working set and renames its directory
    /// with the given prefix, e.g. "detached_".
    pub fn rename_and_detach_part(&self, part: &Arc<DataPart>, prefix: &str) -> Result<()> {
        let mut active = self.data_parts.lock()?;
        let mut all = self.all_data_parts.lock()?;
        active.remove(part);
        all.remove(part);
        part.rename_add_prefix(prefix)?;
        Ok(())
    }

    /// Physically deletes inactive parts whose retention elapsed and which
    /// no reader references. Returns the removed names.
    pub fn clear_old_parts(&self) -> Result<Vec<String>> {
        let active_snapshot: BTreeSet<String> = {
            let active = self.data_parts.lock()?;
            active.iter().map(|p| p.name()).collect()
        };
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let lifetime = self.config.old_parts_lifetime.as_secs() as i64;

        let mut removed = Vec::new();
        let mut all = self.all_data_parts.lock()?;
        let candidates: Vec<Arc<DataPart>> = all
            .iter()
            .filter(|part| {
                if active_snapshot.contains(&part.name()) {
                    return false;
                }
                let remove_time = part.remove_time.load(Ordering::SeqCst);
                remove_time != i64::MAX && now >= remove_time + lifetime
            })
            .cloned()
            .collect();
        for part in candidates {
            all.remove(&part);
            // Two references remain: ours and any live reader's. Only
            // delete when we hold the last one.
            if Arc::strong_count(&part) > 1 {
                all.insert(part);
                continue;
            }
            let name = part.name();
            if let Err(e) = part.remove() {
                tracing::warn!(part = %name, error = %e, "cannot remove old part");
                all.insert(part);
                continue;
            }
            tracing::debug!(table = %self.log_name, part = %name, "removed old part");
            removed.push(name);
        }
        Ok(removed)
    }

    /// Deletes everything. The object must not be used afterwards.
    pub fn drop_all_data(&self) -> Result<()> {
        self.data_parts.lock()?.clear();
        self.all_data_parts.lock()?.clear();
        std::fs::remove_dir_all(&self.path)?;
        Ok(())
    }

    /// Builds the per-thread source streams of a read: selects parts by
    /// date range, mark ranges by primary index, distributes them over a
    /// read pool with work stealing.
    pub fn read(
        self: &Arc<Self>,
        column_names: &[String],
        condition: &dyn KeyCondition,
        date_range: Option<(u16, u16)>,
        prewhere: Option<PrewhereInfo>,
        settings: &Settings,
    ) -> Result<Vec<Box<dyn BlockStream>>> {
        let granularity = self.config.index_granularity;
        let key_size = self.primary_key.len();

        let mut sum_marks = 0usize;
        let mut ranges_in_parts: Vec<RangesInDataPart> = Vec::new();
        for (index_in_query, part) in self.get_data_parts().into_iter().enumerate() {
            if let Some((min_date, max_date)) = date_range {
                if part.info.max_date < min_date || part.info.min_date > max_date {
                    continue;
                }
            }
            let ranges = index::select_mark_ranges(
                &part,
                key_size,
                condition,
                self.config.coarse_index_granularity,
                self.config.min_rows_for_seek / granularity.max(1),
            )?;
            if ranges.is_empty() {
                continue;
            }
            sum_marks += ranges.iter().map(|r| r.marks()).sum::<usize>();
            ranges_in_parts.push(RangesInDataPart { part, part_index_in_query: index_in_query, ranges });
        }
        tracing::debug!(
            table = %self.log_name,
            parts = ranges_in_parts.len(),
            marks = sum_marks,
            "selected ranges to read"
        );
        if ranges_in_parts.is_empty() {
            return Ok(Vec::new());
        }

        let threads = settings.max_threads.max(1);
        let min_marks_for_concurrent_read =
            (self.config.min_rows_for_concurrent_read + granularity - 1) / granularity.max(1);
        let columns = self.columns_list();
        let pool = ReadPool::new(
            threads,
            sum_marks,
            min_marks_for_concurrent_read,
            ranges_in_parts,
            &columns,
            &self.column_defaults,
            prewhere.as_ref(),
            column_names.to_vec(),
            false,
        )?;
        let prewhere = prewhere.map(Arc::new);
        let defaults = Arc::new(self.column_defaults.clone());

        let mut streams: Vec<Box<dyn BlockStream>> = Vec::with_capacity(threads);
        for thread in 0..threads {
            streams.push(Box::new(MergeTreeThreadStream::new(
                pool.clone(),
                thread,
                min_marks_for_concurrent_read,
                prewhere.clone(),
                defaults.clone(),
                granularity,
                settings.max_block_size,
            )));
        }
        Ok(streams)
    }
}

/// A tentative replacement of parts, undone on drop unless committed.
#[derive(Default)]
pub struct Transaction<'a> {
    data: Option<&'a MergeTreeData>,
    added: Vec<Arc<DataPart>>,
    removed: Vec<Arc<DataPart>>,
}

impl<'a> Transaction<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&mut self) {
        self.data = None;
        self.added.clear();
        self.removed.clear();
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            if self.added.is_empty() && self.removed.is_empty() {
                return;
            }
            tracing::debug!(table = %data.log_name, "undoing transaction");
            if let Err(e) = data.replace_parts(&self.added, &self.removed, true) {
                tracing::error!(error = %e, "failed to undo transaction");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, Column, ColumnWithTypeAndName, Value};
    use crate::expr::{Expression, ExpressionAction, ExpressionActions};
    use crate::stream::read_all;
    use crate::testdir::TestDir;
    use std::time::Duration;

    const MARCH: u16 = 16130; // 2014-03-01
    const APRIL: u16 = 16161; // 2014-04-01

    fn table_columns() -> Vec<(String, DataType)> {
        vec![
            ("d".to_string(), DataType::Date),
            ("k".to_string(), DataType::UInt64),
            ("v".to_string(), DataType::UInt64),
        ]
    }

    fn open_table(dir: &TestDir, config: MergeTreeConfig) -> Arc<MergeTreeData> {
        let definition = TableDefinition::new(table_columns(), "d", vec!["k".to_string()]);
        MergeTreeData::open(dir.table_path(), definition, config).expect("open table")
    }

    fn small_config() -> MergeTreeConfig {
        MergeTreeConfig::default()
            .index_granularity(4)
            .min_rows_for_concurrent_read(4)
            .min_rows_for_seek(0)
            .old_parts_lifetime(Duration::ZERO)
            .max_parts_to_merge_at_once(3)
    }

    fn block_of(dates: Vec<u16>, keys: Vec<u64>, values: Vec<u64>) -> Block {
        Block::with_columns(vec![
            ColumnWithTypeAndName::new("d", DataType::Date, Column::Date(dates)),
            ColumnWithTypeAndName::new("k", DataType::UInt64, Column::UInt64(keys)),
            ColumnWithTypeAndName::new("v", DataType::UInt64, Column::UInt64(values)),
        ])
        .unwrap()
    }

    fn settings() -> Settings {
        Settings::default().max_threads(2).max_block_size(8)
    }

    fn read_rows(data: &Arc<MergeTreeData>) -> Vec<(u64, u64)> {
        read_rows_filtered(data, &Unfiltered, None)
    }

    fn read_rows_filtered(
        data: &Arc<MergeTreeData>,
        condition: &dyn KeyCondition,
        prewhere: Option<PrewhereInfo>,
    ) -> Vec<(u64, u64)> {
        let names: Vec<String> = vec!["k".into(), "v".into()];
        let streams = data.read(&names, condition, None, prewhere, &settings()).unwrap();
        let mut rows = Vec::new();
        for mut stream in streams {
            for block in read_all(stream.as_mut()).unwrap() {
                let k = block.by_name("k").unwrap();
                let v = block.by_name("v").unwrap();
                for i in 0..block.rows() {
                    rows.push((
                        k.column.get(i).as_u64().unwrap(),
                        v.column.get(i).as_u64().unwrap(),
                    ));
                }
            }
        }
        rows.sort();
        rows
    }

    #[test]
    fn test_write_read_roundtrip() {
        // 100 rows in one month: one part, checksums verify, reads return
        // exactly what was written.
        let dir = TestDir::for_table("roundtrip").unwrap();
        let data = open_table(&dir, small_config());
        let writer = MergeTreeWriter::new(data.clone());

        let rows = 100usize;
        let dates = vec![MARCH + 5; rows];
        let keys: Vec<u64> = (0..rows as u64).rev().collect();
        let values: Vec<u64> = (0..rows as u64).map(|i| i * 7).collect();
        let written = writer.write(&block_of(dates, keys, values)).unwrap();
        assert_eq!(written.len(), 1);

        let part = &written[0];
        assert_eq!(part.rows, 100);
        // Sparse index invariant: marks x granularity covers the rows with
        // the last granule partially filled.
        let granularity = data.config.index_granularity;
        assert!(part.marks_count * granularity >= part.rows);
        assert!(part.rows > (part.marks_count - 1) * granularity);

        // Reload the part from disk: sizes and sums must agree.
        let reloaded = DataPart::load(
            data.path(),
            &part.name(),
            &table_columns(),
            &["k".to_string()],
            "d",
            true,
        )
        .unwrap();
        reloaded.checksums().check_equal(&part.checksums(), true).unwrap();
        assert_eq!(reloaded.rows, part.rows);
        assert_eq!(reloaded.marks_count, part.marks_count);

        // Keys come back sorted with their values attached.
        let rows_back = read_rows(&data);
        assert_eq!(rows_back.len(), 100);
        // key i carried value (99 - i) * 7 because keys were reversed.
        for (i, (k, v)) in rows_back.iter().enumerate() {
            assert_eq!(*k, i as u64);
            assert_eq!(*v, (99 - i) as u64 * 7);
        }
    }

    #[test]
    fn test_insert_splits_by_month() {
        let dir = TestDir::for_table("month_split").unwrap();
        let data = open_table(&dir, small_config());
        let writer = MergeTreeWriter::new(data.clone());

        let written = writer
            .write(&block_of(
                vec![MARCH, APRIL, MARCH, APRIL],
                vec![1, 2, 3, 4],
                vec![10, 20, 30, 40],
            ))
            .unwrap();
        assert_eq!(written.len(), 2);
        assert_ne!(written[0].info.month(), written[1].info.month());
        assert_eq!(read_rows(&data).len(), 4);
    }

    #[test]
    fn test_compaction_selects_and_replaces() {
        // Three adjacent same-month parts of similar size: the heuristic
        // takes all three, the merged part covers the union, and the
        // inputs disappear after the retention elapsed.
        let dir = TestDir::for_table("compaction").unwrap();
        let data = open_table(&dir, small_config());
        let writer = MergeTreeWriter::new(data.clone());

        for batch in 0..3u64 {
            let keys: Vec<u64> = (batch * 10..batch * 10 + 10).collect();
            let values = keys.clone();
            writer
                .write(&block_of(vec![MARCH + batch as u16; 10], keys, values))
                .unwrap();
        }
        assert_eq!(data.get_data_parts().len(), 3);

        let merger = Merger::new(data.clone());
        let selected = merger
            .select_parts_to_merge(false, false, &|_, _| true)
            .expect("three similar parts should be selected");
        assert_eq!(selected.len(), 3);

        let min_id = selected.first().unwrap().info.min_id;
        let max_id = selected.last().unwrap().info.max_id;
        let merged = merger.merge_parts(selected).unwrap();

        let active = data.get_data_parts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].info.min_id, min_id);
        assert_eq!(active[0].info.max_id, max_id);
        assert_eq!(active[0].info.level, 1);
        assert_eq!(active[0].rows, 30);
        drop(merged);
        drop(active);

        // Retention is zero: the covered inputs go away physically.
        let removed = data.clear_old_parts().unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(data.get_all_data_parts().len(), 1);
        for name in removed {
            assert!(!data.path().join(name).exists());
        }

        // The merged data is intact.
        let rows = read_rows(&data);
        assert_eq!(rows.len(), 30);
        assert_eq!(rows.first(), Some(&(0, 0)));
        assert_eq!(rows.last(), Some(&(29, 29)));
    }

    #[test]
    fn test_merge_respects_veto() {
        let dir = TestDir::for_table("merge_veto").unwrap();
        let data = open_table(&dir, small_config());
        let writer = MergeTreeWriter::new(data.clone());
        for batch in 0..3u64 {
            writer
                .write(&block_of(vec![MARCH; 4], vec![batch * 4, batch * 4 + 1, batch * 4 + 2, batch * 4 + 3], vec![0; 4]))
                .unwrap();
        }
        let merger = Merger::new(data.clone());
        // The veto forbids every pair: nothing to merge.
        assert!(merger.select_parts_to_merge(false, false, &|_, _| false).is_none());
    }

    #[test]
    fn test_cancelled_merge_leaves_only_tmp() {
        let dir = TestDir::for_table("cancelled_merge").unwrap();
        let data = open_table(&dir, small_config());
        let writer = MergeTreeWriter::new(data.clone());
        for batch in 0..2u64 {
            writer
                .write(&block_of(vec![MARCH; 4], vec![batch * 4, batch * 4 + 1, batch * 4 + 2, batch * 4 + 3], vec![0; 4]))
                .unwrap();
        }
        let merger = Merger::new(data.clone());
        merger.cancel_all();
        let parts = data.get_data_parts();
        assert!(matches!(merger.merge_parts(parts), Err(Error::Cancelled)));

        // Nothing but part directories (and possibly tmp leftovers) exists.
        for entry in std::fs::read_dir(data.path()).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().into_owned();
            assert!(
                name.starts_with("tmp") || PartInfo::parse(&name).is_ok(),
                "unexpected file {name} in table directory"
            );
        }
        // The working set is untouched.
        assert_eq!(data.get_data_parts().len(), 2);
    }

    #[test]
    fn test_key_condition_prunes_granules() {
        let dir = TestDir::for_table("index_pruning").unwrap();
        let data = open_table(&dir, small_config());
        let writer = MergeTreeWriter::new(data.clone());

        let keys: Vec<u64> = (0..64).collect();
        let values = keys.clone();
        writer.write(&block_of(vec![MARCH; 64], keys, values)).unwrap();

        let condition = KeyRangeCondition {
            min: Some(Value::UInt64(30)),
            max: Some(Value::UInt64(33)),
        };
        let rows = read_rows_filtered(&data, &condition, None);
        // Everything requested is there, and whole granules far from the
        // range were pruned.
        for k in 30..=33u64 {
            assert!(rows.contains(&(k, k)));
        }
        assert!(rows.len() < 64, "index pruning had no effect");
    }

    #[test]
    fn test_prewhere_filters_and_drops_mask() {
        let dir = TestDir::for_table("prewhere").unwrap();
        let data = open_table(&dir, small_config());
        let writer = MergeTreeWriter::new(data.clone());
        let keys: Vec<u64> = (0..16).collect();
        let values: Vec<u64> = keys.iter().map(|k| k % 4).collect();
        writer.write(&block_of(vec![MARCH; 16], keys, values)).unwrap();

        let prewhere = PrewhereInfo {
            actions: ExpressionActions::default().add(ExpressionAction::AddColumn {
                name: "pw".into(),
                expression: Expression::call(
                    "equals",
                    vec![
                        Expression::column("v"),
                        Expression::literal(Value::UInt64(3), DataType::UInt64),
                    ],
                ),
            }),
            column_name: "pw".into(),
        };
        let names: Vec<String> = vec!["k".into(), "v".into()];
        let streams = data.read(&names, &Unfiltered, None, Some(prewhere), &settings()).unwrap();
        let mut rows = Vec::new();
        for mut stream in streams {
            for block in read_all(stream.as_mut()).unwrap() {
                assert!(!block.has_column("pw"), "internal filter column leaked");
                let k = block.by_name("k").unwrap();
                for i in 0..block.rows() {
                    rows.push(k.column.get(i).as_u64().unwrap());
                }
            }
        }
        rows.sort();
        assert_eq!(rows, vec![3, 7, 11, 15]);
    }

    #[test]
    fn test_cancel_read_streams() {
        let dir = TestDir::for_table("cancel_read").unwrap();
        let data = open_table(&dir, small_config());
        let writer = MergeTreeWriter::new(data.clone());
        writer
            .write(&block_of(vec![MARCH; 32], (0..32).collect(), (0..32).collect()))
            .unwrap();

        let names: Vec<String> = vec!["k".into()];
        let mut streams = data.read(&names, &Unfiltered, None, None, &settings()).unwrap();
        for stream in &streams {
            stream.cancel();
        }
        // A cancelled stream drains to empty in finitely many reads.
        for stream in &mut streams {
            assert!(stream.read().unwrap().is_empty());
        }
    }

    #[test]
    fn test_alter_add_drop_modify() {
        let dir = TestDir::for_table("alter").unwrap();
        let definition = TableDefinition::new(table_columns(), "d", vec!["k".to_string()])
            .column_default(
                "w",
                Expression::call(
                    "multiply",
                    vec![
                        Expression::column("k"),
                        Expression::literal(Value::UInt64(2), DataType::UInt64),
                    ],
                ),
            );
        let data =
            MergeTreeData::open(dir.table_path(), definition, small_config()).unwrap();
        let writer = MergeTreeWriter::new(data.clone());
        writer
            .write(&block_of(vec![MARCH; 10], (0..10).collect(), (0..10).collect()))
            .unwrap();
        let part = data.get_data_parts().remove(0);

        // ADD COLUMN w UInt64 DEFAULT k * 2, DROP COLUMN v.
        let commands = vec![
            AlterCommand::AddColumn { name: "w".into(), data_type: DataType::UInt64 },
            AlterCommand::DropColumn { name: "v".into() },
        ];
        let new_columns = alter::check_alter(&data, &commands).unwrap();
        let transaction =
            alter::alter_data_part(&data, &part, new_columns.clone(), true).unwrap().expect("a plan");
        transaction.commit().unwrap();
        data.set_columns_list(new_columns.clone());

        assert!(part.has_column_files("w"));
        assert!(!part.has_column_files("v"));
        assert_eq!(part.columns_list(), new_columns);

        // The staged files became part of the checksums and verify.
        let reloaded = DataPart::load(
            data.path(),
            &part.name(),
            &new_columns,
            &["k".to_string()],
            "d",
            true,
        )
        .unwrap();
        reloaded.checksums().check_equal(&part.checksums(), true).unwrap();

        // The new column reads back with the DEFAULT's values.
        let mut stream = PartRangeStream::new(
            part.clone(),
            vec![MarkRange::new(0, part.marks_count)],
            vec![("k".to_string(), DataType::UInt64), ("w".to_string(), DataType::UInt64)],
            data.config.index_granularity,
            1024,
        );
        let blocks = read_all(&mut stream).unwrap();
        for block in blocks {
            let k = block.by_name("k").unwrap();
            let w = block.by_name("w").unwrap();
            for i in 0..block.rows() {
                assert_eq!(
                    w.column.get(i).as_u64().unwrap(),
                    k.column.get(i).as_u64().unwrap() * 2
                );
            }
        }
    }

    #[test]
    fn test_alter_rollback_removes_staged_files() {
        let dir = TestDir::for_table("alter_rollback").unwrap();
        let data = open_table(&dir, small_config());
        let writer = MergeTreeWriter::new(data.clone());
        writer
            .write(&block_of(vec![MARCH; 8], (0..8).collect(), (0..8).collect()))
            .unwrap();
        let part = data.get_data_parts().remove(0);
        let old_columns = part.columns_list();

        let commands =
            vec![AlterCommand::AddColumn { name: "extra".into(), data_type: DataType::UInt32 }];
        let new_columns = alter::check_alter(&data, &commands).unwrap();
        let transaction = alter::alter_data_part(&data, &part, new_columns, true).unwrap();
        drop(transaction);

        // No staged temporaries survive and the part is unchanged.
        for entry in std::fs::read_dir(part.path()).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().into_owned();
            assert!(!name.ends_with(".tmp"), "staged file {name} left behind");
        }
        assert_eq!(part.columns_list(), old_columns);
    }

    #[test]
    fn test_alter_protects_key_columns() {
        let dir = TestDir::for_table("alter_checks").unwrap();
        let data = open_table(&dir, small_config());
        assert!(alter::check_alter(&data, &[AlterCommand::DropColumn { name: "k".into() }]).is_err());
        assert!(alter::check_alter(&data, &[AlterCommand::DropColumn { name: "d".into() }]).is_err());
        assert!(alter::check_alter(
            &data,
            &[AlterCommand::ModifyColumn { name: "v".into(), data_type: DataType::UInt32 }]
        )
        .is_ok());
    }

    #[test]
    fn test_restart_reclaims_tmp_and_reloads_parts() {
        let dir = TestDir::for_table("restart").unwrap();
        let path = dir.table_path().to_path_buf();
        {
            let data = open_table(&dir, small_config());
            let writer = MergeTreeWriter::new(data.clone());
            writer
                .write(&block_of(vec![MARCH; 8], (0..8).collect(), (8..16).collect()))
                .unwrap();
            // A crash would leave a tmp directory behind.
            std::fs::create_dir_all(path.join("tmp_20140301_20140301_99_99_0")).unwrap();
        }
        let definition = TableDefinition::new(table_columns(), "d", vec!["k".to_string()]);
        let data = MergeTreeData::open(&path, definition, small_config()).unwrap();
        assert!(!path.join("tmp_20140301_20140301_99_99_0").exists());
        assert_eq!(data.get_data_parts().len(), 1);
        assert_eq!(read_rows(&data).len(), 8);
        // The id counter resumes above the loaded parts.
        assert!(data.next_part_id() > data.get_data_parts()[0].info.max_id);
    }

    #[test]
    fn test_disjoint_id_ranges_invariant() {
        let dir = TestDir::for_table("disjoint_ids").unwrap();
        let data = open_table(&dir, small_config());
        let writer = MergeTreeWriter::new(data.clone());
        for batch in 0..4u64 {
            writer
                .write(&block_of(vec![MARCH; 2], vec![batch, batch + 100], vec![0, 0]))
                .unwrap();
        }
        let parts = data.get_data_parts();
        for (i, a) in parts.iter().enumerate() {
            for b in parts.iter().skip(i + 1) {
                assert!(
                    a.info.max_id < b.info.min_id || b.info.max_id < a.info.min_id,
                    "active parts {} and {} overlap",
                    a.name(),
                    b.name()
                );
            }
        }
    }
}
