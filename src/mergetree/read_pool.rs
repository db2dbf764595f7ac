//! Distribution of mark ranges across reader threads.
//!
//! The pool pre-splits the selected ranges into per-thread queues sized by
//! total marks, then hands out tasks of `min_marks` granularity. A thread
//! that drains its own queue steals from another unless stealing is
//! disabled. All decisions happen under one mutex.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use crate::block::DataType;
use crate::error::{Error, Result};
use crate::expr::{Expression, ExpressionActions};
use crate::mergetree::index::MarkRange;
use crate::mergetree::part::DataPart;

/// The selected ranges of one part, as produced by index analysis.
pub struct RangesInDataPart {
    pub part: Arc<DataPart>,
    pub part_index_in_query: usize,
    /// Increasing order.
    pub ranges: Vec<MarkRange>,
}

/// The PREWHERE stage: the compiled filter expression and the name of the
/// mask column it produces.
pub struct PrewhereInfo {
    pub actions: ExpressionActions,
    pub column_name: String,
}

/// One unit of work for a reader thread.
pub struct ReadTask {
    pub part: Arc<DataPart>,
    /// Left-to-right order, ready for reading.
    pub ranges: Vec<MarkRange>,
    /// Stable identity of the part within this query.
    pub part_index_in_query: usize,
    /// The requested output column order.
    pub ordered_names: Vec<String>,
    pub column_name_set: HashSet<String>,
    /// Columns read after the filter, with types.
    pub columns: Vec<(String, DataType)>,
    /// Columns needed to evaluate PREWHERE, with types.
    pub pre_columns: Vec<(String, DataType)>,
    pub remove_prewhere_column: bool,
    pub should_reorder: bool,
}

struct PartIndexAndRanges {
    part_idx: usize,
    /// Right-to-left, so tasks pop from the back.
    ranges: Vec<MarkRange>,
}

#[derive(Default)]
struct ThreadTasks {
    parts_and_ranges: Vec<PartIndexAndRanges>,
    sum_marks_in_parts: Vec<usize>,
}

struct PoolState {
    threads_tasks: Vec<ThreadTasks>,
    remaining_thread_tasks: BTreeSet<usize>,
}

struct PerPartInfo {
    part: Arc<DataPart>,
    part_index_in_query: usize,
    column_name_set: HashSet<String>,
    columns: Vec<(String, DataType)>,
    pre_columns: Vec<(String, DataType)>,
    remove_prewhere_column: bool,
    should_reorder: bool,
}

pub struct ReadPool {
    state: Mutex<PoolState>,
    per_part: Vec<PerPartInfo>,
    column_names: Vec<String>,
    do_not_steal_tasks: bool,
}

impl ReadPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        threads: usize,
        sum_marks: usize,
        min_marks_for_concurrent_read: usize,
        mut parts: Vec<RangesInDataPart>,
        table_columns: &[(String, DataType)],
        column_defaults: &std::collections::HashMap<String, Expression>,
        prewhere: Option<&PrewhereInfo>,
        column_names: Vec<String>,
        do_not_steal_tasks: bool,
    ) -> Result<Arc<ReadPool>> {
        let per_part_sum_marks =
            Self::fill_per_part_info(&mut parts, table_columns, column_defaults, prewhere, &column_names)?;
        let (per_part, state) = Self::fill_per_thread_info(
            threads.max(1),
            sum_marks,
            per_part_sum_marks,
            parts,
            min_marks_for_concurrent_read.max(1),
        );
        Ok(Arc::new(ReadPool {
            state: Mutex::new(state),
            per_part,
            column_names,
            do_not_steal_tasks,
        }))
    }

    /// Per-part column resolution: required-column injection for DEFAULT
    /// evaluation, the PREWHERE split, and reorder flags.
    fn fill_per_part_info(
        parts: &mut [RangesInDataPart],
        table_columns: &[(String, DataType)],
        column_defaults: &std::collections::HashMap<String, Expression>,
        prewhere: Option<&PrewhereInfo>,
        column_names: &[String],
    ) -> Result<Vec<(PerPartInfo, usize)>> {
        let type_of = |name: &str| -> Result<DataType> {
            table_columns
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, t)| t.clone())
                .ok_or_else(|| Error::InvalidArgument(format!("no column {name} in table")))
        };
        let add_types = |names: &[String]| -> Result<Vec<(String, DataType)>> {
            names.iter().map(|n| Ok((n.clone(), type_of(n)?))).collect()
        };

        let mut result = Vec::with_capacity(parts.len());
        for part in parts.iter_mut() {
            let sum_marks: usize = part.ranges.iter().map(|r| r.marks()).sum();

            let mut required_column_names = column_names.to_vec();
            let injected = inject_required_columns(
                &part.part,
                table_columns,
                column_defaults,
                &mut required_column_names,
            );
            let mut should_reorder = !injected.is_empty();

            let mut required_pre_column_names: Vec<String> = Vec::new();
            let mut remove_prewhere_column = false;
            if let Some(prewhere) = prewhere {
                required_pre_column_names = prewhere.actions.required_columns();
                // There must be at least one column to drive row counts.
                if required_pre_column_names.is_empty() {
                    if let Some(first) = required_column_names.first() {
                        required_pre_column_names.push(first.clone());
                    }
                }
                let injected_pre = inject_required_columns(
                    &part.part,
                    table_columns,
                    column_defaults,
                    &mut required_pre_column_names,
                );
                if !injected_pre.is_empty() {
                    should_reorder = true;
                }

                let pre_name_set: HashSet<String> = required_pre_column_names.iter().cloned().collect();
                // A computed filter column is internal and not handed out.
                remove_prewhere_column = !pre_name_set.contains(&prewhere.column_name);

                required_column_names.retain(|n| !pre_name_set.contains(n));
            }

            let info = PerPartInfo {
                part: part.part.clone(),
                part_index_in_query: part.part_index_in_query,
                column_name_set: required_column_names.iter().cloned().collect(),
                columns: add_types(&required_column_names)?,
                pre_columns: add_types(&required_pre_column_names)?,
                remove_prewhere_column,
                should_reorder,
            };
            result.push((info, sum_marks));
        }
        Ok(result)
    }

    /// Pre-distributes ranges: each thread receives about sum_marks/threads
    /// marks, biting parts off the back of the list. Ranges are recorded
    /// right-to-left so get_task can pop from the back.
    fn fill_per_thread_info(
        threads: usize,
        sum_marks: usize,
        mut per_part: Vec<(PerPartInfo, usize)>,
        mut parts: Vec<RangesInDataPart>,
        min_marks_for_concurrent_read: usize,
    ) -> (Vec<PerPartInfo>, PoolState) {
        let mut threads_tasks: Vec<ThreadTasks> = (0..threads).map(|_| ThreadTasks::default()).collect();
        let mut remaining_thread_tasks = BTreeSet::new();

        // Ranges arrive in increasing order; store them right-to-left.
        for part in parts.iter_mut() {
            part.ranges.reverse();
        }

        let min_marks_per_thread = (sum_marks + threads - 1) / threads;

        for (i, thread_tasks) in threads_tasks.iter_mut().enumerate() {
            let mut need_marks = min_marks_per_thread;

            while need_marks > 0 && !parts.is_empty() {
                let part_idx = parts.len() - 1;
                let part = match parts.last_mut() {
                    Some(p) => p,
                    None => break,
                };
                let marks_in_part = per_part[part_idx].1;

                // Do not take too few rows from a part.
                if marks_in_part >= min_marks_for_concurrent_read
                    && need_marks < min_marks_for_concurrent_read
                {
                    need_marks = min_marks_for_concurrent_read;
                }
                // Do not leave too few rows in a part either.
                let mut take = need_marks;
                if marks_in_part > take && marks_in_part - take < min_marks_for_concurrent_read {
                    take = marks_in_part;
                }

                let mut ranges_to_get: Vec<MarkRange>;
                let marks_in_ranges;

                if marks_in_part <= take {
                    // The whole remainder of the part, already right-to-left.
                    ranges_to_get = std::mem::take(&mut part.ranges);
                    marks_in_ranges = marks_in_part;
                    need_marks = need_marks.saturating_sub(marks_in_part);
                    parts.pop();
                    per_part[part_idx].1 = 0;
                } else {
                    ranges_to_get = Vec::new();
                    let mut got = 0usize;
                    while got < take {
                        let Some(range) = part.ranges.last_mut() else { break };
                        let available = range.marks();
                        let from_range = available.min(take - got);
                        ranges_to_get.push(MarkRange::new(range.begin, range.begin + from_range));
                        range.begin += from_range;
                        got += from_range;
                        if range.begin == range.end {
                            part.ranges.pop();
                        }
                    }
                    per_part[part_idx].1 -= got;
                    marks_in_ranges = got;
                    need_marks = need_marks.saturating_sub(got);
                    // Back to right-to-left for get_task's pop_back.
                    ranges_to_get.reverse();
                }

                thread_tasks.parts_and_ranges.push(PartIndexAndRanges { part_idx, ranges: ranges_to_get });
                thread_tasks.sum_marks_in_parts.push(marks_in_ranges);
                if marks_in_ranges != 0 {
                    remaining_thread_tasks.insert(i);
                }
            }
        }

        let per_part = per_part.into_iter().map(|(info, _)| info).collect();
        (per_part, PoolState { threads_tasks, remaining_thread_tasks })
    }

    /// Hands the calling thread its next chunk of work, stealing from
    /// another thread's queue when its own is empty.
    pub fn get_task(&self, min_marks_to_read: usize, thread: usize) -> Result<Option<ReadTask>> {
        let mut state = self.state.lock()?;
        let state = &mut *state;

        if state.remaining_thread_tasks.is_empty() {
            return Ok(None);
        }
        let own_tasks_left = state
            .threads_tasks
            .get(thread)
            .map(|t| !t.sum_marks_in_parts.is_empty())
            .unwrap_or(false);
        if !own_tasks_left && self.do_not_steal_tasks {
            return Ok(None);
        }
        let thread_idx = if own_tasks_left {
            thread
        } else {
            match state.remaining_thread_tasks.iter().next() {
                Some(&idx) => idx,
                None => return Ok(None),
            }
        };
        let thread_tasks = &mut state.threads_tasks[thread_idx];

        let Some(part_and_ranges) = thread_tasks.parts_and_ranges.last_mut() else {
            return Ok(None);
        };
        let part_idx = part_and_ranges.part_idx;
        let Some(marks_in_part) = thread_tasks.sum_marks_in_parts.last_mut() else {
            return Ok(None);
        };

        // Take the whole part if it is small enough.
        let mut need_marks = (*marks_in_part).min(min_marks_to_read.max(1));
        // Do not leave a fragment smaller than one concurrent read.
        if *marks_in_part > need_marks && *marks_in_part - need_marks < min_marks_to_read {
            need_marks = *marks_in_part;
        }

        let mut ranges_to_get: Vec<MarkRange> = Vec::new();
        if *marks_in_part <= need_marks {
            // Restore left-to-right order for the reader.
            part_and_ranges.ranges.reverse();
            ranges_to_get = std::mem::take(&mut part_and_ranges.ranges);
            thread_tasks.parts_and_ranges.pop();
            thread_tasks.sum_marks_in_parts.pop();
            if thread_tasks.sum_marks_in_parts.is_empty() {
                state.remaining_thread_tasks.remove(&thread_idx);
            }
        } else {
            let mut got = 0usize;
            while got < need_marks {
                let Some(range) = part_and_ranges.ranges.last_mut() else { break };
                let from_range = range.marks().min(need_marks - got);
                ranges_to_get.push(MarkRange::new(range.begin, range.begin + from_range));
                range.begin += from_range;
                got += from_range;
                if range.begin == range.end {
                    part_and_ranges.ranges.pop();
                }
            }
            *marks_in_part -= got;
            // Segments were collected left-to-right already.
        }

        let info = &self.per_part[part_idx];
        Ok(Some(ReadTask {
            part: info.part.clone(),
            ranges: ranges_to_get,
            part_index_in_query: info.part_index_in_query,
            ordered_names: self.column_names.clone(),
            column_name_set: info.column_name_set.clone(),
            columns: info.columns.clone(),
            pre_columns: info.pre_columns.clone(),
            remove_prewhere_column: info.remove_prewhere_column,
            should_reorder: info.should_reorder,
        }))
    }
}

/// For each requested column missing from the part, resolves its DEFAULT
/// expression and appends the referenced columns to `columns`. If the part
/// has none of the requested columns on disk at all, appends the smallest
/// column on disk as a row-count carrier. Returns the injected names.
pub fn inject_required_columns(
    part: &DataPart,
    table_columns: &[(String, DataType)],
    column_defaults: &std::collections::HashMap<String, Expression>,
    columns: &mut Vec<String>,
) -> HashSet<String> {
    let mut required: HashSet<String> = columns.iter().cloned().collect();
    let mut injected = HashSet::new();

    let mut all_column_files_missing = true;
    for i in 0..columns.len() {
        let column_name = columns[i].clone();
        if part.has_column_files(&column_name) {
            all_column_files_missing = false;
            continue;
        }
        let Some(default) = column_defaults.get(&column_name) else { continue };
        let mut identifiers = std::collections::BTreeSet::new();
        default.collect_columns(&mut identifiers);
        for identifier in identifiers {
            let known = table_columns.iter().any(|(n, _)| *n == identifier);
            if known && required.insert(identifier.clone()) {
                columns.push(identifier.clone());
                injected.insert(identifier);
            }
        }
    }

    if all_column_files_missing {
        if let Some(name) = minimum_size_column(part, table_columns) {
            columns.push(name.clone());
            injected.insert(name);
        }
    }
    injected
}

/// The column with the smallest bin+mrk footprint among those present in
/// the part. Knowing any column's values gives the row count.
fn minimum_size_column(part: &DataPart, table_columns: &[(String, DataType)]) -> Option<String> {
    let mut best: Option<(u64, String)> = None;
    for (name, _) in table_columns {
        if !part.has_column_files(name) {
            continue;
        }
        let size = part.column_size_on_disk(name);
        if best.as_ref().map_or(true, |(s, _)| size < *s) {
            best = Some((size, name.clone()));
        }
    }
    best.map(|(_, name)| name)
}
