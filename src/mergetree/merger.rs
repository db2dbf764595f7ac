//! Background compaction: choosing parts to merge and merging them.
//!
//! The heuristic walks the active parts of one month and looks for the
//! longest contiguous run that fits the limits: at most
//! `max_parts_to_merge_at_once` parts, bounded total bytes, and outer
//! parts within a size-ratio band of the group's geometric mean so one
//! huge part never drags small neighbors through a rewrite. At night the
//! band widens, biasing toward larger merges.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Timelike;
use itertools::Itertools;

use crate::error::{Error, Result};
use crate::mergetree::index::MarkRange;
use crate::mergetree::part::{DataPart, PartInfo};
use crate::mergetree::reader::PartRangeStream;
use crate::mergetree::writer::PartBuilder;
use crate::mergetree::{MergeTreeData, Mode, Transaction};
use crate::stream::sort::SortColumnDescription;
use crate::stream::{
    AggregatingMergedStream, BlockStream, CollapsingMergedStream, MergingSortedStream,
    SummingMergedStream,
};

/// Decides whether two adjacent parts may merge; replication wires its
/// coordination veto through this.
pub type AllowedMergingPredicate<'a> = dyn Fn(&DataPart, &DataPart) -> bool + 'a;

pub struct Merger {
    data: Arc<MergeTreeData>,
    cancelled: AtomicBool,
}

impl Merger {
    pub fn new(data: Arc<MergeTreeData>) -> Self {
        Self { data, cancelled: AtomicBool::new(false) }
    }

    /// Cancels running and future merges until uncancelled.
    pub fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn uncancel_all(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Rough disk need of merging the given parts, with headroom.
    pub fn estimate_disk_space_for_merge(parts: &[Arc<DataPart>]) -> u64 {
        let total: u64 = parts.iter().map(|p| p.bytes_on_disk.load(Ordering::SeqCst)).sum();
        total + total / 10
    }

    /// Picks the parts of the next merge, or None when nothing is worth
    /// merging. `aggressive` drops the balance requirement, `only_small`
    /// uses the reduced byte budget.
    pub fn select_parts_to_merge(
        &self,
        aggressive: bool,
        only_small: bool,
        can_merge: &AllowedMergingPredicate<'_>,
    ) -> Option<Vec<Arc<DataPart>>> {
        let parts = self.data.get_data_parts();
        if parts.len() < 2 {
            return None;
        }
        let config = &self.data.config;
        let max_bytes = if only_small {
            config.max_bytes_to_merge_parts_small
        } else {
            config.max_bytes_to_merge_parts
        };
        // Between one and five in the morning, accept more unbalanced
        // merges so big parts consolidate while load is low.
        let hour = chrono::Local::now().hour();
        let mut ratio = config.size_ratio_coefficient_to_merge_parts;
        if (1..6).contains(&hour) {
            ratio *= config.merge_parts_at_night_inc;
        }

        let mut best: Option<Vec<Arc<DataPart>>> = None;
        let mut best_score = (0usize, 0u64);

        for first in 0..parts.len() {
            let mut group: Vec<Arc<DataPart>> = vec![parts[first].clone()];
            let mut total_bytes = parts[first].bytes_on_disk.load(Ordering::SeqCst);

            for candidate in parts.iter().skip(first + 1) {
                let last = match group.last() {
                    Some(last) => last.clone(),
                    None => break,
                };
                if candidate.info.month() != last.info.month() {
                    break;
                }
                if group.len() >= config.max_parts_to_merge_at_once {
                    break;
                }
                if !can_merge(last.as_ref(), candidate.as_ref()) {
                    break;
                }
                let bytes = candidate.bytes_on_disk.load(Ordering::SeqCst);
                if total_bytes + bytes > max_bytes {
                    break;
                }
                group.push(candidate.clone());
                total_bytes += bytes;

                if group.len() < 2 {
                    continue;
                }
                if !aggressive && !Self::size_ratio_allows(&group, ratio) {
                    continue;
                }
                let score = (group.len(), total_bytes);
                if score > best_score {
                    best_score = score;
                    best = Some(group.clone());
                }
            }
        }
        best
    }

    /// The balance requirement: both outer parts of the group must lie
    /// within `1 + ratio` of the geometric mean size.
    fn size_ratio_allows(group: &[Arc<DataPart>], ratio: f64) -> bool {
        let sizes: Vec<f64> = group
            .iter()
            .map(|p| p.bytes_on_disk.load(Ordering::SeqCst).max(1) as f64)
            .collect();
        let geometric_mean = sizes.iter().map(|s| s.ln()).sum::<f64>() / sizes.len() as f64;
        let geometric_mean = geometric_mean.exp();
        let bound_high = geometric_mean * (1.0 + ratio);
        let bound_low = geometric_mean / (1.0 + ratio);
        let first = sizes[0];
        let last = sizes[sizes.len() - 1];
        first <= bound_high && first >= bound_low && last <= bound_high && last >= bound_low
    }

    /// The name of the part a merge of `parts` will produce.
    pub fn merged_part_info(parts: &[Arc<DataPart>]) -> Result<PartInfo> {
        let first = parts
            .first()
            .ok_or_else(|| Error::InvalidArgument("empty set of parts to merge".into()))?;
        let last = parts
            .last()
            .ok_or_else(|| Error::InvalidArgument("empty set of parts to merge".into()))?;
        Ok(PartInfo {
            min_date: parts.iter().map(|p| p.info.min_date).min().unwrap_or(first.info.min_date),
            max_date: parts.iter().map(|p| p.info.max_date).max().unwrap_or(last.info.max_date),
            min_id: first.info.min_id,
            max_id: last.info.max_id,
            level: parts.iter().map(|p| p.info.level).max().unwrap_or(0) + 1,
        })
    }

    /// K-way merges the parts into a new one, honoring the table mode, and
    /// atomically swaps it into the working set. The inputs become
    /// inactive and are deleted after the retention period.
    pub fn merge_parts(&self, parts: Vec<Arc<DataPart>>) -> Result<Arc<DataPart>> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if parts.len() < 2 {
            return Err(Error::InvalidArgument("need at least two parts to merge".into()));
        }
        let info = Self::merged_part_info(&parts)?;
        tracing::info!(
            table = %self.data.log_name(),
            merged = %info.name(),
            parts = %parts.iter().map(|p| p.name()).join(", "),
            "merging parts"
        );

        let columns = self.data.columns_list();
        let description: Vec<SortColumnDescription> = self
            .data
            .primary_key()
            .iter()
            .map(SortColumnDescription::asc)
            .collect();
        let block_size = 8192;

        let mut inputs: Vec<Box<dyn BlockStream>> = Vec::with_capacity(parts.len());
        for part in &parts {
            inputs.push(Box::new(PartRangeStream::new(
                part.clone(),
                vec![MarkRange::new(0, part.marks_count)],
                columns.clone(),
                self.data.config.index_granularity,
                block_size,
            )));
        }

        let mut merged: Box<dyn BlockStream> = match self.data.mode {
            Mode::Ordinary => Box::new(MergingSortedStream::new(inputs, description, block_size)),
            Mode::Collapsing => {
                let sign = self.data.sign_column.clone().ok_or_else(|| {
                    Error::InvalidArgument("collapsing mode requires a sign column".into())
                })?;
                Box::new(CollapsingMergedStream::new(inputs, description, sign, block_size))
            }
            Mode::Summing => Box::new(SummingMergedStream::new(inputs, description, block_size)),
            Mode::Aggregating => Box::new(AggregatingMergedStream::new(inputs, description, block_size)),
        };

        let tmp_dir = self.data.path().join(format!("tmp_{}", info.name()));
        let mut builder = PartBuilder::new(
            tmp_dir.clone(),
            columns.clone(),
            self.data.primary_key().to_vec(),
            self.data.config.index_granularity,
            self.data.config.min_compress_block_size,
            self.data.config.max_compress_block_size,
        )?;

        merged.read_prefix()?;
        loop {
            if self.is_cancelled() {
                merged.cancel();
                // The builder and its tmp directory are abandoned; the
                // temporary part cleanup reclaims it.
                drop(builder);
                let _ = std::fs::remove_dir_all(&tmp_dir);
                return Err(Error::Cancelled);
            }
            let block = merged.read()?;
            if block.is_empty() {
                break;
            }
            builder.write_block(&block)?;
        }
        merged.read_suffix()?;
        let (checksums, index, marks_count, rows) = builder.finish()?;

        let bytes = DataPart::calc_total_size(&tmp_dir)?;
        let new_part = DataPart::new_temporary(
            info,
            self.data.path().to_path_buf(),
            marks_count,
            rows,
            bytes,
            index,
            checksums,
            columns,
        );

        let mut transaction = Transaction::new();
        let (new_part, replaced) =
            self.data.rename_temp_part_and_replace(new_part, Some(&mut transaction))?;
        if replaced.len() != parts.len() {
            tracing::warn!(
                table = %self.data.log_name(),
                expected = parts.len(),
                replaced = replaced.len(),
                "merge replaced an unexpected number of parts"
            );
        }
        transaction.commit();
        tracing::info!(
            table = %self.data.log_name(),
            part = %new_part.name(),
            rows,
            bytes,
            "merged parts"
        );
        Ok(new_part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Selection-heuristic tests build parts without disk data.
    fn fake_part(month_day: &str, id: u64, bytes: u64) -> Arc<DataPart> {
        let info = PartInfo::parse(&format!("{month_day}_{month_day}_{id}_{id}_0")).unwrap();
        let part = DataPart::new_temporary(
            info,
            std::path::PathBuf::from("/nonexistent"),
            0,
            0,
            bytes,
            Vec::new(),
            Default::default(),
            Vec::new(),
        );
        part.is_temp.store(false, Ordering::SeqCst);
        Arc::new(part)
    }

    #[test]
    fn test_size_ratio_band() {
        let group = vec![
            fake_part("20140301", 1, 10 << 20),
            fake_part("20140301", 2, 11 << 20),
            fake_part("20140301", 3, 12 << 20),
        ];
        assert!(Merger::size_ratio_allows(&group, 0.25));

        let unbalanced = vec![
            fake_part("20140301", 1, 1 << 30),
            fake_part("20140301", 2, 1 << 20),
            fake_part("20140301", 3, 1 << 20),
        ];
        assert!(!Merger::size_ratio_allows(&unbalanced, 0.25));
    }

    #[test]
    fn test_merged_part_info_spans_inputs() {
        let parts = vec![
            fake_part("20140301", 3, 1),
            fake_part("20140305", 4, 1),
            fake_part("20140310", 7, 1),
        ];
        let info = Merger::merged_part_info(&parts).unwrap();
        assert_eq!(info.min_id, 3);
        assert_eq!(info.max_id, 7);
        assert_eq!(info.level, 1);
        assert_eq!(info.min_date, parts[0].info.min_date);
        assert_eq!(info.max_date, parts[2].info.max_date);
    }
}
