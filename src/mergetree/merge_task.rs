use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::mergetree::merger::Merger;
use crate::mergetree::MergeTreeData;
use crate::scheduler::MaintenanceTask;

/// Periodic background merging: each run selects one group of parts worth
/// merging and merges it.
pub struct MergeTask {
    data: Arc<MergeTreeData>,
    merger: Arc<Merger>,
}

impl MergeTask {
    pub fn new(data: Arc<MergeTreeData>) -> Self {
        let merger = Arc::new(Merger::new(data.clone()));
        Self { data, merger }
    }

    pub fn merger(&self) -> Arc<Merger> {
        self.merger.clone()
    }
}

#[async_trait::async_trait]
impl MaintenanceTask for MergeTask {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn period(&self) -> Duration {
        self.data.config.scheduler.merge_interval
    }

    async fn run(&self) -> Result<()> {
        let merger = self.merger.clone();
        // Merging is blocking file IO; keep it off the timer threads.
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parts) = merger.select_parts_to_merge(false, false, &|_, _| true) {
                merger.merge_parts(parts)?;
            }
            Ok(())
        })
        .await??;
        Ok(())
    }
}

/// Periodic removal of inactive parts past their retention.
pub struct CleanupTask {
    data: Arc<MergeTreeData>,
    removed_total: Mutex<usize>,
}

impl CleanupTask {
    pub fn new(data: Arc<MergeTreeData>) -> Self {
        Self { data, removed_total: Mutex::new(0) }
    }
}

#[async_trait::async_trait]
impl MaintenanceTask for CleanupTask {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn period(&self) -> Duration {
        self.data.config.scheduler.cleanup_interval
    }

    async fn run(&self) -> Result<()> {
        let data = self.data.clone();
        let removed = tokio::task::spawn_blocking(move || data.clear_old_parts()).await??;
        if !removed.is_empty() {
            let mut total = self.removed_total.lock()?;
            *total += removed.len();
            tracing::info!(removed = removed.len(), total = *total, "cleared old parts");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, Column, ColumnWithTypeAndName, DataType};
    use crate::config::{MergeTreeConfig, SchedulerConfig};
    use crate::mergetree::{MergeTreeWriter, TableDefinition};
    use crate::scheduler::Scheduler;
    use crate::testdir::TestDir;

    fn two_row_block(day: u16, first_key: u64) -> Block {
        Block::with_columns(vec![
            ColumnWithTypeAndName::new("d", DataType::Date, Column::Date(vec![day, day])),
            ColumnWithTypeAndName::new(
                "k",
                DataType::UInt64,
                Column::UInt64(vec![first_key, first_key + 1]),
            ),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_scheduled_merge_compacts_parts() -> Result<()> {
        let dir = TestDir::for_table("scheduled_merge")?;
        let config = MergeTreeConfig::default()
            .index_granularity(2)
            .min_rows_for_seek(0)
            .old_parts_lifetime(Duration::ZERO)
            .scheduler(
                SchedulerConfig::default()
                    .merge_interval(Duration::from_millis(10))
                    .cleanup_interval(Duration::from_millis(10)),
            );
        let definition = TableDefinition::new(
            vec![("d".to_string(), DataType::Date), ("k".to_string(), DataType::UInt64)],
            "d",
            vec!["k".to_string()],
        );
        let data = MergeTreeData::open(dir.table_path(), definition, config)?;

        let writer = MergeTreeWriter::new(data.clone());
        let day = crate::block::types::parse_compact_date("20140301")?;
        for batch in 0..3u64 {
            writer.write(&two_row_block(day, batch * 2))?;
        }
        assert_eq!(data.get_data_parts().len(), 3);

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(MergeTask::new(data.clone())));
        scheduler.register(Arc::new(CleanupTask::new(data.clone())));

        // Within a few periods the three parts become one merged part and
        // the covered inputs are cleaned up.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let active = data.get_data_parts();
            if active.len() == 1 && active[0].info.level == 1 && data.get_all_data_parts().len() == 1 {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("background merge never compacted the parts");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.stop().await?;
        Ok(())
    }
}
