use std::time::Duration;

use crate::error::{Error, Result};

/// What to do when a per-query limit is exceeded.
///
/// `Any` is only meaningful for GROUP BY: stop adding new groups but keep
/// aggregating rows whose group already exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowMode {
    Throw,
    Break,
    Any,
}

impl OverflowMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "throw" => Ok(OverflowMode::Throw),
            "break" => Ok(OverflowMode::Break),
            "any" => Ok(OverflowMode::Any),
            other => Err(Error::InvalidArgument(format!("unknown overflow mode: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowMode::Throw => "throw",
            OverflowMode::Break => "break",
            OverflowMode::Any => "any",
        }
    }
}

/// Behavior of the WITH TOTALS row relative to HAVING.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TotalsMode {
    BeforeHaving,
    AfterHavingExclusive,
    AfterHavingInclusive,
    AfterHavingAuto,
}

/// Per-query execution limits, checked by the profiling wrapper.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Hard cap on rows read from leaf sources (0 = unlimited).
    pub max_rows_to_read: usize,
    /// Hard cap on bytes read from leaf sources (0 = unlimited).
    pub max_bytes_to_read: usize,
    pub read_overflow_mode: OverflowMode,

    /// Wall-clock bound for the whole query (zero = unlimited).
    pub max_execution_time: Duration,
    pub timeout_overflow_mode: OverflowMode,

    /// Minimum rows per second, checked once the grace period elapsed.
    pub min_execution_speed: usize,
    pub timeout_before_checking_execution_speed: Duration,

    /// Caps on the DISTINCT fingerprint set.
    pub max_rows_in_distinct: usize,
    pub max_bytes_in_distinct: usize,
    pub distinct_overflow_mode: OverflowMode,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_rows_to_read: 0,
            max_bytes_to_read: 0,
            read_overflow_mode: OverflowMode::Throw,
            max_execution_time: Duration::ZERO,
            timeout_overflow_mode: OverflowMode::Throw,
            min_execution_speed: 0,
            timeout_before_checking_execution_speed: Duration::ZERO,
            max_rows_in_distinct: 0,
            max_bytes_in_distinct: 0,
            distinct_overflow_mode: OverflowMode::Throw,
        }
    }
}

/// Per-query settings. Each query receives its own snapshot.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Target number of rows per block produced by sources.
    pub max_block_size: usize,

    /// Worker thread count for parallel reads.
    pub max_threads: usize,

    /// Frames smaller than this are buffered before compressing.
    pub min_compress_block_size: usize,

    /// A compressed frame is cut once the buffer reaches this size.
    pub max_compress_block_size: usize,

    /// Cap on distinct GROUP BY keys (0 = unlimited).
    pub max_rows_to_group_by: usize,
    pub group_by_overflow_mode: OverflowMode,

    /// Compute per-column minimums and maximums of the result.
    pub extremes: bool,

    /// Allow the uncompressed-block cache for small enough reads.
    pub use_uncompressed_cache: bool,

    pub totals_mode: TotalsMode,
    pub totals_auto_threshold: f64,

    pub limits: Limits,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_block_size: 65_536,
            max_threads: 8,
            min_compress_block_size: 65_536,
            max_compress_block_size: 1_048_576,
            max_rows_to_group_by: 0,
            group_by_overflow_mode: OverflowMode::Throw,
            extremes: false,
            use_uncompressed_cache: true,
            totals_mode: TotalsMode::BeforeHaving,
            totals_auto_threshold: 0.5,
            limits: Limits::default(),
        }
    }
}

impl Settings {
    /// Set max block size
    pub fn max_block_size(mut self, rows: usize) -> Self {
        self.max_block_size = rows;
        self
    }

    /// Set worker thread count
    pub fn max_threads(mut self, threads: usize) -> Self {
        self.max_threads = threads;
        self
    }

    /// Set GROUP BY cap and overflow mode
    pub fn group_by_limit(mut self, rows: usize, mode: OverflowMode) -> Self {
        self.max_rows_to_group_by = rows;
        self.group_by_overflow_mode = mode;
        self
    }

    /// Enable extremes calculation
    pub fn extremes(mut self, enabled: bool) -> Self {
        self.extremes = enabled;
        self
    }

    /// Set per-query limits
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Set a setting by name from its textual value. Used when applying
    /// settings received as name-value pairs.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        fn num(value: &str) -> Result<usize> {
            value
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("bad numeric setting value: {value}")))
        }
        match name {
            "max_block_size" => self.max_block_size = num(value)?,
            "max_threads" => self.max_threads = num(value)?,
            "min_compress_block_size" => self.min_compress_block_size = num(value)?,
            "max_compress_block_size" => self.max_compress_block_size = num(value)?,
            "max_rows_to_group_by" => self.max_rows_to_group_by = num(value)?,
            "group_by_overflow_mode" => self.group_by_overflow_mode = OverflowMode::parse(value)?,
            "extremes" => self.extremes = value == "1" || value == "true",
            "use_uncompressed_cache" => self.use_uncompressed_cache = value == "1" || value == "true",
            "max_execution_time" => self.limits.max_execution_time = Duration::from_secs(num(value)? as u64),
            "max_rows_to_read" => self.limits.max_rows_to_read = num(value)?,
            "max_bytes_to_read" => self.limits.max_bytes_to_read = num(value)?,
            "max_rows_in_distinct" => self.limits.max_rows_in_distinct = num(value)?,
            "max_bytes_in_distinct" => self.limits.max_bytes_in_distinct = num(value)?,
            "distinct_overflow_mode" => self.limits.distinct_overflow_mode = OverflowMode::parse(value)?,
            other => return Err(Error::InvalidArgument(format!("unknown setting: {other}"))),
        }
        Ok(())
    }

    /// Apply settings serialized as name-value pairs. The sequence ends with
    /// an empty name, the form used when settings travel between servers.
    pub fn apply_pairs<'a, I>(&mut self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (name, value) in pairs {
            if name.is_empty() {
                break;
            }
            self.set(name, value)?;
        }
        Ok(())
    }

    /// The settings as name-value pairs, terminated by an empty name. The
    /// inverse of [`Settings::apply_pairs`].
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let bool_str = |b: bool| if b { "1" } else { "0" }.to_string();
        vec![
            ("max_block_size".into(), self.max_block_size.to_string()),
            ("max_threads".into(), self.max_threads.to_string()),
            ("min_compress_block_size".into(), self.min_compress_block_size.to_string()),
            ("max_compress_block_size".into(), self.max_compress_block_size.to_string()),
            ("max_rows_to_group_by".into(), self.max_rows_to_group_by.to_string()),
            (
                "group_by_overflow_mode".into(),
                self.group_by_overflow_mode.as_str().to_string(),
            ),
            ("extremes".into(), bool_str(self.extremes)),
            ("use_uncompressed_cache".into(), bool_str(self.use_uncompressed_cache)),
            (
                "max_execution_time".into(),
                self.limits.max_execution_time.as_secs().to_string(),
            ),
            ("max_rows_to_read".into(), self.limits.max_rows_to_read.to_string()),
            ("max_bytes_to_read".into(), self.limits.max_bytes_to_read.to_string()),
            ("max_rows_in_distinct".into(), self.limits.max_rows_in_distinct.to_string()),
            ("max_bytes_in_distinct".into(), self.limits.max_bytes_in_distinct.to_string()),
            (
                "distinct_overflow_mode".into(),
                self.limits.distinct_overflow_mode.as_str().to_string(),
            ),
            (String::new(), String::new()),
        ]
    }
}

/// Scheduler configuration for background maintenance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to look for parts worth merging (default: 10s)
    pub merge_interval: Duration,

    /// How often to drop inactive parts past their lifetime (default: 30s)
    pub cleanup_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            merge_interval: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Set merge check interval
    pub fn merge_interval(mut self, interval: Duration) -> Self {
        self.merge_interval = interval;
        self
    }

    /// Set old-parts cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// Per-table configuration of a MergeTree storage.
#[derive(Debug, Clone)]
pub struct MergeTreeConfig {
    /// One primary index entry and one mark is written per this many rows.
    pub index_granularity: usize,

    /// If at least this many rows are read from one part, the read can be
    /// split between threads.
    pub min_rows_for_concurrent_read: usize,

    /// Skipping fewer rows than this is cheaper done by reading through.
    pub min_rows_for_seek: usize,

    /// An index range that may contain matching keys is split into this many
    /// pieces and each piece is checked recursively.
    pub coarse_index_granularity: usize,

    /// The uncompressed cache is only used for reads below this many rows,
    /// so large scans do not evict it.
    pub max_rows_to_use_cache: usize,

    /// How many parts a single merge may take.
    pub max_parts_to_merge_at_once: usize,

    /// Parts above this total size are never merged.
    pub max_bytes_to_merge_parts: u64,

    /// Size bound used when only small merges are allowed.
    pub max_bytes_to_merge_parts_small: u64,

    /// How unbalanced a merge we accept: every outer part of the group must
    /// be within this ratio of the group's geometric mean size.
    pub size_ratio_coefficient_to_merge_parts: f64,

    /// The ratio coefficient is multiplied by this at night, biasing the
    /// selection toward bigger merges.
    pub merge_parts_at_night_inc: f64,

    /// How long an inactive part is retained before deletion.
    pub old_parts_lifetime: Duration,

    /// With at least this many active parts in one month, inserts slow down.
    pub parts_to_delay_insert: usize,

    /// With parts_to_delay_insert + k parts, sleep insert_delay_step^k
    /// milliseconds before writing each block.
    pub insert_delay_step: f64,

    /// Compression framing for column files written by this table.
    pub min_compress_block_size: usize,
    pub max_compress_block_size: usize,

    pub scheduler: SchedulerConfig,
}

impl Default for MergeTreeConfig {
    fn default() -> Self {
        Self {
            index_granularity: 8192,
            min_rows_for_concurrent_read: 20 * 8192,
            min_rows_for_seek: 5 * 8192,
            coarse_index_granularity: 8,
            max_rows_to_use_cache: 1024 * 1024,
            max_parts_to_merge_at_once: 10,
            max_bytes_to_merge_parts: 25 * 1024 * 1024 * 1024,
            max_bytes_to_merge_parts_small: 250 * 1024 * 1024,
            size_ratio_coefficient_to_merge_parts: 0.25,
            merge_parts_at_night_inc: 10.0,
            old_parts_lifetime: Duration::from_secs(5 * 60),
            parts_to_delay_insert: 150,
            insert_delay_step: 1.1,
            min_compress_block_size: 65_536,
            max_compress_block_size: 1_048_576,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl MergeTreeConfig {
    /// Set index granularity
    pub fn index_granularity(mut self, rows: usize) -> Self {
        self.index_granularity = rows;
        self
    }

    /// Set minimum rows for a concurrent read
    pub fn min_rows_for_concurrent_read(mut self, rows: usize) -> Self {
        self.min_rows_for_concurrent_read = rows;
        self
    }

    /// Set how many rows a seek must skip to be worth it
    pub fn min_rows_for_seek(mut self, rows: usize) -> Self {
        self.min_rows_for_seek = rows;
        self
    }

    /// Set how many parts one merge may take
    pub fn max_parts_to_merge_at_once(mut self, parts: usize) -> Self {
        self.max_parts_to_merge_at_once = parts;
        self
    }

    /// Set the total size bound for one merge
    pub fn max_bytes_to_merge_parts(mut self, bytes: u64) -> Self {
        self.max_bytes_to_merge_parts = bytes;
        self
    }

    /// Set the size ratio coefficient of the merge heuristic
    pub fn size_ratio_coefficient(mut self, coefficient: f64) -> Self {
        self.size_ratio_coefficient_to_merge_parts = coefficient;
        self
    }

    /// Set the retention period for inactive parts
    pub fn old_parts_lifetime(mut self, lifetime: Duration) -> Self {
        self.old_parts_lifetime = lifetime;
        self
    }

    /// Set insert backpressure threshold
    pub fn parts_to_delay_insert(mut self, parts: usize) -> Self {
        self.parts_to_delay_insert = parts;
        self
    }

    /// Configure scheduler settings
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.max_block_size, 65_536);
        assert_eq!(settings.max_threads, 8);
        assert_eq!(settings.max_rows_to_group_by, 0);
        assert_eq!(settings.group_by_overflow_mode, OverflowMode::Throw);
        assert!(!settings.extremes);
    }

    #[test]
    fn test_settings_builder() {
        let settings = Settings::default()
            .max_block_size(1024)
            .max_threads(4)
            .group_by_limit(100, OverflowMode::Any)
            .extremes(true);

        assert_eq!(settings.max_block_size, 1024);
        assert_eq!(settings.max_threads, 4);
        assert_eq!(settings.max_rows_to_group_by, 100);
        assert_eq!(settings.group_by_overflow_mode, OverflowMode::Any);
        assert!(settings.extremes);
    }

    #[test]
    fn test_set_by_name() {
        let mut settings = Settings::default();
        settings.set("max_block_size", "4096").unwrap();
        settings.set("group_by_overflow_mode", "break").unwrap();
        assert_eq!(settings.max_block_size, 4096);
        assert_eq!(settings.group_by_overflow_mode, OverflowMode::Break);

        assert!(settings.set("no_such_setting", "1").is_err());
        assert!(settings.set("group_by_overflow_mode", "bogus").is_err());
    }

    #[test]
    fn test_apply_pairs_stops_at_empty_name() {
        let mut settings = Settings::default();
        settings
            .apply_pairs(vec![("max_threads", "2"), ("", ""), ("max_block_size", "1")])
            .unwrap();
        assert_eq!(settings.max_threads, 2);
        assert_eq!(settings.max_block_size, 65_536);
    }

    #[test]
    fn test_pairs_roundtrip() {
        let original = Settings::default()
            .max_threads(3)
            .group_by_limit(42, OverflowMode::Break)
            .extremes(true);
        let pairs = original.to_pairs();
        assert_eq!(pairs.last(), Some(&(String::new(), String::new())));

        let mut restored = Settings::default();
        restored
            .apply_pairs(pairs.iter().map(|(n, v)| (n.as_str(), v.as_str())))
            .unwrap();
        assert_eq!(restored.max_threads, 3);
        assert_eq!(restored.max_rows_to_group_by, 42);
        assert_eq!(restored.group_by_overflow_mode, OverflowMode::Break);
        assert!(restored.extremes);
    }

    #[test]
    fn test_merge_tree_config_builder() {
        let config = MergeTreeConfig::default()
            .index_granularity(16)
            .max_parts_to_merge_at_once(3)
            .old_parts_lifetime(Duration::from_millis(100));

        assert_eq!(config.index_granularity, 16);
        assert_eq!(config.max_parts_to_merge_at_once, 3);
        assert_eq!(config.old_parts_lifetime, Duration::from_millis(100));
    }
}
