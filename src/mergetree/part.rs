//! One immutable data part: naming, on-disk loading and lifecycle.
//!
//! A part is a directory named `<min-date>_<max-date>_<min-id>_<max-id>_<level>`
//! holding:
//!
//! ```text
//! primary.idx      key tuple of every index_granularity-th row
//! <column>.bin     compressed column stream
//! <column>.mrk     (compressed_offset, decompressed_offset) pairs, 16 bytes each
//! columns.txt      textual column list
//! checksums.txt    per-file sizes and hashes
//! ```
//!
//! Directories starting with `tmp` are invisible and reclaimed on startup.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};

use crate::block::types::{format_compact_date, month_of_days, parse_compact_date};
use crate::block::{DataType, Value};
use crate::error::{Error, Result};
use crate::io::compressed::CompressedReader;
use crate::mergetree::checksums::Checksums;

/// Size of one mark entry on disk: two big-endian u64 offsets.
pub const MARK_SIZE: u64 = 16;

/// Escapes a column name so it is safe as a file name.
pub fn escape_for_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).as_bytes() {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

/// The identity of a part, parsed from and formatted into its directory
/// name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartInfo {
    pub min_date: u16,
    pub max_date: u16,
    pub min_id: u64,
    pub max_id: u64,
    pub level: u32,
}

impl PartInfo {
    pub fn name(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            format_compact_date(self.min_date),
            format_compact_date(self.max_date),
            self.min_id,
            self.max_id,
            self.level
        )
    }

    pub fn parse(name: &str) -> Result<PartInfo> {
        let pieces: Vec<&str> = name.split('_').collect();
        let [min_date, max_date, min_id, max_id, level] = pieces[..] else {
            return crate::errinput!("bad part name: {name}");
        };
        let parse_num = |s: &str| -> Result<u64> {
            s.parse()
                .map_err(|_| Error::InvalidArgument(format!("bad number in part name: {name}")))
        };
        Ok(PartInfo {
            min_date: parse_compact_date(min_date)?,
            max_date: parse_compact_date(max_date)?,
            min_id: parse_num(min_id)?,
            max_id: parse_num(max_id)?,
            level: parse_num(level)? as u32,
        })
    }

    /// Month bucket; all rows of one part fall in a single month.
    pub fn month(&self) -> u32 {
        month_of_days(self.min_date)
    }

    /// Whether this part's id range covers another part of the same month.
    pub fn contains(&self, other: &PartInfo) -> bool {
        self.month() == other.month()
            && self.min_id <= other.min_id
            && self.max_id >= other.max_id
            && self.level >= other.level
    }
}

impl PartialOrd for PartInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PartInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.min_date, self.min_id, self.max_id, self.level).cmp(&(
            other.min_date,
            other.min_id,
            other.max_id,
            other.level,
        ))
    }
}

/// An immutable on-disk part. After insertion into the table's working set
/// it is only read; mutation happens by replacing parts.
pub struct DataPart {
    pub info: PartInfo,
    /// The table directory this part lives under.
    pub storage_path: PathBuf,
    /// Current directory name: `tmp_`-prefixed until the part is made
    /// visible by an atomic rename.
    dir_name: std::sync::RwLock<String>,
    /// Size in marks.
    pub marks_count: usize,
    pub rows: usize,
    pub bytes_on_disk: AtomicU64,
    /// Seconds since the epoch when the part left the working set;
    /// i64::MAX while active.
    pub remove_time: AtomicI64,
    /// A temporary part removes its directory on drop.
    pub is_temp: AtomicBool,
    /// The sparse primary index: `marks_count` tuples of `key_size` values.
    pub index: Vec<Value>,
    /// Updated in place when an ALTER commits.
    checksums: std::sync::RwLock<Checksums>,
    columns: std::sync::RwLock<Vec<(String, DataType)>>,
    /// Read-locked while column files are read, write-locked while an
    /// ALTER commit rewrites them.
    pub columns_lock: std::sync::RwLock<()>,
    /// Held across the stage-then-commit window of an ALTER.
    pub alter_mutex: Arc<tokio::sync::Mutex<()>>,
}

impl DataPart {
    /// A freshly written part living in a `tmp_` directory. It is made
    /// visible later by renaming; until then the destructor removes it.
    #[allow(clippy::too_many_arguments)]
    pub fn new_temporary(
        info: PartInfo,
        storage_path: PathBuf,
        marks_count: usize,
        rows: usize,
        bytes_on_disk: u64,
        index: Vec<Value>,
        checksums: Checksums,
        columns: Vec<(String, DataType)>,
    ) -> DataPart {
        let dir_name = format!("tmp_{}", info.name());
        DataPart {
            info,
            storage_path,
            dir_name: std::sync::RwLock::new(dir_name),
            marks_count,
            rows,
            bytes_on_disk: AtomicU64::new(bytes_on_disk),
            remove_time: AtomicI64::new(i64::MAX),
            is_temp: AtomicBool::new(true),
            index,
            checksums: std::sync::RwLock::new(checksums),
            columns: std::sync::RwLock::new(columns),
            columns_lock: std::sync::RwLock::new(()),
            alter_mutex: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn name(&self) -> String {
        self.info.name()
    }

    pub fn columns_list(&self) -> Vec<(String, DataType)> {
        self.columns.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_columns(&self, columns: Vec<(String, DataType)>) {
        *self.columns.write().unwrap_or_else(|e| e.into_inner()) = columns;
    }

    pub fn checksums(&self) -> Checksums {
        self.checksums.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_checksums(&self, checksums: Checksums) {
        *self.checksums.write().unwrap_or_else(|e| e.into_inner()) = checksums;
    }

    /// Current directory name, which differs from `name()` while the part
    /// is temporary or detached.
    pub fn dir_name(&self) -> String {
        self.dir_name
            .read()
            .map(|n| n.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn path(&self) -> PathBuf {
        self.storage_path.join(self.dir_name())
    }

    /// Renames the temporary directory to the part's final name, making it
    /// visible. The rename is atomic.
    pub fn make_permanent(&self) -> Result<()> {
        let final_name = self.name();
        let from = self.path();
        let to = self.storage_path.join(&final_name);
        std::fs::rename(&from, &to)?;
        match self.dir_name.write() {
            Ok(mut name) => *name = final_name,
            Err(e) => *e.into_inner() = final_name,
        }
        self.is_temp.store(false, AtomicOrdering::SeqCst);
        Ok(())
    }

    pub fn bin_file(&self, column: &str) -> PathBuf {
        self.path().join(format!("{}.bin", escape_for_file_name(column)))
    }

    pub fn mrk_file(&self, column: &str) -> PathBuf {
        self.path().join(format!("{}.mrk", escape_for_file_name(column)))
    }

    pub fn has_column_files(&self, column: &str) -> bool {
        self.bin_file(column).exists() && self.mrk_file(column).exists()
    }

    /// On-disk footprint of one column, bin plus marks. Used to pick a
    /// row-count carrier when no requested column exists in the part.
    pub fn column_size_on_disk(&self, column: &str) -> u64 {
        let escaped = escape_for_file_name(column);
        let checksums = self.checksums();
        let mut total = 0;
        for suffix in [".bin", ".mrk"] {
            if let Some(checksum) = checksums.files.get(&format!("{escaped}{suffix}")) {
                total += checksum.file_size;
            }
        }
        total
    }

    /// Loads the marks of one column file.
    pub fn load_marks(&self, column: &str) -> Result<Vec<(u64, u64)>> {
        let path = self.mrk_file(column);
        let mut reader = BufReader::new(File::open(&path)?);
        let len = std::fs::metadata(&path)?.len();
        if len % MARK_SIZE != 0 {
            return Err(Error::Corruption(format!(
                "marks file {} has odd size {len}",
                path.display()
            )));
        }
        let count = (len / MARK_SIZE) as usize;
        let mut marks = Vec::with_capacity(count);
        for _ in 0..count {
            let compressed = reader.read_u64::<BigEndian>()?;
            let decompressed = reader.read_u64::<BigEndian>()?;
            marks.push((compressed, decompressed));
        }
        Ok(marks)
    }

    /// Total size of a directory tree in bytes.
    pub fn calc_total_size(path: &Path) -> Result<u64> {
        let metadata = std::fs::metadata(path)?;
        if metadata.is_file() {
            return Ok(metadata.len());
        }
        let mut total = 0;
        for entry in std::fs::read_dir(path)? {
            total += Self::calc_total_size(&entry?.path())?;
        }
        Ok(total)
    }

    /// Loads a part from disk: columns, checksums, index, row count.
    /// `key_types` resolves the primary index entry layout; `date_column`
    /// anchors the row count.
    pub fn load(
        storage_path: &Path,
        name: &str,
        table_columns: &[(String, DataType)],
        key_names: &[String],
        date_column: &str,
        require_part_metadata: bool,
    ) -> Result<DataPart> {
        let info = PartInfo::parse(name)?;
        let dir = storage_path.join(name);

        let mut part = DataPart {
            info,
            storage_path: storage_path.to_path_buf(),
            dir_name: std::sync::RwLock::new(name.to_string()),
            marks_count: 0,
            rows: 0,
            bytes_on_disk: AtomicU64::new(0),
            remove_time: AtomicI64::new(i64::MAX),
            is_temp: AtomicBool::new(false),
            index: Vec::new(),
            checksums: std::sync::RwLock::new(Checksums::default()),
            columns: std::sync::RwLock::new(Vec::new()),
            columns_lock: std::sync::RwLock::new(()),
            alter_mutex: Arc::new(tokio::sync::Mutex::new(())),
        };

        part.load_columns(&dir, table_columns, require_part_metadata)?;
        part.load_checksums(&dir, require_part_metadata)?;
        part.check_not_broken(&dir, require_part_metadata)?;

        // Marks count from the date column, rows from its uncompressed size.
        let marks_len = std::fs::metadata(part.mrk_file(date_column))?.len();
        part.marks_count = (marks_len / MARK_SIZE) as usize;
        part.rows = part.count_rows(date_column)?;
        part.load_index(&dir, key_names)?;
        part.bytes_on_disk
            .store(Self::calc_total_size(&dir)?, AtomicOrdering::SeqCst);
        Ok(part)
    }

    fn load_columns(
        &mut self,
        dir: &Path,
        table_columns: &[(String, DataType)],
        require_part_metadata: bool,
    ) -> Result<()> {
        let path = dir.join("columns.txt");
        if !path.exists() {
            if require_part_metadata {
                return Err(Error::Corruption(format!("no columns.txt in part {}", self.name())));
            }
            self.set_columns(table_columns.to_vec());
            return Ok(());
        }
        self.set_columns(parse_columns_text(&std::fs::read_to_string(&path)?)?);
        Ok(())
    }

    fn load_checksums(&mut self, dir: &Path, require_part_metadata: bool) -> Result<()> {
        let path = dir.join("checksums.txt");
        if !path.exists() {
            if require_part_metadata {
                return Err(Error::Corruption(format!("no checksums.txt in part {}", self.name())));
            }
            return Ok(());
        }
        self.set_checksums(Checksums::parse(&std::fs::read_to_string(&path)?)?);
        Ok(())
    }

    fn load_index(&mut self, dir: &Path, key_names: &[String]) -> Result<()> {
        let columns = self.columns_list();
        let key_types: Vec<DataType> = key_names
            .iter()
            .map(|name| {
                columns
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, t)| t.clone())
                    .ok_or_else(|| {
                        Error::Corruption(format!("primary key column {name} missing in part"))
                    })
            })
            .collect::<Result<_>>()?;

        let path = dir.join("primary.idx");
        let mut reader = BufReader::new(File::open(&path)?);
        self.index = Vec::with_capacity(self.marks_count * key_types.len());
        for _ in 0..self.marks_count {
            for key_type in &key_types {
                self.index.push(key_type.deserialize_value(&mut reader)?);
            }
        }
        let mut rest = [0u8; 1];
        if reader.read(&mut rest)? != 0 {
            return Err(Error::Corruption(format!(
                "index file {} is unexpectedly long",
                path.display()
            )));
        }
        Ok(())
    }

    /// The key tuple at one mark.
    pub fn index_tuple(&self, mark: usize, key_size: usize) -> &[Value] {
        &self.index[mark * key_size..(mark + 1) * key_size]
    }

    /// Counts rows from the uncompressed size of the date column, whose
    /// values are two bytes each.
    fn count_rows(&self, date_column: &str) -> Result<usize> {
        let escaped = escape_for_file_name(date_column);
        if let Some(checksum) = self.checksums().files.get(&format!("{escaped}.bin")) {
            if checksum.is_compressed {
                return Ok((checksum.uncompressed_size / 2) as usize);
            }
        }
        // No checksums: decompress the column to count.
        let mut reader = CompressedReader::new(File::open(self.bin_file(date_column))?);
        let mut total = 0usize;
        let mut buf = [0u8; 4096];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total / 2)
    }

    /// Validation without reading the data itself: checksummed parts check
    /// sizes; bare parts check the index and marks.
    fn check_not_broken(&self, dir: &Path, require_part_metadata: bool) -> Result<()> {
        let checksums = self.checksums();
        let columns = self.columns_list();
        if !checksums.is_empty() {
            if !checksums.files.contains_key("primary.idx") {
                return Err(Error::Corruption("no checksum for primary.idx".into()));
            }
            if require_part_metadata {
                for (name, _) in &columns {
                    let escaped = escape_for_file_name(name);
                    if !checksums.files.contains_key(&format!("{escaped}.mrk"))
                        || !checksums.files.contains_key(&format!("{escaped}.bin"))
                    {
                        return Err(Error::Corruption(format!(
                            "no .mrk or .bin file checksum for column {name}"
                        )));
                    }
                }
            }
            return checksums.check_sizes(dir);
        }

        let index_path = dir.join("primary.idx");
        let index_size = std::fs::metadata(&index_path).map(|m| m.len()).unwrap_or(0);
        if index_size == 0 {
            return Err(Error::Corruption(format!(
                "part {} is broken: primary key is empty",
                self.name()
            )));
        }

        // All marks files must be non-empty and equal in size. Columns
        // added by ALTER may have no files yet; skip them.
        let mut marks_size: Option<u64> = None;
        for (name, _) in &columns {
            let path = self.mrk_file(name);
            if !path.exists() {
                continue;
            }
            let size = std::fs::metadata(&path)?.len();
            match marks_size {
                None => {
                    if size == 0 {
                        return Err(Error::Corruption(format!(
                            "part {} is broken: {} is empty",
                            self.name(),
                            path.display()
                        )));
                    }
                    marks_size = Some(size);
                }
                Some(expected) if size != expected => {
                    return Err(Error::Corruption(format!(
                        "part {} is broken: marks have different sizes",
                        self.name()
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Physically removes the part's directory. Renames first so a crash
    /// mid-delete leaves only a reclaimable tmp directory.
    pub fn remove(&self) -> Result<()> {
        let from = self.path();
        let to = self.storage_path.join(format!("tmp2_{}", self.name()));
        std::fs::rename(&from, &to)?;
        std::fs::remove_dir_all(&to)?;
        Ok(())
    }

    /// Renames the directory, prepending a prefix (for example to detach).
    pub fn rename_add_prefix(&self, prefix: &str) -> Result<()> {
        let from = self.path();
        let new_name = format!("{prefix}{}", self.name());
        let to = self.storage_path.join(&new_name);
        std::fs::rename(from, to)?;
        match self.dir_name.write() {
            Ok(mut name) => *name = new_name,
            Err(e) => *e.into_inner() = new_name,
        }
        Ok(())
    }

    pub fn set_remove_time_now(&self) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.remove_time.store(now, AtomicOrdering::SeqCst);
    }
}

impl PartialEq for DataPart {
    fn eq(&self, other: &Self) -> bool {
        self.info == other.info
    }
}

impl Eq for DataPart {}

impl PartialOrd for DataPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DataPart {
    fn cmp(&self, other: &Self) -> Ordering {
        self.info.cmp(&other.info)
    }
}

impl Drop for DataPart {
    fn drop(&mut self) {
        if !self.is_temp.load(AtomicOrdering::SeqCst) {
            return;
        }
        let dir_name = self.dir_name();
        let dir = self.storage_path.join(&dir_name);
        if !dir.exists() {
            return;
        }
        // Only tmp-prefixed directories may be deleted implicitly.
        if !dir_name.starts_with("tmp") {
            tracing::error!(
                part = %dir_name,
                "temporary part directory does not start with tmp, keeping it"
            );
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            tracing::warn!(part = %dir_name, error = %e, "failed to remove temporary part");
        }
    }
}

/// columns.txt serialization.
pub fn columns_to_text(columns: &[(String, DataType)]) -> String {
    let mut out = String::new();
    out.push_str("columns format version: 1\n");
    out.push_str(&format!("{} columns:\n", columns.len()));
    for (name, data_type) in columns {
        out.push_str(&format!("`{}` {}\n", name, data_type.name()));
    }
    out
}

pub fn parse_columns_text(text: &str) -> Result<Vec<(String, DataType)>> {
    let mut lines = text.lines();
    let header = lines.next().unwrap_or_default();
    if header != "columns format version: 1" {
        return Err(Error::Corruption(format!("bad columns.txt header: {header}")));
    }
    let count_line = lines.next().unwrap_or_default();
    let count: usize = count_line
        .strip_suffix(" columns:")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::Corruption(format!("bad columns.txt count line: {count_line}")))?;
    let mut columns = Vec::with_capacity(count);
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let rest = line
            .strip_prefix('`')
            .ok_or_else(|| Error::Corruption(format!("bad columns.txt line: {line}")))?;
        let (name, type_name) = rest
            .split_once("` ")
            .ok_or_else(|| Error::Corruption(format!("bad columns.txt line: {line}")))?;
        columns.push((name.to_string(), DataType::parse(type_name)?));
    }
    if columns.len() != count {
        return Err(Error::Corruption(format!(
            "columns.txt lists {} columns, header says {count}",
            columns.len()
        )));
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_name_roundtrip() {
        let info = PartInfo {
            min_date: parse_compact_date("20140301").unwrap(),
            max_date: parse_compact_date("20140331").unwrap(),
            min_id: 5,
            max_id: 17,
            level: 2,
        };
        let name = info.name();
        assert_eq!(name, "20140301_20140331_5_17_2");
        assert_eq!(PartInfo::parse(&name).unwrap(), info);
        assert!(PartInfo::parse("garbage").is_err());
        assert!(PartInfo::parse("1_2_3_4").is_err());
    }

    #[test]
    fn test_part_containment() {
        let outer = PartInfo::parse("20140301_20140331_1_10_1").unwrap();
        let inner = PartInfo::parse("20140305_20140310_3_7_0").unwrap();
        let other_month = PartInfo::parse("20140405_20140410_3_7_0").unwrap();
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(!outer.contains(&other_month));
    }

    #[test]
    fn test_part_ordering() {
        let mut infos = vec![
            PartInfo::parse("20140401_20140430_1_1_0").unwrap(),
            PartInfo::parse("20140301_20140331_5_5_0").unwrap(),
            PartInfo::parse("20140301_20140331_1_4_1").unwrap(),
        ];
        infos.sort();
        assert_eq!(infos[0].min_id, 1);
        assert_eq!(infos[1].min_id, 5);
        assert_eq!(infos[2].month(), 2014 * 12 + 3);
    }

    #[test]
    fn test_columns_text_roundtrip() {
        let columns = vec![
            ("d".to_string(), DataType::Date),
            ("weird name".to_string(), DataType::String),
            ("a".to_string(), DataType::Array(Box::new(DataType::UInt32))),
        ];
        let text = columns_to_text(&columns);
        assert_eq!(parse_columns_text(&text).unwrap(), columns);
    }

    #[test]
    fn test_escape_for_file_name() {
        assert_eq!(escape_for_file_name("plain_name1"), "plain_name1");
        assert_eq!(escape_for_file_name("a b"), "a%20b");
        assert_ne!(escape_for_file_name("a/b"), "a/b");
    }
}
