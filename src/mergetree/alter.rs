//! ALTER of one data part: a staged, revertible file-level plan.
//!
//! Given the old and new column lists, the plan is: removed columns lose
//! their files, added columns get files written by evaluating the DEFAULT
//! expression over existing rows, type changes rewrite files. New files
//! are staged with a `.tmp` suffix under the part's alter mutex; commit
//! renames them into place and rewrites `columns.txt`/`checksums.txt`.
//! If commit never runs, dropping the transaction removes the staged
//! files.

use std::path::Path;
use std::sync::Arc;

use crate::block::{Column, DataType};
use crate::error::{Error, Result};
use crate::expr::cast_column;
use crate::mergetree::checksums::Checksums;
use crate::mergetree::index::MarkRange;
use crate::mergetree::part::{columns_to_text, escape_for_file_name, DataPart};
use crate::mergetree::reader::PartRangeStream;
use crate::mergetree::writer::{file_size_and_hash, ColumnFileWriter};
use crate::mergetree::MergeTreeData;
use crate::stream::BlockStream;

const TMP_SUFFIX: &str = ".tmp";

#[derive(Clone, Debug)]
pub enum AlterCommand {
    /// New columns take their values from the table's DEFAULT expression,
    /// or the type default.
    AddColumn { name: String, data_type: DataType },
    DropColumn { name: String },
    ModifyColumn { name: String, data_type: DataType },
}

/// Validates ALTER commands against the table: all referenced columns
/// exist, and the key, date and sign columns stay untouched. Returns the
/// new column list.
pub fn check_alter(data: &MergeTreeData, commands: &[AlterCommand]) -> Result<Vec<(String, DataType)>> {
    let mut columns = data.columns_list();
    let mut protected: Vec<&str> = data.primary_key().iter().map(|s| s.as_str()).collect();
    protected.push(data.date_column());
    if let Some(sign) = &data.sign_column {
        protected.push(sign.as_str());
    }

    for command in commands {
        match command {
            AlterCommand::AddColumn { name, data_type } => {
                if columns.iter().any(|(n, _)| n == name) {
                    return Err(Error::InvalidArgument(format!("column {name} already exists")));
                }
                columns.push((name.clone(), data_type.clone()));
            }
            AlterCommand::DropColumn { name } => {
                if protected.contains(&name.as_str()) {
                    return Err(Error::InvalidArgument(format!(
                        "cannot drop key, date or sign column {name}"
                    )));
                }
                let before = columns.len();
                columns.retain(|(n, _)| n != name);
                if columns.len() == before {
                    return Err(Error::InvalidArgument(format!("no column {name} to drop")));
                }
            }
            AlterCommand::ModifyColumn { name, data_type } => {
                if protected.contains(&name.as_str()) {
                    return Err(Error::InvalidArgument(format!(
                        "cannot modify key, date or sign column {name}"
                    )));
                }
                match columns.iter_mut().find(|(n, _)| n == name) {
                    Some(column) => column.1 = data_type.clone(),
                    None => {
                        return Err(Error::InvalidArgument(format!("no column {name} to modify")))
                    }
                }
            }
        }
    }
    Ok(columns)
}

struct RenameEntry {
    /// File name inside the part directory.
    from: String,
    /// Rename target, or None to delete `from`.
    to: Option<String>,
}

/// Remembers which temporary files an ALTER staged in a part directory.
/// Commit renames them into place; dropping without commit removes them.
pub struct AlterDataPartTransaction {
    part: Arc<DataPart>,
    new_columns: Vec<(String, DataType)>,
    new_checksums: Checksums,
    entries: Vec<RenameEntry>,
    committed: bool,
    _alter_guard: tokio::sync::OwnedMutexGuard<()>,
}

impl AlterDataPartTransaction {
    /// Renames the staged files, deletes dropped ones, and rewrites the
    /// part metadata, all under the part's file write lock.
    pub fn commit(mut self) -> Result<()> {
        let dir = self.part.path();
        {
            let _write_guard = self
                .part
                .columns_lock
                .write()
                .unwrap_or_else(|e| e.into_inner());
            for entry in &self.entries {
                let from = dir.join(&entry.from);
                match &entry.to {
                    Some(to) => std::fs::rename(&from, dir.join(to))?,
                    None => std::fs::remove_file(&from)?,
                }
            }
            std::fs::write(dir.join("columns.txt"), columns_to_text(&self.new_columns))?;
            std::fs::write(dir.join("checksums.txt"), self.new_checksums.to_text())?;
            self.part.set_columns(self.new_columns.clone());
            self.part.set_checksums(self.new_checksums.clone());
        }
        tracing::info!(part = %self.part.name(), "committed part alteration");
        self.committed = true;
        Ok(())
    }
}

impl Drop for AlterDataPartTransaction {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Roll back: only staged temporaries are removed.
        let dir = self.part.path();
        for entry in &self.entries {
            if entry.to.is_some() {
                let path = dir.join(&entry.from);
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(file = %path.display(), error = %e, "cannot remove staged alter file");
                }
            }
        }
        tracing::debug!(part = %self.part.name(), "rolled back part alteration");
    }
}

/// Plans and stages the ALTER of one part. Returns None when the part
/// already matches the new column list.
pub fn alter_data_part(
    data: &Arc<MergeTreeData>,
    part: &Arc<DataPart>,
    new_columns: Vec<(String, DataType)>,
    skip_sanity_checks: bool,
) -> Result<Option<AlterDataPartTransaction>> {
    let alter_guard = part.alter_mutex.clone().blocking_lock_owned();
    let old_columns = part.columns_list();
    if old_columns == new_columns {
        return Ok(None);
    }

    let mut new_checksums = part.checksums();
    let mut entries: Vec<RenameEntry> = Vec::new();
    let mut touched = 0usize;
    let dir = part.path();

    // Dropped columns lose their files at commit.
    for (name, _) in &old_columns {
        if new_columns.iter().any(|(n, _)| n == name) {
            continue;
        }
        let escaped = escape_for_file_name(name);
        for suffix in [".bin", ".mrk"] {
            let file = format!("{escaped}{suffix}");
            new_checksums.files.remove(&file);
            entries.push(RenameEntry { from: file, to: None });
        }
        touched += 1;
    }

    for (name, data_type) in &new_columns {
        let old = old_columns.iter().find(|(n, _)| n == name);
        match old {
            // Type change: rewrite the column converted to the new type.
            Some((_, old_type)) if old_type != data_type => {
                let source = read_single_column(data, part, name, old_type)?;
                let converted: Vec<Column> = source
                    .into_iter()
                    .map(|c| cast_column(&c, data_type))
                    .collect::<Result<_>>()?;
                stage_column_files(data, &dir, name, &converted, &mut new_checksums, &mut entries)?;
                touched += 1;
            }
            Some(_) => {}
            // Added column: materialize its DEFAULT over existing rows.
            None => {
                let values = default_column_granules(data, part, name, data_type)?;
                stage_column_files(data, &dir, name, &values, &mut new_checksums, &mut entries)?;
                touched += 1;
            }
        }
    }

    if entries.is_empty() {
        return Ok(None);
    }
    if !skip_sanity_checks && touched * 2 > old_columns.len().max(2) {
        return Err(Error::InvalidArgument(format!(
            "suspiciously many columns ({touched}) would be rewritten by this ALTER, \
             pass skip_sanity_checks to force"
        )));
    }

    Ok(Some(AlterDataPartTransaction {
        part: part.clone(),
        new_columns,
        new_checksums,
        entries,
        committed: false,
        _alter_guard: alter_guard,
    }))
}

/// Reads one column of the part, one granule per returned column chunk,
/// so staged files reproduce the part's mark layout.
fn read_single_column(
    data: &Arc<MergeTreeData>,
    part: &Arc<DataPart>,
    name: &str,
    data_type: &DataType,
) -> Result<Vec<Column>> {
    let granularity = data.config.index_granularity;
    let mut stream = PartRangeStream::new(
        part.clone(),
        vec![MarkRange::new(0, part.marks_count)],
        vec![(name.to_string(), data_type.clone())],
        granularity,
        granularity,
    );
    let mut chunks = Vec::with_capacity(part.marks_count);
    loop {
        let block = stream.read()?;
        if block.is_empty() {
            break;
        }
        chunks.push(block.at(0).column.clone());
    }
    Ok(chunks)
}

/// Produces the DEFAULT values of a new column, granule by granule. With
/// an expression the referenced columns are read and evaluated; without
/// one the type's default value fills the column.
fn default_column_granules(
    data: &Arc<MergeTreeData>,
    part: &Arc<DataPart>,
    name: &str,
    data_type: &DataType,
) -> Result<Vec<Column>> {
    let granularity = data.config.index_granularity;
    let default = data.column_defaults().get(name).cloned();

    let Some(expression) = default else {
        // Plain default value, shaped like the part's granules.
        let mut chunks = Vec::with_capacity(part.marks_count);
        let mut remaining = part.rows;
        while remaining > 0 {
            let rows = remaining.min(granularity);
            let mut column = Column::new(data_type)?;
            for _ in 0..rows {
                column.push_default();
            }
            chunks.push(column);
            remaining -= rows;
        }
        return Ok(chunks);
    };

    let mut referenced = std::collections::BTreeSet::new();
    expression.collect_columns(&mut referenced);
    let part_columns = part.columns_list();
    let read_columns: Vec<(String, DataType)> = referenced
        .iter()
        .map(|r| {
            part_columns
                .iter()
                .find(|(n, _)| n == r)
                .cloned()
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("DEFAULT of {name} references unknown column {r}"))
                })
        })
        .collect::<Result<_>>()?;

    let mut stream = PartRangeStream::new(
        part.clone(),
        vec![MarkRange::new(0, part.marks_count)],
        read_columns,
        granularity,
        granularity,
    );
    let mut chunks = Vec::with_capacity(part.marks_count);
    loop {
        let block = stream.read()?;
        if block.is_empty() {
            break;
        }
        let evaluated = expression.evaluate(&block)?;
        chunks.push(cast_column(&evaluated.column.materialize()?, data_type)?);
    }
    Ok(chunks)
}

/// Writes staged .bin/.mrk files for one column from its granule chunks.
fn stage_column_files(
    data: &Arc<MergeTreeData>,
    dir: &Path,
    name: &str,
    granules: &[Column],
    new_checksums: &mut Checksums,
    entries: &mut Vec<RenameEntry>,
) -> Result<()> {
    let mut writer = ColumnFileWriter::open_with_suffix(
        dir,
        name,
        TMP_SUFFIX,
        data.config.max_compress_block_size,
    )?;
    for granule in granules {
        writer.mark(data.config.min_compress_block_size)?;
        writer.write_rows(granule, 0, granule.len())?;
    }
    let (escaped, uncompressed_size, uncompressed_hash) = writer.finish(dir)?;

    let bin_tmp = format!("{escaped}.bin{TMP_SUFFIX}");
    let mrk_tmp = format!("{escaped}.mrk{TMP_SUFFIX}");
    let (bin_size, bin_hash) = file_size_and_hash(&dir.join(&bin_tmp))?;
    let (mrk_size, mrk_hash) = file_size_and_hash(&dir.join(&mrk_tmp))?;
    new_checksums.add_compressed(
        format!("{escaped}.bin"),
        bin_size,
        bin_hash,
        uncompressed_size,
        uncompressed_hash,
    );
    new_checksums.add_file(format!("{escaped}.mrk"), mrk_size, mrk_hash);
    entries.push(RenameEntry { from: bin_tmp, to: Some(format!("{escaped}.bin")) });
    entries.push(RenameEntry { from: mrk_tmp, to: Some(format!("{escaped}.mrk")) });
    Ok(())
}
