//! Per-file checksums of a part.
//!
//! `checksums.txt` lists every file of the part with its size and 128-bit
//! hash; compressed `.bin` files additionally carry the size and hash of
//! their uncompressed content, so two parts can be compared independently
//! of how each was compressed.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::error::{Error, Result};
use crate::io::checksum::Hash128;

const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checksum {
    pub file_size: u64,
    pub file_hash: u128,
    pub is_compressed: bool,
    pub uncompressed_size: u64,
    pub uncompressed_hash: u128,
}

impl Checksum {
    pub fn plain(file_size: u64, file_hash: u128) -> Self {
        Self { file_size, file_hash, is_compressed: false, uncompressed_size: 0, uncompressed_hash: 0 }
    }

    pub fn compressed(
        file_size: u64,
        file_hash: u128,
        uncompressed_size: u64,
        uncompressed_hash: u128,
    ) -> Self {
        Self { file_size, file_hash, is_compressed: true, uncompressed_size, uncompressed_hash }
    }

    /// Compares with another checksum of the same file. With
    /// `have_uncompressed`, compressed files compare their uncompressed
    /// content, which is stable across compression settings.
    pub fn check_equal(&self, rhs: &Checksum, have_uncompressed: bool, name: &str) -> Result<()> {
        if have_uncompressed && self.is_compressed && rhs.is_compressed {
            if self.uncompressed_size != rhs.uncompressed_size {
                return Err(Error::Corruption(format!(
                    "uncompressed size of {name} differs: {} vs {}",
                    self.uncompressed_size, rhs.uncompressed_size
                )));
            }
            if self.uncompressed_hash != rhs.uncompressed_hash {
                return Err(Error::Corruption(format!("uncompressed checksum of {name} differs")));
            }
            return Ok(());
        }
        if self.file_size != rhs.file_size {
            return Err(Error::Corruption(format!(
                "size of {name} differs: {} vs {}",
                self.file_size, rhs.file_size
            )));
        }
        if self.file_hash != rhs.file_hash {
            return Err(Error::Corruption(format!("checksum of {name} differs")));
        }
        Ok(())
    }
}

/// Checksums of all non-temporary files of one part, keyed by file name.
/// BTreeMap keeps iteration lexicographic, which the summary hash relies
/// on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Checksums {
    pub files: BTreeMap<String, Checksum>,
}

impl Checksums {
    pub fn add_file(&mut self, name: impl Into<String>, file_size: u64, file_hash: u128) {
        self.files.insert(name.into(), Checksum::plain(file_size, file_hash));
    }

    pub fn add_compressed(
        &mut self,
        name: impl Into<String>,
        file_size: u64,
        file_hash: u128,
        uncompressed_size: u64,
        uncompressed_hash: u128,
    ) {
        self.files.insert(
            name.into(),
            Checksum::compressed(file_size, file_hash, uncompressed_size, uncompressed_hash),
        );
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Checks that both sides list the same files with matching sums.
    pub fn check_equal(&self, rhs: &Checksums, have_uncompressed: bool) -> Result<()> {
        for name in rhs.files.keys() {
            if !self.files.contains_key(name) {
                return Err(Error::Corruption(format!("unexpected file {name} in data part")));
            }
        }
        for (name, checksum) in &self.files {
            match rhs.files.get(name) {
                Some(other) => checksum.check_equal(other, have_uncompressed, name)?,
                None => return Err(Error::Corruption(format!("no file {name} in data part"))),
            }
        }
        Ok(())
    }

    /// Checks that every listed file exists on disk with the right size.
    /// Does not read file contents.
    pub fn check_sizes(&self, dir: &Path) -> Result<()> {
        for (name, checksum) in &self.files {
            let path = dir.join(name);
            let metadata = std::fs::metadata(&path).map_err(|e| {
                Error::Corruption(format!("missing file {} in data part: {e}", path.display()))
            })?;
            if metadata.len() != checksum.file_size {
                return Err(Error::Corruption(format!(
                    "file {} has size {}, expected {}",
                    path.display(),
                    metadata.len(),
                    checksum.file_size
                )));
            }
        }
        Ok(())
    }

    /// One hash covering the uncompressed content of all .bin files.
    pub fn summary_data_checksum(&self) -> String {
        let mut hash = Hash128::new();
        for (name, checksum) in &self.files {
            if !name.ends_with(".bin") {
                continue;
            }
            hash.update(&(name.len() as u64).to_le_bytes());
            hash.update(name.as_bytes());
            hash.update(&checksum.uncompressed_size.to_le_bytes());
            hash.update(&checksum.uncompressed_hash.to_le_bytes());
        }
        let value = hash.finish();
        format!("{}_{}", (value >> 64) as u64, value as u64)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "checksums format version: {FORMAT_VERSION}");
        let _ = writeln!(out, "{} files:", self.files.len());
        for (name, c) in &self.files {
            let _ = writeln!(out, "{name}");
            let _ = writeln!(out, "\t{} {:032x}", c.file_size, c.file_hash);
            if c.is_compressed {
                let _ = writeln!(out, "\tuncompressed {} {:032x}", c.uncompressed_size, c.uncompressed_hash);
            }
        }
        out
    }

    pub fn parse(text: &str) -> Result<Checksums> {
        let mut lines = text.lines();
        let header = lines.next().unwrap_or_default();
        let version: u32 = header
            .strip_prefix("checksums format version: ")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Corruption("checksums format is too old".into()))?;
        if version != FORMAT_VERSION {
            return Err(Error::Corruption(format!("checksums format version {version} is too old")));
        }
        let count_line = lines.next().unwrap_or_default();
        let count: usize = count_line
            .strip_suffix(" files:")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Corruption(format!("bad checksums file count line: {count_line}")))?;

        fn parse_sum(line: &str, what: &str) -> Result<(u64, u128)> {
            let mut parts = line.trim().split_whitespace();
            let size = parts
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| Error::Corruption(format!("bad {what} size")))?;
            let hash = parts
                .next()
                .and_then(|v| u128::from_str_radix(v, 16).ok())
                .ok_or_else(|| Error::Corruption(format!("bad {what} hash")))?;
            Ok((size, hash))
        }

        let mut checksums = Checksums::default();
        let mut pending: Option<String> = None;
        for line in lines {
            if let Some(rest) = line.strip_prefix('\t') {
                if let Some(rest) = rest.strip_prefix("uncompressed ") {
                    let name = pending.clone().ok_or_else(|| {
                        Error::Corruption("uncompressed checksum before any file".into())
                    })?;
                    let (size, hash) = parse_sum(rest, "uncompressed")?;
                    let entry = checksums
                        .files
                        .get_mut(&name)
                        .ok_or_else(|| Error::Corruption(format!("no entry for {name}")))?;
                    entry.is_compressed = true;
                    entry.uncompressed_size = size;
                    entry.uncompressed_hash = hash;
                } else {
                    let name = pending.clone().ok_or_else(|| {
                        Error::Corruption("checksum line before any file name".into())
                    })?;
                    let (size, hash) = parse_sum(rest, "file")?;
                    checksums.files.insert(name, Checksum::plain(size, hash));
                }
            } else if !line.trim().is_empty() {
                pending = Some(line.to_string());
            }
        }
        if checksums.files.len() != count {
            return Err(Error::Corruption(format!(
                "checksums list {} files, header says {count}",
                checksums.files.len()
            )));
        }
        Ok(checksums)
    }
}
