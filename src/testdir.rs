//! On-disk fixtures for storage tests.
//!
//! Storage tests create real table directories with part subdirectories
//! inside and then assert on that tree: which part directories exist,
//! that only `tmp`-prefixed leftovers appear after a crash, that staged
//! ALTER files are gone after a rollback. A [`TestDir`] owns one unique
//! root under the system temp location and removes the whole tree on
//! drop, so aborted tests do not leave part directories behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

/// Process-wide fixture counter; with the pid it makes root names unique
/// even across tests spawned in the same instant.
static NEXT_FIXTURE_ID: AtomicU64 = AtomicU64::new(0);

pub struct TestDir {
    root: PathBuf,
    table: PathBuf,
}

impl TestDir {
    /// A fresh root holding one table's on-disk tree. The table lives in
    /// a subdirectory named after the fixture, so assertions about the
    /// table directory's contents are not confused by the root itself.
    pub fn for_table(name: &str) -> Result<TestDir> {
        let id = NEXT_FIXTURE_ID.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!("strata_{name}_{}_{id}", std::process::id()));
        std::fs::create_dir_all(&root)?;
        Ok(TestDir { table: root.join(name), root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the table under test keeps its parts. Not created here; the
    /// storage engine creates it on open.
    pub fn table_path(&self) -> &Path {
        &self.table
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_roots_are_unique_and_cleaned() {
        let first = TestDir::for_table("fixture").unwrap();
        let second = TestDir::for_table("fixture").unwrap();
        assert_ne!(first.root(), second.root());
        assert!(first.root().exists());
        assert_eq!(first.table_path().file_name().unwrap(), "fixture");
        // The table directory itself is the engine's to create.
        assert!(!first.table_path().exists());

        let kept = first.root().to_path_buf();
        drop(first);
        assert!(!kept.exists());
    }
}
