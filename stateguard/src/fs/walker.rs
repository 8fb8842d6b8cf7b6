//! Recursive file listing for the mounted remote store.

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path below the listed root, `/`-separated on every platform we run on
    pub relative_path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Every regular file under `root`, sorted by path. Names ending in one of
/// `skip_suffixes` are left out. A missing root lists as empty.
pub fn list_files(root: &Path, skip_suffixes: &[&str]) -> io::Result<Vec<FileEntry>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if skip_suffixes.iter().any(|s| name.ends_with(s)) {
            continue;
        }

        let metadata = entry.metadata().map_err(io::Error::from)?;
        let relative_path = entry
            .path()
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| entry.path().to_path_buf());
        files.push(FileEntry {
            relative_path,
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lists_nested_files_in_order() -> io::Result<()> {
        let temp = TempDir::new()?;
        assert!(list_files(&temp.path().join("absent"), &[])?.is_empty());

        fs::create_dir(temp.path().join("20261019T031500123Z"))?;
        fs::write(temp.path().join("20261019T031500123Z/database.dump"), b"PGDMP")?;
        fs::write(temp.path().join("20261019T031500123Z/cache.rdb.partial"), b"R")?;
        fs::write(temp.path().join("README"), b"x")?;

        let files = list_files(temp.path(), &[".partial"])?;
        let paths: Vec<_> = files.iter().map(|f| f.relative_path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("20261019T031500123Z/database.dump"),
                PathBuf::from("README"),
            ]
        );
        assert_eq!(files[0].size, 5);
        assert!(files[0].modified.is_some());
        Ok(())
    }
}
